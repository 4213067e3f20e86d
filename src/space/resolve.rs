//! Round-based resolution of dependent interpolation rows.
//!
//! Every local DOF ends up with one finalized row: a list of
//! `(global true DOF, coefficient)` pairs. Non-dependent DOFs start
//! finalized with a single identity term. Dependent rows are flattened
//! locally as far as possible, then shipped to the rank holding their first
//! unresolved source; receivers substitute what they know, forward what
//! they cannot, and return fully resolved rows to the origin rank. Rounds
//! are globally synchronized: each ends with two `u64` all-gathers, one for
//! the count of unfinished rows and one for a progress indicator, so every
//! rank terminates in the same round. Zero pending rows ends the protocol;
//! zero progress with rows still pending is a dependency cycle.

use std::collections::{BTreeMap, BTreeSet};

use hashbrown::HashMap;

use crate::comm::communicator::{CommTag, Communicator};
use crate::comm::exchange::exchange_bytes_symmetric;
use crate::comm::wire::{WireRowHdr, WireRowTerm, cast_slice};
use crate::data::dependency::{DependencyGraph, SourceRef};
use crate::error::DofSpaceError;
use crate::space::offsets::GlobalOffsets;
use crate::space::truedof::TrueDofMap;

/// Tag slots consumed per round (sizes, data, pending, progress).
const TAGS_PER_ROUND: u16 = 4;
/// Hard ceiling on the round cap; keeps the per-round tag window inside the
/// range reserved for this phase.
const ROUND_CAP_LIMIT: usize = 120;

/// One term of a row in flight.
#[derive(Copy, Clone, Debug, PartialEq)]
enum Term {
    /// Fully resolved: a global true-DOF index.
    True { gtdof: u64, coef: f64 },
    /// A rank-local DOF on this rank, awaiting a finalized row here.
    Local { dof: usize, coef: f64 },
    /// A DOF on another rank, addressed by that rank's local numbering.
    Remote { rank: u32, dof: u64, coef: f64 },
}

/// A dependent row owned by this rank, awaiting resolution.
#[derive(Clone, Debug)]
struct PendingRow {
    terms: Vec<Term>,
    /// Shipped to the rank of its first remote source; awaiting return.
    dispatched: bool,
}

/// A row received on behalf of another rank (or forwarded back to us) that
/// still references unresolved DOFs here.
#[derive(Clone, Debug)]
struct ParkedRow {
    origin_rank: u32,
    origin_dof: u64,
    terms: Vec<Term>,
}

/// Counters from one protocol run, for diagnostics and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResolveStats {
    /// Rounds executed, including the final empty confirmation round.
    pub rounds: usize,
    /// Point-to-point messages sent (one per destination per round).
    pub msgs_sent: u64,
    pub msgs_recv: u64,
    /// Rows shipped, received, and re-forwarded across all rounds.
    pub rows_sent: u64,
    pub rows_recv: u64,
    pub rows_forwarded: u64,
}

/// Finalized interpolation rows for every local DOF, in global true-DOF
/// column indices sorted ascending.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedRows {
    rows: Vec<Vec<(u64, f64)>>,
}

impl ResolvedRows {
    pub fn ndofs(&self) -> usize {
        self.rows.len()
    }

    pub fn row(&self, dof: usize) -> &[(u64, f64)] {
        &self.rows[dof]
    }
}

/// Resolve every dependent row to global true-DOF terms.
pub(crate) fn resolve_rows<C: Communicator>(
    comm: &C,
    tdof: &TrueDofMap,
    offsets: &GlobalOffsets,
    deps: &DependencyGraph,
    max_rounds: usize,
    tag_base: CommTag,
) -> Result<(ResolvedRows, ResolveStats), DofSpaceError> {
    let my_rank = comm.rank();
    let nranks = comm.size();
    let ndofs = tdof.ndofs();
    let cap = max_rounds.clamp(1, ROUND_CAP_LIMIT);

    // Non-dependent DOFs are identity rows on their owner's true DOF.
    let mut final_rows: Vec<Option<Vec<(u64, f64)>>> = vec![None; ndofs];
    for d in 0..ndofs {
        if let Some(ltdof) = tdof.owner_ltdof(d) {
            let gtdof = offsets.tdof_offset(tdof.owner(d))? + ltdof;
            final_rows[d] = Some(vec![(gtdof, tdof.coef(d))]);
        }
    }

    let mut pending: HashMap<usize, PendingRow> = HashMap::new();
    for (d, sources) in deps.iter() {
        let terms = sources
            .iter()
            .map(|&(src, coef)| match src {
                SourceRef::Local(s) => Term::Local { dof: s, coef },
                SourceRef::Remote { rank, dof } => Term::Remote {
                    rank: rank as u32,
                    dof,
                    coef,
                },
            })
            .collect();
        pending.insert(d, PendingRow {
            terms,
            dispatched: false,
        });
    }

    let mut parked: Vec<ParkedRow> = Vec::new();
    let mut stats = ResolveStats::default();
    let peers: BTreeSet<usize> = (0..nranks).filter(|&r| r != my_rank).collect();
    let mut pending_tot = u64::MAX;

    for round in 0..cap {
        let round_tags = tag_base.offset(round as u16 * TAGS_PER_ROUND);
        let mut finalized_now = 0u64;
        let mut outgoing_rows: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
        let mut rows_sent_now = 0u64;

        // Flatten local chains to a fixpoint: substitute finalized local
        // sources and finalize rows left with only true terms. Each pass
        // finalizes at least one row or stops, so this is bounded by ndofs.
        loop {
            let mut changed = false;
            let dofs: Vec<usize> = pending.keys().copied().collect();
            for d in dofs {
                let Some(row) = pending.get_mut(&d) else {
                    continue;
                };
                substitute_finalized(&mut row.terms, &final_rows);
                row.terms = normalize(std::mem::take(&mut row.terms));
                if row.terms.iter().all(|t| matches!(t, Term::True { .. })) {
                    final_rows[d] = Some(collect_true(&row.terms));
                    pending.remove(&d);
                    finalized_now += 1;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        // Rows parked here for other ranks: substitute, then return,
        // forward, or keep waiting.
        let mut still_parked = Vec::with_capacity(parked.len());
        for mut row in parked.drain(..) {
            substitute_finalized(&mut row.terms, &final_rows);
            row.terms = normalize(std::mem::take(&mut row.terms));
            if row.terms.iter().all(|t| matches!(t, Term::True { .. })) {
                if row.origin_rank as usize == my_rank {
                    let d = row.origin_dof as usize;
                    if final_rows[d].is_some() {
                        return Err(DofSpaceError::DuplicateFinalize { dof: d });
                    }
                    final_rows[d] = Some(collect_true(&row.terms));
                    pending.remove(&d);
                    finalized_now += 1;
                } else {
                    log::trace!(
                        "round {round}: returning row (origin {}:{}) to its origin",
                        row.origin_rank,
                        row.origin_dof
                    );
                    encode_row(
                        outgoing_rows.entry(row.origin_rank as usize).or_default(),
                        &row,
                        my_rank,
                    );
                    rows_sent_now += 1;
                }
            } else if row.terms.iter().any(|t| matches!(t, Term::Local { .. })) {
                // Waiting on a local row still in flight.
                still_parked.push(row);
            } else {
                let next = first_remote_rank(&row.terms).unwrap();
                log::trace!(
                    "round {round}: forwarding row (origin {}:{}) to rank {next}",
                    row.origin_rank,
                    row.origin_dof
                );
                encode_row(outgoing_rows.entry(next).or_default(), &row, my_rank);
                rows_sent_now += 1;
                stats.rows_forwarded += 1;
            }
        }
        parked = still_parked;

        // Dispatch pending rows whose remaining unresolved sources are all
        // remote, to the rank of the first one.
        for (&d, row) in pending.iter_mut() {
            if row.dispatched || row.terms.iter().any(|t| matches!(t, Term::Local { .. })) {
                continue;
            }
            let Some(dest) = first_remote_rank(&row.terms) else {
                continue;
            };
            log::trace!("round {round}: dispatching row for local dof {d} to rank {dest}");
            encode_row(
                outgoing_rows.entry(dest).or_default(),
                &ParkedRow {
                    origin_rank: my_rank as u32,
                    origin_dof: d as u64,
                    terms: row.terms.clone(),
                },
                my_rank,
            );
            row.dispatched = true;
            rows_sent_now += 1;
        }

        stats.msgs_sent += outgoing_rows.len() as u64;
        stats.rows_sent += rows_sent_now;

        let incoming = exchange_bytes_symmetric(
            comm,
            &peers,
            round_tags,
            round_tags.offset(1),
            &outgoing_rows,
        )?;
        stats.msgs_recv += incoming.len() as u64;

        for (&nbr, payload) in &incoming {
            for row in decode_rows(payload, nbr, my_rank, ndofs)? {
                stats.rows_recv += 1;
                let fully_true = row.terms.iter().all(|t| matches!(t, Term::True { .. }));
                if fully_true && row.origin_rank as usize == my_rank {
                    let d = row.origin_dof as usize;
                    if d >= ndofs {
                        return Err(DofSpaceError::WireFormat {
                            neighbor: nbr,
                            detail: format!("returned row for unknown local dof {d}"),
                        });
                    }
                    if final_rows[d].is_some() {
                        return Err(DofSpaceError::DuplicateFinalize { dof: d });
                    }
                    final_rows[d] = Some(collect_true(&row.terms));
                    pending.remove(&d);
                    finalized_now += 1;
                } else {
                    parked.push(row);
                }
            }
        }

        let pending_here = (pending.len() + parked.len()) as u64;
        pending_tot = comm
            .allgather_u64(round_tags.offset(2), pending_here)?
            .iter()
            .sum();
        let progress_tot: u64 = comm
            .allgather_u64(round_tags.offset(3), finalized_now + rows_sent_now)?
            .iter()
            .sum();
        stats.rounds = round + 1;
        log::debug!(
            "row resolution round {round}: {pending_here} unfinished here, \
             {pending_tot} globally, progress {progress_tot}"
        );

        if pending_tot == 0 {
            let rows = final_rows
                .into_iter()
                .map(|r| r.unwrap_or_default())
                .collect();
            return Ok((ResolvedRows { rows }, stats));
        }
        if progress_tot == 0 {
            return Err(DofSpaceError::DependencyCycle {
                round,
                pending: pending_tot,
            });
        }
    }

    Err(DofSpaceError::RoundCapExceeded {
        cap,
        pending: pending_tot,
    })
}

/// Splice finalized local rows into `terms` in place.
fn substitute_finalized(terms: &mut Vec<Term>, final_rows: &[Option<Vec<(u64, f64)>>]) {
    let mut out = Vec::with_capacity(terms.len());
    for t in terms.drain(..) {
        match t {
            Term::Local { dof, coef } => match &final_rows[dof] {
                Some(row) => {
                    out.extend(
                        row.iter()
                            .map(|&(gtdof, w)| Term::True { gtdof, coef: coef * w }),
                    );
                }
                None => out.push(Term::Local { dof, coef }),
            },
            other => out.push(other),
        }
    }
    *terms = out;
}

/// Merge duplicate sources, drop exact-zero coefficients, and order the
/// terms deterministically (true terms by global index, then locals, then
/// remotes by rank and DOF).
fn normalize(terms: Vec<Term>) -> Vec<Term> {
    let mut trues: BTreeMap<u64, f64> = BTreeMap::new();
    let mut locals: BTreeMap<usize, f64> = BTreeMap::new();
    let mut remotes: BTreeMap<(u32, u64), f64> = BTreeMap::new();
    for t in terms {
        match t {
            Term::True { gtdof, coef } => *trues.entry(gtdof).or_default() += coef,
            Term::Local { dof, coef } => *locals.entry(dof).or_default() += coef,
            Term::Remote { rank, dof, coef } => {
                *remotes.entry((rank, dof)).or_default() += coef
            }
        }
    }
    let mut out = Vec::with_capacity(trues.len() + locals.len() + remotes.len());
    out.extend(
        trues
            .into_iter()
            .filter(|&(_, c)| c != 0.0)
            .map(|(gtdof, coef)| Term::True { gtdof, coef }),
    );
    out.extend(
        locals
            .into_iter()
            .filter(|&(_, c)| c != 0.0)
            .map(|(dof, coef)| Term::Local { dof, coef }),
    );
    out.extend(
        remotes
            .into_iter()
            .filter(|&(_, c)| c != 0.0)
            .map(|((rank, dof), coef)| Term::Remote { rank, dof, coef }),
    );
    out
}

fn collect_true(terms: &[Term]) -> Vec<(u64, f64)> {
    terms
        .iter()
        .map(|t| match *t {
            Term::True { gtdof, coef } => (gtdof, coef),
            _ => unreachable!("collect_true on a row with unresolved terms"),
        })
        .collect()
}

fn first_remote_rank(terms: &[Term]) -> Option<usize> {
    terms
        .iter()
        .filter_map(|t| match *t {
            Term::Remote { rank, .. } => Some(rank as usize),
            _ => None,
        })
        .min()
}

fn encode_row(buf: &mut Vec<u8>, row: &ParkedRow, my_rank: usize) {
    let hdr = WireRowHdr::new(row.origin_rank, row.origin_dof, row.terms.len());
    buf.extend_from_slice(cast_slice(std::slice::from_ref(&hdr)));
    for t in &row.terms {
        let rec = match *t {
            Term::True { gtdof, coef } => WireRowTerm::resolved(gtdof, coef),
            Term::Remote { rank, dof, coef } => WireRowTerm::unresolved(rank, dof, coef),
            // Local terms never leave a rank via dispatch or forwarding;
            // encoded self-addressed anyway so decode stays total.
            Term::Local { dof, coef } => {
                WireRowTerm::unresolved(my_rank as u32, dof as u64, coef)
            }
        };
        buf.extend_from_slice(cast_slice(std::slice::from_ref(&rec)));
    }
}

fn decode_rows(
    payload: &[u8],
    neighbor: usize,
    my_rank: usize,
    ndofs: usize,
) -> Result<Vec<ParkedRow>, DofSpaceError> {
    let hdr_size = std::mem::size_of::<WireRowHdr>();
    let term_size = std::mem::size_of::<WireRowTerm>();
    let mut rows = Vec::new();
    let mut cursor = 0usize;
    while cursor < payload.len() {
        if cursor + hdr_size > payload.len() {
            return Err(DofSpaceError::WireFormat {
                neighbor,
                detail: "truncated row header".into(),
            });
        }
        let hdr: WireRowHdr =
            bytemuck::pod_read_unaligned(&payload[cursor..cursor + hdr_size]);
        cursor += hdr_size;
        let nterms = hdr.nterms();
        if cursor + nterms * term_size > payload.len() {
            return Err(DofSpaceError::WireFormat {
                neighbor,
                detail: format!("row claims {nterms} terms past end of payload"),
            });
        }
        let mut terms = Vec::with_capacity(nterms);
        for _ in 0..nterms {
            let rec: WireRowTerm =
                bytemuck::pod_read_unaligned(&payload[cursor..cursor + term_size]);
            cursor += term_size;
            let term = if rec.is_resolved() {
                Term::True {
                    gtdof: rec.dof(),
                    coef: rec.coef(),
                }
            } else if rec.rank() as usize == my_rank {
                let dof = rec.dof() as usize;
                if dof >= ndofs {
                    return Err(DofSpaceError::WireFormat {
                        neighbor,
                        detail: format!("row references unknown local dof {dof}"),
                    });
                }
                Term::Local {
                    dof,
                    coef: rec.coef(),
                }
            } else {
                Term::Remote {
                    rank: rec.rank(),
                    dof: rec.dof(),
                    coef: rec.coef(),
                }
            };
            terms.push(term);
        }
        rows.push(ParkedRow {
            origin_rank: hdr.origin_rank(),
            origin_dof: hdr.origin_dof(),
            terms,
        });
    }
    Ok(rows)
}
