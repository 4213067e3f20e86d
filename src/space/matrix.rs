//! Materialized interpolation and restriction operators.
//!
//! [`ParCsrMatrix`] stores the local block of the interpolation matrix in
//! CSR form with a compact column map: columns below `owned_cols` are this
//! rank's true DOFs, the rest index into `ghost_cols`, the sorted list of
//! off-rank global columns the local rows touch. A column-exchange plan is
//! negotiated once at construction; every apply then needs a single
//! fixed-size value exchange with the owning ranks.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::sync::atomic::{AtomicU16, Ordering};

use crate::comm::communicator::{CommTag, Communicator};
use crate::comm::exchange::{exchange_bytes_symmetric, exchange_fixed};
use crate::comm::wire::{WireDofId, WireValue, cast_slice};
use crate::error::DofSpaceError;
use crate::space::offsets::GlobalOffsets;
use crate::space::resolve::ResolvedRows;
use crate::space::truedof::TrueDofMap;

/// Tag slots reserved per apply direction; epochs rotate within the window
/// so back-to-back applies never reuse an in-flight tag.
const EPOCH_WINDOW: u16 = 64;

/// Per-neighbor value routes for ghost columns.
#[derive(Clone, Debug, Default)]
struct ColExchange {
    /// owner rank -> slot range in `ghost_cols` (contiguous, since ghost
    /// columns are sorted by global index and rank ranges are intervals).
    recv: BTreeMap<usize, Range<usize>>,
    /// requester rank -> owned true-DOF indices to ship on every apply.
    send: BTreeMap<usize, Vec<usize>>,
}

/// Local block of the global interpolation matrix P.
#[derive(Debug)]
pub struct ParCsrMatrix {
    nrows: usize,
    owned_cols: usize,
    row_start: u64,
    col_start: u64,
    global_rows: u64,
    global_cols: u64,
    indptr: Vec<usize>,
    cols: Vec<usize>,
    vals: Vec<f64>,
    ghost_cols: Vec<u64>,
    plan: ColExchange,
    apply_tag: CommTag,
    epoch: AtomicU16,
}

impl ParCsrMatrix {
    /// Assemble the local rows and negotiate the column-exchange plan.
    pub(crate) fn from_rows<C: Communicator>(
        comm: &C,
        rows: &ResolvedRows,
        offsets: &GlobalOffsets,
        sizes_tag: CommTag,
        data_tag: CommTag,
        apply_tag: CommTag,
    ) -> Result<Self, DofSpaceError> {
        let my_rank = comm.rank();
        let nrows = rows.ndofs();
        let tdof_table = &offsets.current().tdof;
        let col_range = tdof_table.range(my_rank)?;
        let owned_cols = (col_range.end - col_range.start) as usize;

        let mut ghost_set: BTreeSet<u64> = BTreeSet::new();
        for d in 0..nrows {
            for &(gtdof, _) in rows.row(d) {
                if !col_range.contains(&gtdof) {
                    ghost_set.insert(gtdof);
                }
            }
        }
        let ghost_cols: Vec<u64> = ghost_set.into_iter().collect();

        let compact = |gtdof: u64| -> usize {
            if col_range.contains(&gtdof) {
                (gtdof - col_range.start) as usize
            } else {
                // Present by construction of ghost_cols.
                owned_cols + ghost_cols.binary_search(&gtdof).unwrap()
            }
        };

        let mut indptr = Vec::with_capacity(nrows + 1);
        let mut cols = Vec::new();
        let mut vals = Vec::new();
        indptr.push(0);
        for d in 0..nrows {
            for &(gtdof, coef) in rows.row(d) {
                cols.push(compact(gtdof));
                vals.push(coef);
            }
            indptr.push(cols.len());
        }

        let plan = Self::build_plan(comm, &ghost_cols, offsets, sizes_tag, data_tag)?;
        log::debug!(
            "interpolation matrix: rank {my_rank}, {nrows} rows, {owned_cols} owned cols, \
             {} ghost cols, {} nonzeros",
            ghost_cols.len(),
            vals.len()
        );

        Ok(Self {
            nrows,
            owned_cols,
            row_start: offsets.dof_offset(my_rank)?,
            col_start: col_range.start,
            global_rows: offsets.global_dof_count(),
            global_cols: offsets.global_tdof_count(),
            indptr,
            cols,
            vals,
            ghost_cols,
            plan,
            apply_tag,
            epoch: AtomicU16::new(0),
        })
    }

    /// Send each owner the list of its true DOFs this rank needs, and learn
    /// which of our true DOFs other ranks need back. One-time, symmetric
    /// over all ranks (a rank with no ghost columns still answers requests).
    fn build_plan<C: Communicator>(
        comm: &C,
        ghost_cols: &[u64],
        offsets: &GlobalOffsets,
        sizes_tag: CommTag,
        data_tag: CommTag,
    ) -> Result<ColExchange, DofSpaceError> {
        let my_rank = comm.rank();
        let tdof_table = &offsets.current().tdof;
        let my_range = tdof_table.range(my_rank)?;

        let mut recv: BTreeMap<usize, Range<usize>> = BTreeMap::new();
        let mut requests: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
        let mut i = 0usize;
        while i < ghost_cols.len() {
            let owner = tdof_table.owner_of(ghost_cols[i])?;
            let owner_end = tdof_table.range(owner)?.end;
            let start = i;
            while i < ghost_cols.len() && ghost_cols[i] < owner_end {
                i += 1;
            }
            recv.insert(owner, start..i);
            let buf = requests.entry(owner).or_default();
            for &g in &ghost_cols[start..i] {
                buf.extend_from_slice(cast_slice(std::slice::from_ref(&WireDofId::of(g))));
            }
        }

        let peers: BTreeSet<usize> = (0..comm.size()).filter(|&r| r != my_rank).collect();
        let incoming = exchange_bytes_symmetric(comm, &peers, sizes_tag, data_tag, &requests)?;

        let id_size = std::mem::size_of::<WireDofId>();
        let mut send: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (&nbr, payload) in &incoming {
            if payload.len() % id_size != 0 {
                return Err(DofSpaceError::WireFormat {
                    neighbor: nbr,
                    detail: "column request list not a whole number of ids".into(),
                });
            }
            let mut list = Vec::with_capacity(payload.len() / id_size);
            for chunk in payload.chunks_exact(id_size) {
                let id: WireDofId = bytemuck::pod_read_unaligned(chunk);
                let g = id.get();
                if !my_range.contains(&g) {
                    return Err(DofSpaceError::TrueDofOutOfRange { gtdof: g });
                }
                list.push((g - my_range.start) as usize);
            }
            send.insert(nbr, list);
        }
        Ok(ColExchange { recv, send })
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols_owned(&self) -> usize {
        self.owned_cols
    }

    pub fn global_rows(&self) -> u64 {
        self.global_rows
    }

    pub fn global_cols(&self) -> u64 {
        self.global_cols
    }

    pub fn row_start(&self) -> u64 {
        self.row_start
    }

    pub fn nnz(&self) -> usize {
        self.vals.len()
    }

    /// Terms of a local row in global column indices, sorted ascending.
    pub fn row_terms(&self, dof: usize) -> Vec<(u64, f64)> {
        let r = self.indptr[dof]..self.indptr[dof + 1];
        r.map(|k| {
            let c = self.cols[k];
            let g = if c < self.owned_cols {
                self.col_start + c as u64
            } else {
                self.ghost_cols[c - self.owned_cols]
            };
            (g, self.vals[k])
        })
        .collect()
    }

    fn epoch_tags(&self) -> (CommTag, CommTag) {
        let e = self.epoch.fetch_add(1, Ordering::Relaxed) % EPOCH_WINDOW;
        (self.apply_tag.offset(e), self.apply_tag.offset(EPOCH_WINDOW + e))
    }

    /// y = P x: prolongate a true-DOF vector to a local-DOF vector.
    pub fn apply<C: Communicator>(
        &self,
        comm: &C,
        x_true: &[f64],
        y: &mut [f64],
    ) -> Result<(), DofSpaceError> {
        check_len(x_true.len(), self.owned_cols)?;
        check_len(y.len(), self.nrows)?;
        let (fwd_tag, _) = self.epoch_tags();

        let mut outgoing: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
        for (&nbr, ltdofs) in &self.plan.send {
            let buf: Vec<WireValue> = ltdofs.iter().map(|&t| WireValue::of(x_true[t])).collect();
            outgoing.insert(nbr, cast_slice(&buf).to_vec());
        }
        let expected: BTreeMap<usize, usize> = self
            .plan
            .recv
            .iter()
            .map(|(&nbr, r)| (nbr, r.len() * std::mem::size_of::<WireValue>()))
            .collect();
        let incoming = exchange_fixed(comm, fwd_tag, &outgoing, &expected)?;

        let mut ghost_vals = vec![0.0f64; self.ghost_cols.len()];
        for (&nbr, payload) in &incoming {
            let range = self.plan.recv[&nbr].clone();
            for (slot, chunk) in range.zip(payload.chunks_exact(std::mem::size_of::<WireValue>()))
            {
                let v: WireValue = bytemuck::pod_read_unaligned(chunk);
                ghost_vals[slot] = v.get();
            }
        }

        for d in 0..self.nrows {
            let mut acc = 0.0;
            for k in self.indptr[d]..self.indptr[d + 1] {
                let c = self.cols[k];
                let xv = if c < self.owned_cols {
                    x_true[c]
                } else {
                    ghost_vals[c - self.owned_cols]
                };
                acc += self.vals[k] * xv;
            }
            y[d] = acc;
        }
        Ok(())
    }

    /// y = Pᵀ x: accumulate a local-DOF vector onto true DOFs, including the
    /// contributions local rows make to columns owned elsewhere.
    pub fn apply_transpose<C: Communicator>(
        &self,
        comm: &C,
        x: &[f64],
        y_true: &mut [f64],
    ) -> Result<(), DofSpaceError> {
        check_len(x.len(), self.nrows)?;
        check_len(y_true.len(), self.owned_cols)?;
        let (_, rev_tag) = self.epoch_tags();

        y_true.fill(0.0);
        let mut ghost_acc = vec![0.0f64; self.ghost_cols.len()];
        for d in 0..self.nrows {
            for k in self.indptr[d]..self.indptr[d + 1] {
                let c = self.cols[k];
                if c < self.owned_cols {
                    y_true[c] += self.vals[k] * x[d];
                } else {
                    ghost_acc[c - self.owned_cols] += self.vals[k] * x[d];
                }
            }
        }

        // Routes reverse: ghost sums travel to the column owners, which add
        // them onto the same slots they serve during the forward apply.
        let mut outgoing: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
        for (&nbr, range) in &self.plan.recv {
            let buf: Vec<WireValue> = ghost_acc[range.clone()]
                .iter()
                .map(|&v| WireValue::of(v))
                .collect();
            outgoing.insert(nbr, cast_slice(&buf).to_vec());
        }
        let expected: BTreeMap<usize, usize> = self
            .plan
            .send
            .iter()
            .map(|(&nbr, l)| (nbr, l.len() * std::mem::size_of::<WireValue>()))
            .collect();
        let incoming = exchange_fixed(comm, rev_tag, &outgoing, &expected)?;

        for (&nbr, payload) in &incoming {
            let ltdofs = &self.plan.send[&nbr];
            for (&t, chunk) in ltdofs
                .iter()
                .zip(payload.chunks_exact(std::mem::size_of::<WireValue>()))
            {
                let v: WireValue = bytemuck::pod_read_unaligned(chunk);
                y_true[t] += v.get();
            }
        }
        Ok(())
    }
}

/// Restriction by injection: each owned true DOF reads its representative
/// local DOF. No communication; R P = I by construction.
#[derive(Clone, Debug)]
pub struct RestrictionMatrix {
    reps: Vec<usize>,
}

impl RestrictionMatrix {
    pub(crate) fn from_truedof(tdof: &TrueDofMap) -> Self {
        Self {
            reps: (0..tdof.true_size()).map(|t| tdof.representative(t)).collect(),
        }
    }

    pub fn nrows(&self) -> usize {
        self.reps.len()
    }

    /// y = R x.
    pub fn apply(&self, x: &[f64], y_true: &mut [f64]) -> Result<(), DofSpaceError> {
        check_len(y_true.len(), self.reps.len())?;
        for (t, &d) in self.reps.iter().enumerate() {
            if d >= x.len() {
                return Err(DofSpaceError::VectorSizeMismatch {
                    expected: d + 1,
                    got: x.len(),
                });
            }
            y_true[t] = x[d];
        }
        Ok(())
    }
}

fn check_len(got: usize, expected: usize) -> Result<(), DofSpaceError> {
    if got != expected {
        return Err(DofSpaceError::VectorSizeMismatch { expected, got });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::communicator::NoComm;
    use crate::data::dependency::{DependencyGraph, SourceRef};
    use crate::data::layout::DofLayout;
    use crate::space::{resolve, truedof};
    use crate::topology::group::GroupTopology;
    use approx::assert_relative_eq;

    fn serial_matrix(ndofs: usize, deps: &DependencyGraph) -> (ParCsrMatrix, RestrictionMatrix) {
        let topo = GroupTopology::new(0);
        let layout = DofLayout::new(ndofs);
        let (map, _) = truedof::construct(
            &NoComm,
            &topo,
            &layout,
            deps,
            CommTag::new(0x0500),
            CommTag::new(0x0501),
        )
        .unwrap();
        let offsets = GlobalOffsets::build(
            &NoComm,
            (CommTag::new(0x0502), CommTag::new(0x0503)),
            ndofs,
            map.true_size(),
        )
        .unwrap();
        let (rows, _) =
            resolve::resolve_rows(&NoComm, &map, &offsets, deps, 64, CommTag::new(0x0510))
                .unwrap();
        let p = ParCsrMatrix::from_rows(
            &NoComm,
            &rows,
            &offsets,
            CommTag::new(0x05a0),
            CommTag::new(0x05a1),
            CommTag::new(0x05b0),
        )
        .unwrap();
        let r = RestrictionMatrix::from_truedof(&map);
        (p, r)
    }

    #[test]
    fn serial_identity_block() {
        let (p, r) = serial_matrix(3, &DependencyGraph::new());
        assert_eq!(p.nrows(), 3);
        assert_eq!(p.ncols_owned(), 3);
        assert_eq!(p.nnz(), 3);
        for d in 0..3 {
            assert_eq!(p.row_terms(d), vec![(d as u64, 1.0)]);
        }

        let x = [1.0, 2.0, 3.0];
        let mut y = [0.0; 3];
        p.apply(&NoComm, &x, &mut y).unwrap();
        assert_eq!(y, x);

        let mut back = [0.0; 3];
        r.apply(&y, &mut back).unwrap();
        assert_eq!(back, x);
    }

    #[test]
    fn dependent_row_interpolates_midpoint() {
        let mut deps = DependencyGraph::new();
        deps.insert_row(1, vec![(SourceRef::Local(0), 0.5), (SourceRef::Local(2), 0.5)]);
        let (p, r) = serial_matrix(3, &deps);
        assert_eq!(p.ncols_owned(), 2);
        assert_eq!(p.row_terms(1), vec![(0, 0.5), (1, 0.5)]);

        let x = [2.0, 6.0];
        let mut y = [0.0; 3];
        p.apply(&NoComm, &x, &mut y).unwrap();
        assert_relative_eq!(y[0], 2.0);
        assert_relative_eq!(y[1], 4.0);
        assert_relative_eq!(y[2], 6.0);

        // R P = I: restriction reads the independent representatives.
        let mut back = [0.0; 2];
        r.apply(&y, &mut back).unwrap();
        assert_eq!(back, x);
    }

    #[test]
    fn transpose_accumulates_row_contributions() {
        let mut deps = DependencyGraph::new();
        deps.insert_row(1, vec![(SourceRef::Local(0), 0.5), (SourceRef::Local(2), 0.5)]);
        let (p, _) = serial_matrix(3, &deps);

        let x = [1.0, 1.0, 1.0];
        let mut y = [0.0; 2];
        p.apply_transpose(&NoComm, &x, &mut y).unwrap();
        // Column sums of P: each independent dof plus half the dependent row.
        assert_relative_eq!(y[0], 1.5);
        assert_relative_eq!(y[1], 1.5);
    }

    #[test]
    fn vector_size_is_checked() {
        let (p, _) = serial_matrix(2, &DependencyGraph::new());
        let x = [0.0; 3];
        let mut y = [0.0; 2];
        assert!(matches!(
            p.apply(&NoComm, &x, &mut y),
            Err(DofSpaceError::VectorSizeMismatch { expected: 2, got: 3 })
        ));
    }
}
