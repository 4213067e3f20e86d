//! True-DOF assignment: one independent unknown per sharing group, owned by
//! the group master.
//!
//! Owned DOFs (private, or shared with this rank as master, and not
//! dependent) are numbered in ascending local-DOF order. Masters then
//! broadcast, per mastered group, the ordered `(true index, canonical
//! sign)` list to the other members; members align the records with their
//! own ordered group DOF lists. A DOF's interpolation coefficient is its
//! local sign relative to the master's canonical sign.

use std::collections::{BTreeMap, BTreeSet};

use crate::comm::communicator::{CommTag, Communicator};
use crate::comm::exchange::exchange_bytes_symmetric;
use crate::comm::wire::{WireGroupBlock, WireTrueDof, cast_slice};
use crate::data::dependency::DependencyGraph;
use crate::data::layout::DofLayout;
use crate::error::DofSpaceError;
use crate::topology::group::GroupTopology;

const INVALID: u64 = u64::MAX;

/// Per-rank map from local DOFs to owning rank, owner-local true-DOF index,
/// and orientation coefficient.
#[derive(Clone, Debug)]
pub struct TrueDofMap {
    my_rank: usize,
    ndofs: usize,
    true_size: usize,
    ldof_owner: Vec<u32>,
    ldof_ltdof: Vec<u64>,
    ldof_coef: Vec<f64>,
    ltdof_ldof: Vec<usize>,
    dependent: Vec<bool>,
}

impl TrueDofMap {
    pub fn ndofs(&self) -> usize {
        self.ndofs
    }

    /// Number of true DOFs owned by this rank.
    pub fn true_size(&self) -> usize {
        self.true_size
    }

    pub fn owner(&self, ldof: usize) -> usize {
        self.ldof_owner[ldof] as usize
    }

    pub fn is_owned(&self, ldof: usize) -> bool {
        self.owner(ldof) == self.my_rank && !self.dependent[ldof]
    }

    pub fn is_dependent(&self, ldof: usize) -> bool {
        self.dependent[ldof]
    }

    /// Rank-local true-DOF index if this rank owns `ldof`, else `None`.
    pub fn local_tdof(&self, ldof: usize) -> Option<usize> {
        if self.is_owned(ldof) {
            Some(self.ldof_ltdof[ldof] as usize)
        } else {
            None
        }
    }

    /// Owner-local true-DOF index of a non-dependent DOF.
    pub fn owner_ltdof(&self, ldof: usize) -> Option<u64> {
        if self.dependent[ldof] || self.ldof_ltdof[ldof] == INVALID {
            None
        } else {
            Some(self.ldof_ltdof[ldof])
        }
    }

    /// Orientation coefficient (±1) relative to the group's canonical sign.
    pub fn coef(&self, ldof: usize) -> f64 {
        self.ldof_coef[ldof]
    }

    /// Representative local DOF of an owned true DOF.
    pub fn representative(&self, ltdof: usize) -> usize {
        self.ltdof_ldof[ltdof]
    }
}

/// Buffer-exchange plan between group masters and members, reused by the
/// implicit conforming operator. Send and receive lists are group-major in
/// ascending group-id order, so both sides agree on slot positions without
/// further negotiation.
#[derive(Clone, Debug, Default)]
pub(crate) struct SharedPlan {
    /// nbr -> owned true-DOF indices whose values this rank broadcasts.
    pub send: BTreeMap<usize, Vec<usize>>,
    /// nbr -> local DOF indices filled from that master's broadcast.
    pub recv: BTreeMap<usize, Vec<usize>>,
    /// Copies per owned true DOF across all ranks (1 for private DOFs).
    pub copy_counts: Vec<u32>,
}

/// Build the true-DOF map and the master/member exchange plan.
pub(crate) fn construct<C: Communicator>(
    comm: &C,
    topo: &GroupTopology,
    layout: &DofLayout,
    deps: &DependencyGraph,
    sizes_tag: CommTag,
    data_tag: CommTag,
) -> Result<(TrueDofMap, SharedPlan), DofSpaceError> {
    let my_rank = comm.rank();
    let ndofs = layout.ndofs();

    let mut ldof_owner = vec![my_rank as u32; ndofs];
    let mut dependent = vec![false; ndofs];
    for d in 0..ndofs {
        let g = layout.group_of(d);
        if deps.is_dependent(d) {
            if !g.is_local() {
                return Err(DofSpaceError::DependentSharedDof {
                    dof: d,
                    group: g.get(),
                });
            }
            dependent[d] = true;
        }
        if !g.is_local() {
            ldof_owner[d] = topo.master(g)? as u32;
        }
    }

    // Owned true DOFs, numbered in ascending local-DOF order.
    let mut ldof_ltdof = vec![INVALID; ndofs];
    let mut ldof_coef = vec![1.0f64; ndofs];
    let mut ltdof_ldof = Vec::new();
    for d in 0..ndofs {
        if ldof_owner[d] as usize == my_rank && !dependent[d] {
            ldof_ltdof[d] = ltdof_ldof.len() as u64;
            ltdof_ldof.push(d);
        }
    }
    let true_size = ltdof_ldof.len();

    // Master broadcast of (ltdof, canonical sign) per mastered group.
    let mut outgoing: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
    let mut peers: BTreeSet<usize> = BTreeSet::new();
    for (g, dofs) in layout.shared_groups() {
        let members = topo.members(g)?;
        peers.extend(members.iter().copied().filter(|&r| r != my_rank));
        if members[0] != my_rank {
            continue;
        }
        for &nbr in &members[1..] {
            let buf = outgoing.entry(nbr).or_default();
            buf.extend_from_slice(cast_slice(std::slice::from_ref(&WireGroupBlock::new(
                g.get(),
                dofs.len(),
            ))));
            for &d in dofs {
                let rec = WireTrueDof::new(ldof_ltdof[d], layout.sign_of(d));
                buf.extend_from_slice(cast_slice(std::slice::from_ref(&rec)));
            }
        }
    }

    let incoming = exchange_bytes_symmetric(comm, &peers, sizes_tag, data_tag, &outgoing)?;

    // Walk this rank's member-side groups per master, in ascending group-id
    // order — the same order the master packed them in.
    let mut expected: BTreeMap<usize, Vec<_>> = BTreeMap::new();
    for (g, dofs) in layout.shared_groups() {
        let master = topo.master(g)?;
        if master != my_rank {
            expected.entry(master).or_default().push((g, dofs));
        }
    }
    for (&nbr, payload) in &incoming {
        let groups = expected.remove(&nbr).unwrap_or_default();
        let mut cursor = 0usize;
        for (g, dofs) in groups {
            let block: WireGroupBlock = read_record(payload, &mut cursor, nbr)?;
            if block.group() != g.get() {
                return Err(DofSpaceError::GroupOrderMismatch {
                    neighbor: nbr,
                    expected: g.get(),
                    got: block.group(),
                });
            }
            if block.ndofs() != dofs.len() {
                return Err(DofSpaceError::GroupSizeMismatch {
                    group: g.get(),
                    expected: dofs.len(),
                    got: block.ndofs(),
                });
            }
            for &d in dofs {
                let rec: WireTrueDof = read_record(payload, &mut cursor, nbr)?;
                ldof_ltdof[d] = rec.ltdof();
                ldof_coef[d] = (layout.sign_of(d) as i32 * rec.sign()) as f64;
            }
        }
        if cursor != payload.len() {
            return Err(DofSpaceError::WireFormat {
                neighbor: nbr,
                detail: format!("{} trailing bytes in true-dof broadcast", payload.len() - cursor),
            });
        }
    }
    // Masters that sent nothing leave their member-side groups unresolved;
    // caught below per DOF.
    for d in 0..ndofs {
        if !dependent[d] && ldof_ltdof[d] == INVALID {
            return Err(DofSpaceError::MissingTrueDof {
                dof: d,
                owner: ldof_owner[d] as usize,
            });
        }
    }

    // Exchange plan for the implicit operator: masters list true-DOF slots
    // to broadcast, members list local DOFs to fill, both group-major.
    let mut plan = SharedPlan {
        send: BTreeMap::new(),
        recv: BTreeMap::new(),
        copy_counts: vec![1u32; true_size],
    };
    for (g, dofs) in layout.shared_groups() {
        let members = topo.members(g)?;
        if members[0] == my_rank {
            for &nbr in &members[1..] {
                let list = plan.send.entry(nbr).or_default();
                list.extend(dofs.iter().map(|&d| ldof_ltdof[d] as usize));
            }
            for &d in dofs {
                plan.copy_counts[ldof_ltdof[d] as usize] = members.len() as u32;
            }
        } else {
            plan.recv
                .entry(members[0])
                .or_default()
                .extend(dofs.iter().copied());
        }
    }

    log::debug!(
        "true-dof assignment: rank {my_rank} owns {true_size} of {ndofs} local dofs \
         ({} dependent)",
        deps.len()
    );

    Ok((
        TrueDofMap {
            my_rank,
            ndofs,
            true_size,
            ldof_owner,
            ldof_ltdof,
            ldof_coef,
            ltdof_ldof,
            dependent,
        },
        plan,
    ))
}

fn read_record<T: bytemuck::Pod>(
    payload: &[u8],
    cursor: &mut usize,
    neighbor: usize,
) -> Result<T, DofSpaceError> {
    let size = std::mem::size_of::<T>();
    let end = *cursor + size;
    if end > payload.len() {
        return Err(DofSpaceError::WireFormat {
            neighbor,
            detail: format!(
                "truncated record: need {} bytes at offset {}, have {}",
                size,
                *cursor,
                payload.len()
            ),
        });
    }
    let rec = bytemuck::pod_read_unaligned(&payload[*cursor..end]);
    *cursor = end;
    Ok(rec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::communicator::NoComm;
    use crate::data::dependency::SourceRef;
    use crate::topology::group::GroupId;

    fn tags() -> (CommTag, CommTag) {
        (CommTag::new(0x0300), CommTag::new(0x0301))
    }

    #[test]
    fn serial_all_dofs_are_true() {
        let topo = GroupTopology::new(0);
        let layout = DofLayout::new(4);
        let deps = DependencyGraph::new();
        let (map, plan) =
            construct(&NoComm, &topo, &layout, &deps, tags().0, tags().1).unwrap();
        assert_eq!(map.true_size(), 4);
        for d in 0..4 {
            assert!(map.is_owned(d));
            assert_eq!(map.local_tdof(d), Some(d));
            assert_eq!(map.coef(d), 1.0);
            assert_eq!(map.representative(d), d);
        }
        assert!(plan.send.is_empty() && plan.recv.is_empty());
        assert_eq!(plan.copy_counts, vec![1; 4]);
    }

    #[test]
    fn dependent_dofs_are_not_true_dofs() {
        let topo = GroupTopology::new(0);
        let layout = DofLayout::new(3);
        let mut deps = DependencyGraph::new();
        deps.insert_row(1, vec![(SourceRef::Local(0), 0.5), (SourceRef::Local(2), 0.5)]);
        let (map, _) = construct(&NoComm, &topo, &layout, &deps, tags().0, tags().1).unwrap();
        assert_eq!(map.true_size(), 2);
        assert_eq!(map.local_tdof(0), Some(0));
        assert_eq!(map.local_tdof(1), None);
        assert!(map.is_dependent(1));
        assert_eq!(map.local_tdof(2), Some(1));
        assert_eq!(map.representative(1), 2);
    }

    #[test]
    fn dependent_shared_dof_is_rejected() {
        let mut topo = GroupTopology::new(0);
        let g = topo.add_group(vec![0, 1]).unwrap();
        let mut layout = DofLayout::new(2);
        layout.set_group_dofs(g, vec![1]).unwrap();
        let mut deps = DependencyGraph::new();
        deps.insert_row(1, vec![(SourceRef::Local(0), 1.0)]);
        let err =
            construct(&NoComm, &topo, &layout, &deps, tags().0, tags().1).unwrap_err();
        assert_eq!(
            err,
            DofSpaceError::DependentSharedDof {
                dof: 1,
                group: g.get()
            }
        );
    }

    #[test]
    fn unknown_group_fails_fast() {
        let topo = GroupTopology::new(0);
        let mut layout = DofLayout::new(1);
        layout.set_group_dofs(GroupId(3), vec![0]).unwrap();
        let deps = DependencyGraph::new();
        let err =
            construct(&NoComm, &topo, &layout, &deps, tags().0, tags().1).unwrap_err();
        assert_eq!(err, DofSpaceError::UnknownGroupId { group: 3 });
    }
}
