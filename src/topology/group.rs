//! Group topology: which ranks share which mesh entity, and who masters it.
//!
//! A *group* is the set of ranks that jointly own one shared mesh entity
//! (vertex, edge, or face). Group ids are agreed across ranks by the mesh
//! layer; this crate consumes them, it never invents them. Group id 0 is
//! reserved for "not shared": entities seen by this rank alone.

use std::collections::BTreeSet;

use crate::error::DofSpaceError;

/// Identifier of a sharing group. Id 0 ([`GroupId::LOCAL`]) marks entities
/// private to the current rank.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct GroupId(pub u32);

impl GroupId {
    /// The reserved "not shared" group.
    pub const LOCAL: GroupId = GroupId(0);

    #[inline]
    pub fn is_local(self) -> bool {
        self == Self::LOCAL
    }
    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

/// Static description of all sharing groups this rank participates in.
///
/// Invariant: every registered group lists its member ranks sorted
/// ascending, contains the local rank, and is identical on every member
/// rank (the cross-rank part of the invariant is the mesh layer's contract;
/// count mismatches are caught during the true-DOF broadcast).
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct GroupTopology {
    my_rank: usize,
    /// Member ranks per group id; index 0 is the reserved local group.
    members: Vec<Vec<usize>>,
}

impl GroupTopology {
    pub fn new(my_rank: usize) -> Self {
        Self {
            my_rank,
            members: vec![Vec::new()],
        }
    }

    pub fn my_rank(&self) -> usize {
        self.my_rank
    }

    /// Number of group slots, including the reserved local group 0.
    pub fn ngroups(&self) -> usize {
        self.members.len()
    }

    /// Register a sharing group and return its id. Ids are assigned densely
    /// in registration order, which must match across member ranks.
    pub fn add_group(&mut self, members: Vec<usize>) -> Result<GroupId, DofSpaceError> {
        let id = GroupId(self.members.len() as u32);
        if members.is_empty() {
            return Err(DofSpaceError::EmptyGroup { group: id.get() });
        }
        let mut sorted = members;
        sorted.sort_unstable();
        sorted.dedup();
        if !sorted.contains(&self.my_rank) {
            return Err(DofSpaceError::NotAMember {
                group: id.get(),
                rank: self.my_rank,
            });
        }
        self.members.push(sorted);
        Ok(id)
    }

    pub fn contains(&self, group: GroupId) -> bool {
        (group.get() as usize) < self.members.len()
    }

    /// Member ranks of a group, sorted ascending. Group 0 yields just the
    /// local rank.
    pub fn members(&self, group: GroupId) -> Result<&[usize], DofSpaceError> {
        if group.is_local() {
            return Ok(std::slice::from_ref(&self.my_rank));
        }
        self.members
            .get(group.get() as usize)
            .map(|v| v.as_slice())
            .ok_or(DofSpaceError::UnknownGroupId { group: group.get() })
    }

    /// The owning (master) rank of a group: the lowest member rank.
    pub fn master(&self, group: GroupId) -> Result<usize, DofSpaceError> {
        Ok(self.members(group)?[0])
    }

    pub fn is_master(&self, group: GroupId) -> Result<bool, DofSpaceError> {
        Ok(self.master(group)? == self.my_rank)
    }

    /// All ranks sharing at least one group with this rank.
    pub fn neighbor_ranks(&self) -> BTreeSet<usize> {
        let mut out = BTreeSet::new();
        for group in self.members.iter().skip(1) {
            out.extend(group.iter().copied());
        }
        out.remove(&self.my_rank);
        out
    }
}
