//! Local DOF layout: per-entity ordered DOF lists and basis-orientation
//! signs.
//!
//! The mesh layer supplies, for every shared entity group, the list of
//! rank-local DOF indices living on that entity. The list order is the
//! entity-canonical order agreed across ranks (same entity, same DOF count,
//! same traversal), which is what lets the true-DOF broadcast align
//! positions without shipping any geometry.

use std::collections::BTreeMap;

use crate::error::DofSpaceError;
use crate::topology::group::{GroupId, GroupTopology};

/// Per-rank DOF layout: group tag and sign per local DOF, plus the ordered
/// DOF list of each shared group.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct DofLayout {
    ndofs: usize,
    dof_group: Vec<GroupId>,
    dof_sign: Vec<i8>,
    group_dofs: BTreeMap<GroupId, Vec<usize>>,
}

impl DofLayout {
    /// A layout of `ndofs` local DOFs, all private (group 0) with sign +1.
    pub fn new(ndofs: usize) -> Self {
        Self {
            ndofs,
            dof_group: vec![GroupId::LOCAL; ndofs],
            dof_sign: vec![1; ndofs],
            group_dofs: BTreeMap::new(),
        }
    }

    pub fn ndofs(&self) -> usize {
        self.ndofs
    }

    /// Attach the ordered DOF list of a shared entity group. Each listed DOF
    /// is tagged with `group`; a DOF may belong to at most one group, and
    /// re-listing it under a second one is rejected. The layout is untouched
    /// on error.
    pub fn set_group_dofs(
        &mut self,
        group: GroupId,
        dofs: Vec<usize>,
    ) -> Result<(), DofSpaceError> {
        for &d in &dofs {
            if d >= self.ndofs {
                return Err(DofSpaceError::DofOutOfRange {
                    dof: d,
                    ndofs: self.ndofs,
                });
            }
            let tagged = self.dof_group[d];
            if !tagged.is_local() && tagged != group {
                return Err(DofSpaceError::GroupTagConflict {
                    dof: d,
                    listed: group.get(),
                    tagged: tagged.get(),
                });
            }
        }
        // Replacing a group's list untags the dofs that dropped out of it.
        if let Some(old) = self.group_dofs.get(&group) {
            for &d in old {
                self.dof_group[d] = GroupId::LOCAL;
            }
        }
        for &d in &dofs {
            self.dof_group[d] = group;
        }
        self.group_dofs.insert(group, dofs);
        Ok(())
    }

    /// Record the basis-orientation sign of a DOF (must be +1 or -1).
    pub fn set_sign(&mut self, dof: usize, sign: i8) -> Result<(), DofSpaceError> {
        if dof >= self.ndofs {
            return Err(DofSpaceError::DofOutOfRange {
                dof,
                ndofs: self.ndofs,
            });
        }
        if sign != 1 && sign != -1 {
            return Err(DofSpaceError::InvalidSign { dof, sign });
        }
        self.dof_sign[dof] = sign;
        Ok(())
    }

    #[inline]
    pub fn group_of(&self, dof: usize) -> GroupId {
        self.dof_group[dof]
    }

    #[inline]
    pub fn sign_of(&self, dof: usize) -> i8 {
        self.dof_sign[dof]
    }

    /// Ordered DOFs of a shared group (empty slice when the group holds no
    /// local DOFs).
    pub fn dofs_of(&self, group: GroupId) -> &[usize] {
        self.group_dofs.get(&group).map_or(&[], |v| v.as_slice())
    }

    /// Iterate shared groups ascending by group id.
    pub fn shared_groups(&self) -> impl Iterator<Item = (GroupId, &[usize])> {
        self.group_dofs
            .iter()
            .filter(|(g, _)| !g.is_local())
            .map(|(g, dofs)| (*g, dofs.as_slice()))
    }

    /// Check every referenced group against the topology, and the group DOF
    /// lists against the per-DOF tags. A DOF claiming membership in an
    /// unknown group, or listed under a group it is no longer tagged with,
    /// is a fatal consistency failure.
    pub fn validate(&self, topo: &GroupTopology) -> Result<(), DofSpaceError> {
        for (d, g) in self.dof_group.iter().enumerate() {
            if !g.is_local() && !topo.contains(*g) {
                return Err(DofSpaceError::UnknownGroup {
                    dof: d,
                    group: g.get(),
                });
            }
        }
        for (g, dofs) in self.shared_groups() {
            for &d in dofs {
                if self.dof_group[d] != g {
                    return Err(DofSpaceError::GroupTagConflict {
                        dof: d,
                        listed: g.get(),
                        tagged: self.dof_group[d].get(),
                    });
                }
            }
        }
        for (g, _) in self.shared_groups() {
            // Registration already guarantees membership of the local rank;
            // this re-checks layouts deserialized from elsewhere.
            let members = topo.members(g)?;
            if !members.contains(&topo.my_rank()) {
                return Err(DofSpaceError::NotAMember {
                    group: g.get(),
                    rank: topo.my_rank(),
                });
            }
        }
        Ok(())
    }
}
