//! Distributed DOF space construction.
//!
//! [`DofSpace::build`] runs the whole pipeline on every rank: validate the
//! inputs, assign true DOFs and broadcast them from the group masters,
//! all-gather the global offsets, then either wire up the matrix-free
//! conforming operator or resolve the dependent rows and assemble the
//! interpolation matrix.

pub mod conforming;
pub mod matrix;
pub mod offsets;
pub mod operator;
pub mod resolve;
pub mod truedof;

use crate::comm::communicator::{CommTag, Communicator};
use crate::data::dependency::DependencyGraph;
use crate::data::layout::DofLayout;
use crate::error::DofSpaceError;
use crate::topology::group::GroupTopology;

use conforming::{ConformingOperator, ReduceMode};
use matrix::{ParCsrMatrix, RestrictionMatrix};
use offsets::GlobalOffsets;
use operator::Prolongation;
use resolve::ResolveStats;
use truedof::TrueDofMap;

/// Knobs for [`DofSpace::build`].
#[derive(Clone, Copy, Debug)]
pub struct SpaceConfig {
    /// Round cap for dependent-row resolution (clamped to 1..=120).
    pub max_rounds: usize,
    /// Reduction used by the matrix-free restriction.
    pub reduce_mode: ReduceMode,
    /// Assemble the interpolation matrix even when the space is conforming.
    pub force_matrix: bool,
    /// First tag of the window this space uses; concurrent spaces on one
    /// communicator must use disjoint windows.
    pub tag_base: u16,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            max_rounds: 64,
            reduce_mode: ReduceMode::Copy,
            force_matrix: false,
            tag_base: 0x1000,
        }
    }
}

/// Tag layout within one space's window. Phases that run once get fixed
/// slots; per-round and per-epoch phases get sub-windows sized for the
/// round cap and the epoch rotation.
#[derive(Copy, Clone, Debug)]
pub(crate) struct SpaceTags {
    base: CommTag,
}

impl SpaceTags {
    pub fn new(base: u16) -> Self {
        Self {
            base: CommTag::new(base),
        }
    }

    pub fn truedof_sizes(&self) -> CommTag {
        self.base
    }
    pub fn truedof_data(&self) -> CommTag {
        self.base.offset(1)
    }
    pub fn offsets_dof(&self) -> CommTag {
        self.base.offset(2)
    }
    pub fn offsets_tdof(&self) -> CommTag {
        self.base.offset(3)
    }
    /// 4 tags per round from here; the round cap keeps this under 0x200.
    pub fn resolve_base(&self) -> CommTag {
        self.base.offset(8)
    }
    pub fn colplan_sizes(&self) -> CommTag {
        self.base.offset(0x200)
    }
    pub fn colplan_data(&self) -> CommTag {
        self.base.offset(0x201)
    }
    /// 128-tag epoch window (forward and transpose halves).
    pub fn matrix_apply(&self) -> CommTag {
        self.base.offset(0x210)
    }
    pub fn conforming_apply(&self) -> CommTag {
        self.base.offset(0x300)
    }
}

/// A fully constructed distributed DOF space.
#[derive(Debug)]
pub struct DofSpace {
    my_rank: usize,
    nranks: usize,
    ndofs: usize,
    tdof: TrueDofMap,
    offsets: GlobalOffsets,
    operator: Prolongation,
    stats: Option<ResolveStats>,
}

impl DofSpace {
    /// Construct the space. Collective: every rank of `comm` must call this
    /// with consistent group and layout data.
    pub fn build<C: Communicator>(
        comm: &C,
        topo: &GroupTopology,
        layout: &DofLayout,
        deps: &DependencyGraph,
        cfg: &SpaceConfig,
    ) -> Result<Self, DofSpaceError> {
        layout.validate(topo)?;
        deps.validate(layout.ndofs(), comm.rank())?;
        let tags = SpaceTags::new(cfg.tag_base);

        let (tdof, plan) = truedof::construct(
            comm,
            topo,
            layout,
            deps,
            tags.truedof_sizes(),
            tags.truedof_data(),
        )?;
        let offsets = GlobalOffsets::build(
            comm,
            (tags.offsets_dof(), tags.offsets_tdof()),
            layout.ndofs(),
            tdof.true_size(),
        )?;

        let (operator, stats) = if deps.is_empty() && !cfg.force_matrix {
            let op =
                ConformingOperator::new(&tdof, plan, cfg.reduce_mode, tags.conforming_apply());
            (Prolongation::Implicit(op), None)
        } else {
            let (rows, stats) = resolve::resolve_rows(
                comm,
                &tdof,
                &offsets,
                deps,
                cfg.max_rounds,
                tags.resolve_base(),
            )?;
            let p = ParCsrMatrix::from_rows(
                comm,
                &rows,
                &offsets,
                tags.colplan_sizes(),
                tags.colplan_data(),
                tags.matrix_apply(),
            )?;
            let r = RestrictionMatrix::from_truedof(&tdof);
            (Prolongation::Explicit { p, r }, Some(stats))
        };

        log::info!(
            "dof space built: rank {}/{}, {} local dofs, {} true dofs ({} global), {}",
            comm.rank(),
            comm.size(),
            layout.ndofs(),
            tdof.true_size(),
            offsets.global_tdof_count(),
            if operator.is_implicit() {
                "implicit operator"
            } else {
                "assembled matrix"
            }
        );

        Ok(Self {
            my_rank: comm.rank(),
            nranks: comm.size(),
            ndofs: layout.ndofs(),
            tdof,
            offsets,
            operator,
            stats,
        })
    }

    pub fn rank(&self) -> usize {
        self.my_rank
    }

    pub fn nranks(&self) -> usize {
        self.nranks
    }

    /// Local DOF count (the operator's row space on this rank).
    pub fn ndofs(&self) -> usize {
        self.ndofs
    }

    /// Owned true-DOF count (the operator's column space on this rank).
    pub fn true_size(&self) -> usize {
        self.tdof.true_size()
    }

    pub fn global_dof_count(&self) -> u64 {
        self.offsets.global_dof_count()
    }

    pub fn global_tdof_count(&self) -> u64 {
        self.offsets.global_tdof_count()
    }

    /// This rank's first global DOF index.
    pub fn dof_offset(&self) -> u64 {
        self.offsets
            .dof_offset(self.my_rank)
            .unwrap_or_default()
    }

    /// This rank's first global true-DOF index.
    pub fn tdof_offset(&self) -> u64 {
        self.offsets
            .tdof_offset(self.my_rank)
            .unwrap_or_default()
    }

    pub fn offsets(&self) -> &GlobalOffsets {
        &self.offsets
    }

    pub fn true_dof_map(&self) -> &TrueDofMap {
        &self.tdof
    }

    pub fn owner(&self, ldof: usize) -> usize {
        self.tdof.owner(ldof)
    }

    pub fn is_dependent(&self, ldof: usize) -> bool {
        self.tdof.is_dependent(ldof)
    }

    /// Rank-local true-DOF index of an owned DOF, `None` otherwise.
    pub fn local_tdof_number(&self, ldof: usize) -> Option<usize> {
        self.tdof.local_tdof(ldof)
    }

    /// Global true-DOF index of a non-dependent DOF, `None` for dependent
    /// ones (their rows have no single column).
    pub fn global_tdof_number(&self, ldof: usize) -> Result<Option<u64>, DofSpaceError> {
        match self.tdof.owner_ltdof(ldof) {
            Some(ltdof) => Ok(Some(self.offsets.tdof_offset(self.tdof.owner(ldof))? + ltdof)),
            None => Ok(None),
        }
    }

    pub fn prolongation(&self) -> &Prolongation {
        &self.operator
    }

    /// Protocol counters from row resolution; `None` for implicit spaces.
    pub fn resolve_stats(&self) -> Option<&ResolveStats> {
        self.stats.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::communicator::NoComm;
    use crate::data::dependency::SourceRef;

    #[test]
    fn serial_conforming_space_is_implicit() {
        let topo = GroupTopology::new(0);
        let layout = DofLayout::new(4);
        let deps = DependencyGraph::new();
        let space =
            DofSpace::build(&NoComm, &topo, &layout, &deps, &SpaceConfig::default()).unwrap();

        assert!(space.prolongation().is_implicit());
        assert_eq!(space.true_size(), 4);
        assert_eq!(space.global_tdof_count(), 4);
        assert_eq!(space.dof_offset(), 0);
        assert_eq!(space.global_tdof_number(2).unwrap(), Some(2));
        assert!(space.resolve_stats().is_none());
    }

    #[test]
    fn force_matrix_matches_implicit_apply() {
        let topo = GroupTopology::new(0);
        let layout = DofLayout::new(3);
        let deps = DependencyGraph::new();
        let implicit =
            DofSpace::build(&NoComm, &topo, &layout, &deps, &SpaceConfig::default()).unwrap();
        let explicit = DofSpace::build(&NoComm, &topo, &layout, &deps, &SpaceConfig {
            force_matrix: true,
            tag_base: 0x2000,
            ..SpaceConfig::default()
        })
        .unwrap();
        assert!(!explicit.prolongation().is_implicit());

        let x = [1.0, 2.0, 3.0];
        let mut y_imp = [0.0; 3];
        let mut y_exp = [0.0; 3];
        implicit.prolongation().apply(&NoComm, &x, &mut y_imp).unwrap();
        explicit.prolongation().apply(&NoComm, &x, &mut y_exp).unwrap();
        assert_eq!(y_imp, y_exp);
    }

    #[test]
    fn dependent_dofs_force_the_matrix_path() {
        let topo = GroupTopology::new(0);
        let layout = DofLayout::new(3);
        let mut deps = DependencyGraph::new();
        deps.insert_row(1, vec![(SourceRef::Local(0), 0.5), (SourceRef::Local(2), 0.5)]);
        let space = DofSpace::build(&NoComm, &topo, &layout, &deps, &SpaceConfig {
            tag_base: 0x3000,
            ..SpaceConfig::default()
        })
        .unwrap();

        assert!(!space.prolongation().is_implicit());
        assert_eq!(space.true_size(), 2);
        assert_eq!(space.global_tdof_number(1).unwrap(), None);
        assert!(space.is_dependent(1));
        let stats = space.resolve_stats().unwrap();
        assert_eq!(stats.rounds, 1);
        let p = space.prolongation().p_matrix().unwrap();
        assert_eq!(p.row_terms(1), vec![(0, 0.5), (1, 0.5)]);
    }
}
