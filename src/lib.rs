//! Distributed degree-of-freedom numbering and conforming interpolation
//! operators for partitioned, possibly non-conforming meshes.
//!
//! The mesh layer hands each rank three things: the sharing groups it
//! participates in ([`topology::GroupTopology`]), its local DOF layout with
//! orientation signs ([`data::DofLayout`]), and the dependency rows of any
//! hanging DOFs ([`data::DependencyGraph`]). From those,
//! [`space::DofSpace::build`] numbers the independent unknowns (one true
//! DOF per group, owned by the lowest member rank), gathers the global
//! offset tables, and produces the prolongation/restriction pair: a
//! matrix-free operator on conforming partitions, or an assembled parallel
//! CSR interpolation matrix once dependent rows exist. Dependent rows that
//! reach across ranks are resolved by a round-based forwarding protocol
//! that terminates deterministically and reports cycles instead of hanging.
//!
//! All communication goes through [`comm::Communicator`], so a whole
//! partition can be simulated with threads in one process
//! ([`comm::RayonComm`]) or run over MPI (feature `mpi-support`).

pub mod comm;
pub mod data;
pub mod error;
pub mod ghost;
pub mod space;
pub mod topology;

/// One-stop imports for typical users.
pub mod prelude {
    pub use crate::comm::{CommTag, Communicator, NoComm, RayonComm, Wait};
    #[cfg(feature = "mpi-support")]
    pub use crate::comm::MpiComm;
    pub use crate::data::{DependencyGraph, DofLayout, SourceRef};
    pub use crate::error::DofSpaceError;
    pub use crate::ghost::FaceNbrExchange;
    pub use crate::space::conforming::{ConformingOperator, ReduceMode};
    pub use crate::space::matrix::{ParCsrMatrix, RestrictionMatrix};
    pub use crate::space::offsets::{GlobalOffsets, OffsetTable};
    pub use crate::space::operator::Prolongation;
    pub use crate::space::resolve::ResolveStats;
    pub use crate::space::truedof::TrueDofMap;
    pub use crate::space::{DofSpace, SpaceConfig};
    pub use crate::topology::{GroupId, GroupTopology};
}
