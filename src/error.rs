//! DofSpaceError: unified error type for dof-space public APIs.
//!
//! Every fallible operation in the crate reports through this enum. The
//! variants follow the taxonomy of the distributed DOF construction:
//! consistency errors (bad group ids, membership mismatches) are programmer
//! or mesh-generation contract violations; protocol errors (cycles, round
//! caps) indicate a dependency graph the resolution rounds cannot finish;
//! communication errors carry the offending neighbor rank.

use thiserror::Error;

/// Unified error type for dof-space operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DofSpaceError {
    /// A local DOF is tagged with a group id the topology does not know.
    #[error("local dof {dof} references group {group} unknown to the group topology")]
    UnknownGroup { dof: usize, group: u32 },
    /// A group id was queried that the topology does not contain.
    #[error("group id {group} unknown to the group topology")]
    UnknownGroupId { group: u32 },
    /// A group was registered without any member ranks.
    #[error("group {group} has an empty member list")]
    EmptyGroup { group: u32 },
    /// This rank holds DOFs of a group it is not a member of.
    #[error("rank {rank} is not a member of group {group}")]
    NotAMember { group: u32, rank: usize },
    /// The master sent a different number of DOFs for a group than we hold.
    #[error("group {group}: master sent {got} dofs, this rank holds {expected}")]
    GroupSizeMismatch {
        group: u32,
        expected: usize,
        got: usize,
    },
    /// Group blocks in a broadcast arrived out of the agreed order.
    #[error("message from rank {neighbor}: expected group {expected}, got group {got}")]
    GroupOrderMismatch {
        neighbor: usize,
        expected: u32,
        got: u32,
    },
    /// A DOF index does not fit the local layout.
    #[error("local dof index {dof} out of range (ndofs = {ndofs})")]
    DofOutOfRange { dof: usize, ndofs: usize },
    /// A DOF sits in one group's ordered list while tagged with another.
    #[error("dof {dof} is listed in group {listed} but tagged with group {tagged}")]
    GroupTagConflict {
        dof: usize,
        listed: u32,
        tagged: u32,
    },
    /// A dependent DOF is also a member of a shared group; its conformity
    /// must be expressed by the dependency row alone.
    #[error("dependent dof {dof} is tagged with shared group {group}")]
    DependentSharedDof { dof: usize, group: u32 },
    /// A dependency row references the DOF it defines.
    #[error("dependency row for dof {dof} references itself")]
    SelfDependency { dof: usize },
    /// A shared DOF never received its true-DOF index from the group master.
    #[error("shared dof {dof} received no true-dof index from owner rank {owner}")]
    MissingTrueDof { dof: usize, owner: usize },
    /// A sign other than +1/-1 was supplied for a DOF.
    #[error("dof {dof}: sign must be +1 or -1, got {sign}")]
    InvalidSign { dof: usize, sign: i8 },
    /// Point-to-point communication with a neighbor failed.
    #[error("communication error with rank {neighbor}: {detail}")]
    CommError { neighbor: usize, detail: String },
    /// A message arrived with an unexpected byte length.
    #[error("message from rank {neighbor} has {got} bytes, expected {expected}")]
    BufferSizeMismatch {
        neighbor: usize,
        expected: usize,
        got: usize,
    },
    /// A wire payload could not be decoded.
    #[error("malformed payload from rank {neighbor}: {detail}")]
    WireFormat { neighbor: usize, detail: String },
    /// The row resolution protocol made no global progress while rows were
    /// still pending: the dependency graph contains a cycle.
    #[error("dependency cycle detected in round {round} ({pending} rows pending globally)")]
    DependencyCycle { round: usize, pending: u64 },
    /// The protocol hit the configured round cap; distinguishes a stalled or
    /// lost exchange from a plain cycle.
    #[error(
        "row resolution did not terminate within {cap} rounds ({pending} rows still pending); \
         incomplete or lost message exchange"
    )]
    RoundCapExceeded { cap: usize, pending: u64 },
    /// A second finalized row arrived for a DOF already finalized.
    #[error("received a second finalized row for dof {dof}")]
    DuplicateFinalize { dof: usize },
    /// A global true-DOF index lies outside every rank's offset range.
    #[error("global true dof {gtdof} outside every rank's range")]
    TrueDofOutOfRange { gtdof: u64 },
    /// A vector passed to an operator has the wrong length.
    #[error("vector length mismatch: expected {expected}, got {got}")]
    VectorSizeMismatch { expected: usize, got: usize },
    /// Ghost values were queried before any exchange (or after invalidation).
    #[error("ghost values requested before exchange or after invalidation")]
    GhostNotExchanged,
    /// A rank index does not fit the communicator size.
    #[error("rank {rank} out of range (nranks = {nranks})")]
    RankOutOfRange { rank: usize, nranks: usize },
}
