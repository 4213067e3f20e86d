//! Communication layer: transport façade, wire records, and the two-stage
//! neighbor exchange every protocol phase is built on.

pub mod communicator;
pub mod exchange;
pub mod wire;

pub use communicator::{CommTag, Communicator, NoComm, RayonComm, Wait};
#[cfg(feature = "mpi-support")]
pub use communicator::MpiComm;
