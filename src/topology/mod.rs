//! Mesh-facing topology inputs: sharing groups and their ownership.

pub mod group;

pub use group::{GroupId, GroupTopology};
