//! External inputs describing the per-rank DOF picture: the local layout
//! (groups, signs) and the non-conforming dependency graph.

pub mod dependency;
pub mod layout;

pub use dependency::{DependencyGraph, SourceRef};
pub use layout::DofLayout;
