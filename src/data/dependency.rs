//! Dependency graph for non-conforming meshes: each dependent local DOF is
//! a weighted linear combination of other DOFs, local or remote, possibly
//! themselves dependent. The graph is an input derived from the refinement
//! tree; acyclicity is the mesh layer's contract and is only checked
//! defensively (the resolution protocol converts a real cycle into a
//! diagnosable error instead of hanging).

use std::collections::BTreeMap;

use crate::error::DofSpaceError;

/// A source a dependent DOF draws from: a rank-local DOF index, or a DOF on
/// a remote rank addressed by that rank's local numbering.
#[derive(Copy, Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum SourceRef {
    Local(usize),
    Remote { rank: usize, dof: u64 },
}

/// Sparse map from dependent local DOFs to their weighted source lists.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct DependencyGraph {
    rows: BTreeMap<usize, Vec<(SourceRef, f64)>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `dof` dependent with the given weighted sources. An empty
    /// source list is legal and yields an all-zero interpolation row (a
    /// fully constrained DOF).
    pub fn insert_row(&mut self, dof: usize, sources: Vec<(SourceRef, f64)>) {
        self.rows.insert(dof, sources);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_dependent(&self, dof: usize) -> bool {
        self.rows.contains_key(&dof)
    }

    pub fn sources_of(&self, dof: usize) -> Option<&[(SourceRef, f64)]> {
        self.rows.get(&dof).map(|v| v.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &[(SourceRef, f64)])> {
        self.rows.iter().map(|(d, s)| (*d, s.as_slice()))
    }

    /// Basic well-formedness: indices in range, no trivial self-reference,
    /// remote refs actually remote.
    pub fn validate(&self, ndofs: usize, my_rank: usize) -> Result<(), DofSpaceError> {
        for (&dof, sources) in &self.rows {
            if dof >= ndofs {
                return Err(DofSpaceError::DofOutOfRange { dof, ndofs });
            }
            for (src, _) in sources {
                match *src {
                    SourceRef::Local(s) => {
                        if s >= ndofs {
                            return Err(DofSpaceError::DofOutOfRange { dof: s, ndofs });
                        }
                        if s == dof {
                            return Err(DofSpaceError::SelfDependency { dof });
                        }
                    }
                    SourceRef::Remote { rank, dof: rdof } => {
                        if rank == my_rank && rdof as usize == dof {
                            return Err(DofSpaceError::SelfDependency { dof });
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependent_lookup() {
        let mut deps = DependencyGraph::new();
        deps.insert_row(3, vec![(SourceRef::Local(1), 0.5), (SourceRef::Local(2), 0.5)]);
        assert!(deps.is_dependent(3));
        assert!(!deps.is_dependent(1));
        assert_eq!(deps.sources_of(3).unwrap().len(), 2);
        assert_eq!(deps.len(), 1);
    }

    #[test]
    fn validate_rejects_self_reference() {
        let mut deps = DependencyGraph::new();
        deps.insert_row(0, vec![(SourceRef::Local(0), 1.0)]);
        assert_eq!(
            deps.validate(4, 0).unwrap_err(),
            DofSpaceError::SelfDependency { dof: 0 }
        );
    }

    #[test]
    fn empty_source_list_is_legal() {
        let mut deps = DependencyGraph::new();
        deps.insert_row(1, vec![]);
        assert!(deps.validate(2, 0).is_ok());
        assert_eq!(deps.sources_of(1).unwrap(), &[]);
    }
}
