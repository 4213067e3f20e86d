//! The prolongation/restriction pair in either representation.

use crate::comm::communicator::Communicator;
use crate::error::DofSpaceError;
use crate::space::conforming::ConformingOperator;
use crate::space::matrix::{ParCsrMatrix, RestrictionMatrix};

/// Interpolation operator of a space: an assembled matrix pair when the
/// space has dependent DOFs (or a matrix was forced), otherwise the
/// matrix-free conforming form.
#[derive(Debug)]
pub enum Prolongation {
    Explicit {
        p: ParCsrMatrix,
        r: RestrictionMatrix,
    },
    Implicit(ConformingOperator),
}

impl Prolongation {
    pub fn is_implicit(&self) -> bool {
        matches!(self, Prolongation::Implicit(_))
    }

    /// The assembled interpolation matrix, when one exists.
    pub fn p_matrix(&self) -> Option<&ParCsrMatrix> {
        match self {
            Prolongation::Explicit { p, .. } => Some(p),
            Prolongation::Implicit(_) => None,
        }
    }

    pub fn restriction(&self) -> Option<&RestrictionMatrix> {
        match self {
            Prolongation::Explicit { r, .. } => Some(r),
            Prolongation::Implicit(_) => None,
        }
    }

    pub fn conforming(&self) -> Option<&ConformingOperator> {
        match self {
            Prolongation::Implicit(op) => Some(op),
            Prolongation::Explicit { .. } => None,
        }
    }

    /// y = P x.
    pub fn apply<C: Communicator>(
        &self,
        comm: &C,
        x_true: &[f64],
        y: &mut [f64],
    ) -> Result<(), DofSpaceError> {
        match self {
            Prolongation::Explicit { p, .. } => p.apply(comm, x_true, y),
            Prolongation::Implicit(op) => op.apply(comm, x_true, y),
        }
    }

    /// y = Pᵀ x.
    pub fn apply_transpose<C: Communicator>(
        &self,
        comm: &C,
        x: &[f64],
        y_true: &mut [f64],
    ) -> Result<(), DofSpaceError> {
        match self {
            Prolongation::Explicit { p, .. } => p.apply_transpose(comm, x, y_true),
            Prolongation::Implicit(op) => op.apply_transpose(comm, x, y_true),
        }
    }

    /// y = R x. The explicit restriction is injection; the implicit one
    /// honors the operator's configured reduction mode.
    pub fn restrict<C: Communicator>(
        &self,
        comm: &C,
        x: &[f64],
        y_true: &mut [f64],
    ) -> Result<(), DofSpaceError> {
        match self {
            Prolongation::Explicit { r, .. } => r.apply(x, y_true),
            Prolongation::Implicit(op) => op.restrict(comm, x, y_true),
        }
    }
}
