//! Matrix-free conforming interpolation.
//!
//! On a conforming partition the interpolation matrix has exactly one ±1
//! entry per row, so prolongation is a copy plus one master-to-member value
//! broadcast and never needs the assembled matrix. The buffer layout reuses
//! the group-major plan negotiated during true-DOF assignment, which makes
//! the result bitwise identical to applying the explicit matrix.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU16, Ordering};

use crate::comm::communicator::{CommTag, Communicator};
use crate::comm::exchange::exchange_fixed;
use crate::comm::wire::{WireValue, cast_slice};
use crate::error::DofSpaceError;
use crate::space::truedof::{SharedPlan, TrueDofMap};

const EPOCH_WINDOW: u16 = 64;

/// How `restrict` reduces the copies of a shared true DOF.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ReduceMode {
    /// Read the owner's representative copy. Exact inverse of prolongation
    /// on its range.
    #[default]
    Copy,
    /// Arithmetic mean of all copies (sign-corrected). Smooths vectors that
    /// are not group-consistent; still an inverse on conforming data.
    Average,
}

/// Matrix-free stand-in for the interpolation and restriction pair on a
/// conforming space.
#[derive(Debug)]
pub struct ConformingOperator {
    ndofs: usize,
    true_size: usize,
    /// ltdof -> representative local dof.
    rep: Vec<usize>,
    /// Orientation coefficient per local dof.
    coef: Vec<f64>,
    plan: SharedPlan,
    mode: ReduceMode,
    apply_tag: CommTag,
    epoch: AtomicU16,
}

impl ConformingOperator {
    pub(crate) fn new(
        tdof: &TrueDofMap,
        plan: SharedPlan,
        mode: ReduceMode,
        apply_tag: CommTag,
    ) -> Self {
        Self {
            ndofs: tdof.ndofs(),
            true_size: tdof.true_size(),
            rep: (0..tdof.true_size()).map(|t| tdof.representative(t)).collect(),
            coef: (0..tdof.ndofs()).map(|d| tdof.coef(d)).collect(),
            plan,
            mode,
            apply_tag,
            epoch: AtomicU16::new(0),
        }
    }

    pub fn ndofs(&self) -> usize {
        self.ndofs
    }

    pub fn true_size(&self) -> usize {
        self.true_size
    }

    pub fn reduce_mode(&self) -> ReduceMode {
        self.mode
    }

    fn epoch_tags(&self) -> (CommTag, CommTag) {
        let e = self.epoch.fetch_add(1, Ordering::Relaxed) % EPOCH_WINDOW;
        (self.apply_tag.offset(e), self.apply_tag.offset(EPOCH_WINDOW + e))
    }

    /// y = P x: copy owned values to their representatives, broadcast them
    /// to the member copies, and apply each copy's orientation sign.
    pub fn apply<C: Communicator>(
        &self,
        comm: &C,
        x_true: &[f64],
        y: &mut [f64],
    ) -> Result<(), DofSpaceError> {
        check_len(x_true.len(), self.true_size)?;
        check_len(y.len(), self.ndofs)?;
        let (fwd_tag, _) = self.epoch_tags();

        for (t, &d) in self.rep.iter().enumerate() {
            y[d] = x_true[t];
        }

        let mut outgoing: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
        for (&nbr, ltdofs) in &self.plan.send {
            let buf: Vec<WireValue> = ltdofs.iter().map(|&t| WireValue::of(x_true[t])).collect();
            outgoing.insert(nbr, cast_slice(&buf).to_vec());
        }
        let expected: BTreeMap<usize, usize> = self
            .plan
            .recv
            .iter()
            .map(|(&nbr, l)| (nbr, l.len() * std::mem::size_of::<WireValue>()))
            .collect();
        let incoming = exchange_fixed(comm, fwd_tag, &outgoing, &expected)?;

        for (&nbr, payload) in &incoming {
            let ldofs = &self.plan.recv[&nbr];
            for (&d, chunk) in ldofs
                .iter()
                .zip(payload.chunks_exact(std::mem::size_of::<WireValue>()))
            {
                let v: WireValue = bytemuck::pod_read_unaligned(chunk);
                y[d] = self.coef[d] * v.get();
            }
        }
        Ok(())
    }

    /// y = Pᵀ x: members return their sign-corrected copies to the master,
    /// which sums them onto the true DOF.
    pub fn apply_transpose<C: Communicator>(
        &self,
        comm: &C,
        x: &[f64],
        y_true: &mut [f64],
    ) -> Result<(), DofSpaceError> {
        check_len(x.len(), self.ndofs)?;
        check_len(y_true.len(), self.true_size)?;
        let (_, rev_tag) = self.epoch_tags();

        for (t, &d) in self.rep.iter().enumerate() {
            y_true[t] = x[d];
        }

        let mut outgoing: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
        for (&nbr, ldofs) in &self.plan.recv {
            let buf: Vec<WireValue> = ldofs
                .iter()
                .map(|&d| WireValue::of(self.coef[d] * x[d]))
                .collect();
            outgoing.insert(nbr, cast_slice(&buf).to_vec());
        }
        let expected: BTreeMap<usize, usize> = self
            .plan
            .send
            .iter()
            .map(|(&nbr, l)| (nbr, l.len() * std::mem::size_of::<WireValue>()))
            .collect();
        let incoming = exchange_fixed(comm, rev_tag, &outgoing, &expected)?;

        for (&nbr, payload) in &incoming {
            let ltdofs = &self.plan.send[&nbr];
            for (&t, chunk) in ltdofs
                .iter()
                .zip(payload.chunks_exact(std::mem::size_of::<WireValue>()))
            {
                let v: WireValue = bytemuck::pod_read_unaligned(chunk);
                y_true[t] += v.get();
            }
        }
        Ok(())
    }

    /// y = R x per the configured [`ReduceMode`].
    pub fn restrict<C: Communicator>(
        &self,
        comm: &C,
        x: &[f64],
        y_true: &mut [f64],
    ) -> Result<(), DofSpaceError> {
        match self.mode {
            ReduceMode::Copy => {
                check_len(x.len(), self.ndofs)?;
                check_len(y_true.len(), self.true_size)?;
                for (t, &d) in self.rep.iter().enumerate() {
                    y_true[t] = x[d];
                }
                Ok(())
            }
            ReduceMode::Average => {
                self.apply_transpose(comm, x, y_true)?;
                for (t, v) in y_true.iter_mut().enumerate() {
                    *v /= self.plan.copy_counts[t] as f64;
                }
                Ok(())
            }
        }
    }
}

fn check_len(got: usize, expected: usize) -> Result<(), DofSpaceError> {
    if got != expected {
        return Err(DofSpaceError::VectorSizeMismatch { expected, got });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::communicator::NoComm;
    use crate::data::dependency::DependencyGraph;
    use crate::data::layout::DofLayout;
    use crate::space::truedof;
    use crate::topology::group::GroupTopology;

    fn serial_op(mode: ReduceMode) -> ConformingOperator {
        let topo = GroupTopology::new(0);
        let layout = DofLayout::new(3);
        let (map, plan) = truedof::construct(
            &NoComm,
            &topo,
            &layout,
            &DependencyGraph::new(),
            CommTag::new(0x0600),
            CommTag::new(0x0601),
        )
        .unwrap();
        ConformingOperator::new(&map, plan, mode, CommTag::new(0x0610))
    }

    #[test]
    fn serial_apply_is_identity() {
        let op = serial_op(ReduceMode::Copy);
        let x = [1.0, -2.0, 3.0];
        let mut y = [0.0; 3];
        op.apply(&NoComm, &x, &mut y).unwrap();
        assert_eq!(y, x);

        let mut back = [0.0; 3];
        op.restrict(&NoComm, &y, &mut back).unwrap();
        assert_eq!(back, x);
    }

    #[test]
    fn serial_average_equals_copy_without_sharing() {
        let op = serial_op(ReduceMode::Average);
        let x = [4.0, 5.0, 6.0];
        let mut y = [0.0; 3];
        op.apply(&NoComm, &x, &mut y).unwrap();
        let mut back = [0.0; 3];
        op.restrict(&NoComm, &y, &mut back).unwrap();
        assert_eq!(back, x);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let op = serial_op(ReduceMode::Copy);
        let x = [0.0; 2];
        let mut y = [0.0; 3];
        assert!(matches!(
            op.apply(&NoComm, &x, &mut y),
            Err(DofSpaceError::VectorSizeMismatch { expected: 3, got: 2 })
        ));
    }
}
