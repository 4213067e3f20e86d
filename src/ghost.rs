//! Ghost (face-neighbor) DOF exchange.
//!
//! Ranks that share an interface exchange the DOF values the other side
//! needs for off-rank element evaluation. Ghost slots extend the local
//! numbering: slot `k` stands for local index `ndofs + k`, grouped by
//! neighbor in ascending rank order. The routing is negotiated once; each
//! refresh is a single fixed-size value exchange, and the received values
//! are cached until the caller invalidates them.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU16, Ordering};

use crate::comm::communicator::{CommTag, Communicator};
use crate::comm::exchange::exchange_fixed;
use crate::comm::wire::{WireCount, WireValue, cast_slice};
use crate::error::DofSpaceError;

const EPOCH_WINDOW: u16 = 64;

/// Negotiated ghost-value routes plus the cached values of the last
/// exchange.
#[derive(Debug)]
pub struct FaceNbrExchange {
    ndofs: usize,
    /// nbr -> local DOFs shipped to that neighbor, in the agreed interface
    /// order.
    send: BTreeMap<usize, Vec<usize>>,
    /// nbr -> slot range in the ghost segment.
    recv: BTreeMap<usize, Range<usize>>,
    num_ghost: usize,
    values: Option<Vec<f64>>,
    tag: CommTag,
    epoch: AtomicU16,
}

impl FaceNbrExchange {
    /// Negotiate ghost counts with every interface neighbor. `send_lists`
    /// names, per neighbor, the local DOFs that neighbor will see as
    /// ghosts, in the interface order both sides agree on. Collective over
    /// the listed neighbors.
    pub fn build<C: Communicator>(
        comm: &C,
        tag: CommTag,
        ndofs: usize,
        send_lists: BTreeMap<usize, Vec<usize>>,
    ) -> Result<Self, DofSpaceError> {
        for dofs in send_lists.values() {
            for &d in dofs {
                if d >= ndofs {
                    return Err(DofSpaceError::DofOutOfRange { dof: d, ndofs });
                }
            }
        }

        let mut outgoing: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
        let mut expected: BTreeMap<usize, usize> = BTreeMap::new();
        for (&nbr, dofs) in &send_lists {
            let cnt = WireCount::new(dofs.len());
            outgoing.insert(nbr, cast_slice(std::slice::from_ref(&cnt)).to_vec());
            expected.insert(nbr, std::mem::size_of::<WireCount>());
        }
        let incoming = exchange_fixed(comm, tag, &outgoing, &expected)?;

        let mut recv = BTreeMap::new();
        let mut num_ghost = 0usize;
        for (&nbr, payload) in &incoming {
            let cnt: WireCount = bytemuck::pod_read_unaligned(payload);
            recv.insert(nbr, num_ghost..num_ghost + cnt.get());
            num_ghost += cnt.get();
        }
        log::debug!(
            "ghost exchange plan: rank {}, {} neighbors, {num_ghost} ghost dofs",
            comm.rank(),
            send_lists.len()
        );

        Ok(Self {
            ndofs,
            send: send_lists,
            recv,
            num_ghost,
            values: None,
            tag,
            epoch: AtomicU16::new(0),
        })
    }

    pub fn num_ghost(&self) -> usize {
        self.num_ghost
    }

    /// Extended vector length: local DOFs followed by the ghost segment.
    pub fn total_size(&self) -> usize {
        self.ndofs + self.num_ghost
    }

    /// Ghost-segment slots filled by a neighbor; local indices are
    /// `ndofs + slot`.
    pub fn ghost_range(&self, nbr: usize) -> Option<Range<usize>> {
        self.recv.get(&nbr).cloned()
    }

    /// Refresh the ghost values from `x` (this rank's local DOF vector) and
    /// cache them. Collective over the interface neighbors.
    pub fn exchange<C: Communicator>(
        &mut self,
        comm: &C,
        x: &[f64],
    ) -> Result<&[f64], DofSpaceError> {
        if x.len() != self.ndofs {
            return Err(DofSpaceError::VectorSizeMismatch {
                expected: self.ndofs,
                got: x.len(),
            });
        }
        let e = self.epoch.fetch_add(1, Ordering::Relaxed) % EPOCH_WINDOW;
        let tag = self.tag.offset(1 + e);

        let mut outgoing: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
        for (&nbr, dofs) in &self.send {
            let buf: Vec<WireValue> = dofs.iter().map(|&d| WireValue::of(x[d])).collect();
            outgoing.insert(nbr, cast_slice(&buf).to_vec());
        }
        let expected: BTreeMap<usize, usize> = self
            .recv
            .iter()
            .map(|(&nbr, r)| (nbr, r.len() * std::mem::size_of::<WireValue>()))
            .collect();
        let incoming = exchange_fixed(comm, tag, &outgoing, &expected)?;

        let mut values = vec![0.0f64; self.num_ghost];
        for (&nbr, payload) in &incoming {
            let range = self.recv[&nbr].clone();
            for (slot, chunk) in
                range.zip(payload.chunks_exact(std::mem::size_of::<WireValue>()))
            {
                let v: WireValue = bytemuck::pod_read_unaligned(chunk);
                values[slot] = v.get();
            }
        }
        self.values = Some(values);
        Ok(self.values.as_deref().unwrap_or(&[]))
    }

    /// Cached ghost values from the last [`exchange`](Self::exchange).
    pub fn values(&self) -> Result<&[f64], DofSpaceError> {
        self.values.as_deref().ok_or(DofSpaceError::GhostNotExchanged)
    }

    /// Drop the cache after the local vector changes.
    pub fn invalidate(&mut self) {
        self.values = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::communicator::{NoComm, RayonComm};
    use serial_test::serial;

    #[test]
    fn no_neighbors_means_no_ghosts() {
        let mut ex =
            FaceNbrExchange::build(&NoComm, CommTag::new(0x0700), 3, BTreeMap::new()).unwrap();
        assert_eq!(ex.num_ghost(), 0);
        assert_eq!(ex.total_size(), 3);
        assert!(matches!(ex.values(), Err(DofSpaceError::GhostNotExchanged)));
        let got = ex.exchange(&NoComm, &[1.0, 2.0, 3.0]).unwrap();
        assert!(got.is_empty());
        assert!(ex.values().unwrap().is_empty());
    }

    #[test]
    fn rejects_out_of_range_send_list() {
        let mut lists = BTreeMap::new();
        lists.insert(1, vec![5]);
        let err = FaceNbrExchange::build(&NoComm, CommTag::new(0x0701), 2, lists).unwrap_err();
        assert_eq!(err, DofSpaceError::DofOutOfRange { dof: 5, ndofs: 2 });
    }

    #[test]
    #[serial]
    fn one_sided_interface_does_not_block() {
        // rank 0 exposes nothing across the interface; rank 1 exposes one
        // dof. Both refreshes must still complete.
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                std::thread::spawn(move || {
                    let comm = RayonComm::new(rank, 2);
                    let mut lists = BTreeMap::new();
                    lists.insert(1 - rank, if rank == 0 { vec![] } else { vec![0] });
                    let mut ex =
                        FaceNbrExchange::build(&comm, CommTag::new(0x0720), 2, lists).unwrap();
                    let x = vec![rank as f64 + 0.5, 9.0];
                    let got = ex.exchange(&comm, &x).unwrap().to_vec();
                    (ex.num_ghost(), got)
                })
            })
            .collect();
        let got: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(got[0], (1, vec![1.5]));
        assert_eq!(got[1], (0, vec![]));
    }

    #[test]
    #[serial]
    fn two_rank_ghost_values_match_owner() {
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                std::thread::spawn(move || {
                    let comm = RayonComm::new(rank, 2);
                    let x: Vec<f64> = (0..3).map(|d| (10 * rank + d) as f64).collect();
                    let mut lists = BTreeMap::new();
                    // Each side exposes its last two dofs to the other.
                    lists.insert(1 - rank, vec![1, 2]);
                    let mut ex =
                        FaceNbrExchange::build(&comm, CommTag::new(0x0710), 3, lists).unwrap();
                    assert_eq!(ex.num_ghost(), 2);
                    assert_eq!(ex.total_size(), 5);
                    let got = ex.exchange(&comm, &x).unwrap().to_vec();
                    ex.invalidate();
                    assert!(ex.values().is_err());
                    got
                })
            })
            .collect();
        let got: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(got[0], vec![11.0, 12.0]);
        assert_eq!(got[1], vec![1.0, 2.0]);
    }
}
