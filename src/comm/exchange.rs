//! Two-stage neighbor exchange: sizes first, then payload bytes.
//!
//! Every protocol phase in this crate funnels through these two helpers, so
//! the message-queue discipline (post all receives, post all sends, drain
//! every handle even on error) lives in exactly one place and the round
//! structure of the callers stays auditable.

use std::collections::{BTreeMap, BTreeSet};

use crate::comm::communicator::{CommTag, Communicator, Wait};
use crate::comm::wire::{WireCount, cast_slice, cast_slice_mut};
use crate::error::DofSpaceError;

/// Symmetric byte exchange with the peer set `peers`: every peer is sent a
/// length header (zero when `outgoing` has no entry for it) followed by the
/// payload, and the same is received back. Returns the non-empty incoming
/// payloads keyed by sender rank.
pub fn exchange_bytes_symmetric<C: Communicator>(
    comm: &C,
    peers: &BTreeSet<usize>,
    sizes_tag: CommTag,
    data_tag: CommTag,
    outgoing: &BTreeMap<usize, Vec<u8>>,
) -> Result<BTreeMap<usize, Vec<u8>>, DofSpaceError> {
    // Stage 1: exchange byte lengths.
    let mut recv_size: Vec<(usize, C::RecvHandle)> = Vec::with_capacity(peers.len());
    for &nbr in peers {
        let mut cnt = WireCount::new(0);
        let h = comm.irecv(
            nbr,
            sizes_tag.as_u16(),
            cast_slice_mut(std::slice::from_mut(&mut cnt)),
        );
        recv_size.push((nbr, h));
    }
    let mut pending_sends = Vec::with_capacity(peers.len());
    let mut send_counts = Vec::with_capacity(peers.len());
    for &nbr in peers {
        let len = outgoing.get(&nbr).map_or(0, |v| v.len());
        send_counts.push(WireCount::new(len));
        let last = send_counts.len() - 1;
        pending_sends.push(comm.isend(
            nbr,
            sizes_tag.as_u16(),
            cast_slice(std::slice::from_ref(&send_counts[last])),
        ));
    }

    let mut sizes_in: BTreeMap<usize, usize> = BTreeMap::new();
    let mut maybe_err = None;
    for (nbr, h) in recv_size {
        match h.wait() {
            Some(data) if data.len() == std::mem::size_of::<WireCount>() => {
                if maybe_err.is_none() {
                    let mut cnt = WireCount::new(0);
                    cast_slice_mut(std::slice::from_mut(&mut cnt)).copy_from_slice(&data);
                    sizes_in.insert(nbr, cnt.get());
                }
            }
            Some(data) if maybe_err.is_none() => {
                maybe_err = Some(DofSpaceError::BufferSizeMismatch {
                    neighbor: nbr,
                    expected: std::mem::size_of::<WireCount>(),
                    got: data.len(),
                });
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(DofSpaceError::CommError {
                    neighbor: nbr,
                    detail: "failed to receive size header".into(),
                });
            }
            _ => {} // already failing; just drain
        }
    }
    for send in pending_sends {
        let _ = send.wait();
    }
    drop(send_counts);
    if let Some(err) = maybe_err {
        return Err(err);
    }

    // Stage 2: exchange the payloads whose lengths are non-zero.
    let expected: BTreeMap<usize, usize> =
        sizes_in.into_iter().filter(|&(_, n)| n > 0).collect();
    exchange_fixed(comm, data_tag, outgoing, &expected)
}

/// Byte exchange with known receive lengths: sends every non-empty entry of
/// `outgoing` and receives exactly `expected[nbr]` bytes from each neighbor
/// with a non-zero expectation (a negotiated zero-length route carries no
/// message in either direction). Used when both sides already agree on
/// buffer sizes (implicit operator application, ghost value refresh,
/// column-value exchange).
pub fn exchange_fixed<C: Communicator>(
    comm: &C,
    tag: CommTag,
    outgoing: &BTreeMap<usize, Vec<u8>>,
    expected: &BTreeMap<usize, usize>,
) -> Result<BTreeMap<usize, Vec<u8>>, DofSpaceError> {
    let mut recv_data: Vec<(usize, C::RecvHandle, usize)> = Vec::with_capacity(expected.len());
    let mut recv_bufs: Vec<Vec<u8>> = Vec::with_capacity(expected.len());
    for (&nbr, &len) in expected {
        // Zero-length routes post no receive: senders skip empty payloads,
        // so waiting here would never complete.
        if len == 0 {
            continue;
        }
        let mut buf = vec![0u8; len];
        let h = comm.irecv(nbr, tag.as_u16(), &mut buf);
        recv_bufs.push(buf);
        recv_data.push((nbr, h, len));
    }

    let mut pending_sends = Vec::with_capacity(outgoing.len());
    for (&nbr, payload) in outgoing {
        if payload.is_empty() {
            continue;
        }
        pending_sends.push(comm.isend(nbr, tag.as_u16(), payload));
    }

    let mut incoming = BTreeMap::new();
    let mut maybe_err = None;
    for (nbr, h, len) in recv_data {
        match h.wait() {
            Some(data) if data.len() == len => {
                if maybe_err.is_none() {
                    incoming.insert(nbr, data);
                }
            }
            Some(data) if maybe_err.is_none() => {
                maybe_err = Some(DofSpaceError::BufferSizeMismatch {
                    neighbor: nbr,
                    expected: len,
                    got: data.len(),
                });
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(DofSpaceError::CommError {
                    neighbor: nbr,
                    detail: "failed to receive payload".into(),
                });
            }
            _ => {}
        }
    }
    for send in pending_sends {
        let _ = send.wait();
    }
    drop(recv_bufs);

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(incoming),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::communicator::RayonComm;
    use serial_test::serial;

    #[test]
    #[serial]
    fn symmetric_exchange_two_ranks() {
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                std::thread::spawn(move || {
                    let comm = RayonComm::new(rank, 2);
                    let peers: BTreeSet<usize> = [1 - rank].into_iter().collect();
                    let mut out = BTreeMap::new();
                    out.insert(1 - rank, vec![rank as u8; 3 + rank]);
                    exchange_bytes_symmetric(
                        &comm,
                        &peers,
                        CommTag::new(0x0200),
                        CommTag::new(0x0201),
                        &out,
                    )
                    .unwrap()
                })
            })
            .collect();
        let got: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(got[0][&1], vec![1u8; 4]);
        assert_eq!(got[1][&0], vec![0u8; 3]);
    }

    #[test]
    #[serial]
    fn fixed_exchange_skips_zero_length_routes() {
        // rank 1 expects nothing from rank 0 and must not wait for it.
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                std::thread::spawn(move || {
                    let comm = RayonComm::new(rank, 2);
                    let mut out = BTreeMap::new();
                    let mut expected = BTreeMap::new();
                    if rank == 0 {
                        out.insert(1, Vec::new());
                        expected.insert(1, 2);
                    } else {
                        out.insert(0, vec![5u8, 6]);
                        expected.insert(0, 0);
                    }
                    exchange_fixed(&comm, CommTag::new(0x0220), &out, &expected).unwrap()
                })
            })
            .collect();
        let got: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(got[0][&1], vec![5u8, 6]);
        assert!(got[1].is_empty());
    }

    #[test]
    #[serial]
    fn symmetric_exchange_with_empty_side() {
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                std::thread::spawn(move || {
                    let comm = RayonComm::new(rank, 2);
                    let peers: BTreeSet<usize> = [1 - rank].into_iter().collect();
                    let mut out = BTreeMap::new();
                    if rank == 0 {
                        out.insert(1, vec![9u8, 9, 9]);
                    }
                    exchange_bytes_symmetric(
                        &comm,
                        &peers,
                        CommTag::new(0x0210),
                        CommTag::new(0x0211),
                        &out,
                    )
                    .unwrap()
                })
            })
            .collect();
        let got: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(got[0].is_empty());
        assert_eq!(got[1][&0], vec![9u8, 9, 9]);
    }
}
