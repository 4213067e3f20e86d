//! Thin façade over intra-process (thread mailbox) or inter-process (MPI)
//! message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees). All
//! handles are **waitable** but non-blocking — callers invoke `.wait()`
//! before trusting that a buffer is ready. The protocol layers above never
//! talk to a transport directly; they go through [`Communicator`] so that
//! unit tests can simulate a whole partition inside one process.

use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::DofSpaceError;

/// Typed communication tag. Each protocol phase owns a disjoint tag range so
/// concurrent phases (and successive protocol rounds) never collide in the
/// mailbox or the MPI matching queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommTag(u16);

impl CommTag {
    pub const fn new(v: u16) -> Self {
        CommTag(v)
    }
    pub const fn as_u16(self) -> u16 {
        self.0
    }
    /// Tag shifted by `d`, wrapping. Used for per-round and per-epoch tags.
    pub const fn offset(self, d: u16) -> Self {
        CommTag(self.0.wrapping_add(d))
    }
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

/// Non-blocking communication interface (minimal by design).
pub trait Communicator: Send + Sync {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    /// This process's rank in `0..size()`.
    fn rank(&self) -> usize;
    /// Number of ranks in the process group.
    fn size(&self) -> usize;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    /// All-gather one `u64` per rank. The default implementation is a
    /// pairwise exchange over `isend`/`irecv`; transport backends may
    /// override it with a native collective.
    fn allgather_u64(&self, tag: CommTag, value: u64) -> Result<Vec<u64>, DofSpaceError> {
        let n = self.size();
        let me = self.rank();
        if n <= 1 {
            return Ok(vec![value]);
        }
        let mut recvs = Vec::with_capacity(n - 1);
        for peer in (0..n).filter(|&p| p != me) {
            let mut buf = [0u8; 8];
            let h = self.irecv(peer, tag.as_u16(), &mut buf);
            recvs.push((peer, h));
        }
        let bytes = value.to_le_bytes();
        let mut sends = Vec::with_capacity(n - 1);
        for peer in (0..n).filter(|&p| p != me) {
            sends.push(self.isend(peer, tag.as_u16(), &bytes));
        }

        let mut out = vec![0u64; n];
        out[me] = value;
        let mut maybe_err = None;
        for (peer, h) in recvs {
            match h.wait() {
                Some(data) if data.len() == 8 => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&data);
                    out[peer] = u64::from_le_bytes(raw);
                }
                Some(data) if maybe_err.is_none() => {
                    maybe_err = Some(DofSpaceError::BufferSizeMismatch {
                        neighbor: peer,
                        expected: 8,
                        got: data.len(),
                    });
                }
                None if maybe_err.is_none() => {
                    maybe_err = Some(DofSpaceError::CommError {
                        neighbor: peer,
                        detail: "allgather receive returned no data".into(),
                    });
                }
                _ => {} // already failing; just drain
            }
        }
        for s in sends {
            let _ = s.wait();
        }
        match maybe_err {
            Some(err) => Err(err),
            None => Ok(out),
        }
    }
}

/// Compile-time no-op comm for pure serial unit tests (one rank, no peers).
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}
}

// --- RayonComm: intra-process rank simulation over a shared mailbox ---

type Key = (usize, usize, u16); // (src, dst, tag)

static MAILBOX: Lazy<DashMap<Key, Bytes>> = Lazy::new(DashMap::new);

pub struct LocalHandle {
    buf: Arc<Mutex<Option<Vec<u8>>>>,
    handle: Option<JoinHandle<()>>,
}

impl Wait for LocalHandle {
    fn wait(mut self) -> Option<Vec<u8>> {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let mut guard = self.buf.lock();
        guard.take()
    }
}

/// In-process communicator: each "rank" is a thread, messages go through a
/// process-global mailbox keyed by `(src, dst, tag)`. One outstanding
/// message per key — protocol phases must use distinct tags.
#[derive(Clone, Debug)]
pub struct RayonComm {
    rank: usize,
    size: usize,
}

impl RayonComm {
    pub fn new(rank: usize, size: usize) -> Self {
        Self { rank, size }
    }
}

impl Communicator for RayonComm {
    type SendHandle = ();
    type RecvHandle = LocalHandle;

    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        let key = (self.rank, peer, tag);
        MAILBOX.insert(key, Bytes::from(buf.to_vec()));
    }

    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle {
        let key = (peer, self.rank, tag);
        let buf_arc = Arc::new(Mutex::new(None));
        let buf_arc_clone = buf_arc.clone();
        let buf_len = buf.len();
        let handle = std::thread::spawn(move || {
            loop {
                if let Some(bytes) = MAILBOX.remove(&key).map(|(_, v)| v) {
                    let n = bytes.len().min(buf_len);
                    let mut guard = buf_arc_clone.lock();
                    *guard = Some(bytes[..n].to_vec());
                    break;
                }
                std::thread::yield_now();
            }
        });
        LocalHandle {
            buf: buf_arc,
            handle: Some(handle),
        }
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::{Communicator, Wait};
    use mpi::point_to_point::Status;
    use mpi::request::{Request, StaticScope};
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    /// MPI communicator over `MPI_COMM_WORLD`.
    pub struct MpiComm {
        world: SimpleCommunicator,
        rank: usize,
        size: usize,
        _universe: mpi::environment::Universe,
    }

    impl MpiComm {
        pub fn new() -> Option<Self> {
            let universe = mpi::initialize()?;
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Some(Self {
                world,
                rank,
                size,
                _universe: universe,
            })
        }
    }

    /// Owns a leaked buffer for the lifetime of the request; reclaims it on
    /// wait so the transfer never outlives its storage.
    pub struct MpiHandle {
        req: Request<'static, [u8], StaticScope>,
        buf: &'static mut [u8],
        deliver: bool,
    }

    impl Wait for MpiHandle {
        fn wait(self) -> Option<Vec<u8>> {
            let _: Status = self.req.wait();
            let boxed = unsafe { Box::from_raw(self.buf as *mut [u8]) };
            if self.deliver { Some(boxed.into_vec()) } else { None }
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiHandle;
        type RecvHandle = MpiHandle;

        fn rank(&self) -> usize {
            self.rank
        }
        fn size(&self) -> usize {
            self.size
        }

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiHandle {
            let stash: &'static mut [u8] = Box::leak(buf.to_vec().into_boxed_slice());
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, &*stash, tag as i32);
            // Request borrows the leaked stash immutably; the handle keeps the
            // raw pointer so wait() can reclaim it after completion.
            let ptr = stash as *const [u8] as *mut [u8];
            MpiHandle {
                req,
                buf: unsafe { &mut *ptr },
                deliver: false,
            }
        }

        fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> MpiHandle {
            let stash: &'static mut [u8] = Box::leak(vec![0u8; buf.len()].into_boxed_slice());
            let ptr = stash as *mut [u8];
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_receive_into_with_tag(StaticScope, stash, tag as i32);
            MpiHandle {
                req,
                buf: unsafe { &mut *ptr },
                deliver: true,
            }
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
