//! Global offset tables: exclusive prefix sums of per-rank DOF and true-DOF
//! counts, with versioned snapshots so in-flight consumers (e.g. a transfer
//! operator computed against the previous numbering) keep a consistent view
//! until the caller declares updates finished.

use std::ops::Range;
use std::sync::Arc;

use crate::comm::communicator::{CommTag, Communicator};
use crate::error::DofSpaceError;

/// Per-rank global starting indices; `starts.len() == nranks + 1` and the
/// final entry is the global total.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OffsetTable {
    starts: Vec<u64>,
}

impl OffsetTable {
    pub fn from_counts(counts: &[u64]) -> Self {
        let mut starts = Vec::with_capacity(counts.len() + 1);
        let mut acc = 0u64;
        starts.push(0);
        for &c in counts {
            acc += c;
            starts.push(acc);
        }
        Self { starts }
    }

    pub fn nranks(&self) -> usize {
        self.starts.len().saturating_sub(1)
    }

    /// Global starting index of `rank`. `rank == nranks()` yields the total.
    pub fn start(&self, rank: usize) -> Result<u64, DofSpaceError> {
        self.starts
            .get(rank)
            .copied()
            .ok_or(DofSpaceError::RankOutOfRange {
                rank,
                nranks: self.nranks(),
            })
    }

    pub fn count(&self, rank: usize) -> Result<u64, DofSpaceError> {
        Ok(self.start(rank + 1)? - self.start(rank)?)
    }

    pub fn total(&self) -> u64 {
        self.starts.last().copied().unwrap_or(0)
    }

    pub fn range(&self, rank: usize) -> Result<Range<u64>, DofSpaceError> {
        Ok(self.start(rank)?..self.start(rank + 1)?)
    }

    /// Rank owning a global index (binary search over the starts).
    pub fn owner_of(&self, global: u64) -> Result<usize, DofSpaceError> {
        if global >= self.total() {
            return Err(DofSpaceError::TrueDofOutOfRange { gtdof: global });
        }
        // partition_point: first rank whose start exceeds `global`, minus 1.
        let idx = self.starts.partition_point(|&s| s <= global);
        Ok(idx - 1)
    }

    pub fn is_monotone(&self) -> bool {
        self.starts.windows(2).all(|w| w[0] <= w[1])
    }
}

/// One immutable generation of the numbering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OffsetSnapshot {
    pub generation: u64,
    pub dof: OffsetTable,
    pub tdof: OffsetTable,
}

/// Current and (optionally) previous offset generation. The previous
/// snapshot survives until [`GlobalOffsets::updates_finished`] — a
/// caller-driven event, never automatic — so a consumer holding the old
/// `Arc` can never observe a half-updated numbering.
#[derive(Clone, Debug)]
pub struct GlobalOffsets {
    current: Arc<OffsetSnapshot>,
    previous: Option<Arc<OffsetSnapshot>>,
}

impl GlobalOffsets {
    /// All-gather the local DOF and true-DOF counts and form both prefix
    /// sums. `tags` are the two collective tags (DOF counts, true-DOF
    /// counts).
    pub fn build<C: Communicator>(
        comm: &C,
        tags: (CommTag, CommTag),
        ndofs: usize,
        ntdofs: usize,
    ) -> Result<Self, DofSpaceError> {
        let snapshot = Self::gather(comm, tags, ndofs, ntdofs, 0)?;
        Ok(Self {
            current: Arc::new(snapshot),
            previous: None,
        })
    }

    /// Recompute the numbering after a mesh update, archiving the current
    /// snapshot for consumers still finalizing against it.
    pub fn rebuild<C: Communicator>(
        &mut self,
        comm: &C,
        tags: (CommTag, CommTag),
        ndofs: usize,
        ntdofs: usize,
    ) -> Result<(), DofSpaceError> {
        let next = Self::gather(comm, tags, ndofs, ntdofs, self.current.generation + 1)?;
        self.previous = Some(Arc::clone(&self.current));
        self.current = Arc::new(next);
        Ok(())
    }

    /// Discard the archived snapshot once every consumer has observed the
    /// update.
    pub fn updates_finished(&mut self) {
        self.previous = None;
    }

    fn gather<C: Communicator>(
        comm: &C,
        tags: (CommTag, CommTag),
        ndofs: usize,
        ntdofs: usize,
        generation: u64,
    ) -> Result<OffsetSnapshot, DofSpaceError> {
        let dof_counts = comm.allgather_u64(tags.0, ndofs as u64)?;
        let tdof_counts = comm.allgather_u64(tags.1, ntdofs as u64)?;
        let snapshot = OffsetSnapshot {
            generation,
            dof: OffsetTable::from_counts(&dof_counts),
            tdof: OffsetTable::from_counts(&tdof_counts),
        };
        debug_assert!(snapshot.dof.is_monotone() && snapshot.tdof.is_monotone());
        log::debug!(
            "global offsets gen {}: {} dofs, {} true dofs across {} ranks",
            generation,
            snapshot.dof.total(),
            snapshot.tdof.total(),
            snapshot.dof.nranks()
        );
        Ok(snapshot)
    }

    pub fn current(&self) -> &Arc<OffsetSnapshot> {
        &self.current
    }

    pub fn previous(&self) -> Option<&Arc<OffsetSnapshot>> {
        self.previous.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.current.generation
    }

    pub fn dof_offset(&self, rank: usize) -> Result<u64, DofSpaceError> {
        self.current.dof.start(rank)
    }

    pub fn tdof_offset(&self, rank: usize) -> Result<u64, DofSpaceError> {
        self.current.tdof.start(rank)
    }

    pub fn global_dof_count(&self) -> u64 {
        self.current.dof.total()
    }

    pub fn global_tdof_count(&self) -> u64 {
        self.current.tdof.total()
    }
}
