//! Host allocations the interception layer reports to us.
//!
//! Each record is a [`PrivateBox`] on the cycle's private heap, so the
//! tracker's bookkeeping never lands in the host heap it describes.
//!
//! Records are allocated and freed while the records lock is held, so the
//! heap's live block count moves together with the record map. Lock order is
//! records, then the heap registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use leakward_heap::{HeapError, PrivateBox, PrivateHeap};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A host allocation that has not been freed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostAllocation {
    pub address: usize,
    pub size: usize,
    /// Order in which the tracker saw the allocation, starting at 0 each cycle.
    pub sequence: u64,
}

/// The set of unresolved host allocations for one load cycle.
pub struct HostTracker {
    heap: Arc<PrivateHeap>,
    records: Mutex<HashMap<usize, PrivateBox<HostAllocation>>>,
    next_sequence: AtomicU64,
}

impl HostTracker {
    #[must_use]
    pub fn new(heap: Arc<PrivateHeap>) -> Self {
        Self {
            heap,
            records: Mutex::new(HashMap::new()),
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Record `address`. A null address is ignored and returns `Ok(false)`.
    ///
    /// Tracking an address that is already tracked replaces the old record:
    /// the host must have released it through a path we did not see.
    pub fn track(&self, address: usize, size: usize) -> Result<bool, HeapError> {
        if address == 0 {
            return Ok(false);
        }
        let mut records = self.records.lock();
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let record = PrivateBox::try_new_in(
            HostAllocation {
                address,
                size,
                sequence,
            },
            &self.heap,
        )?;
        records.insert(address, record);
        Ok(true)
    }

    /// Forget `address`. Returns `false` if it was not tracked.
    pub fn untrack(&self, address: usize) -> bool {
        self.records.lock().remove(&address).is_some()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn tracked_bytes(&self) -> usize {
        self.records.lock().values().map(|r| r.size).sum()
    }

    #[must_use]
    pub fn contains(&self, address: usize) -> bool {
        self.records.lock().contains_key(&address)
    }

    /// Copy of every record, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<HostAllocation> {
        let mut out: Vec<HostAllocation> = self.records.lock().values().map(|r| **r).collect();
        out.sort_unstable_by_key(|a| a.sequence);
        out
    }

    /// Records, oldest first, and the number of live private heap blocks that
    /// are not records, both read at one instant.
    #[must_use]
    pub fn census(&self) -> (Vec<HostAllocation>, usize) {
        let records = self.records.lock();
        let mut out: Vec<HostAllocation> = records.values().map(|r| **r).collect();
        let internal = self.heap.live_blocks().saturating_sub(records.len());
        drop(records);
        out.sort_unstable_by_key(|a| a.sequence);
        (out, internal)
    }

    /// Drop every record.
    pub fn clear(&self) {
        self.records.lock().clear();
    }

    /// Heap the records live on.
    #[must_use]
    pub fn heap(&self) -> &Arc<PrivateHeap> {
        &self.heap
    }
}

impl std::fmt::Debug for HostTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostTracker")
            .field("tracked", &self.count())
            .field("next_sequence", &self.next_sequence.load(Ordering::Relaxed))
            .finish()
    }
}
