//! The private tracking heap.
//!
//! Every block carries a [`BlockHeader`](crate::header) with its provenance
//! and serial number, and is linked into the heap's registry for as long as it
//! is live. The registry lock is held only for the O(1) link/unlink step,
//! never across a region call.

use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::HeapConfig;
use crate::error::{HeapError, IntegrityError};
use crate::header::{self, BLOCK_ALIGN, BlockHeader, BlockInfo, HEADER_SIZE};
use crate::region::{DefaultRegion, HeapRegion, RegionStats};
use crate::registry::{BlockList, Blocks};

/// Counters describing a heap at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Blocks currently linked in the registry.
    pub live_blocks: usize,
    /// Usable bytes held by live blocks.
    pub live_bytes: usize,
    /// Serial number the next successful allocation receives.
    pub next_serial: u64,
    /// Accounting of the backing region.
    pub region: RegionStats,
}

/// Result of tearing a heap down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownSummary {
    /// Blocks that were still live, i.e. leaked by the tool itself.
    pub leaked: Vec<BlockInfo>,
    /// Usable bytes held by `leaked`.
    pub leaked_bytes: usize,
}

impl TeardownSummary {
    /// True when the tool freed everything it allocated.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.leaked.is_empty()
    }
}

/// Allocator for the tool's own memory, isolated in a dedicated region.
pub struct PrivateHeap<R: HeapRegion = DefaultRegion> {
    region: R,
    registry: Mutex<BlockList>,
    next_serial: AtomicU64,
}

impl PrivateHeap<DefaultRegion> {
    /// Heap over a default-sized dedicated region.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&HeapConfig::default())
    }

    /// Heap over a dedicated region sized by `config`.
    #[must_use]
    pub fn with_config(config: &HeapConfig) -> Self {
        Self::with_region(DefaultRegion::from_config(config))
    }
}

impl Default for PrivateHeap<DefaultRegion> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: HeapRegion> PrivateHeap<R> {
    /// Heap over an explicit region. Serial numbers start at 0.
    #[must_use]
    pub fn with_region(region: R) -> Self {
        Self {
            region,
            registry: Mutex::new(BlockList::new()),
            next_serial: AtomicU64::new(0),
        }
    }

    /// Allocate `size` usable bytes tagged with their origin.
    ///
    /// The returned pointer is aligned to [`BLOCK_ALIGN`]. On failure nothing
    /// is linked and no serial number is consumed.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero, `origin_file` is empty or `origin_line` is
    /// zero. Those are bugs in the tool, not conditions to recover from.
    pub fn allocate(
        &self,
        size: usize,
        origin_file: &'static str,
        origin_line: u32,
    ) -> Result<NonNull<u8>, HeapError> {
        assert!(size > 0, "private heap allocation of zero bytes");
        assert!(
            !origin_file.is_empty(),
            "private heap allocation without an origin file"
        );
        assert!(
            origin_line > 0,
            "private heap allocation without an origin line"
        );

        let layout = header::block_layout(size).ok_or(HeapError::SizeOverflow { requested: size })?;
        let Some(block) = NonNull::new(self.region.acquire(layout)) else {
            return Err(HeapError::OutOfMemory { requested: size });
        };
        let header = block.cast::<BlockHeader>();

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        // SAFETY: the region returned `layout.size()` writable bytes aligned
        // to BLOCK_ALIGN, enough for the header.
        unsafe {
            header
                .as_ptr()
                .write(BlockHeader::new(origin_file, origin_line, serial, size));
        }

        {
            let mut registry = self.registry.lock();
            // SAFETY: header is initialized and not linked anywhere.
            unsafe { registry.push_front(header) };
        }

        // SAFETY: the block spans HEADER_SIZE + size bytes.
        Ok(unsafe { header::data_of(header) })
    }

    /// Free a block. Null is a no-op.
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must have been returned by [`Self::allocate`] on this
    /// heap and not freed since.
    ///
    /// # Panics
    ///
    /// Panics if the registry links around the block are inconsistent or the
    /// region refuses the block back.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        let Some(data) = NonNull::new(ptr) else {
            return;
        };
        // SAFETY: caller guarantees `data` came from `allocate`.
        let header = unsafe { header::header_of(data) };

        let (serial, size) = {
            let mut registry = self.registry.lock();
            // SAFETY: a live block from this heap is linked in its registry.
            unsafe { registry.unlink(header) };
            // SAFETY: the header stays valid until the region takes it back.
            unsafe { (header.as_ref().serial, header.as_ref().size) }
        };

        // SAFETY: `size` passed `block_layout` when the block was allocated.
        let layout = unsafe { Layout::from_size_align_unchecked(HEADER_SIZE + size, BLOCK_ALIGN) };
        // SAFETY: the block came from this region with this layout.
        let released = unsafe { self.region.release(header.as_ptr().cast::<u8>(), layout) };
        assert!(
            released,
            "private region refused block #{serial} ({size} bytes): heap corrupted"
        );
    }

    /// Provenance of a live block, recovered from its data pointer in O(1).
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block returned by [`Self::allocate`] on this heap.
    #[must_use]
    pub unsafe fn header_of(&self, ptr: NonNull<u8>) -> BlockInfo {
        // SAFETY: caller guarantees `ptr` is a live block of this heap.
        let header = unsafe { header::header_of(ptr) };
        // Links can move under other threads; the fields read here cannot.
        // SAFETY: live header.
        unsafe { header.as_ref() }.info(header)
    }

    /// Lock the registry for traversal.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks::new(self.registry.lock())
    }

    /// Verify the registry invariants, returning the live block count.
    pub fn check_integrity(&self) -> Result<usize, IntegrityError> {
        self.registry.lock().verify()
    }

    /// Blocks currently live.
    #[must_use]
    pub fn live_blocks(&self) -> usize {
        self.registry.lock().len()
    }

    /// Usable bytes currently live.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.registry.lock().bytes()
    }

    /// Serial number the next successful allocation will receive.
    #[must_use]
    pub fn next_serial(&self) -> u64 {
        self.next_serial.load(Ordering::Relaxed)
    }

    /// The backing region.
    #[must_use]
    pub fn region(&self) -> &R {
        &self.region
    }

    /// Snapshot of heap and region counters.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let (live_blocks, live_bytes) = {
            let registry = self.registry.lock();
            (registry.len(), registry.bytes())
        };
        HeapStats {
            live_blocks,
            live_bytes,
            next_serial: self.next_serial(),
            region: self.region.stats(),
        }
    }

    /// Release every block still live and report them as internal leaks.
    ///
    /// Leaves the heap empty and usable; serial numbers keep counting.
    pub fn teardown(&mut self) -> TeardownSummary {
        let mut cursor = self.registry.get_mut().take_all();
        let mut summary = TeardownSummary::default();

        while let Some(header) = NonNull::new(cursor) {
            // SAFETY: detached chain of live headers now owned by this call.
            let header_ref = unsafe { header.as_ref() };
            let info = header_ref.info(header);
            cursor = header_ref.next;

            summary.leaked_bytes += info.size;
            summary.leaked.push(info);

            // SAFETY: `info.size` passed `block_layout` at allocation time.
            let layout =
                unsafe { Layout::from_size_align_unchecked(HEADER_SIZE + info.size, BLOCK_ALIGN) };
            // SAFETY: the block came from this region and is no longer reachable.
            let released = unsafe { self.region.release(header.as_ptr().cast::<u8>(), layout) };
            assert!(
                released,
                "private region refused leaked block #{} during teardown",
                info.serial
            );
        }

        summary
    }
}

impl<R: HeapRegion> Drop for PrivateHeap<R> {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

impl<R: HeapRegion> fmt::Debug for PrivateHeap<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("PrivateHeap")
            .field("live_blocks", &stats.live_blocks)
            .field("live_bytes", &stats.live_bytes)
            .field("next_serial", &stats.next_serial)
            .finish_non_exhaustive()
    }
}
