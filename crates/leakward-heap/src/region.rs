//! Dedicated memory regions backing the private heap.
//!
//! A region hands out raw blocks and takes them back. It never shares memory
//! with the process heap the host application allocates from, so blocks the
//! tool uses for itself cannot be confused with the host's.
//!
//! Thread-safe: each region serializes its own bookkeeping with a
//! `parking_lot::Mutex` or atomics, independently of the block registry lock.

use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::HeapConfig;
use crate::header::BLOCK_ALIGN;

/// Source of raw memory for a [`crate::PrivateHeap`].
pub trait HeapRegion: Send + Sync {
    /// Obtain a block for `layout`, or null when the region is exhausted.
    ///
    /// Layouts aligned beyond [`BLOCK_ALIGN`] are refused with null.
    fn acquire(&self, layout: Layout) -> *mut u8;

    /// Return a block to the region. Returns `false` if the region does not
    /// recognize the block, which callers treat as corruption.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `acquire` on this region with the same `layout`
    /// and must not have been released already.
    unsafe fn release(&self, ptr: *mut u8, layout: Layout) -> bool;

    /// Current accounting snapshot.
    fn stats(&self) -> RegionStats;
}

/// Region accounting snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionStats {
    /// Bytes currently reserved from the OS (or the system allocator).
    pub reserved_bytes: usize,
    /// Blocks handed out and not yet released.
    pub outstanding_blocks: usize,
    /// Bytes handed out and not yet released.
    pub outstanding_bytes: usize,
}

/// Region used by [`crate::PrivateHeap::new`].
#[cfg(unix)]
pub type DefaultRegion = MappedRegion;
/// Region used by [`crate::PrivateHeap::new`].
#[cfg(not(unix))]
pub type DefaultRegion = SystemRegion;

// ---------------------------------------------------------------------------
// SystemRegion
// ---------------------------------------------------------------------------

/// Portable region over [`std::alloc::System`] with its own accounting.
///
/// Bypasses any `#[global_allocator]` the host installs, and keeps a block
/// count so that releasing more blocks than were acquired is detected.
#[derive(Debug, Default)]
pub struct SystemRegion {
    max_bytes: Option<usize>,
    outstanding_blocks: AtomicUsize,
    outstanding_bytes: AtomicUsize,
}

impl SystemRegion {
    /// Unlimited system region.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_bytes: None,
            outstanding_blocks: AtomicUsize::new(0),
            outstanding_bytes: AtomicUsize::new(0),
        }
    }

    /// System region honoring `config.max_bytes`.
    #[must_use]
    pub fn from_config(config: &HeapConfig) -> Self {
        Self {
            max_bytes: config.max_bytes,
            ..Self::new()
        }
    }
}

impl HeapRegion for SystemRegion {
    fn acquire(&self, layout: Layout) -> *mut u8 {
        if layout.size() == 0 || layout.align() > BLOCK_ALIGN {
            return ptr::null_mut();
        }

        let reserved =
            self.outstanding_bytes
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    let next = current.checked_add(layout.size())?;
                    match self.max_bytes {
                        Some(max) if next > max => None,
                        _ => Some(next),
                    }
                });
        if reserved.is_err() {
            return ptr::null_mut();
        }

        // SAFETY: layout has non-zero size.
        let block = unsafe { System.alloc(layout) };
        if block.is_null() {
            self.outstanding_bytes
                .fetch_sub(layout.size(), Ordering::AcqRel);
            return ptr::null_mut();
        }
        self.outstanding_blocks.fetch_add(1, Ordering::AcqRel);
        block
    }

    unsafe fn release(&self, ptr: *mut u8, layout: Layout) -> bool {
        if ptr.is_null() {
            return false;
        }
        if self
            .outstanding_blocks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
        {
            return false;
        }
        self.outstanding_bytes
            .fetch_sub(layout.size(), Ordering::AcqRel);
        // SAFETY: caller guarantees `ptr` came from `acquire` with `layout`.
        unsafe { System.dealloc(ptr, layout) };
        true
    }

    fn stats(&self) -> RegionStats {
        let outstanding_bytes = self.outstanding_bytes.load(Ordering::Acquire);
        RegionStats {
            reserved_bytes: outstanding_bytes,
            outstanding_blocks: self.outstanding_blocks.load(Ordering::Acquire),
            outstanding_bytes,
        }
    }
}

// ---------------------------------------------------------------------------
// MappedRegion
// ---------------------------------------------------------------------------

#[cfg(unix)]
pub use mapped::MappedRegion;

#[cfg(unix)]
mod mapped {
    use std::alloc::Layout;
    use std::mem::size_of;
    use std::ptr;

    use parking_lot::Mutex;

    use super::{HeapRegion, RegionStats};
    use crate::config::{DEFAULT_CHUNK_SIZE, HeapConfig};
    use crate::header::BLOCK_ALIGN;

    /// Number of power-of-two size classes (16 B .. 512 KiB).
    const NUM_CLASSES: usize = 16;
    const MIN_CLASS_SHIFT: u32 = 4;
    const MAX_CLASS_SIZE: usize = 1 << (MIN_CLASS_SHIFT + NUM_CLASSES as u32 - 1);

    /// Bytes at the start of a chunk reserved for its header.
    const CHUNK_HEADER: usize = 16;
    /// Bytes in front of a large block reserved for its mapping header.
    const LARGE_PREFIX: usize = 32;

    const _: () = assert!(size_of::<ChunkHeader>() <= CHUNK_HEADER);
    const _: () = assert!(size_of::<LargeHeader>() <= LARGE_PREFIX);
    const _: () = assert!(CHUNK_HEADER % BLOCK_ALIGN == 0 && LARGE_PREFIX % BLOCK_ALIGN == 0);

    #[repr(C)]
    struct ChunkHeader {
        next: *mut ChunkHeader,
        len: usize,
    }

    #[repr(C)]
    struct LargeHeader {
        prev: *mut LargeHeader,
        next: *mut LargeHeader,
        len: usize,
    }

    #[repr(C)]
    struct FreeBlock {
        next: *mut FreeBlock,
    }

    /// All bookkeeping lives inside the mapped memory itself: chunk and large
    /// mapping lists are intrusive, and free lists thread through released
    /// blocks. Nothing here touches the process heap.
    struct MappedState {
        chunks: *mut ChunkHeader,
        cursor: usize,
        limit: usize,
        free: [*mut FreeBlock; NUM_CLASSES],
        large: *mut LargeHeader,
        reserved_bytes: usize,
        outstanding_blocks: usize,
        outstanding_bytes: usize,
    }

    // SAFETY: the raw pointers refer to mappings owned by the region and are
    // only dereferenced while the region's mutex is held.
    unsafe impl Send for MappedState {}

    /// Private region built from anonymous `mmap` chunks.
    ///
    /// Small requests are carved from chunks by bump allocation and recycled
    /// through per-size-class free lists; requests above a quarter chunk get
    /// a mapping of their own. Dropping the region unmaps everything, live
    /// blocks included.
    pub struct MappedRegion {
        state: Mutex<MappedState>,
        chunk_size: usize,
        small_limit: usize,
        max_bytes: Option<usize>,
        page_size: usize,
    }

    impl MappedRegion {
        /// Region with default sizing and no reservation cap.
        #[must_use]
        pub fn new() -> Self {
            Self::from_config(&HeapConfig::default())
        }

        /// Region sized by `config`.
        #[must_use]
        pub fn from_config(config: &HeapConfig) -> Self {
            let page_size = page_size();
            let chunk_size =
                round_up(config.chunk_size.max(page_size), page_size).unwrap_or(DEFAULT_CHUNK_SIZE);
            Self {
                state: Mutex::new(MappedState {
                    chunks: ptr::null_mut(),
                    cursor: 0,
                    limit: 0,
                    free: [ptr::null_mut(); NUM_CLASSES],
                    large: ptr::null_mut(),
                    reserved_bytes: 0,
                    outstanding_blocks: 0,
                    outstanding_bytes: 0,
                }),
                chunk_size,
                small_limit: (chunk_size / 4).min(MAX_CLASS_SIZE),
                max_bytes: config.max_bytes,
                page_size,
            }
        }

        /// Bytes mapped per small-block chunk.
        #[must_use]
        pub fn chunk_size(&self) -> usize {
            self.chunk_size
        }

        /// Largest request served from chunks rather than a dedicated mapping.
        #[must_use]
        pub fn small_limit(&self) -> usize {
            self.small_limit
        }

        fn size_class(&self, size: usize) -> Option<(usize, usize)> {
            let class_size = size.max(1 << MIN_CLASS_SHIFT).checked_next_power_of_two()?;
            if class_size > self.small_limit {
                return None;
            }
            let index = (class_size.trailing_zeros() - MIN_CLASS_SHIFT) as usize;
            Some((index, class_size))
        }

        fn within_budget(&self, state: &MappedState, extra: usize) -> bool {
            match self.max_bytes {
                None => true,
                Some(max) => state
                    .reserved_bytes
                    .checked_add(extra)
                    .is_some_and(|total| total <= max),
            }
        }

        fn acquire_small(&self, state: &mut MappedState, index: usize, class_size: usize) -> *mut u8 {
            let head = state.free[index];
            if !head.is_null() {
                // SAFETY: free-list entries are released blocks of this class
                // inside chunks the region still maps.
                state.free[index] = unsafe { (*head).next };
                return head.cast::<u8>();
            }

            if state.limit - state.cursor < class_size && !self.map_chunk(state) {
                return ptr::null_mut();
            }
            let block = state.cursor as *mut u8;
            state.cursor += class_size;
            block
        }

        fn map_chunk(&self, state: &mut MappedState) -> bool {
            let len = self.chunk_size;
            if !self.within_budget(state, len) {
                return false;
            }
            let base = map_anonymous(len);
            if base.is_null() {
                return false;
            }
            let chunk = base.cast::<ChunkHeader>();
            // SAFETY: fresh writable mapping of `len >= CHUNK_HEADER` bytes.
            unsafe {
                chunk.write(ChunkHeader {
                    next: state.chunks,
                    len,
                });
            }
            state.chunks = chunk;
            state.cursor = base as usize + CHUNK_HEADER;
            state.limit = base as usize + len;
            state.reserved_bytes += len;
            true
        }

        fn acquire_large(&self, state: &mut MappedState, size: usize) -> *mut u8 {
            let Some(len) = size
                .checked_add(LARGE_PREFIX)
                .and_then(|total| round_up(total, self.page_size))
            else {
                return ptr::null_mut();
            };
            if !self.within_budget(state, len) {
                return ptr::null_mut();
            }
            let base = map_anonymous(len);
            if base.is_null() {
                return ptr::null_mut();
            }

            let header = base.cast::<LargeHeader>();
            // SAFETY: fresh writable mapping; the current list head, if any,
            // is a live large mapping owned by this region.
            unsafe {
                header.write(LargeHeader {
                    prev: ptr::null_mut(),
                    next: state.large,
                    len,
                });
                if !state.large.is_null() {
                    (*state.large).prev = header;
                }
            }
            state.large = header;
            state.reserved_bytes += len;
            // SAFETY: len >= LARGE_PREFIX + size.
            unsafe { base.add(LARGE_PREFIX) }
        }

        fn chunk_contains(&self, state: &MappedState, addr: usize, class_size: usize) -> bool {
            let mut chunk = state.chunks;
            while !chunk.is_null() {
                // SAFETY: chunk list nodes are headers of live chunk mappings.
                let (next, len) = unsafe { ((*chunk).next, (*chunk).len) };
                let start = chunk as usize + CHUNK_HEADER;
                let end = chunk as usize + len;
                if addr >= start && addr.checked_add(class_size).is_some_and(|e| e <= end) {
                    return true;
                }
                chunk = next;
            }
            false
        }

        fn release_small(
            &self,
            state: &mut MappedState,
            ptr: *mut u8,
            index: usize,
            class_size: usize,
        ) -> bool {
            let addr = ptr as usize;
            if addr % BLOCK_ALIGN != 0 || !self.chunk_contains(state, addr, class_size) {
                return false;
            }
            let block = ptr.cast::<FreeBlock>();
            // SAFETY: `block` lies inside a live chunk and is at least 16 bytes.
            unsafe { block.write(FreeBlock { next: state.free[index] }) };
            state.free[index] = block;
            true
        }

        fn release_large(&self, state: &mut MappedState, ptr: *mut u8) -> bool {
            let target = ptr.wrapping_sub(LARGE_PREFIX).cast::<LargeHeader>();
            let mut node = state.large;
            while !node.is_null() && node != target {
                // SAFETY: large list nodes are headers of live large mappings.
                node = unsafe { (*node).next };
            }
            if node.is_null() {
                return false;
            }

            // SAFETY: `node` is a live large mapping; neighbors are too.
            let (prev, next, len) = unsafe { ((*node).prev, (*node).next, (*node).len) };
            unsafe {
                if prev.is_null() {
                    state.large = next;
                } else {
                    (*prev).next = next;
                }
                if !next.is_null() {
                    (*next).prev = prev;
                }
            }
            state.reserved_bytes -= len;
            // SAFETY: `node` is the base of a mapping of `len` bytes that no
            // list references any more.
            unsafe { unmap(node.cast::<u8>(), len) }
        }
    }

    impl Default for MappedRegion {
        fn default() -> Self {
            Self::new()
        }
    }

    impl HeapRegion for MappedRegion {
        fn acquire(&self, layout: Layout) -> *mut u8 {
            if layout.size() == 0 || layout.align() > BLOCK_ALIGN {
                return ptr::null_mut();
            }
            let mut state = self.state.lock();
            let block = match self.size_class(layout.size()) {
                Some((index, class_size)) => self.acquire_small(&mut state, index, class_size),
                None => self.acquire_large(&mut state, layout.size()),
            };
            if !block.is_null() {
                state.outstanding_blocks += 1;
                state.outstanding_bytes += layout.size();
            }
            block
        }

        unsafe fn release(&self, ptr: *mut u8, layout: Layout) -> bool {
            if ptr.is_null() || layout.size() == 0 {
                return false;
            }
            let mut state = self.state.lock();
            if state.outstanding_blocks == 0 {
                return false;
            }
            let released = match self.size_class(layout.size()) {
                Some((index, class_size)) => self.release_small(&mut state, ptr, index, class_size),
                None => self.release_large(&mut state, ptr),
            };
            if released {
                state.outstanding_blocks -= 1;
                state.outstanding_bytes = state.outstanding_bytes.saturating_sub(layout.size());
            }
            released
        }

        fn stats(&self) -> RegionStats {
            let state = self.state.lock();
            RegionStats {
                reserved_bytes: state.reserved_bytes,
                outstanding_blocks: state.outstanding_blocks,
                outstanding_bytes: state.outstanding_bytes,
            }
        }
    }

    impl Drop for MappedRegion {
        fn drop(&mut self) {
            let state = self.state.get_mut();

            let mut chunk = state.chunks;
            while !chunk.is_null() {
                // SAFETY: live chunk header; read before the mapping goes away.
                let (next, len) = unsafe { ((*chunk).next, (*chunk).len) };
                // SAFETY: `chunk` is the base of a mapping of `len` bytes.
                unsafe { unmap(chunk.cast::<u8>(), len) };
                chunk = next;
            }

            let mut large = state.large;
            while !large.is_null() {
                // SAFETY: live large header; read before the mapping goes away.
                let (next, len) = unsafe { ((*large).next, (*large).len) };
                // SAFETY: `large` is the base of a mapping of `len` bytes.
                unsafe { unmap(large.cast::<u8>(), len) };
                large = next;
            }

            state.chunks = ptr::null_mut();
            state.large = ptr::null_mut();
            state.free = [ptr::null_mut(); NUM_CLASSES];
            state.reserved_bytes = 0;
        }
    }

    fn map_anonymous(len: usize) -> *mut u8 {
        // SAFETY: anonymous private mapping at a kernel-chosen address.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            base.cast::<u8>()
        }
    }

    unsafe fn unmap(base: *mut u8, len: usize) -> bool {
        // SAFETY: caller passes a mapping created by `map_anonymous`.
        unsafe { libc::munmap(base.cast::<libc::c_void>(), len) == 0 }
    }

    fn page_size() -> usize {
        // SAFETY: sysconf has no memory-safety preconditions.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if raw > 0 { raw as usize } else { 4096 }
    }

    fn round_up(value: usize, align: usize) -> Option<usize> {
        debug_assert!(align.is_power_of_two());
        value.checked_add(align - 1).map(|v| v & !(align - 1))
    }

}
