//! Block header prepended to every private-heap allocation.
//!
//! Memory layout of one block:
//!
//! ```text
//! [ BlockHeader (HEADER_SIZE bytes) | usable region (size bytes) ]
//! ^ region pointer                    ^ pointer handed to the caller
//! ```
//!
//! The header is recovered from a data pointer by subtracting `HEADER_SIZE`,
//! so lookups never need an out-of-band table.

use std::alloc::Layout;
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};

/// Alignment of every block and of every usable region.
pub const BLOCK_ALIGN: usize = 16;

/// Bytes reserved in front of every usable region.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

const _: () = assert!(align_of::<BlockHeader>() == BLOCK_ALIGN);
const _: () = assert!(HEADER_SIZE % BLOCK_ALIGN == 0);

/// Bookkeeping record living directly in front of a block's usable region.
///
/// `prev`/`next` belong to the registry and are only touched while its lock
/// is held. Every other field is written once before the block is linked.
#[repr(C, align(16))]
pub(crate) struct BlockHeader {
    pub(crate) origin_file: &'static str,
    pub(crate) origin_line: u32,
    pub(crate) serial: u64,
    pub(crate) size: usize,
    pub(crate) prev: *mut BlockHeader,
    pub(crate) next: *mut BlockHeader,
}

impl BlockHeader {
    pub(crate) fn new(origin_file: &'static str, origin_line: u32, serial: u64, size: usize) -> Self {
        Self {
            origin_file,
            origin_line,
            serial,
            size,
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        }
    }

    pub(crate) fn info(&self, header: NonNull<BlockHeader>) -> BlockInfo {
        BlockInfo {
            origin_file: self.origin_file,
            origin_line: self.origin_line,
            serial: self.serial,
            size: self.size,
            // SAFETY: `header` points at `self`, which heads a live block.
            data: unsafe { data_of(header) }.as_ptr() as usize,
        }
    }
}

/// Read-only snapshot of one live block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    /// Source file that requested the block.
    pub origin_file: &'static str,
    /// Source line that requested the block.
    pub origin_line: u32,
    /// Allocation serial number, unique within one heap instance.
    pub serial: u64,
    /// Usable size requested by the caller (header excluded).
    pub size: usize,
    /// Address of the usable region.
    pub data: usize,
}

/// Region layout of a block whose usable region is `size` bytes.
///
/// Returns `None` when the total does not fit the address space.
#[must_use]
pub(crate) fn block_layout(size: usize) -> Option<Layout> {
    let total = HEADER_SIZE.checked_add(size)?;
    Layout::from_size_align(total, BLOCK_ALIGN).ok()
}

/// Usable region of the block headed by `header`.
///
/// # Safety
///
/// `header` must head a block of at least `HEADER_SIZE` bytes.
#[inline]
pub(crate) unsafe fn data_of(header: NonNull<BlockHeader>) -> NonNull<u8> {
    // SAFETY: the block extends at least HEADER_SIZE bytes past `header`.
    unsafe { header.cast::<u8>().add(HEADER_SIZE) }
}

/// Header of the block whose usable region starts at `data`.
///
/// # Safety
///
/// `data` must have been returned by [`data_of`] for a still-allocated block.
#[inline]
pub(crate) unsafe fn header_of(data: NonNull<u8>) -> NonNull<BlockHeader> {
    // SAFETY: caller guarantees `data` sits HEADER_SIZE bytes into a block.
    unsafe { data.sub(HEADER_SIZE).cast::<BlockHeader>() }
}
