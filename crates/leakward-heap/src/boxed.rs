//! Typed values placed on a private heap.

use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ops::{Deref, DerefMut};
use std::panic::Location;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::HeapError;
use crate::header::{BLOCK_ALIGN, BlockInfo};
use crate::heap::PrivateHeap;
use crate::region::{DefaultRegion, HeapRegion};

/// Owning pointer to a `T` stored on a [`PrivateHeap`].
///
/// The block is tagged with the caller's source location, so a `PrivateBox`
/// that is never dropped shows up in the heap's registry with the line that
/// created it.
pub struct PrivateBox<T, R: HeapRegion = DefaultRegion> {
    ptr: NonNull<T>,
    heap: Arc<PrivateHeap<R>>,
    _owns: PhantomData<T>,
}

// SAFETY: PrivateBox owns its T exactly like Box does; the heap is Sync.
unsafe impl<T: Send, R: HeapRegion> Send for PrivateBox<T, R> {}
// SAFETY: shared access only hands out &T.
unsafe impl<T: Sync, R: HeapRegion> Sync for PrivateBox<T, R> {}

impl<T, R: HeapRegion> PrivateBox<T, R> {
    /// Move `value` onto `heap`.
    ///
    /// # Panics
    ///
    /// Panics if `T` needs more than [`BLOCK_ALIGN`] alignment.
    #[track_caller]
    pub fn try_new_in(value: T, heap: &Arc<PrivateHeap<R>>) -> Result<Self, HeapError> {
        assert!(
            align_of::<T>() <= BLOCK_ALIGN,
            "private heap blocks are only {BLOCK_ALIGN}-byte aligned"
        );
        let caller = Location::caller();
        // Zero-sized values still get a one-byte block so they are tracked.
        let block = heap.allocate(size_of::<T>().max(1), caller.file(), caller.line())?;
        let ptr = block.cast::<T>();
        // SAFETY: the block is at least size_of::<T>() bytes and suitably aligned.
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self {
            ptr,
            heap: Arc::clone(heap),
            _owns: PhantomData,
        })
    }

    /// Registry entry of this value's block.
    #[must_use]
    pub fn block(this: &Self) -> BlockInfo {
        // SAFETY: the block stays live for as long as `this` exists.
        unsafe { this.heap.header_of(this.ptr.cast::<u8>()) }
    }

    /// Heap the value lives on.
    #[must_use]
    pub fn heap(this: &Self) -> &Arc<PrivateHeap<R>> {
        &this.heap
    }
}

impl<T, R: HeapRegion> Deref for PrivateBox<T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: initialized in `try_new_in`, dropped only in `Drop`.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T, R: HeapRegion> DerefMut for PrivateBox<T, R> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: unique access through &mut self.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T, R: HeapRegion> Drop for PrivateBox<T, R> {
    fn drop(&mut self) {
        // SAFETY: the value is initialized and dropped exactly once; the block
        // came from `self.heap`.
        unsafe {
            self.ptr.as_ptr().drop_in_place();
            self.heap.deallocate(self.ptr.as_ptr().cast::<u8>());
        }
    }
}

impl<T: fmt::Debug, R: HeapRegion> fmt::Debug for PrivateBox<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn boxed_value_is_tracked_with_caller_location() {
        let heap = Arc::new(PrivateHeap::new());
        let line = line!() + 1;
        let boxed = PrivateBox::try_new_in(0xDEAD_BEEF_u64, &heap).expect("alloc");
        assert_eq!(*boxed, 0xDEAD_BEEF);

        let block = PrivateBox::block(&boxed);
        assert_eq!(block.origin_line, line);
        assert!(block.origin_file.ends_with("boxed.rs"));
        assert_eq!(block.size, size_of::<u64>());
        assert_eq!(heap.live_blocks(), 1);

        drop(boxed);
        assert_eq!(heap.live_blocks(), 0);
    }

    #[test]
    fn drop_runs_destructor_before_freeing() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Noisy;
        impl Drop for Noisy {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let heap = Arc::new(PrivateHeap::new());
        let boxed = PrivateBox::try_new_in(Noisy, &heap).expect("alloc");
        assert_eq!(PrivateBox::block(&boxed).size, 1, "ZST gets a one-byte block");
        drop(boxed);
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
        assert_eq!(heap.live_blocks(), 0);
    }

    #[test]
    fn deref_mut_updates_in_place() {
        let heap = Arc::new(PrivateHeap::new());
        let mut boxed = PrivateBox::try_new_in([0_u8; 8], &heap).expect("alloc");
        boxed[3] = 9;
        assert_eq!(boxed[3], 9);
        assert_eq!(format!("{boxed:?}"), "[0, 0, 0, 9, 0, 0, 0, 0]");
    }

    #[test]
    fn box_keeps_heap_alive() {
        let heap = Arc::new(PrivateHeap::new());
        let boxed = PrivateBox::try_new_in(String::from("kept"), &heap).expect("alloc");
        drop(heap);
        assert_eq!(PrivateBox::heap(&boxed).live_blocks(), 1);
        assert_eq!(boxed.as_str(), "kept");
    }
}
