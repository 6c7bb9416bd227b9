//! Intrusive registry of live blocks.
//!
//! Every live block is linked, through its header, into one doubly-linked
//! list. Link and unlink are O(1); a traversal sees exactly the set of blocks
//! not yet freed. The list is only ever touched with the owning heap's
//! registry lock held.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use parking_lot::MutexGuard;

use crate::error::IntegrityError;
use crate::header::{BlockHeader, BlockInfo};

/// List head plus running totals.
pub(crate) struct BlockList {
    head: *mut BlockHeader,
    len: usize,
    bytes: usize,
}

// SAFETY: headers are reachable only through the list, and the list is only
// reachable through the heap's mutex.
unsafe impl Send for BlockList {}

impl BlockList {
    pub(crate) const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
            bytes: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }

    /// Link `header` in front of the current head.
    ///
    /// # Safety
    ///
    /// `header` must be a fully initialized header that is not in any list.
    pub(crate) unsafe fn push_front(&mut self, header: NonNull<BlockHeader>) {
        let raw = header.as_ptr();
        // SAFETY: caller hands over an unlinked header; the current head, if
        // any, is a live header owned by this list.
        unsafe {
            (*raw).prev = ptr::null_mut();
            (*raw).next = self.head;
            if !self.head.is_null() {
                (*self.head).prev = raw;
            }
            self.len += 1;
            self.bytes += (*raw).size;
        }
        self.head = raw;
    }

    /// Remove `header` from the list.
    ///
    /// Panics if the neighbor links disagree with `header`; a torn list means
    /// the heap can no longer vouch for its own bookkeeping.
    ///
    /// # Safety
    ///
    /// `header` must be linked into this list.
    pub(crate) unsafe fn unlink(&mut self, header: NonNull<BlockHeader>) {
        let raw = header.as_ptr();
        assert!(self.len > 0, "unlink from an empty block registry");

        // SAFETY: `raw` is linked here, so its neighbors are live headers.
        unsafe {
            let prev = (*raw).prev;
            let next = (*raw).next;
            let serial = (*raw).serial;

            if prev.is_null() {
                assert!(
                    self.head == raw,
                    "block #{serial} has no predecessor but is not the registry head"
                );
                self.head = next;
            } else {
                assert!(
                    (*prev).next == raw,
                    "block #{serial} is not the successor of its predecessor"
                );
                (*prev).next = next;
            }

            if !next.is_null() {
                assert!(
                    (*next).prev == raw,
                    "block #{serial} is not the predecessor of its successor"
                );
                (*next).prev = prev;
            }

            (*raw).prev = ptr::null_mut();
            (*raw).next = ptr::null_mut();
            self.len -= 1;
            self.bytes -= (*raw).size;
        }
    }

    /// Detach the whole chain, leaving the list empty.
    pub(crate) fn take_all(&mut self) -> *mut BlockHeader {
        self.len = 0;
        self.bytes = 0;
        std::mem::replace(&mut self.head, ptr::null_mut())
    }

    pub(crate) fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            cursor: self.head,
            remaining: self.len,
            _list: PhantomData,
        }
    }

    /// Walk the list and verify its structural invariants.
    pub(crate) fn verify(&self) -> Result<usize, IntegrityError> {
        if !self.head.is_null() {
            // SAFETY: the head is a live header.
            if unsafe { !(*self.head).prev.is_null() } {
                return Err(IntegrityError::HeadHasPrev);
            }
        }

        let limit = self.len;
        let mut counted = 0_usize;
        let mut bytes = 0_usize;
        let mut serials = HashSet::with_capacity(limit);
        let mut cursor = self.head;
        while !cursor.is_null() {
            if counted > limit {
                return Err(IntegrityError::Cycle { limit });
            }
            // SAFETY: every node reachable from the head is a live header.
            let (next, serial, size) = unsafe { ((*cursor).next, (*cursor).serial, (*cursor).size) };
            if !next.is_null() && unsafe { (*next).prev } != cursor {
                return Err(IntegrityError::BrokenBackLink { serial });
            }
            if !serials.insert(serial) {
                return Err(IntegrityError::DuplicateSerial { serial });
            }
            counted += 1;
            bytes += size;
            cursor = next;
        }

        if counted != self.len {
            return Err(IntegrityError::LengthMismatch {
                counted,
                recorded: self.len,
            });
        }
        if bytes != self.bytes {
            return Err(IntegrityError::ByteMismatch {
                counted: bytes,
                recorded: self.bytes,
            });
        }
        Ok(counted)
    }
}

/// Iterator over live blocks, newest first.
pub struct BlockIter<'a> {
    cursor: *mut BlockHeader,
    remaining: usize,
    _list: PhantomData<&'a BlockList>,
}

impl Iterator for BlockIter<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let header = NonNull::new(self.cursor)?;
        // SAFETY: the list lock outlives this iterator, so the header is live.
        let header_ref = unsafe { header.as_ref() };
        self.cursor = header_ref.next;
        self.remaining = self.remaining.saturating_sub(1);
        Some(header_ref.info(header))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

/// Locked view of a heap's registry.
///
/// Holding a `Blocks` keeps every allocate and deallocate on the heap waiting
/// at its link/unlink step, so traversal never observes a torn list. Keep it
/// short-lived.
pub struct Blocks<'a> {
    guard: MutexGuard<'a, BlockList>,
}

impl<'a> Blocks<'a> {
    pub(crate) fn new(guard: MutexGuard<'a, BlockList>) -> Self {
        Self { guard }
    }

    /// Number of live blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.guard.len()
    }

    /// True when no block is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guard.len() == 0
    }

    /// Total usable bytes held by live blocks.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.guard.bytes()
    }

    /// Iterate live blocks, most recently linked first.
    pub fn iter(&self) -> BlockIter<'_> {
        self.guard.iter()
    }
}

impl<'b> IntoIterator for &'b Blocks<'_> {
    type Item = BlockInfo;
    type IntoIter = BlockIter<'b>;

    fn into_iter(self) -> BlockIter<'b> {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed_header(serial: u64, size: usize) -> NonNull<BlockHeader> {
        let header = Box::new(BlockHeader::new("registry.rs", 1, serial, size));
        NonNull::from(Box::leak(header))
    }

    fn free_header(header: NonNull<BlockHeader>) {
        // SAFETY: produced by `boxed_header` and no longer linked.
        drop(unsafe { Box::from_raw(header.as_ptr()) });
    }

    fn serials(list: &BlockList) -> Vec<u64> {
        list.iter().map(|info| info.serial).collect()
    }

    #[test]
    fn push_front_orders_newest_first() {
        let mut list = BlockList::new();
        let headers: Vec<_> = (0..3).map(|s| boxed_header(s, 8)).collect();
        for &h in &headers {
            // SAFETY: fresh unlinked headers.
            unsafe { list.push_front(h) };
        }
        assert_eq!(serials(&list), vec![2, 1, 0]);
        assert_eq!(list.len(), 3);
        assert_eq!(list.bytes(), 24);
        assert_eq!(list.verify(), Ok(3));

        for &h in &headers {
            // SAFETY: linked above.
            unsafe { list.unlink(h) };
            free_header(h);
        }
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn unlink_head_middle_and_tail() {
        let mut list = BlockList::new();
        let headers: Vec<_> = (0..4).map(|s| boxed_header(s, 1)).collect();
        for &h in &headers {
            // SAFETY: fresh unlinked headers.
            unsafe { list.push_front(h) };
        }

        // Order is 3,2,1,0: unlink a middle node, then the head, then the tail.
        // SAFETY: all four are linked.
        unsafe { list.unlink(headers[1]) };
        assert_eq!(serials(&list), vec![3, 2, 0]);
        // SAFETY: still linked.
        unsafe { list.unlink(headers[3]) };
        assert_eq!(serials(&list), vec![2, 0]);
        // SAFETY: still linked.
        unsafe { list.unlink(headers[0]) };
        assert_eq!(serials(&list), vec![2]);
        assert_eq!(list.verify(), Ok(1));
        // SAFETY: still linked.
        unsafe { list.unlink(headers[2]) };
        assert_eq!(list.verify(), Ok(0));

        for h in headers {
            free_header(h);
        }
    }

    #[test]
    fn verify_detects_broken_back_link() {
        let mut list = BlockList::new();
        let a = boxed_header(10, 4);
        let b = boxed_header(11, 4);
        // SAFETY: fresh unlinked headers.
        unsafe {
            list.push_front(a);
            list.push_front(b);
            (*a.as_ptr()).prev = ptr::null_mut();
        }
        assert_eq!(list.verify(), Err(IntegrityError::BrokenBackLink { serial: 11 }));

        list.take_all();
        free_header(a);
        free_header(b);
    }

    #[test]
    #[should_panic(expected = "not the registry head")]
    fn unlink_of_detached_header_panics() {
        let mut list = BlockList::new();
        let linked = boxed_header(1, 4);
        let stray = boxed_header(2, 4);
        // SAFETY: fresh unlinked header.
        unsafe { list.push_front(linked) };
        // SAFETY: deliberately violates the contract; unlink asserts before
        // touching any neighbor.
        unsafe { list.unlink(stray) };
    }

    #[test]
    fn take_all_empties_the_list() {
        let mut list = BlockList::new();
        let h = boxed_header(0, 16);
        // SAFETY: fresh unlinked header.
        unsafe { list.push_front(h) };
        let chain = list.take_all();
        assert_eq!(chain, h.as_ptr());
        assert_eq!(list.len(), 0);
        assert_eq!(list.bytes(), 0);
        assert!(list.iter().next().is_none());
        free_header(h);
    }
}
