use std::cell::Cell;

thread_local! {
    static DETECTOR_REENTRY_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Held while an entry point runs on this thread.
///
/// The detector allocates from the process heap (log records, the tracker
/// index, a cycle's setup and teardown), some of it under its state lock.
/// Under an intercepting allocator each of those allocations comes back in
/// through `leakward_track_alloc` / `leakward_track_free` on the same thread;
/// those nested calls must be dropped, not recorded.
pub(crate) struct DetectorReentryGuard;

impl Drop for DetectorReentryGuard {
    fn drop(&mut self) {
        DETECTOR_REENTRY_DEPTH.with(|depth| {
            let current = depth.get();
            depth.set(current.saturating_sub(1));
        });
    }
}

/// Enter the detector. `None` when this thread is already inside it.
#[inline]
pub(crate) fn enter_detector_reentry_guard() -> Option<DetectorReentryGuard> {
    DETECTOR_REENTRY_DEPTH.with(|depth| {
        let current = depth.get();
        if current > 0 {
            None
        } else {
            depth.set(current + 1);
            Some(DetectorReentryGuard)
        }
    })
}
