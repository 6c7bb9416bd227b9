//! Entry points driven from a thread whose every allocation is reported back
//! through the tracking hooks, the way an interception layer does it.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::ffi::c_void;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use leakward_abi::{
    INACTIVE, leakward_get_leaks_count, leakward_on_load, leakward_on_unload,
    leakward_report_leaks, leakward_track_alloc, leakward_track_free,
};

thread_local! {
    static INTERCEPT: Cell<bool> = const { Cell::new(false) };
}

fn intercepting() -> bool {
    INTERCEPT.try_with(Cell::get).unwrap_or(false)
}

struct InterceptingAllocator;

// SAFETY: every request is forwarded to `System` unchanged; the hooks only
// observe addresses.
unsafe impl GlobalAlloc for InterceptingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: forwarded with the caller's layout.
        let ptr = unsafe { System.alloc(layout) };
        if intercepting() {
            leakward_track_alloc(ptr.cast::<c_void>(), layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if intercepting() {
            leakward_track_free(ptr.cast::<c_void>());
        }
        // SAFETY: `ptr` came from `alloc` with this layout.
        unsafe { System.dealloc(ptr, layout) };
    }
}

#[global_allocator]
static GLOBAL: InterceptingAllocator = InterceptingAllocator;

/// Run `f` on an intercepted thread, failing if it does not finish in time.
fn run_intercepted<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        INTERCEPT.with(|flag| flag.set(true));
        let out = f();
        INTERCEPT.with(|flag| flag.set(false));
        let _ = tx.send(out);
    });
    rx.recv_timeout(Duration::from_secs(10))
        .expect("entry point deadlocked under an intercepting allocator")
}

#[test]
fn lifecycle_under_intercepting_allocator() {
    let (loaded, leaked, reported, unloaded, after) = run_intercepted(|| {
        let loaded = leakward_on_load();

        let mut kept: Vec<u64> = Vec::with_capacity(32);
        kept.push(7);
        let freed = vec![0_u8; 128];
        drop(freed);
        let leaked = leakward_get_leaks_count();
        let reported = leakward_report_leaks();

        let unloaded = leakward_on_unload();
        let after = leakward_get_leaks_count();
        std::mem::forget(kept);
        (loaded, leaked, reported, unloaded, after)
    });

    assert_eq!(loaded, 1);
    // At least `kept` is still live; the detector's own allocations are not
    // counted because they re-enter on a guarded thread.
    assert!(leaked >= 1, "host allocation was tracked: {leaked}");
    assert_eq!(reported, leaked);
    assert_eq!(unloaded, 0);
    assert_eq!(after, INACTIVE);
}
