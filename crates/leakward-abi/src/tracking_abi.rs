//! ABI layer for the allocation interception hooks.

use std::ffi::{c_int, c_void};

use leakward_core::global_detector;

use crate::reentry::enter_detector_reentry_guard;

/// Record a host allocation of `size` bytes at `ptr`.
///
/// Returns 1 when recorded, 0 when ignored (inactive detector, null pointer,
/// nested call from inside the detector, or exhausted private heap).
#[unsafe(no_mangle)]
pub extern "C" fn leakward_track_alloc(ptr: *mut c_void, size: libc::size_t) -> c_int {
    let Some(_reentry_guard) = enter_detector_reentry_guard() else {
        return 0;
    };
    c_int::from(global_detector().track_host_allocation(ptr as usize, size))
}

/// Record that the host freed `ptr`.
///
/// Returns 1 when `ptr` was tracked, 0 otherwise.
#[unsafe(no_mangle)]
pub extern "C" fn leakward_track_free(ptr: *mut c_void) -> c_int {
    if ptr.is_null() {
        return 0;
    }
    let Some(_reentry_guard) = enter_detector_reentry_guard() else {
        return 0;
    };
    c_int::from(global_detector().untrack_host_allocation(ptr as usize))
}
