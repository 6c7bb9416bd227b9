//! ABI layer for the load/unload protocol and leak queries.
//!
//! Every entry point holds the reentry guard for its whole call, so host
//! allocations the detector makes on this thread are not fed back into it.
//! A lifecycle call that is itself nested inside the detector still runs:
//! load and unload notifications are never dropped.

use std::ffi::c_int;

use leakward_core::global_detector;

use crate::reentry::enter_detector_reentry_guard;
use crate::{INACTIVE, to_c_int};

/// Module load notification. Returns the new load depth.
#[unsafe(no_mangle)]
pub extern "C" fn leakward_on_load() -> c_int {
    let _reentry_guard = enter_detector_reentry_guard();
    to_c_int(global_detector().on_load())
}

/// Module unload notification. Returns 0, or -1 when nothing was loaded.
#[unsafe(no_mangle)]
pub extern "C" fn leakward_on_unload() -> c_int {
    let _reentry_guard = enter_detector_reentry_guard();
    match global_detector().on_unload() {
        Ok(_) => 0,
        Err(_) => -1,
    }
}

/// Host allocations not freed so far in the current cycle, or -1 when no
/// load is outstanding.
#[unsafe(no_mangle)]
pub extern "C" fn leakward_get_leaks_count() -> c_int {
    let _reentry_guard = enter_detector_reentry_guard();
    global_detector()
        .query_active_leak_count()
        .map_or(INACTIVE, to_c_int)
}

/// Emit a leak report now. Returns the number of leaks reported, or -1 when
/// no load is outstanding.
#[unsafe(no_mangle)]
pub extern "C" fn leakward_report_leaks() -> c_int {
    let _reentry_guard = enter_detector_reentry_guard();
    global_detector().report_leaks().map_or(INACTIVE, to_c_int)
}

/// Outstanding load notifications.
#[unsafe(no_mangle)]
pub extern "C" fn leakward_load_depth() -> c_int {
    let _reentry_guard = enter_detector_reentry_guard();
    to_c_int(global_detector().depth())
}
