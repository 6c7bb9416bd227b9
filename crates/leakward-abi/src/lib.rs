//! # leakward-abi
//!
//! C entry points over [`leakward_core::global_detector`].
//!
//! The module-loading glue calls `leakward_on_load` / `leakward_on_unload`;
//! the allocation interception layer calls `leakward_track_alloc` /
//! `leakward_track_free`. Every query answers `-1` while no load is
//! outstanding.

mod reentry;

pub mod lifecycle_abi;
pub mod tracking_abi;

pub use lifecycle_abi::{
    leakward_get_leaks_count, leakward_load_depth, leakward_on_load, leakward_on_unload,
    leakward_report_leaks,
};
pub use tracking_abi::{leakward_track_alloc, leakward_track_free};

/// Returned by queries while the detector is inactive.
pub const INACTIVE: std::ffi::c_int = -1;

pub(crate) fn to_c_int(n: usize) -> std::ffi::c_int {
    std::ffi::c_int::try_from(n).unwrap_or(std::ffi::c_int::MAX)
}
