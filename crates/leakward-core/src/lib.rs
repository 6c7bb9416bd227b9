//! # leakward-core
//!
//! Load-cycle leak detection on top of [`leakward_heap`].
//!
//! A [`LeakDetector`] counts load and unload notifications. While at least
//! one load is outstanding it owns a private heap and a [`HostTracker`] that
//! the interception layer feeds with host allocations and frees. The last
//! unload produces a [`LeakReport`] over everything never freed, hands it to
//! the configured [`LeakReporter`], and tears the cycle down.
//!
//! Outside a load cycle the detector holds no state: queries answer `None`
//! and tracking calls are ignored.

pub mod config;
pub mod error;
pub mod global;
pub mod lifecycle;
pub mod log;
pub mod report;
pub mod tracker;

pub use config::{DetectorConfig, LogTarget, ReportLevel};
pub use error::{LifecycleError, ReportError};
pub use global::global_detector;
pub use lifecycle::{CycleTeardown, LeakDetector, LoadState, UnloadOutcome};
pub use log::{LogEmitter, LogLevel, LogRecord, SharedBuffer};
pub use report::{
    CollectingReporter, JsonlReporter, LeakEntry, LeakReport, LeakReporter, NullReporter,
    ReportTrigger,
};
pub use tracker::{HostAllocation, HostTracker};
