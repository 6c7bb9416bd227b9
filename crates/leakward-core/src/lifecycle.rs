//! Load-cycle state machine.
//!
//! The detector is active while at least one load notification is
//! outstanding. The `0 -> 1` edge builds a fresh private heap and host
//! tracker; the `1 -> 0` edge reports every host allocation still tracked
//! and tears both down. Nothing survives from one cycle to the next.
//!
//! A load or unload holds the state write lock across both the depth update
//! and the activation or teardown that update triggers, so every `0 -> 1`
//! and `1 -> 0` edge runs its work in the order the edges happened. Under the
//! lock, `active.is_some()` holds exactly when the depth is non-zero.
//!
//! Activation, reporting and teardown allocate while holding that lock. An
//! interception layer feeding [`LeakDetector::track_host_allocation`] from a
//! hooked allocator must drop calls made on a thread that is inside one of
//! these entry points, or that thread deadlocks on itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use leakward_heap::{PrivateHeap, TeardownSummary};
use parking_lot::{Mutex, RwLock};
use serde_json::json;

use crate::config::DetectorConfig;
use crate::error::LifecycleError;
use crate::log::{LogEmitter, LogLevel, LogRecord};
use crate::report::{LeakReport, LeakReporter, ReportTrigger};
use crate::tracker::HostTracker;

/// Externally visible state of a [`LeakDetector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadState {
    Inactive,
    /// Loaded with this many outstanding load notifications.
    Active(usize),
}

/// Result of the final unload of a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleTeardown {
    pub cycle: u64,
    pub report: LeakReport,
    /// Tool-internal blocks still live when the heap was torn down, or `None`
    /// if someone still held the heap and teardown was left to its last owner.
    pub internal: Option<TeardownSummary>,
}

/// What an accepted unload did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnloadOutcome {
    /// The detector stays loaded.
    Nested { depth: usize },
    /// This unload ended the cycle.
    TornDown(CycleTeardown),
}

impl UnloadOutcome {
    #[must_use]
    pub fn teardown(&self) -> Option<&CycleTeardown> {
        match self {
            Self::TornDown(t) => Some(t),
            Self::Nested { .. } => None,
        }
    }
}

struct ActiveState {
    cycle: u64,
    heap: Arc<PrivateHeap>,
    tracker: HostTracker,
}

/// Leak detector service: load counter, per-cycle state and report sink.
pub struct LeakDetector {
    depth: AtomicUsize,
    cycles: AtomicU64,
    active: RwLock<Option<ActiveState>>,
    config: DetectorConfig,
    reporter: Arc<dyn LeakReporter>,
    log: Mutex<LogEmitter>,
}

impl LeakDetector {
    /// Detector logging to `config.log`. An unusable log file falls back to
    /// stderr.
    #[must_use]
    pub fn new(config: DetectorConfig, reporter: Arc<dyn LeakReporter>) -> Self {
        let (emitter, fallback) = match LogEmitter::from_target(&config.log) {
            Ok(emitter) => (emitter, None),
            Err(err) => (LogEmitter::to_stderr(), Some(err)),
        };
        let detector = Self::with_log(config, reporter, emitter);
        if let Some(err) = fallback {
            detector.log(
                LogRecord::new(LogLevel::Warn, "log_target_unavailable")
                    .with_details(json!({ "error": err.to_string() })),
            );
        }
        detector
    }

    #[must_use]
    pub fn with_log(
        config: DetectorConfig,
        reporter: Arc<dyn LeakReporter>,
        log: LogEmitter,
    ) -> Self {
        Self {
            depth: AtomicUsize::new(0),
            cycles: AtomicU64::new(0),
            active: RwLock::new(None),
            config,
            reporter,
            log: Mutex::new(log),
        }
    }

    #[must_use]
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Outstanding load notifications.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn state(&self) -> LoadState {
        match self.depth() {
            0 => LoadState::Inactive,
            n => LoadState::Active(n),
        }
    }

    /// Cycle number of the active state, if any.
    #[must_use]
    pub fn cycle(&self) -> Option<u64> {
        self.active.read().as_ref().map(|s| s.cycle)
    }

    /// Cycles activated so far.
    #[must_use]
    pub fn cycles_started(&self) -> u64 {
        self.cycles.load(Ordering::Acquire)
    }

    /// Record one load notification. Returns the new depth.
    pub fn on_load(&self) -> usize {
        let mut active = self.active.write();
        let previous = self.depth.fetch_add(1, Ordering::AcqRel);
        let depth = previous + 1;
        self.log(LogRecord::new(LogLevel::Info, "load").with_depth(depth));
        if previous == 0 {
            debug_assert!(active.is_none(), "inactive detector holds cycle state");
            *active = Some(self.activate(depth));
        }
        depth
    }

    /// Record one unload notification.
    ///
    /// An unload with nothing loaded changes nothing and returns
    /// [`LifecycleError::NotLoaded`].
    pub fn on_unload(&self) -> Result<UnloadOutcome, LifecycleError> {
        let mut active = self.active.write();
        let previous = self
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1))
            .map_err(|_| {
                self.log(LogRecord::new(LogLevel::Warn, "unbalanced_unload").with_depth(0));
                LifecycleError::NotLoaded
            })?;
        let depth = previous - 1;
        self.log(LogRecord::new(LogLevel::Info, "unload").with_depth(depth));
        if depth == 0 {
            let state = active.take();
            debug_assert!(state.is_some(), "loaded detector without cycle state");
            if let Some(state) = state {
                return Ok(UnloadOutcome::TornDown(self.teardown(state)));
            }
        }
        Ok(UnloadOutcome::Nested { depth })
    }

    /// Unresolved host allocations of the current cycle, `None` when inactive.
    #[must_use]
    pub fn query_active_leak_count(&self) -> Option<usize> {
        self.active.read().as_ref().map(|s| s.tracker.count())
    }

    /// Report the current cycle's unresolved allocations now.
    ///
    /// Goes to the reporter even when teardown reports are off. Returns the
    /// leak count reported, `None` when inactive.
    pub fn report_leaks(&self) -> Option<usize> {
        let active = self.active.read();
        let state = active.as_ref()?;
        let report = LeakReport::from_tracker(
            state.cycle,
            ReportTrigger::Requested,
            &state.tracker,
            self.config.report_level.includes_entries(),
        );
        self.emit_report(&report);
        Some(report.leak_count)
    }

    /// Record a host allocation. Ignored (returns `false`) while inactive, for
    /// null addresses, and when the private heap is exhausted.
    pub fn track_host_allocation(&self, address: usize, size: usize) -> bool {
        let active = self.active.read();
        let Some(state) = active.as_ref() else {
            return false;
        };
        match state.tracker.track(address, size) {
            Ok(tracked) => tracked,
            Err(err) => {
                self.log(
                    LogRecord::new(LogLevel::Error, "track_failed")
                        .with_cycle(state.cycle)
                        .with_details(json!({
                            "address": format!("{address:#x}"),
                            "size": size,
                            "error": err.to_string(),
                        })),
                );
                false
            }
        }
    }

    /// Record that the host freed `address`. `false` while inactive or when
    /// the address was not tracked.
    pub fn untrack_host_allocation(&self, address: usize) -> bool {
        self.active
            .read()
            .as_ref()
            .is_some_and(|s| s.tracker.untrack(address))
    }

    /// Private heap of the current cycle, for the tool's own allocations.
    ///
    /// Holding the returned handle past the final unload defers that cycle's
    /// heap teardown to the handle's last owner.
    #[must_use]
    pub fn private_heap(&self) -> Option<Arc<PrivateHeap>> {
        self.active.read().as_ref().map(|s| Arc::clone(&s.heap))
    }

    fn activate(&self, depth: usize) -> ActiveState {
        let cycle = self.cycles.fetch_add(1, Ordering::AcqRel) + 1;
        let heap = Arc::new(PrivateHeap::with_config(&self.config.heap));
        self.log(
            LogRecord::new(LogLevel::Info, "activate")
                .with_depth(depth)
                .with_cycle(cycle),
        );
        ActiveState {
            cycle,
            tracker: HostTracker::new(Arc::clone(&heap)),
            heap,
        }
    }

    fn teardown(&self, state: ActiveState) -> CycleTeardown {
        let ActiveState {
            cycle,
            heap,
            tracker,
        } = state;

        let report = LeakReport::from_tracker(
            cycle,
            ReportTrigger::FinalUnload,
            &tracker,
            self.config.report_level.includes_entries(),
        );
        if self.config.report_level.reports_at_teardown() {
            self.emit_report(&report);
        }

        drop(tracker);
        let internal = match Arc::try_unwrap(heap) {
            Ok(mut heap) => {
                let summary = heap.teardown();
                for block in &summary.leaked {
                    self.log(
                        LogRecord::new(LogLevel::Warn, "internal_leak")
                            .with_cycle(cycle)
                            .with_details(json!({
                                "file": block.origin_file,
                                "line": block.origin_line,
                                "serial": block.serial,
                                "size": block.size,
                            })),
                    );
                }
                Some(summary)
            }
            Err(_) => {
                self.log(LogRecord::new(LogLevel::Warn, "heap_teardown_deferred").with_cycle(cycle));
                None
            }
        };

        self.log(
            LogRecord::new(LogLevel::Info, "teardown")
                .with_depth(0)
                .with_cycle(cycle)
                .with_details(json!({
                    "leak_count": report.leak_count,
                    "internal_leaks": internal.as_ref().map(|s| s.leaked.len()),
                })),
        );
        CycleTeardown {
            cycle,
            report,
            internal,
        }
    }

    fn emit_report(&self, report: &LeakReport) {
        self.log(
            LogRecord::new(LogLevel::Info, "report")
                .with_cycle(report.cycle)
                .with_details(json!({
                    "trigger": report.trigger,
                    "leak_count": report.leak_count,
                    "leaked_bytes": report.leaked_bytes,
                })),
        );
        self.reporter.report(report);
    }

    fn log(&self, record: LogRecord) {
        // Logging must never fail a lifecycle transition.
        let _ = self.log.lock().emit(record);
    }
}

impl std::fmt::Debug for LeakDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeakDetector")
            .field("depth", &self.depth())
            .field("cycles", &self.cycles_started())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
