//! Leak reports and the sinks that receive them.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::ReportError;
use crate::log::{LogEmitter, LogLevel, LogRecord, SharedBuffer};
use crate::tracker::{HostAllocation, HostTracker};

/// Why a report was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportTrigger {
    /// Explicit request while loaded.
    Requested,
    /// The last outstanding unload.
    FinalUnload,
}

/// One host allocation that was never freed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakEntry {
    /// Hex address, e.g. `0x7f3a2c001010`.
    pub address: String,
    pub size: usize,
    pub sequence: u64,
}

impl From<&HostAllocation> for LeakEntry {
    fn from(a: &HostAllocation) -> Self {
        Self {
            address: format!("{:#x}", a.address),
            size: a.size,
            sequence: a.sequence,
        }
    }
}

/// Unresolved host allocations of one load cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakReport {
    pub cycle: u64,
    pub trigger: ReportTrigger,
    pub leak_count: usize,
    pub leaked_bytes: usize,
    /// Empty unless entries were requested.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<LeakEntry>,
    /// Private-heap blocks that are not tracking records.
    pub internal_leaks: usize,
}

impl LeakReport {
    /// Build a report over the current contents of `tracker`.
    #[must_use]
    pub fn from_tracker(
        cycle: u64,
        trigger: ReportTrigger,
        tracker: &HostTracker,
        include_entries: bool,
    ) -> Self {
        let (snapshot, internal_leaks) = tracker.census();
        let leaked_bytes = snapshot.iter().map(|a| a.size).sum();
        let entries = if include_entries {
            snapshot.iter().map(LeakEntry::from).collect()
        } else {
            Vec::new()
        };
        Self {
            cycle,
            trigger,
            leak_count: snapshot.len(),
            leaked_bytes,
            entries,
            internal_leaks,
        }
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.leak_count == 0 && self.internal_leaks == 0
    }
}

/// Receives every report the detector produces.
///
/// Called with the detector's lifecycle lock held: implementations must not
/// call back into the detector.
pub trait LeakReporter: Send + Sync {
    fn report(&self, report: &LeakReport);
}

/// Discards reports.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl LeakReporter for NullReporter {
    fn report(&self, _report: &LeakReport) {}
}

/// Keeps every report in memory.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    reports: Mutex<Vec<LeakReport>>,
}

impl CollectingReporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn reports(&self) -> Vec<LeakReport> {
        self.reports.lock().clone()
    }

    #[must_use]
    pub fn last(&self) -> Option<LeakReport> {
        self.reports.lock().last().cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }
}

impl LeakReporter for CollectingReporter {
    fn report(&self, report: &LeakReport) {
        self.reports.lock().push(report.clone());
    }
}

/// Writes each report as a `leak_report` JSONL record.
#[derive(Debug)]
pub struct JsonlReporter {
    emitter: Mutex<LogEmitter>,
    failures: AtomicU64,
}

impl JsonlReporter {
    #[must_use]
    pub fn new(emitter: LogEmitter) -> Self {
        Self {
            emitter: Mutex::new(emitter),
            failures: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn to_stderr() -> Self {
        Self::new(LogEmitter::to_stderr())
    }

    #[must_use]
    pub fn to_buffer() -> (Self, SharedBuffer) {
        let (emitter, buffer) = LogEmitter::to_buffer();
        (Self::new(emitter), buffer)
    }

    /// Write `report`, surfacing I/O and serialization failures.
    pub fn try_report(&self, report: &LeakReport) -> Result<(), ReportError> {
        let details = serde_json::to_value(report)?;
        let level = if report.leak_count > 0 {
            LogLevel::Warn
        } else {
            LogLevel::Info
        };
        let record = LogRecord::new(level, "leak_report")
            .with_cycle(report.cycle)
            .with_details(details);
        self.emitter.lock().emit(record)?;
        Ok(())
    }

    /// Reports that could not be written.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl LeakReporter for JsonlReporter {
    fn report(&self, report: &LeakReport) {
        if self.try_report(report).is_err() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leakward_heap::PrivateHeap;
    use std::sync::Arc;

    fn tracker_with(allocs: &[(usize, usize)]) -> HostTracker {
        let tracker = HostTracker::new(Arc::new(PrivateHeap::new()));
        for &(addr, size) in allocs {
            tracker.track(addr, size).unwrap();
        }
        tracker
    }

    #[test]
    fn summary_report_has_counts_and_no_entries() {
        let tracker = tracker_with(&[(0x10, 8), (0x20, 24)]);
        let report = LeakReport::from_tracker(3, ReportTrigger::FinalUnload, &tracker, false);
        assert_eq!(report.cycle, 3);
        assert_eq!(report.leak_count, 2);
        assert_eq!(report.leaked_bytes, 32);
        assert!(report.entries.is_empty());
        assert_eq!(report.internal_leaks, 0);
        assert!(!report.is_clean());
    }

    #[test]
    fn full_report_lists_entries_oldest_first() {
        let tracker = tracker_with(&[(0xbeef0, 16), (0xabc0, 4)]);
        let report = LeakReport::from_tracker(1, ReportTrigger::Requested, &tracker, true);
        assert_eq!(report.entries.len(), 2);
        assert_eq!(report.entries[0].address, "0xbeef0");
        assert_eq!(report.entries[0].sequence, 0);
        assert_eq!(report.entries[1].address, "0xabc0");
    }

    #[test]
    fn internal_leaks_count_non_record_blocks() {
        let tracker = tracker_with(&[(0x10, 8)]);
        let stray = tracker.heap().allocate(40, file!(), line!()).unwrap();
        let report = LeakReport::from_tracker(1, ReportTrigger::Requested, &tracker, false);
        assert_eq!(report.leak_count, 1);
        assert_eq!(report.internal_leaks, 1);
        // SAFETY: allocated above from the same heap.
        unsafe { tracker.heap().deallocate(stray.as_ptr()) };
    }

    #[test]
    fn jsonl_reporter_writes_one_record_per_report() {
        let tracker = tracker_with(&[(0x1000, 64)]);
        let report = LeakReport::from_tracker(2, ReportTrigger::FinalUnload, &tracker, true);
        let (reporter, buffer) = JsonlReporter::to_buffer();
        reporter.report(&report);
        assert_eq!(reporter.failures(), 0);

        let lines = buffer.lines();
        assert_eq!(lines.len(), 1);
        let parsed: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(parsed["event"], "leak_report");
        assert_eq!(parsed["level"], "warn");
        assert_eq!(parsed["cycle"], 2);
        assert_eq!(parsed["details"]["trigger"], "final_unload");
        assert_eq!(parsed["details"]["leak_count"], 1);
        assert_eq!(parsed["details"]["leaked_bytes"], 64);
        assert_eq!(parsed["details"]["entries"][0]["address"], "0x1000");

        let back: LeakReport = serde_json::from_value(parsed["details"].clone()).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn clean_report_is_info_and_omits_entries() {
        let tracker = tracker_with(&[]);
        let report = LeakReport::from_tracker(1, ReportTrigger::Requested, &tracker, true);
        assert!(report.is_clean());
        let (reporter, buffer) = JsonlReporter::to_buffer();
        reporter.try_report(&report).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&buffer.lines()[0]).unwrap();
        assert_eq!(parsed["level"], "info");
        assert!(parsed["details"].get("entries").is_none());
    }

    #[test]
    fn failing_writer_is_counted_not_propagated() {
        struct Broken;
        impl std::io::Write for Broken {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("closed"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let reporter = JsonlReporter::new(LogEmitter::from_writer(Box::new(Broken)));
        let tracker = tracker_with(&[]);
        let report = LeakReport::from_tracker(1, ReportTrigger::Requested, &tracker, false);
        assert!(matches!(reporter.try_report(&report), Err(ReportError::Io(_))));
        reporter.report(&report);
        assert_eq!(reporter.failures(), 1);
    }

    #[test]
    fn collecting_reporter_keeps_order() {
        let reporter = CollectingReporter::new();
        let tracker = tracker_with(&[(0x8, 1)]);
        for cycle in 1..=3 {
            reporter.report(&LeakReport::from_tracker(
                cycle,
                ReportTrigger::Requested,
                &tracker,
                false,
            ));
        }
        assert_eq!(reporter.len(), 3);
        assert_eq!(reporter.last().map(|r| r.cycle), Some(3));
        NullReporter.report(&reporter.reports()[0]);
    }
}
