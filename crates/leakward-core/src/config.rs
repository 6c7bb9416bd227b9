//! Detector configuration.
//!
//! - `LEAKWARD_REPORT`: how much the final leak report carries.
//!   `summary` (default) emits counts, `full` adds one entry per leaked
//!   allocation, `off` skips reporting.
//! - `LEAKWARD_LOG`: where lifecycle records go. `stderr` (default), `off`,
//!   or a file path.
//! - `LEAKWARD_HEAP_CHUNK_KB` / `LEAKWARD_HEAP_LIMIT_KB`: see [`HeapConfig`].

use std::path::PathBuf;

use leakward_heap::HeapConfig;

const REPORT_ENV: &str = "LEAKWARD_REPORT";
const LOG_ENV: &str = "LEAKWARD_LOG";

/// Amount of detail in leak reports.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportLevel {
    /// Leak count and leaked bytes only.
    #[default]
    Summary,
    /// Summary plus one entry per unresolved allocation.
    Full,
    /// No report at the final unload. Forced reports still go out as summaries.
    Off,
}

impl ReportLevel {
    /// Parse from string (case-insensitive). Unknown values mean `Summary`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" | "verbose" | "entries" | "all" => Self::Full,
            "off" | "none" | "disabled" | "0" => Self::Off,
            _ => Self::Summary,
        }
    }

    /// Read `LEAKWARD_REPORT`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_var(std::env::var(REPORT_ENV).ok().as_deref())
    }

    /// Level for a raw `LEAKWARD_REPORT` value; unset means `Summary`.
    #[must_use]
    pub fn from_var(raw: Option<&str>) -> Self {
        raw.map(Self::from_str_loose).unwrap_or_default()
    }

    #[must_use]
    pub const fn reports_at_teardown(self) -> bool {
        !matches!(self, Self::Off)
    }

    #[must_use]
    pub const fn includes_entries(self) -> bool {
        matches!(self, Self::Full)
    }
}

/// Destination of lifecycle log records.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum LogTarget {
    #[default]
    Stderr,
    Off,
    /// Append JSONL records to this file.
    File(PathBuf),
}

impl LogTarget {
    /// Parse from string. `stderr`/empty and `off`/`none` are keywords,
    /// anything else is a path.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "" | "stderr" | "default" => Self::Stderr,
            "off" | "none" | "disabled" | "0" => Self::Off,
            _ => Self::File(PathBuf::from(trimmed)),
        }
    }

    #[must_use]
    pub fn from_env() -> Self {
        std::env::var(LOG_ENV)
            .map(|v| Self::from_str_loose(&v))
            .unwrap_or_default()
    }
}

/// Everything a [`LeakDetector`](crate::LeakDetector) needs to know up front.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DetectorConfig {
    pub report_level: ReportLevel,
    /// Applied to the private heap of every load cycle.
    pub heap: HeapConfig,
    pub log: LogTarget,
}

impl DetectorConfig {
    /// Read every `LEAKWARD_*` variable. Invalid values fall back to the
    /// defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            report_level: ReportLevel::from_env(),
            heap: HeapConfig::from_env(),
            log: LogTarget::from_env(),
        }
    }

    #[must_use]
    pub fn with_report_level(mut self, level: ReportLevel) -> Self {
        self.report_level = level;
        self
    }

    #[must_use]
    pub fn with_heap(mut self, heap: HeapConfig) -> Self {
        self.heap = heap;
        self
    }

    #[must_use]
    pub fn with_log(mut self, log: LogTarget) -> Self {
        self.log = log;
        self
    }
}
