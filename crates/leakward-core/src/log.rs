//! Structured JSONL lifecycle log.
//!
//! Every load, activation, unload, report and teardown is written as one JSON
//! object per line:
//!
//! ```json
//! {"seq":3,"timestamp":"2026-01-01T00:00:00.000Z","level":"info","event":"unload","depth":0,"cycle":1}
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::LogTarget;

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// One lifecycle log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Assigned by the emitter; strictly increasing per emitter.
    pub seq: u64,
    pub timestamp: String,
    pub level: LogLevel,
    pub event: String,
    /// Load depth after the event, when it concerns the load counter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<usize>,
    /// Load cycle the event belongs to (first activation is cycle 1).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogRecord {
    #[must_use]
    pub fn new(level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            seq: 0,
            timestamp: now_utc(),
            level,
            event: event.into(),
            depth: None,
            cycle: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = Some(depth);
        self
    }

    #[must_use]
    pub fn with_cycle(mut self, cycle: u64) -> Self {
        self.cycle = Some(cycle);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// In-memory sink shared between an emitter and whoever inspects it.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }

    /// Non-empty lines written so far.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.contents()
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// Lines parsed back into records. Lines that are not records are skipped.
    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        self.lines()
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    pub fn clear(&self) {
        self.bytes.lock().clear();
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writes [`LogRecord`]s as JSONL lines.
pub struct LogEmitter {
    writer: Option<Box<dyn Write + Send>>,
    min_level: LogLevel,
    seq: u64,
}

impl LogEmitter {
    /// Emitter writing to standard error.
    #[must_use]
    pub fn to_stderr() -> Self {
        Self::from_writer(Box::new(io::stderr()))
    }

    /// Emitter appending to `path` (created if missing).
    pub fn to_file(path: &Path) -> io::Result<Self> {
        let file: File = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::from_writer(Box::new(BufWriter::new(file))))
    }

    /// Emitter writing into a buffer the caller keeps a handle to.
    #[must_use]
    pub fn to_buffer() -> (Self, SharedBuffer) {
        let buffer = SharedBuffer::new();
        (Self::from_writer(Box::new(buffer.clone())), buffer)
    }

    /// Emitter that drops every record.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            writer: None,
            min_level: LogLevel::Info,
            seq: 0,
        }
    }

    #[must_use]
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Some(writer),
            min_level: LogLevel::Info,
            seq: 0,
        }
    }

    /// Build the emitter a [`LogTarget`] asks for.
    pub fn from_target(target: &LogTarget) -> io::Result<Self> {
        match target {
            LogTarget::Stderr => Ok(Self::to_stderr()),
            LogTarget::Off => Ok(Self::disabled()),
            LogTarget::File(path) => Self::to_file(path),
        }
    }

    /// Drop records below `level`.
    #[must_use]
    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    /// Records written so far.
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.seq
    }

    /// Stamp `record` with the next sequence number and write it.
    ///
    /// Returns `Ok(false)` when the record was filtered out.
    pub fn emit(&mut self, mut record: LogRecord) -> io::Result<bool> {
        if record.level < self.min_level {
            return Ok(false);
        }
        let Some(writer) = self.writer.as_mut() else {
            return Ok(false);
        };
        record.seq = self.seq + 1;
        let line = record.to_jsonl().map_err(io::Error::other)?;
        writeln!(writer, "{line}")?;
        writer.flush()?;
        self.seq = record.seq;
        Ok(true)
    }
}

impl std::fmt::Debug for LogEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogEmitter")
            .field("enabled", &self.writer.is_some())
            .field("min_level", &self.min_level)
            .field("seq", &self.seq)
            .finish()
    }
}

/// Current UTC time as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format_utc(duration.as_secs(), duration.subsec_millis())
}

fn format_utc(secs: u64, millis: u32) -> String {
    let days = secs / 86_400;
    let (year, month, day) = civil_from_days(days);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{millis:03}Z",
        (secs % 86_400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
    )
}

/// Proleptic Gregorian date for a day count since 1970-01-01.
fn civil_from_days(days: u64) -> (u64, u64, u64) {
    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + u64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_serializes_required_fields_only() {
        let record = LogRecord::new(LogLevel::Info, "load");
        let json = record.to_jsonl().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed["timestamp"].is_string());
        assert_eq!(parsed["level"], "info");
        assert_eq!(parsed["event"], "load");
        assert!(parsed.get("depth").is_none());
        assert!(parsed.get("cycle").is_none());
        assert!(parsed.get("details").is_none());
    }

    #[test]
    fn record_builder_sets_optional_fields() {
        let record = LogRecord::new(LogLevel::Warn, "internal_leak")
            .with_depth(0)
            .with_cycle(2)
            .with_details(serde_json::json!({"serial": 7}));
        let parsed: serde_json::Value = serde_json::from_str(&record.to_jsonl().unwrap()).unwrap();
        assert_eq!(parsed["level"], "warn");
        assert_eq!(parsed["depth"], 0);
        assert_eq!(parsed["cycle"], 2);
        assert_eq!(parsed["details"]["serial"], 7);
    }

    #[test]
    fn emitter_assigns_increasing_seq() {
        let (mut emitter, buffer) = LogEmitter::to_buffer();
        for event in ["load", "activate", "unload"] {
            assert!(emitter.emit(LogRecord::new(LogLevel::Info, event)).unwrap());
        }
        let records = buffer.records();
        assert_eq!(records.len(), 3);
        let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(records[1].event, "activate");
        assert_eq!(emitter.emitted(), 3);
    }

    #[test]
    fn emitter_filters_below_min_level() {
        let (emitter, buffer) = LogEmitter::to_buffer();
        let mut emitter = emitter.with_min_level(LogLevel::Warn);
        assert!(!emitter.emit(LogRecord::new(LogLevel::Info, "load")).unwrap());
        assert!(emitter.emit(LogRecord::new(LogLevel::Error, "boom")).unwrap());
        assert_eq!(buffer.lines().len(), 1);
        assert_eq!(buffer.records()[0].seq, 1);
    }

    #[test]
    fn disabled_emitter_writes_nothing() {
        let mut emitter = LogEmitter::disabled();
        assert!(!emitter.is_enabled());
        assert!(!emitter.emit(LogRecord::new(LogLevel::Error, "x")).unwrap());
        assert_eq!(emitter.emitted(), 0);
    }

    #[test]
    fn file_emitter_appends_jsonl() {
        let path = std::env::temp_dir().join(format!(
            "leakward-log-{}-{:?}.jsonl",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_file(&path);
        {
            let mut emitter = LogEmitter::from_target(&LogTarget::File(path.clone())).unwrap();
            emitter.emit(LogRecord::new(LogLevel::Info, "load")).unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let parsed: LogRecord = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(parsed.event, "load");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn utc_formatting_matches_known_instants() {
        assert_eq!(format_utc(0, 0), "1970-01-01T00:00:00.000Z");
        // 2000-02-29 12:34:56 UTC
        assert_eq!(format_utc(951_827_696, 789), "2000-02-29T12:34:56.789Z");
        // 2024-12-31 23:59:59 UTC
        assert_eq!(format_utc(1_735_689_599, 5), "2024-12-31T23:59:59.005Z");
    }
}
