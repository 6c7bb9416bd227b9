//! Private region sizing.
//!
//! Read from the environment when a heap is created:
//! - `LEAKWARD_HEAP_CHUNK_KB`: size of each chunk mapped for small blocks
//!   (default 1024, clamped to `[64, 65536]`).
//! - `LEAKWARD_HEAP_LIMIT_KB`: cap on bytes the region may reserve from the OS
//!   (default: unlimited; `0`, `none` and `unlimited` also mean unlimited).
//!
//! Malformed values fall back to the defaults instead of failing.

/// Default chunk size for small-block mappings.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

const MIN_CHUNK_SIZE: usize = 64 * 1024;
const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

const CHUNK_ENV: &str = "LEAKWARD_HEAP_CHUNK_KB";
const LIMIT_ENV: &str = "LEAKWARD_HEAP_LIMIT_KB";

/// Sizing knobs for the private region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Bytes mapped per small-block chunk.
    pub chunk_size: usize,
    /// Upper bound on bytes reserved from the OS, if any.
    pub max_bytes: Option<usize>,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_bytes: None,
        }
    }
}

impl HeapConfig {
    /// Read the configuration from `LEAKWARD_HEAP_*` variables.
    #[must_use]
    pub fn from_env() -> Self {
        let chunk = std::env::var(CHUNK_ENV).ok();
        let limit = std::env::var(LIMIT_ENV).ok();
        Self::from_vars(chunk.as_deref(), limit.as_deref())
    }

    /// Build a configuration from raw variable values.
    #[must_use]
    pub fn from_vars(chunk_kb: Option<&str>, limit_kb: Option<&str>) -> Self {
        let chunk_size = chunk_kb
            .and_then(parse_kib_loose)
            .map_or(DEFAULT_CHUNK_SIZE, |bytes| {
                bytes.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
            });
        let max_bytes = limit_kb.and_then(parse_limit_loose);
        Self {
            chunk_size,
            max_bytes,
        }
    }

    /// Same configuration with a reservation cap.
    #[must_use]
    pub const fn with_limit(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }
}

fn parse_kib_loose(raw: &str) -> Option<usize> {
    let trimmed = raw.trim().trim_end_matches(['k', 'K']);
    let kib: usize = trimmed.parse().ok()?;
    kib.checked_mul(1024)
}

fn parse_limit_loose(raw: &str) -> Option<usize> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "none" | "unlimited" | "off" => None,
        other => parse_kib_loose(other).filter(|&bytes| bytes > 0),
    }
}
