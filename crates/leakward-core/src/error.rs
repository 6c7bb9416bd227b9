use thiserror::Error;

/// Misuse of the load/unload protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// An unload arrived with no outstanding load.
    #[error("unload without a matching load (depth is 0)")]
    NotLoaded,
}

/// Failure to deliver a leak report.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
