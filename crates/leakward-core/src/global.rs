//! Process-wide detector for the C entry points.

use std::sync::{Arc, OnceLock};

use crate::config::DetectorConfig;
use crate::lifecycle::LeakDetector;
use crate::log::LogEmitter;
use crate::report::JsonlReporter;

static GLOBAL_DETECTOR: OnceLock<LeakDetector> = OnceLock::new();

/// Global leak detector, configured from the environment on first use.
///
/// Reports go to the same destination as the lifecycle log.
#[must_use]
pub fn global_detector() -> &'static LeakDetector {
    GLOBAL_DETECTOR.get_or_init(build_from_env)
}

fn build_from_env() -> LeakDetector {
    let config = DetectorConfig::from_env();
    let reporter = LogEmitter::from_target(&config.log)
        .map_or_else(|_| JsonlReporter::to_stderr(), JsonlReporter::new);
    LeakDetector::new(config, Arc::new(reporter))
}
