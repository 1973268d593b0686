//! Worker stderr filtering
//!
//! The worker process writes diagnostic chatter to stderr. Lines that look
//! like real failures are surfaced as warnings; everything else is kept at
//! trace level so it stays available under verbose logging without
//! polluting normal output.

use regex::Regex;
use tracing::{trace, warn};

/// Classifier trait for testing and extensibility
pub trait StderrClassifier: Send + Sync {
    /// Whether this stderr line should be surfaced as a warning
    fn is_surfaced(&self, line: &str) -> bool;
}

/// Default classifier using a compiled error pattern
#[derive(Clone)]
pub struct WorkerStderrClassifier {
    error_pattern: Regex,
}

impl WorkerStderrClassifier {
    /// Create a classifier with compiled patterns
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            // Matches anywhere in the line, case-insensitive: "Error:", "FATAL", "error loading ..."
            error_pattern: Regex::new(r"(?i)(error|fatal)")?,
        })
    }
}

impl Default for WorkerStderrClassifier {
    fn default() -> Self {
        Self::new().expect("Failed to compile stderr patterns")
    }
}

impl StderrClassifier for WorkerStderrClassifier {
    fn is_surfaced(&self, line: &str) -> bool {
        self.error_pattern.is_match(line)
    }
}

/// Build the per-line stderr callback installed on the worker process
pub fn create_stderr_processor() -> impl Fn(String) + Send + Sync {
    let classifier = WorkerStderrClassifier::default();
    move |line: String| {
        if classifier.is_surfaced(&line) {
            warn!("worker stderr: {}", line);
        } else {
            trace!("worker stderr: {}", line);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
