//! Worker wire protocol
//!
//! Newline-delimited JSON over the worker's standard streams. Requests carry
//! a numeric id; responses match by id and hold either a result or an error
//! object; method-bearing messages without an id are notifications. No
//! batching.

use crate::io::process::ProcessError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Method Names
// ============================================================================

/// Methods the client drives on the worker
pub mod methods {
    /// Handshake; the worker answers with its name and version
    pub const INITIALIZE: &str = "initialize";

    /// Sent as a notification during stop; the worker exits cleanly
    pub const SHUTDOWN: &str = "shutdown";

    /// Root discovery performed worker-side
    pub const RESOURCE_RESOLVE_ROOTS: &str = "resource/resolveRoots";

    /// Full index build worker-side
    pub const RESOURCE_BUILD_INDEX: &str = "resource/buildIndex";

    /// Incremental update worker-side
    pub const RESOURCE_APPLY_CHANGES: &str = "resource/applyChanges";

    /// Whole-project source scan
    pub const SCAN_EXTRACT: &str = "scan/extract";

    /// Single-resource source scan
    pub const SCAN_EXTRACT_RESOURCE: &str = "scan/extractResource";

    /// Translation context lookup at a source position
    pub const SCAN_TRANSLATION_CONTEXT_AT: &str = "scan/translationContextAt";

    /// Key-resolution analysis
    pub const RESOLVE_COMPUTE: &str = "resolve/compute";

    /// Project-wide diagnosis; emits `doctor/progress` notifications
    pub const DOCTOR_DIAGNOSE: &str = "doctor/diagnose";

    /// Progress notification emitted while `doctor/diagnose` runs
    pub const DOCTOR_PROGRESS: &str = "doctor/progress";

    /// Hardcoded-string extraction
    pub const HARDCODED_EXTRACT: &str = "hardcoded/extract";
}

// ============================================================================
// Timeouts
// ============================================================================

/// Timeout applied to requests unless the method is known to run long
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for methods that scan whole source trees
pub const EXPENSIVE_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

const EXPENSIVE_METHODS: &[&str] = &[
    methods::SCAN_EXTRACT,
    methods::DOCTOR_DIAGNOSE,
    methods::HARDCODED_EXTRACT,
];

/// Timeout to arm for one request to `method`
pub fn request_timeout(method: &str) -> Duration {
    if EXPENSIVE_METHODS.contains(&method) {
        EXPENSIVE_REQUEST_TIMEOUT
    } else {
        DEFAULT_REQUEST_TIMEOUT
    }
}

// ============================================================================
// Wire Types
// ============================================================================

/// Protocol version tag carried on every request
pub const JSONRPC_VERSION: &str = "2.0";

/// Outbound request: `{"jsonrpc":"2.0","id":<int>,"method":...,"params":...}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub jsonrpc: String,

    pub id: u64,

    pub method: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl WorkerRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// Inbound response: `{"id":<int>,"result":...}` or
/// `{"id":<int>,"error":{"message":...}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkerErrorObject>,
}

/// Error object inside a failed response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerErrorObject {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
}

/// Notification in either direction: method-bearing, no id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerNotification {
    pub method: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// One classified inbound line
#[derive(Debug)]
pub enum InboundMessage {
    Response(WorkerResponse),
    Notification(WorkerNotification),
    Unknown(String),
}

/// Classify an inbound line. A present id makes it a response; a method
/// without an id makes it a notification.
pub fn parse_inbound(line: &str) -> InboundMessage {
    if let Ok(response) = serde_json::from_str::<WorkerResponse>(line) {
        return InboundMessage::Response(response);
    }
    if let Ok(notification) = serde_json::from_str::<WorkerNotification>(line) {
        return InboundMessage::Notification(notification);
    }
    InboundMessage::Unknown(line.to_string())
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from the worker client
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(serde_json::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(serde_json::Error),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// Explicit error object from the worker, surfaced verbatim
    #[error("{0}")]
    Worker(String),

    #[error("Request '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("Worker exited before a response arrived (exit code {code:?})")]
    ProcessExited { code: Option<i32> },

    #[error("Worker is not running")]
    NotRunning,

    #[error("Worker already started")]
    AlreadyStarted,

    #[error("Missing result in response")]
    MissingResult,

    #[error("Failed to manage cancellation token {path:?}: {source}")]
    TokenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl WorkerError {
    /// True for the clean-exit-before-response case that permits a
    /// transparent retry
    pub fn is_retryable_exit(&self) -> bool {
        matches!(self, WorkerError::ProcessExited { code: Some(0) })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization_shape() {
        let request = WorkerRequest::new(7, methods::RESOLVE_COMPUTE, Some(json!({"key": "a"})));
        let line = serde_json::to_string(&request).unwrap();
        assert_eq!(
            line,
            "{\"jsonrpc\":\"2.0\",\"id\":7,\"method\":\"resolve/compute\",\"params\":{\"key\":\"a\"}}"
        );

        let bare = WorkerRequest::new(8, methods::INITIALIZE, None);
        let line = serde_json::to_string(&bare).unwrap();
        assert!(!line.contains("params"));
    }

    #[test]
    fn test_parse_inbound_classifies_responses() {
        let message = parse_inbound("{\"id\":3,\"result\":{\"name\":\"worker\"}}");
        match message {
            InboundMessage::Response(response) => {
                assert_eq!(response.id, 3);
                assert!(response.error.is_none());
                assert_eq!(response.result.unwrap()["name"], "worker");
            }
            other => panic!("expected response, got {:?}", other),
        }

        let message = parse_inbound("{\"id\":4,\"error\":{\"message\":\"scan failed\",\"code\":-1}}");
        match message {
            InboundMessage::Response(response) => {
                let error = response.error.unwrap();
                assert_eq!(error.message, "scan failed");
                assert_eq!(error.code, Some(-1));
            }
            other => panic!("expected error response, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_inbound_classifies_notifications() {
        let message =
            parse_inbound("{\"method\":\"doctor/progress\",\"params\":{\"message\":\"scanning\"}}");
        match message {
            InboundMessage::Notification(notification) => {
                assert_eq!(notification.method, methods::DOCTOR_PROGRESS);
                assert_eq!(notification.params.unwrap()["message"], "scanning");
            }
            other => panic!("expected notification, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_inbound_flags_garbage() {
        assert!(matches!(
            parse_inbound("not json at all"),
            InboundMessage::Unknown(_)
        ));
        assert!(matches!(parse_inbound("[1,2,3]"), InboundMessage::Unknown(_)));
    }

    #[test]
    fn test_expensive_methods_get_extended_timeout() {
        assert_eq!(request_timeout(methods::SCAN_EXTRACT), EXPENSIVE_REQUEST_TIMEOUT);
        assert_eq!(
            request_timeout(methods::DOCTOR_DIAGNOSE),
            EXPENSIVE_REQUEST_TIMEOUT
        );
        assert_eq!(
            request_timeout(methods::HARDCODED_EXTRACT),
            EXPENSIVE_REQUEST_TIMEOUT
        );
        assert_eq!(request_timeout(methods::INITIALIZE), DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(
            request_timeout(methods::RESOURCE_BUILD_INDEX),
            DEFAULT_REQUEST_TIMEOUT
        );
    }

    #[test]
    fn test_worker_error_surfaces_message_verbatim() {
        let error = WorkerError::Worker("parse failed in components/App.tsx".to_string());
        assert_eq!(error.to_string(), "parse failed in components/App.tsx");
    }

    #[test]
    fn test_retryable_exit_requires_clean_code() {
        assert!(WorkerError::ProcessExited { code: Some(0) }.is_retryable_exit());
        assert!(!WorkerError::ProcessExited { code: Some(1) }.is_retryable_exit());
        assert!(!WorkerError::ProcessExited { code: None }.is_retryable_exit());
        assert!(!WorkerError::NotRunning.is_retryable_exit());
    }
}
