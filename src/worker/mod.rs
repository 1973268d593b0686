//! Worker subprocess integration
//!
//! The heavy analysis operations (scanning, extraction, diagnostics) run in
//! a separate worker process speaking newline-delimited JSON-RPC over stdio.
//! This module provides the protocol types, the request/response channel,
//! and the lifecycle-managing client.

// Library surface for embedding; the CLI only exercises part of it.
#![allow(dead_code)]

pub mod channel;
pub mod client;
pub mod protocol;
pub mod stderr;

pub use channel::{NotificationHandler, ResponseReceiver, RpcChannel};
pub use client::{
    CancelHandle, ClientState, PendingCall, WorkerClient, WorkerClientConfig,
    DEFAULT_MAX_RETRIES, DEFAULT_SHUTDOWN_GRACE,
};
pub use protocol::{
    methods, parse_inbound, request_timeout, InboundMessage, WorkerError, WorkerErrorObject,
    WorkerNotification, WorkerRequest, WorkerResponse, DEFAULT_REQUEST_TIMEOUT,
    EXPENSIVE_REQUEST_TIMEOUT,
};
pub use stderr::{create_stderr_processor, StderrClassifier, WorkerStderrClassifier};
