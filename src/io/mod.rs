//! I/O layer - Generic abstractions for process management and transport
//!
//! This module provides the fundamental I/O abstractions the worker client is
//! built on, with no knowledge of the message format beyond line framing:
//!
//! - **Transport**: Bidirectional exchange of newline-delimited messages
//! - **Process**: External process lifecycle management with stdio integration

#![allow(dead_code)]

pub mod process;
pub mod transport;

// Re-export main types for convenience
pub use process::{
    ChildProcessManager, ProcessError, ProcessExitEvent, ProcessExitHandler, ProcessManager,
    ProcessState, StderrMonitor, StopMode,
};
pub use transport::{MockTransport, MockTransportHandle, StdioTransport, Transport};
