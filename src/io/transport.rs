//! Transport layer - Pure I/O abstraction for line-delimited message exchange
//!
//! One message per line on the wire. The stdio implementation pumps a child
//! process's pipes through background tasks and reassembles complete lines
//! from arbitrary read chunks; partial lines buffer until their terminator
//! arrives.

use async_trait::async_trait;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, trace};

// ============================================================================
// Constants
// ============================================================================

/// Size of the read buffer for stdout reading operations
const READ_BUFFER_SIZE: usize = 4096;

/// Default capacity for the line accumulation buffer
const LINE_BUFFER_CAPACITY: usize = 8192;

/// Core transport trait for bidirectional line exchange
#[async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send one message; the transport appends the line terminator
    async fn send(&mut self, message: &str) -> Result<(), Self::Error>;

    /// Receive the next complete line, terminator stripped
    async fn receive(&mut self) -> Result<String, Self::Error>;

    /// Resolve once every line accepted by earlier `send` calls has been
    /// handed to the underlying sink
    async fn flush(&mut self) -> Result<(), Self::Error>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), Self::Error>;

    /// Check if transport is still active
    fn is_connected(&self) -> bool;
}

// ============================================================================
// Stdio Transport Implementation
// ============================================================================

/// Error types for stdio transport
#[derive(Debug, thiserror::Error)]
pub enum StdioTransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport is disconnected")]
    Disconnected,

    #[error("Channel error: {0}")]
    Channel(String),
}

/// Work items for the stdin writer task. The channel is FIFO, so a `Flush`
/// acknowledgement proves every line queued before it reached the pipe.
#[derive(Debug)]
enum StdinCommand {
    /// Write this line to stdin
    Line(String),

    /// Acknowledge once the preceding lines are written
    Flush(oneshot::Sender<()>),
}

/// Transport over a child process's stdin/stdout streams
#[derive(Debug)]
pub struct StdioTransport {
    /// Channel for sending commands to the stdin writer
    stdin_sender: Option<mpsc::UnboundedSender<StdinCommand>>,

    /// Channel for receiving lines from stdout
    stdout_receiver: Option<mpsc::UnboundedReceiver<String>>,

    /// Connection status
    connected: bool,
}

/// Reassembles complete lines from arbitrary read chunks
struct LineReaderState {
    /// Bytes received but not yet terminated by a newline
    byte_buffer: Vec<u8>,
}

impl LineReaderState {
    fn new() -> Self {
        Self {
            byte_buffer: Vec::with_capacity(LINE_BUFFER_CAPACITY),
        }
    }

    fn add_bytes(&mut self, bytes: &[u8]) {
        self.byte_buffer.extend_from_slice(bytes);
    }

    /// Extract the next complete line. The terminator and any trailing
    /// carriage return are stripped; blank lines are skipped. Invalid UTF-8
    /// is replaced rather than dropped so one bad byte cannot desync the
    /// stream.
    fn next_line(&mut self) -> Option<String> {
        loop {
            let newline = self.byte_buffer.iter().position(|&b| b == b'\n')?;
            let mut line: Vec<u8> = self.byte_buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }
            return Some(String::from_utf8_lossy(&line).into_owned());
        }
    }

    /// Remaining unterminated bytes, delivered as a final line at EOF
    fn take_remainder(&mut self) -> Option<String> {
        if self.byte_buffer.is_empty() {
            return None;
        }
        let mut line = std::mem::take(&mut self.byte_buffer);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Shrink the buffer back down after an oversized line passed through
    fn compact(&mut self) {
        if self.byte_buffer.capacity() > LINE_BUFFER_CAPACITY * 2 {
            self.byte_buffer.shrink_to(LINE_BUFFER_CAPACITY);
        }
    }
}

impl StdioTransport {
    /// Create a new StdioTransport from child process streams
    pub fn new(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        let (stdin_sender, stdin_receiver) = mpsc::unbounded_channel();
        let (stdout_sender, stdout_receiver) = mpsc::unbounded_channel();

        tokio::spawn(Self::stdin_writer_task(stdin, stdin_receiver));
        tokio::spawn(Self::stdout_reader_task(stdout, stdout_sender));

        Self {
            stdin_sender: Some(stdin_sender),
            stdout_receiver: Some(stdout_receiver),
            connected: true,
        }
    }

    /// Background task that writes lines to stdin. Exiting on a write error
    /// drops the queued flush acknowledgements, which surfaces to waiters as
    /// a channel error.
    async fn stdin_writer_task(
        mut stdin: ChildStdin,
        mut receiver: mpsc::UnboundedReceiver<StdinCommand>,
    ) {
        while let Some(command) = receiver.recv().await {
            match command {
                StdinCommand::Line(line) => {
                    trace!("StdioTransport: Writing line (length: {})", line.len());

                    if let Err(e) = stdin.write_all(line.as_bytes()).await {
                        error!("Failed to write to stdin: {}", e);
                        break;
                    }

                    if let Err(e) = stdin.flush().await {
                        error!("Failed to flush stdin: {}", e);
                        break;
                    }
                }
                StdinCommand::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }

        trace!("StdioTransport: stdin writer task finished");
    }

    /// Background task that reads stdout and emits complete lines
    async fn stdout_reader_task(stdout: ChildStdout, sender: mpsc::UnboundedSender<String>) {
        let mut reader = BufReader::new(stdout);
        let mut state = LineReaderState::new();
        let mut read_buffer = Box::new([0u8; READ_BUFFER_SIZE]);

        loop {
            match reader.read(read_buffer.as_mut()).await {
                Ok(0) => {
                    trace!("StdioTransport: stdout reader reached EOF");
                    if let Some(final_line) = state.take_remainder() {
                        let _ = sender.send(final_line);
                    }
                    break;
                }
                Ok(n) => {
                    state.add_bytes(&read_buffer[..n]);

                    while let Some(line) = state.next_line() {
                        if sender.send(line).is_err() {
                            trace!("StdioTransport: stdout receiver dropped, stopping reader");
                            return;
                        }
                    }

                    state.compact();
                }
                Err(e) => {
                    error!("Failed to read from stdout: {}", e);
                    break;
                }
            }
        }

        trace!("StdioTransport: stdout reader task finished");
    }
}

#[async_trait]
impl Transport for StdioTransport {
    type Error = StdioTransportError;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(StdioTransportError::Disconnected);
        }

        let sender = self
            .stdin_sender
            .as_ref()
            .ok_or(StdioTransportError::Disconnected)?;

        sender
            .send(StdinCommand::Line(format!("{message}\n")))
            .map_err(|e| StdioTransportError::Channel(e.to_string()))?;

        Ok(())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(StdioTransportError::Disconnected);
        }

        let sender = self
            .stdin_sender
            .as_ref()
            .ok_or(StdioTransportError::Disconnected)?;

        let (ack, acked) = oneshot::channel();
        sender
            .send(StdinCommand::Flush(ack))
            .map_err(|e| StdioTransportError::Channel(e.to_string()))?;

        acked
            .await
            .map_err(|_| StdioTransportError::Channel("stdin writer exited".to_string()))
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        if !self.connected {
            return Err(StdioTransportError::Disconnected);
        }

        let receiver = self
            .stdout_receiver
            .as_mut()
            .ok_or(StdioTransportError::Disconnected)?;

        receiver
            .recv()
            .await
            .ok_or(StdioTransportError::Disconnected)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        self.stdin_sender.take();
        self.stdout_receiver.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Mock Transport Implementation
// ============================================================================

/// Error type for mock transport
#[derive(Debug, thiserror::Error)]
pub enum MockTransportError {
    #[error("Transport is disconnected")]
    Disconnected,

    #[error("Incoming line stream ended")]
    Closed,
}

/// Mock transport for testing. Records sent lines and yields scripted
/// incoming lines pushed through the paired [`MockTransportHandle`];
/// `receive` pends while no line is queued, mirroring a quiet worker.
pub struct MockTransport {
    /// Lines sent via this transport
    sent: Arc<Mutex<Vec<String>>>,

    /// Scripted incoming lines
    incoming: mpsc::UnboundedReceiver<String>,

    /// Connection status
    connected: bool,
}

/// Test-side handle for a [`MockTransport`]
#[derive(Clone)]
pub struct MockTransportHandle {
    tx: mpsc::UnboundedSender<String>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl MockTransport {
    /// Create a mock transport and its controlling handle
    pub fn new() -> (Self, MockTransportHandle) {
        let (tx, incoming) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                sent: sent.clone(),
                incoming,
                connected: true,
            },
            MockTransportHandle { tx, sent },
        )
    }

    /// Create a mock transport with lines already queued
    pub fn with_responses(responses: Vec<String>) -> (Self, MockTransportHandle) {
        let (transport, handle) = Self::new();
        for response in responses {
            handle.push_line(response);
        }
        (transport, handle)
    }
}

impl MockTransportHandle {
    /// Queue one incoming line for the transport to deliver
    pub fn push_line(&self, line: impl Into<String>) {
        let _ = self.tx.send(line.into());
    }

    /// Lines sent through the transport so far
    pub fn sent_lines(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockTransportError;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(MockTransportError::Disconnected);
        }

        self.sent.lock().unwrap().push(message.to_string());
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(MockTransportError::Disconnected);
        }

        // Sends record synchronously, so there is nothing in flight
        Ok(())
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        if !self.connected {
            return Err(MockTransportError::Disconnected);
        }

        self.incoming.recv().await.ok_or(MockTransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Tests
// ============================================================================
