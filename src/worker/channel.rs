//! Request/response correlation over a line transport
//!
//! One dispatch task owns the transport: it writes queued outbound lines and
//! classifies inbound lines into responses (matched against the pending
//! table by id) and notifications (fanned out to per-method handlers in
//! registration order). Timed-out requests leave the pending table, so a
//! late response for that id is logged and dropped.

use crate::io::transport::Transport;
use crate::worker::protocol::{
    parse_inbound, request_timeout, InboundMessage, WorkerError, WorkerNotification, WorkerRequest,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, trace};

/// Completion slot for one in-flight request
type PendingSender = oneshot::Sender<Result<Value, WorkerError>>;

/// Receiver half handed to the caller awaiting a response
pub type ResponseReceiver = oneshot::Receiver<Result<Value, WorkerError>>;

/// Handler invoked for every notification of one method
pub type NotificationHandler = Arc<dyn Fn(WorkerNotification) + Send + Sync>;

/// Work items for the dispatch task's outbound lane. FIFO order means a
/// `Flush` acknowledgement proves every line queued before it went through
/// the transport.
enum Outbound {
    /// Serialized request or notification line
    Line(String),

    /// Acknowledge once the preceding lines are flushed
    Flush(oneshot::Sender<()>),
}

/// Protocol engine with request/response correlation
pub struct RpcChannel<T: Transport> {
    /// Channel for sending outbound work (requests, notifications, flushes)
    outbound_sender: mpsc::UnboundedSender<Outbound>,

    /// Request id counter, shared with the owning client so ids stay
    /// monotonic across worker restarts
    next_id: Arc<AtomicU64>,

    /// Pending requests waiting for responses
    pending: Arc<Mutex<HashMap<u64, PendingSender>>>,

    /// Notification handlers per method, fired in registration order
    handlers: Arc<Mutex<HashMap<String, Vec<NotificationHandler>>>>,

    /// Type parameter marker
    _phantom: std::marker::PhantomData<T>,
}

impl<T: Transport + 'static> RpcChannel<T> {
    /// Create a channel and spawn its dispatch task over `transport`
    pub fn new(transport: T, next_id: Arc<AtomicU64>) -> Self {
        let transport_arc = Arc::new(Mutex::new(transport));
        let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<Outbound>();
        let pending: Arc<Mutex<HashMap<u64, PendingSender>>> = Arc::new(Mutex::new(HashMap::new()));
        let handlers: Arc<Mutex<HashMap<String, Vec<NotificationHandler>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let transport_clone = Arc::clone(&transport_arc);
        let pending_clone = Arc::clone(&pending);
        let handlers_clone = Arc::clone(&handlers);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    // Outbound work (prioritized)
                    Some(item) = outbound_receiver.recv() => {
                        let mut transport = transport_clone.lock().await;
                        match item {
                            Outbound::Line(line) => {
                                if let Err(e) = transport.send(&line).await {
                                    error!("Failed to send line to worker: {}", e);
                                    break;
                                }
                            }
                            Outbound::Flush(ack) => {
                                if let Err(e) = transport.flush().await {
                                    error!("Failed to flush worker transport: {}", e);
                                    break;
                                }
                                let _ = ack.send(());
                            }
                        }
                        drop(transport);
                    }
                    // Inbound lines
                    result = async {
                        let mut transport = transport_clone.lock().await;
                        transport.receive().await
                    } => {
                        match result {
                            Ok(line) => {
                                Self::process_inbound(line, &pending_clone, &handlers_clone).await;
                            }
                            Err(e) => {
                                debug!("Worker transport closed: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
            trace!("RpcChannel: dispatch task finished");
        });

        Self {
            outbound_sender,
            next_id,
            pending,
            handlers,
            _phantom: std::marker::PhantomData,
        }
    }

    /// Classify one inbound line and route it
    async fn process_inbound(
        line: String,
        pending: &Arc<Mutex<HashMap<u64, PendingSender>>>,
        handlers: &Arc<Mutex<HashMap<String, Vec<NotificationHandler>>>>,
    ) {
        trace!("RpcChannel: Received line: {}", line);

        match parse_inbound(&line) {
            InboundMessage::Response(response) => {
                let mut pending = pending.lock().await;
                match pending.remove(&response.id) {
                    Some(sender) => {
                        let outcome = match response.error {
                            Some(error) => Err(WorkerError::Worker(error.message)),
                            None => response.result.ok_or(WorkerError::MissingResult),
                        };
                        if sender.send(outcome).is_err() {
                            debug!("Response receiver dropped for request {}", response.id);
                        }
                    }
                    None => {
                        debug!("Received response for unknown request {}", response.id);
                    }
                }
            }
            InboundMessage::Notification(notification) => {
                let handlers = handlers.lock().await;
                match handlers.get(&notification.method) {
                    Some(list) => {
                        for handler in list {
                            handler(notification.clone());
                        }
                    }
                    None => {
                        debug!(
                            "No handler registered for notification '{}'",
                            notification.method
                        );
                    }
                }
            }
            InboundMessage::Unknown(line) => {
                debug!("Received unparseable line: {}", line);
            }
        }
    }

    /// Assign an id, register the pending completion, and queue the request
    /// line. Returns the id and the receiver to await the response on.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(u64, ResponseReceiver), WorkerError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        // Serialize before touching the pending table so an early failure
        // leaves nothing behind to leak.
        let request = WorkerRequest::new(id, method, params);
        let line = serde_json::to_string(&request).map_err(WorkerError::Serialization)?;
        debug!("RpcChannel: Sending request: {}", line);

        let (sender, receiver) = oneshot::channel();
        self.pending.lock().await.insert(id, sender);

        if self.outbound_sender.send(Outbound::Line(line)).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(WorkerError::Transport("Outbound channel closed".to_string()));
        }

        Ok((id, receiver))
    }

    /// Wait for the response to `id` within `timeout`. On timeout the
    /// pending entry is removed so a later response for this id is ignored.
    pub async fn await_response(
        &self,
        id: u64,
        receiver: ResponseReceiver,
        method: &str,
        timeout: Duration,
    ) -> Result<Value, WorkerError> {
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&id);
                Err(WorkerError::Transport("Response channel closed".to_string()))
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                debug!("Request {} ('{}') timed out after {:?}", id, method, timeout);
                Err(WorkerError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Send a request and wait with the per-method timeout
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, WorkerError> {
        self.request_with_timeout(method, params, request_timeout(method))
            .await
    }

    /// Send a request and wait with an explicit timeout
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, WorkerError> {
        let (id, receiver) = self.send_request(method, params).await?;
        self.await_response(id, receiver, method, timeout).await
    }

    /// Send a notification (no id, no response)
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), WorkerError> {
        let notification = WorkerNotification {
            method: method.to_string(),
            params,
        };
        let line = serde_json::to_string(&notification).map_err(WorkerError::Serialization)?;
        debug!("RpcChannel: Sending notification: {}", line);

        self.outbound_sender
            .send(Outbound::Line(line))
            .map_err(|_| WorkerError::Transport("Outbound channel closed".to_string()))?;

        Ok(())
    }

    /// Wait until every line queued so far has been written to the
    /// transport. Errors if the dispatch task or the transport has already
    /// gone away, in which case delivery cannot be confirmed.
    pub async fn flush(&self) -> Result<(), WorkerError> {
        let (ack, acked) = oneshot::channel();
        self.outbound_sender
            .send(Outbound::Flush(ack))
            .map_err(|_| WorkerError::Transport("Outbound channel closed".to_string()))?;

        acked
            .await
            .map_err(|_| WorkerError::Transport("Dispatch task exited before flush".to_string()))
    }

    /// Register a handler for one notification method. Handlers for the
    /// same method fire in the order they were registered.
    pub async fn on_notification<F>(&self, method: &str, handler: F)
    where
        F: Fn(WorkerNotification) + Send + Sync + 'static,
    {
        self.add_notification_handler(method, Arc::new(handler)).await;
    }

    pub async fn add_notification_handler(&self, method: &str, handler: NotificationHandler) {
        self.handlers
            .lock()
            .await
            .entry(method.to_string())
            .or_default()
            .push(handler);
    }

    /// Fail every pending request with the worker's exit code
    pub async fn fail_all_pending(&self, exit_code: Option<i32>) {
        let mut pending = self.pending.lock().await;
        if pending.is_empty() {
            return;
        }
        debug!(
            "RpcChannel: failing {} pending request(s) after worker exit (code {:?})",
            pending.len(),
            exit_code
        );
        for (id, sender) in pending.drain() {
            trace!("RpcChannel: failing pending request {}", id);
            let _ = sender.send(Err(WorkerError::ProcessExited { code: exit_code }));
        }
    }

    /// Check if the dispatch task is still consuming outbound lines
    pub fn is_connected(&self) -> bool {
        !self.outbound_sender.is_closed()
    }
}

// ============================================================================
// Tests
// ============================================================================
