//! Worker process client
//!
//! Owns the worker child process and the RPC channel over its stdio.
//! Lifecycle is Stopped -> Starting -> Running -> Stopping -> Stopped;
//! requests are only accepted while Running. A clean worker exit
//! (code 0) during a request triggers a bounded restart-and-resend,
//! any other exit fails the request as-is.

use crate::io::process::{
    ChildProcessManager, ProcessExitEvent, ProcessExitHandler, ProcessManager, StderrMonitor,
    StopMode,
};
use crate::io::transport::StdioTransport;
use crate::worker::channel::{NotificationHandler, ResponseReceiver, RpcChannel};
use crate::worker::protocol::{methods, request_timeout, WorkerError, WorkerNotification};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Grace period for each shutdown phase: the voluntary-exit window after
/// the shutdown notification, and again between SIGTERM and SIGKILL
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Restart attempts after a clean worker exit mid-request
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Shared handle to the live RPC channel, swapped on restart
type SharedChannel = Arc<Mutex<Option<Arc<RpcChannel<StdioTransport>>>>>;

// ============================================================================
// Client State
// ============================================================================

/// Client lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No worker process
    Stopped,
    /// Process spawned, channel being wired up
    Starting,
    /// Accepting requests
    Running,
    /// Shutdown requested, waiting for the process to exit
    Stopping,
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the worker client
#[derive(Debug, Clone)]
pub struct WorkerClientConfig {
    /// Path or name of the worker executable
    pub worker_path: PathBuf,

    /// Arguments passed to the worker
    pub args: Vec<String>,

    /// Working directory for the worker process
    pub working_dir: Option<PathBuf>,

    /// How long to wait after SIGTERM before escalating to SIGKILL
    pub shutdown_grace: Duration,

    /// Restart attempts after a clean exit mid-request
    pub max_retries: u32,

    /// Whether to send the initialize handshake on start
    pub send_initialize: bool,
}

impl WorkerClientConfig {
    pub fn new(worker_path: impl Into<PathBuf>) -> Self {
        Self {
            worker_path: worker_path.into(),
            args: Vec::new(),
            working_dir: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            max_retries: DEFAULT_MAX_RETRIES,
            send_initialize: true,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

// ============================================================================
// Exit Handler
// ============================================================================

/// Installed on each worker process; reacts to its exit from the wait task
struct ClientExitHandler {
    /// Which worker run this handler belongs to
    generation: u64,

    /// The client's current run; exit events from older runs are ignored
    current_generation: Arc<AtomicU64>,

    state: Arc<Mutex<ClientState>>,
    channel: SharedChannel,
    last_exit: Arc<Mutex<Option<ProcessExitEvent>>>,
    exit_notify: Arc<Notify>,
}

#[async_trait]
impl ProcessExitHandler for ClientExitHandler {
    async fn on_process_exit(&self, event: ProcessExitEvent) {
        if self.current_generation.load(Ordering::SeqCst) != self.generation {
            debug!("Ignoring exit event from a previous worker run");
            return;
        }

        info!("Worker exited with code {:?}", event.exit_code);

        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        *self.state.lock().unwrap() = ClientState::Stopped;
        *self.last_exit.lock().unwrap() = Some(event.clone());

        // Clone the Arc out so the std mutex is not held across the await
        let channel = self.channel.lock().unwrap().clone();
        if let Some(channel) = channel {
            channel.fail_all_pending(event.exit_code).await;
        }

        // Wake the escalation timer and any wait_for_stop() callers.
        // last_exit is published first so a timer racing this handler
        // sees the exit either way.
        self.exit_notify.notify_waiters();
    }
}

// ============================================================================
// Worker Client
// ============================================================================

/// Client for a worker subprocess speaking newline-delimited JSON-RPC
pub struct WorkerClient {
    config: WorkerClientConfig,

    state: Arc<Mutex<ClientState>>,

    /// Process manager for the current run, replaced on restart
    process: Option<ChildProcessManager>,

    /// RPC channel for the current run, replaced on restart
    channel: SharedChannel,

    /// Request id counter, shared across restarts so ids never repeat
    next_id: Arc<AtomicU64>,

    /// Bumped on every start; lets stale exit handlers detect they are old
    generation: Arc<AtomicU64>,

    /// Signaled by the exit handler when the current worker run ends
    exit_notify: Arc<Notify>,

    /// Exit event of the most recent worker run, if it has ended
    last_exit: Arc<Mutex<Option<ProcessExitEvent>>>,

    /// Handlers re-registered on the fresh channel after every (re)start
    notification_handlers: Vec<(String, NotificationHandler)>,
}

impl WorkerClient {
    pub fn new(config: WorkerClientConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(ClientState::Stopped)),
            process: None,
            channel: Arc::new(Mutex::new(None)),
            next_id: Arc::new(AtomicU64::new(1)),
            generation: Arc::new(AtomicU64::new(0)),
            exit_notify: Arc::new(Notify::new()),
            last_exit: Arc::new(Mutex::new(None)),
            notification_handlers: Vec::new(),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ClientState {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        *self.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ClientState::Running
    }

    /// Exit event of the most recent worker run, if it has ended
    pub fn last_exit(&self) -> Option<ProcessExitEvent> {
        self.last_exit.lock().unwrap().clone()
    }

    /// Register a notification handler. Survives restarts; handlers for the
    /// same method fire in registration order.
    pub async fn on_notification<F>(&mut self, method: &str, handler: F)
    where
        F: Fn(WorkerNotification) + Send + Sync + 'static,
    {
        let handler: NotificationHandler = Arc::new(handler);
        self.notification_handlers
            .push((method.to_string(), handler.clone()));

        let channel = self.channel.lock().unwrap().clone();
        if let Some(channel) = channel {
            channel.add_notification_handler(method, handler).await;
        }
    }

    /// Spawn the worker and wire up the RPC channel
    pub async fn start(&mut self) -> Result<(), WorkerError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != ClientState::Stopped {
                return Err(WorkerError::AlreadyStarted);
            }
            *state = ClientState::Starting;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_exit.lock().unwrap() = None;

        let mut process = ChildProcessManager::new(
            self.config.worker_path.to_string_lossy().into_owned(),
            self.config.args.clone(),
            self.config.working_dir.clone(),
        );
        process.on_stderr_line(super::stderr::create_stderr_processor());
        process.set_exit_handler(Arc::new(ClientExitHandler {
            generation,
            current_generation: Arc::clone(&self.generation),
            state: Arc::clone(&self.state),
            channel: Arc::clone(&self.channel),
            last_exit: Arc::clone(&self.last_exit),
            exit_notify: Arc::clone(&self.exit_notify),
        }));

        if let Err(e) = process.start().await {
            *self.state.lock().unwrap() = ClientState::Stopped;
            return Err(e.into());
        }

        let transport = match process.create_stdio_transport() {
            Ok(transport) => transport,
            Err(e) => {
                *self.state.lock().unwrap() = ClientState::Stopped;
                return Err(e.into());
            }
        };

        let channel = Arc::new(RpcChannel::new(transport, Arc::clone(&self.next_id)));
        for (method, handler) in &self.notification_handlers {
            channel.add_notification_handler(method, handler.clone()).await;
        }
        *self.channel.lock().unwrap() = Some(Arc::clone(&channel));
        self.process = Some(process);
        *self.state.lock().unwrap() = ClientState::Running;
        info!("Worker client running: {:?}", self.config.worker_path);

        if self.config.send_initialize {
            // Fire-and-forget handshake: the response receiver is dropped,
            // so the reply is discarded on arrival. If the worker exits
            // instead, the exit handler fails the leaked pending entry.
            let params = json!({
                "client": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            });
            if let Err(e) = channel.send_request(methods::INITIALIZE, Some(params)).await {
                debug!("Failed to send initialize: {}", e);
            }
        }

        Ok(())
    }

    /// Request shutdown: polite shutdown notification flushed to the pipe,
    /// one grace period for a voluntary exit, then SIGTERM with a detached
    /// timer that escalates to SIGKILL after another grace period. Returns
    /// once signalling is handed off; use `wait_for_stop` to observe the
    /// exit.
    pub async fn stop(&mut self) -> Result<(), WorkerError> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                ClientState::Stopped | ClientState::Stopping => return Ok(()),
                ClientState::Starting | ClientState::Running => {
                    *state = ClientState::Stopping;
                }
            }
        }

        // The notification only queues the line; flushing confirms it was
        // written to the worker's stdin before any signal goes out.
        let channel = self.channel.lock().unwrap().clone();
        let mut delivered = false;
        if let Some(channel) = channel {
            if let Err(e) = channel.notify(methods::SHUTDOWN, None).await {
                debug!("Failed to send shutdown notification: {}", e);
            } else {
                match tokio::time::timeout(self.config.shutdown_grace, channel.flush()).await {
                    Ok(Ok(())) => delivered = true,
                    Ok(Err(e)) => debug!("Failed to flush shutdown notification: {}", e),
                    Err(_) => debug!("Flushing the shutdown notification timed out"),
                }
            }
        }

        let Some(mut process) = self.process.take() else {
            *self.state.lock().unwrap() = ClientState::Stopped;
            return Ok(());
        };

        if delivered {
            // Create the future before checking last_exit: notify_waiters
            // stores no permit, so the other order can miss the wakeup.
            let notified = self.exit_notify.notified();
            if self.last_exit.lock().unwrap().is_some() {
                return Ok(());
            }
            tokio::select! {
                _ = notified => {
                    debug!("Worker exited on the shutdown notification");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.shutdown_grace) => {
                    debug!("Worker ignored the shutdown notification, signalling");
                }
            }
        }

        let pid = process.get_state().pid();
        match process.stop(StopMode::Graceful).await {
            Ok(()) => {}
            Err(e) => {
                // Already gone; the exit handler has recorded the details
                debug!("Graceful stop skipped: {}", e);
                return Ok(());
            }
        }

        if let Some(pid) = pid {
            let exit_notify = Arc::clone(&self.exit_notify);
            let last_exit = Arc::clone(&self.last_exit);
            let grace = self.config.shutdown_grace;
            tokio::spawn(async move {
                // Create the future before checking last_exit: notify_waiters
                // stores no permit, so the other order can miss the wakeup.
                let notified = exit_notify.notified();
                if last_exit.lock().unwrap().is_some() {
                    return;
                }
                tokio::select! {
                    _ = notified => {
                        debug!("Worker {} exited within the grace period", pid);
                    }
                    _ = tokio::time::sleep(grace) => {
                        warn!(
                            "Worker {} did not exit within {:?} after SIGTERM, sending SIGKILL",
                            pid, grace
                        );
                        #[cfg(unix)]
                        unsafe {
                            libc::kill(pid as libc::pid_t, libc::SIGKILL);
                        }
                    }
                }
            });
        }

        Ok(())
    }

    /// Wait until the client reaches Stopped, up to `timeout`
    pub async fn wait_for_stop(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.state() == ClientState::Stopped {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Force back to Stopped and start a fresh worker
    pub async fn restart(&mut self) -> Result<(), WorkerError> {
        info!("Restarting worker");
        *self.state.lock().unwrap() = ClientState::Stopped;
        if let Some(mut process) = self.process.take() {
            // No-op when the wait task has already recorded the exit
            process.kill_sync();
        }
        *self.channel.lock().unwrap() = None;
        self.start().await
    }

    fn ensure_running(&self) -> Result<Arc<RpcChannel<StdioTransport>>, WorkerError> {
        if self.state() != ClientState::Running {
            return Err(WorkerError::NotRunning);
        }
        self.channel
            .lock()
            .unwrap()
            .clone()
            .ok_or(WorkerError::NotRunning)
    }

    /// One request attempt, no retry
    async fn request_once(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, WorkerError> {
        let channel = self.ensure_running()?;
        channel.request_with_timeout(method, params, timeout).await
    }

    async fn request_value_with_timeout(
        &mut self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, WorkerError> {
        let mut attempt = 0;
        loop {
            match self.request_once(method, params.clone(), timeout).await {
                Err(e) if e.is_retryable_exit() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        "Worker exited cleanly during '{}', restarting (attempt {}/{})",
                        method, attempt, self.config.max_retries
                    );
                    self.restart().await?;
                }
                other => return other,
            }
        }
    }

    /// Send a request with the per-method timeout, restarting and resending
    /// after a clean worker exit (bounded by `max_retries`)
    pub async fn request_value(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, WorkerError> {
        self.request_value_with_timeout(method, params, request_timeout(method))
            .await
    }

    /// Like `request_value` with an explicit timeout
    pub async fn request_with_timeout(
        &mut self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, WorkerError> {
        self.request_value_with_timeout(method, params, timeout).await
    }

    /// Send a request and deserialize the result
    pub async fn request<R: DeserializeOwned>(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> Result<R, WorkerError> {
        let value = self.request_value(method, params).await?;
        serde_json::from_value(value).map_err(WorkerError::Deserialization)
    }

    /// Send a notification to the worker
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), WorkerError> {
        let channel = self.ensure_running()?;
        channel.notify(method, params).await
    }

    /// Send a request the caller can cancel out-of-band. A fresh token path
    /// is injected into the params as `cancel_token_path`; the worker polls
    /// that path and abandons the operation once the file appears.
    pub async fn send_cancellable_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<PendingCall, WorkerError> {
        let channel = self.ensure_running()?;

        let token_path = std::env::temp_dir().join(format!(
            "i18n-cancel-{}.token",
            Uuid::new_v4().simple()
        ));

        let mut map = match params {
            None => Map::new(),
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(WorkerError::InvalidParams(format!(
                    "cancellable request params must be a JSON object, got {other}"
                )));
            }
        };
        map.insert(
            "cancel_token_path".to_string(),
            Value::String(token_path.to_string_lossy().into_owned()),
        );

        let (id, receiver) = channel.send_request(method, Some(Value::Object(map))).await?;

        Ok(PendingCall {
            id,
            method: method.to_string(),
            token_path,
            receiver,
            channel,
            timeout: request_timeout(method),
        })
    }
}

impl Drop for WorkerClient {
    fn drop(&mut self) {
        // The manager has no Drop of its own, so a still-live child must
        // be killed here
        if let Some(mut process) = self.process.take() {
            process.kill_sync();
        }
    }
}

// ============================================================================
// Cancellable Calls
// ============================================================================

/// An in-flight cancellable request
pub struct PendingCall {
    id: u64,
    method: String,
    token_path: PathBuf,
    receiver: ResponseReceiver,
    channel: Arc<RpcChannel<StdioTransport>>,
    timeout: Duration,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Path the worker polls for cancellation
    pub fn token_path(&self) -> &Path {
        &self.token_path
    }

    /// Detached handle that can cancel this call from another task
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token_path: self.token_path.clone(),
        }
    }

    /// Wait for the response. The token file, if the call was cancelled,
    /// is removed once the outcome is observed.
    pub async fn wait(self) -> Result<Value, WorkerError> {
        let outcome = self
            .channel
            .await_response(self.id, self.receiver, &self.method, self.timeout)
            .await;

        match tokio::fs::remove_file(&self.token_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(
                    "Failed to remove cancel token {:?}: {}",
                    self.token_path, e
                );
            }
        }

        outcome
    }
}

/// Cancels a pending call by creating its token file
#[derive(Clone)]
pub struct CancelHandle {
    token_path: PathBuf,
}

impl CancelHandle {
    pub async fn cancel(&self) -> Result<(), WorkerError> {
        debug!("Cancelling via token {:?}", self.token_path);
        tokio::fs::write(&self.token_path, b"")
            .await
            .map_err(|source| WorkerError::TokenFile {
                path: self.token_path.clone(),
                source,
            })
    }
}

// ============================================================================
// Tests
// ============================================================================
