//! Reference-counted watch registry and event coalescing

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::poll;

// ============================================================================
// Constants
// ============================================================================

/// Quiet window for coalescing bursts of raw events
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Interval between snapshots when a watch runs in polling mode
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Capacity of the channel bridging the notify thread onto the runtime
const RAW_EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Public Types
// ============================================================================

/// One coalesced batch of filesystem changes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Union of the paths named by the underlying raw events
    pub paths: Vec<PathBuf>,
    /// Set when a change could not be attributed to specific paths
    pub needs_rebuild: bool,
}

/// Callback invoked once per coalesced batch
pub type ChangeHandler = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// How an active watch is implemented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    /// Native filesystem notifications
    Native,
    /// Periodic snapshot polling, used when native installation fails
    Polling,
}

/// Parameters for one watch
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub paths: Vec<PathBuf>,
    pub debounce: Duration,
    pub poll_interval: Duration,
}

impl WatchConfig {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            debounce: DEFAULT_DEBOUNCE,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Stable fingerprint of a watched root set: sha256 over the sorted paths.
/// Callers compare signatures to detect that an active watch already covers
/// the same directories.
pub fn watch_signature(paths: &[PathBuf]) -> String {
    let mut sorted: Vec<String> = paths
        .iter()
        .map(|path| path.to_string_lossy().into_owned())
        .collect();
    sorted.sort();
    let mut hasher = Sha256::new();
    for path in &sorted {
        hasher.update(path.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// Registry
// ============================================================================

struct WatchState {
    refcount: usize,
    mode: WatchMode,
    signature: Option<String>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns every active watch, keyed by the caller's logical key
pub struct WatcherRegistry {
    watches: HashMap<String, WatchState>,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self {
            watches: HashMap::new(),
        }
    }

    /// Start the watch registered under `key`, or join it if one is already
    /// active. Joining bumps the refcount and ignores the handler passed
    /// here. Falls back to polling when a native watcher cannot be
    /// installed, so this never fails.
    pub fn start(&mut self, key: &str, config: WatchConfig, handler: ChangeHandler) -> WatchMode {
        if let Some(state) = self.watches.get_mut(key) {
            state.refcount += 1;
            debug!(key, refcount = state.refcount, "joining existing watch");
            return state.mode;
        }

        let cancel = CancellationToken::new();
        let (mode, task) = match native_watch(key, &config, handler.clone(), cancel.clone()) {
            Ok(task) => (WatchMode::Native, task),
            Err(err) => {
                static DEGRADED: Once = Once::new();
                DEGRADED.call_once(|| {
                    warn!("native file watching unavailable, degrading to polling mode");
                });
                debug!(key, error = %err, "native watcher installation failed");
                let task = poll::spawn_polling(key, &config, handler, cancel.clone());
                (WatchMode::Polling, task)
            }
        };

        info!(key, ?mode, paths = config.paths.len(), "watch started");
        self.watches.insert(
            key.to_string(),
            WatchState {
                refcount: 1,
                mode,
                signature: None,
                cancel,
                task,
            },
        );
        mode
    }

    /// Drop one reference to the watch under `key`. The underlying watcher
    /// is torn down when the last reference stops; unknown keys are a no-op.
    pub fn stop(&mut self, key: &str) {
        let Some(state) = self.watches.get_mut(key) else {
            debug!(key, "stop for unknown watch ignored");
            return;
        };
        state.refcount -= 1;
        if state.refcount > 0 {
            debug!(key, refcount = state.refcount, "watch still referenced");
            return;
        }
        if let Some(state) = self.watches.remove(key) {
            state.cancel.cancel();
            state.task.abort();
            info!(key, "watch stopped");
        }
    }

    /// Tear down the watch under `key` regardless of its refcount and
    /// install a fresh one with `config` and `handler`. Existing holders
    /// keep their references, now against the new watch; its signature
    /// starts unset. Equivalent to `start` when the key is unknown.
    pub fn replace(&mut self, key: &str, config: WatchConfig, handler: ChangeHandler) -> WatchMode {
        let holders = match self.watches.remove(key) {
            Some(state) => {
                state.cancel.cancel();
                state.task.abort();
                info!(key, refcount = state.refcount, "watch torn down for replacement");
                state.refcount
            }
            None => 1,
        };

        let mode = self.start(key, config, handler);
        if let Some(state) = self.watches.get_mut(key) {
            state.refcount = holders;
        }
        mode
    }

    pub fn is_watching(&self, key: &str) -> bool {
        self.watches.contains_key(key)
    }

    /// Fingerprint recorded for the active watch under `key`
    pub fn signature(&self, key: &str) -> Option<&str> {
        self.watches
            .get(key)
            .and_then(|state| state.signature.as_deref())
    }

    pub fn set_signature(&mut self, key: &str, signature: impl Into<String>) {
        if let Some(state) = self.watches.get_mut(key) {
            state.signature = Some(signature.into());
        }
    }

    pub fn mode(&self, key: &str) -> Option<WatchMode> {
        self.watches.get(key).map(|state| state.mode)
    }
}

impl Default for WatcherRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WatcherRegistry {
    fn drop(&mut self) {
        for (key, state) in self.watches.drain() {
            state.cancel.cancel();
            state.task.abort();
            debug!(key = %key, "watch torn down on drop");
        }
    }
}

// ============================================================================
// Native Backend
// ============================================================================

/// One filtered raw event from the native watcher
#[derive(Debug)]
pub(super) struct RawChange {
    pub(super) paths: Vec<PathBuf>,
    pub(super) needs_rebuild: bool,
}

impl RawChange {
    fn from_event(event: Event) -> Option<Self> {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {
                let needs_rebuild = event.need_rescan() || event.paths.is_empty();
                Some(Self {
                    paths: event.paths,
                    needs_rebuild,
                })
            }
            _ if event.need_rescan() => Some(Self::rescan()),
            _ => None,
        }
    }

    fn rescan() -> Self {
        Self {
            paths: Vec::new(),
            needs_rebuild: true,
        }
    }
}

fn native_watch(
    key: &str,
    config: &WatchConfig,
    handler: ChangeHandler,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, notify::Error> {
    let (raw_tx, raw_rx) = mpsc::channel(RAW_EVENT_CHANNEL_CAPACITY);
    let mut watcher = RecommendedWatcher::new(
        move |result: Result<Event, notify::Error>| match result {
            Ok(event) => {
                if let Some(raw) = RawChange::from_event(event) {
                    let _ = raw_tx.blocking_send(raw);
                }
            }
            Err(err) => {
                warn!(error = %err, "file watcher error, forcing rescan");
                let _ = raw_tx.blocking_send(RawChange::rescan());
            }
        },
        notify::Config::default(),
    )?;

    for path in &config.paths {
        watcher.watch(path, RecursiveMode::Recursive)?;
        debug!(key, path = %path.display(), "watching directory");
    }

    let key = key.to_string();
    let debounce = config.debounce;
    Ok(tokio::spawn(async move {
        // The watcher stops delivering events when dropped; keep it alive
        // for the lifetime of this task.
        let _watcher = watcher;
        debounce_loop(&key, debounce, raw_rx, handler, cancel).await;
    }))
}

/// Coalesce raw events: the first event opens a window that extends while
/// further events keep arriving within `debounce` of the last one; the
/// handler fires once the stream goes quiet.
pub(super) async fn debounce_loop(
    key: &str,
    debounce: Duration,
    mut raw_rx: mpsc::Receiver<RawChange>,
    handler: ChangeHandler,
    cancel: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            _ = cancel.cancelled() => break,
            raw = raw_rx.recv() => match raw {
                Some(raw) => raw,
                None => break,
            },
        };

        let mut pending = ChangeEvent::default();
        merge_raw(&mut pending, first);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(debounce) => break,
                raw = raw_rx.recv() => match raw {
                    Some(raw) => merge_raw(&mut pending, raw),
                    None => break,
                },
            }
        }

        debug!(
            key,
            paths = pending.paths.len(),
            needs_rebuild = pending.needs_rebuild,
            "change batch ready"
        );
        handler(pending);
    }
    debug!(key, "watch task exiting");
}

fn merge_raw(pending: &mut ChangeEvent, raw: RawChange) {
    for path in raw.paths {
        if !pending.paths.contains(&path) {
            pending.paths.push(path);
        }
    }
    pending.needs_rebuild |= raw.needs_rebuild;
}

// ============================================================================
// Tests
// ============================================================================
