//! Engine service owning every project's index
//!
//! One engine instance maps stable project keys to cached indexes. A cached
//! index is served as-is while fresh, revalidated against file mtimes once
//! it ages past the revalidation window, patched incrementally when changes
//! can be attributed to files, and rebuilt when they cannot. Watcher events
//! funnel through a single channel pump so the index is only ever mutated
//! from the owning caller.

// Library surface for embedding; the CLI only exercises part of it.
#![allow(dead_code)]

use crate::resource::builder::file_mtime_nanos;
use crate::resource::{apply_changes, build_index, resolve_roots, ResourceIndex, Root};
use crate::watch::{
    watch_signature, ChangeEvent, ChangeHandler, WatchConfig, WatchMode, WatcherRegistry,
};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How long a validated index is served without re-statting its files
pub const DEFAULT_REVALIDATE_AFTER: Duration = Duration::from_secs(2);

/// Errors from engine-level project management
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no resource roots found under {start_dir:?}")]
    NoRoots { start_dir: PathBuf },

    #[error("unknown project {key}")]
    UnknownProject { key: ProjectKey },
}

// ============================================================================
// Project Keys
// ============================================================================

/// Stable identifier for one starting directory
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectKey(String);

impl ProjectKey {
    /// Derive the key from a directory path. Canonicalization makes the key
    /// stable across differently-spelled paths to the same directory; a path
    /// that cannot be canonicalized (not yet created, permission) is hashed
    /// as spelled.
    pub fn for_dir(start_dir: &Path) -> Self {
        let canonical = start_dir
            .canonicalize()
            .unwrap_or_else(|_| start_dir.to_path_buf());
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string_lossy().as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Everything the engine tracks for one project
struct ProjectState {
    start_dir: PathBuf,
    roots: Vec<Root>,
    index: ResourceIndex,
}

/// Owner of all project indexes and their watches
pub struct ResourceEngine {
    projects: HashMap<ProjectKey, ProjectState>,
    watchers: WatcherRegistry,
    revalidate_after: Duration,
    change_sender: mpsc::UnboundedSender<(ProjectKey, ChangeEvent)>,
    change_receiver: mpsc::UnboundedReceiver<(ProjectKey, ChangeEvent)>,
}

impl ResourceEngine {
    pub fn new() -> Self {
        let (change_sender, change_receiver) = mpsc::unbounded_channel();
        Self {
            projects: HashMap::new(),
            watchers: WatcherRegistry::new(),
            revalidate_after: DEFAULT_REVALIDATE_AFTER,
            change_sender,
            change_receiver,
        }
    }

    /// Override the revalidation window
    pub fn with_revalidate_after(mut self, revalidate_after: Duration) -> Self {
        self.revalidate_after = revalidate_after;
        self
    }

    /// Discover roots under `start_dir` and build its index on first call;
    /// later calls with the same directory return the existing key.
    pub async fn resolve_project(&mut self, start_dir: &Path) -> Result<ProjectKey, EngineError> {
        let key = ProjectKey::for_dir(start_dir);
        if self.projects.contains_key(&key) {
            return Ok(key);
        }

        let roots = resolve_roots(start_dir);
        if roots.is_empty() {
            return Err(EngineError::NoRoots {
                start_dir: start_dir.to_path_buf(),
            });
        }

        info!(
            roots = roots.len(),
            start_dir = %start_dir.display(),
            "resolved resource project"
        );
        let index = build_index(&roots).await;
        self.projects.insert(
            key.clone(),
            ProjectState {
                start_dir: start_dir.to_path_buf(),
                roots,
                index,
            },
        );
        Ok(key)
    }

    pub fn roots(&self, key: &ProjectKey) -> Result<&[Root], EngineError> {
        Ok(&self.project(key)?.roots)
    }

    pub fn start_dir(&self, key: &ProjectKey) -> Result<&Path, EngineError> {
        Ok(&self.project(key)?.start_dir)
    }

    /// The project's current index: cached while fresh, revalidated against
    /// file mtimes once stale, rebuilt when marked dirty or when a detected
    /// change cannot be applied in place.
    pub async fn index(&mut self, key: &ProjectKey) -> Result<&ResourceIndex, EngineError> {
        let revalidate_after = self.revalidate_after;
        {
            let state = self.project_mut(key)?;
            if state.index.is_dirty() {
                debug!(key = %key, "index dirty, rebuilding");
                state.index = build_index(&state.roots).await;
            } else {
                let age = Utc::now().signed_duration_since(state.index.checked_at());
                let is_stale = age.to_std().map_or(true, |age| age >= revalidate_after);
                if is_stale {
                    let changed = stale_files(&state.index);
                    if changed.is_empty() {
                        state.index.touch_checked_at();
                    } else {
                        debug!(
                            key = %key,
                            files = changed.len(),
                            "revalidation found changed files"
                        );
                        let outcome = apply_changes(&mut state.index, &state.roots, &changed);
                        if outcome.needs_full_rebuild {
                            state.index = build_index(&state.roots).await;
                        }
                    }
                }
            }
        }
        Ok(&self.project(key)?.index)
    }

    /// Force the next `index` call to rebuild from scratch
    pub fn invalidate(&mut self, key: &ProjectKey) -> Result<(), EngineError> {
        self.project_mut(key)?.index.mark_dirty();
        Ok(())
    }

    // ========================================================================
    // Watching
    // ========================================================================

    /// Watch the project's roots, feeding debounced events into the change
    /// pump. Repeated calls share one underlying watch; if the root set has
    /// changed since the watch was installed, the watch is replaced in place
    /// and its existing holders carry over without taking a new reference.
    pub fn watch_project(&mut self, key: &ProjectKey) -> Result<WatchMode, EngineError> {
        let state = self.project(key)?;
        let paths: Vec<PathBuf> = state.roots.iter().map(|root| root.path.clone()).collect();
        let signature = watch_signature(&paths);
        let watch_key = key.as_str();

        let sender = self.change_sender.clone();
        let project = key.clone();
        let handler: ChangeHandler = Arc::new(move |event| {
            let _ = sender.send((project.clone(), event));
        });

        let stale = self
            .watchers
            .signature(watch_key)
            .map_or(false, |active| active != signature);
        let mode = if stale {
            warn!(key = %key, "resource roots changed under an active watch, replacing it");
            self.watchers
                .replace(watch_key, WatchConfig::new(paths), handler)
        } else {
            self.watchers
                .start(watch_key, WatchConfig::new(paths), handler)
        };
        self.watchers.set_signature(watch_key, signature);
        Ok(mode)
    }

    /// Release one reference to the project's watch
    pub fn stop_watching(&mut self, key: &ProjectKey) {
        self.watchers.stop(key.as_str());
    }

    pub fn is_watching(&self, key: &ProjectKey) -> bool {
        self.watchers.is_watching(key.as_str())
    }

    // ========================================================================
    // Change Pump
    // ========================================================================

    /// Next debounced change event from any watched project
    pub async fn next_change(&mut self) -> Option<(ProjectKey, ChangeEvent)> {
        self.change_receiver.recv().await
    }

    /// Fold one change event into the project's index. Attributable paths
    /// are applied incrementally; anything else marks the index dirty so the
    /// next `index` call rebuilds it.
    pub fn handle_change(&mut self, key: &ProjectKey, event: &ChangeEvent) -> Result<(), EngineError> {
        let state = self.project_mut(key)?;

        if event.needs_rebuild || event.paths.is_empty() {
            debug!(key = %key, "change event forces a rebuild");
            state.index.mark_dirty();
            return Ok(());
        }

        let outcome = apply_changes(&mut state.index, &state.roots, &event.paths);
        if outcome.needs_full_rebuild {
            debug!(key = %key, "change event could not be applied in place");
        }
        Ok(())
    }

    fn project(&self, key: &ProjectKey) -> Result<&ProjectState, EngineError> {
        self.projects.get(key).ok_or_else(|| EngineError::UnknownProject {
            key: key.clone(),
        })
    }

    fn project_mut(&mut self, key: &ProjectKey) -> Result<&mut ProjectState, EngineError> {
        self.projects.get_mut(key).ok_or_else(|| EngineError::UnknownProject {
            key: key.clone(),
        })
    }
}

impl Default for ResourceEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Recorded files whose on-disk mtime no longer matches the index. A file
/// that vanished counts as changed; retraction happens during apply.
fn stale_files(index: &ResourceIndex) -> Vec<PathBuf> {
    index
        .files()
        .iter()
        .filter(|(path, recorded)| file_mtime_nanos(path) != Some(**recorded))
        .map(|(path, _)| path.clone())
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::integration::TestProject;
    use tempfile::TempDir;

    // Auto-initialize logging for all tests in this module
    #[cfg(feature = "test-logging")]
    #[ctor::ctor]
    fn init_test_logging() {
        crate::test_utils::logging::init();
    }

    fn winner_value(index: &ResourceIndex, language: &str, key: &str) -> Option<String> {
        index.winner(language, key).map(|entry| entry.value.clone())
    }

    #[test]
    fn test_project_key_is_stable() {
        let dir = TempDir::new().unwrap();
        let first = ProjectKey::for_dir(dir.path());
        let second = ProjectKey::for_dir(dir.path());
        assert_eq!(first, second);

        let other = TempDir::new().unwrap();
        assert_ne!(first, ProjectKey::for_dir(other.path()));

        // 64 hex chars of sha-256
        assert_eq!(first.as_str().len(), 64);
    }

    #[tokio::test]
    async fn test_resolve_project_builds_index() {
        let project = TestProject::with_default_locales().unwrap();
        let mut engine = ResourceEngine::new();

        let key = engine.resolve_project(project.path()).await.unwrap();
        let index = engine.index(&key).await.unwrap();
        assert_eq!(
            winner_value(index, "en", "common:title"),
            Some("Hello".to_string())
        );
        assert!(index.languages().contains("ja"));

        // Resolving again returns the same key without rediscovery
        let again = engine.resolve_project(project.path()).await.unwrap();
        assert_eq!(key, again);
    }

    #[tokio::test]
    async fn test_resolve_project_without_roots_fails() {
        let dir = TempDir::new().unwrap();
        let mut engine = ResourceEngine::new();
        let err = engine.resolve_project(dir.path()).await.unwrap_err();
        assert!(matches!(err, EngineError::NoRoots { .. }));
    }

    #[tokio::test]
    async fn test_fresh_index_skips_revalidation() {
        let project = TestProject::with_default_locales().unwrap();
        let mut engine = ResourceEngine::new();
        let key = engine.resolve_project(project.path()).await.unwrap();
        engine.index(&key).await.unwrap();

        // The on-disk change is invisible while the index is inside its
        // revalidation window.
        project
            .write_resource("locales/en/common.json", r#"{"title": "Changed"}"#)
            .unwrap();
        let index = engine.index(&key).await.unwrap();
        assert_eq!(
            winner_value(index, "en", "common:title"),
            Some("Hello".to_string())
        );
    }

    #[tokio::test]
    async fn test_stale_index_revalidates_changed_file() {
        let project = TestProject::with_default_locales().unwrap();
        let mut engine = ResourceEngine::new().with_revalidate_after(Duration::ZERO);
        let key = engine.resolve_project(project.path()).await.unwrap();
        engine.index(&key).await.unwrap();

        // Filesystem mtime granularity can be coarse
        tokio::time::sleep(Duration::from_millis(50)).await;
        project
            .write_resource(
                "locales/en/common.json",
                r#"{"title": "Changed", "extra": "New"}"#,
            )
            .unwrap();

        let index = engine.index(&key).await.unwrap();
        assert_eq!(
            winner_value(index, "en", "common:title"),
            Some("Changed".to_string())
        );
        assert_eq!(
            winner_value(index, "en", "common:extra"),
            Some("New".to_string())
        );
        assert_eq!(
            winner_value(index, "ja", "common:title"),
            Some("こんにちは".to_string())
        );
    }

    #[tokio::test]
    async fn test_deleting_last_file_of_language_removes_it() {
        let project = TestProject::with_default_locales().unwrap();
        let mut engine = ResourceEngine::new().with_revalidate_after(Duration::ZERO);
        let key = engine.resolve_project(project.path()).await.unwrap();
        assert!(engine.index(&key).await.unwrap().languages().contains("ja"));

        project.delete_resource("locales/ja/common.json").unwrap();
        let index = engine.index(&key).await.unwrap();
        assert!(!index.languages().contains("ja"));
        assert_eq!(
            winner_value(index, "en", "common:title"),
            Some("Hello".to_string())
        );
    }

    #[tokio::test]
    async fn test_rebuild_event_picks_up_new_language() {
        let project = TestProject::with_default_locales().unwrap();
        let mut engine = ResourceEngine::new();
        let key = engine.resolve_project(project.path()).await.unwrap();
        assert!(!engine.index(&key).await.unwrap().languages().contains("de"));

        project
            .write_resource("locales/de/common.json", r#"{"title": "Hallo"}"#)
            .unwrap();
        let event = ChangeEvent {
            paths: vec![],
            needs_rebuild: true,
        };
        engine.handle_change(&key, &event).unwrap();

        let index = engine.index(&key).await.unwrap();
        assert_eq!(
            winner_value(index, "de", "common:title"),
            Some("Hallo".to_string())
        );
    }

    #[tokio::test]
    async fn test_path_event_applies_in_place() {
        let project = TestProject::with_default_locales().unwrap();
        let mut engine = ResourceEngine::new();
        let key = engine.resolve_project(project.path()).await.unwrap();
        engine.index(&key).await.unwrap();

        let changed = project
            .write_resource(
                "locales/en/common.json",
                r#"{"title": "Hello", "body": "Text"}"#,
            )
            .unwrap();
        let event = ChangeEvent {
            paths: vec![changed],
            needs_rebuild: false,
        };
        engine.handle_change(&key, &event).unwrap();

        // Applied eagerly, visible even inside the revalidation window
        let index = engine.index(&key).await.unwrap();
        assert_eq!(
            winner_value(index, "en", "common:body"),
            Some("Text".to_string())
        );
    }

    #[tokio::test]
    async fn test_invalidate_forces_rebuild() {
        let project = TestProject::with_default_locales().unwrap();
        let mut engine = ResourceEngine::new();
        let key = engine.resolve_project(project.path()).await.unwrap();
        engine.index(&key).await.unwrap();

        project
            .write_resource("locales/en/extra.json", r#"{"k": "V"}"#)
            .unwrap();
        engine.invalidate(&key).unwrap();

        let index = engine.index(&key).await.unwrap();
        assert_eq!(
            winner_value(index, "en", "extra:k"),
            Some("V".to_string())
        );
        assert!(!index.is_dirty());
    }

    #[tokio::test]
    async fn test_unknown_project_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut engine = ResourceEngine::new();
        let key = ProjectKey::for_dir(dir.path());
        let err = engine.index(&key).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownProject { .. }));
    }

    #[tokio::test]
    async fn test_watch_is_shared_and_signed() {
        let project = TestProject::with_default_locales().unwrap();
        let mut engine = ResourceEngine::new();
        let key = engine.resolve_project(project.path()).await.unwrap();

        engine.watch_project(&key).unwrap();
        engine.watch_project(&key).unwrap();
        assert!(engine.is_watching(&key));

        engine.stop_watching(&key);
        assert!(engine.is_watching(&key), "first stop only drops one reference");
        engine.stop_watching(&key);
        assert!(!engine.is_watching(&key));
    }

    #[tokio::test]
    async fn test_root_change_replaces_shared_watch() {
        let project = TestProject::with_default_locales().unwrap();
        let mut engine = ResourceEngine::new();
        let key = engine.resolve_project(project.path()).await.unwrap();

        engine.watch_project(&key).unwrap();
        engine.watch_project(&key).unwrap();

        // A messages/ tree appears and a fresh root resolution picks it up,
        // so the active watch no longer covers the project's roots.
        let messages = project.path().join("messages");
        std::fs::create_dir_all(&messages).unwrap();
        std::fs::write(messages.join("en.json"), r#"{"common": {"title": "Hi"}}"#).unwrap();
        engine.projects.get_mut(&key).unwrap().roots = resolve_roots(project.path());

        engine.watch_project(&key).unwrap();
        assert!(engine.is_watching(&key));

        // The recorded signature matches the watch that is actually running.
        let new_paths: Vec<PathBuf> = engine.projects[&key]
            .roots
            .iter()
            .map(|root| root.path.clone())
            .collect();
        assert_eq!(
            engine.watchers.signature(key.as_str()),
            Some(watch_signature(&new_paths).as_str())
        );

        // Let the replacement watch settle before mutating the new root.
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(messages.join("en.json"), r#"{"common": {"title": "Hello"}}"#).unwrap();

        let (event_key, event) =
            tokio::time::timeout(Duration::from_secs(10), engine.next_change())
                .await
                .expect("no change event for the replaced roots")
                .expect("change pump closed");
        assert_eq!(event_key, key);
        assert!(
            event.needs_rebuild || event.paths.iter().any(|p| p.ends_with("en.json")),
            "event did not reference the new root: {event:?}"
        );

        // Both holders carried over to the replacement watch.
        engine.stop_watching(&key);
        assert!(engine.is_watching(&key), "first stop only drops one reference");
        engine.stop_watching(&key);
        assert!(!engine.is_watching(&key));
    }

    #[tokio::test]
    async fn test_watched_change_flows_through_pump() {
        let project = TestProject::with_default_locales().unwrap();
        let mut engine = ResourceEngine::new();
        let key = engine.resolve_project(project.path()).await.unwrap();
        engine.index(&key).await.unwrap();
        engine.watch_project(&key).unwrap();

        // Let the watch settle before mutating the tree
        tokio::time::sleep(Duration::from_millis(200)).await;
        project
            .write_resource("locales/en/common.json", r#"{"title": "Watched"}"#)
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let current = winner_value(
                engine.index(&key).await.unwrap(),
                "en",
                "common:title",
            );
            if current.as_deref() == Some("Watched") {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "watched change never reached the index"
            );
            if let Ok(Some((event_key, event))) =
                tokio::time::timeout(Duration::from_millis(500), engine.next_change()).await
            {
                engine.handle_change(&event_key, &event).unwrap();
            }
        }

        engine.stop_watching(&key);
    }
}
