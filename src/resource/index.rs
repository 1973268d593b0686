//! Merged translation resource index
//!
//! The index is the queryable product of scanning a project's resource roots.
//! For every (language, canonical key) pair it keeps the full candidate list
//! ordered by merge priority, plus a derived winning view holding the entry
//! that currently shadows the others. Keeping all candidates means a file
//! change can retract exactly that file's contribution and promote the next
//! candidate without rescanning anything else.
//!
//! Canonical keys have the form `namespace:dotted.key.path`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// One translation value as loaded from a specific file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub value: String,
    pub file: PathBuf,
    pub priority: u32,
}

/// A recorded per-file load failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    pub language: String,
    pub file: PathBuf,
    pub message: String,
}

/// Build a canonical key from a namespace and a flattened key path
pub fn canonical_key(namespace: &str, flat_key: &str) -> String {
    format!("{}:{}", namespace, flat_key)
}

/// Split a canonical key into (namespace, flattened key path)
pub fn split_canonical_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(':')
}

/// Index of all translation resources under a fixed set of roots
#[derive(Debug)]
pub struct ResourceIndex {
    /// language -> canonical key -> candidates ordered by ascending priority
    entries: HashMap<String, HashMap<String, Vec<ResourceEntry>>>,
    /// language -> canonical key -> head of the candidate list
    winning: HashMap<String, HashMap<String, ResourceEntry>>,
    /// file -> (language, key) pairs the file currently contributes
    file_pairs: HashMap<PathBuf, Vec<(String, String)>>,
    file_errors: HashMap<PathBuf, FileError>,
    /// file -> mtime in nanoseconds since the epoch
    files: HashMap<PathBuf, u64>,
    languages: BTreeSet<String>,
    namespaces: BTreeSet<String>,
    checked_at: DateTime<Utc>,
    dirty: bool,
}

impl ResourceIndex {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            winning: HashMap::new(),
            file_pairs: HashMap::new(),
            file_errors: HashMap::new(),
            files: HashMap::new(),
            languages: BTreeSet::new(),
            namespaces: BTreeSet::new(),
            checked_at: Utc::now(),
            dirty: false,
        }
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Add a candidate for a (language, key) pair.
    ///
    /// Candidates stay sorted by ascending priority; among equal priorities
    /// the earlier insertion stays in front, so loading order decides. The
    /// winning view is not touched here, callers recompute winners once all
    /// candidates for a change are in place.
    pub(crate) fn insert_candidate(&mut self, language: &str, key: &str, entry: ResourceEntry) {
        self.file_pairs
            .entry(entry.file.clone())
            .or_default()
            .push((language.to_string(), key.to_string()));

        let candidates = self
            .entries
            .entry(language.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default();
        let position = candidates.partition_point(|existing| existing.priority <= entry.priority);
        candidates.insert(position, entry);
    }

    /// Remove every trace of a file: its candidates, its recorded error and
    /// its mtime. Returns the (language, key) pairs that lost a candidate so
    /// the caller can recompute their winners.
    pub(crate) fn retract_file(&mut self, file: &Path) -> Vec<(String, String)> {
        let pairs = self.file_pairs.remove(file).unwrap_or_default();

        for (language, key) in &pairs {
            let Some(lang_map) = self.entries.get_mut(language) else {
                continue;
            };
            if let Some(candidates) = lang_map.get_mut(key) {
                candidates.retain(|entry| entry.file != file);
                if candidates.is_empty() {
                    lang_map.remove(key);
                }
            }
            if lang_map.is_empty() {
                self.entries.remove(language);
            }
        }

        self.file_errors.remove(file);
        self.files.remove(file);
        pairs
    }

    /// Recompute the winning entry for one (language, key) pair
    pub(crate) fn recompute_winner(&mut self, language: &str, key: &str) {
        let head = self
            .entries
            .get(language)
            .and_then(|lang_map| lang_map.get(key))
            .and_then(|candidates| candidates.first())
            .cloned();

        match head {
            Some(entry) => {
                self.winning
                    .entry(language.to_string())
                    .or_default()
                    .insert(key.to_string(), entry);
            }
            None => {
                if let Some(lang_map) = self.winning.get_mut(language) {
                    lang_map.remove(key);
                    if lang_map.is_empty() {
                        self.winning.remove(language);
                    }
                }
            }
        }
    }

    /// Recompute the whole winning view from the candidate lists
    pub(crate) fn rebuild_winning_view(&mut self) {
        self.winning.clear();
        for (language, lang_map) in &self.entries {
            let winners = self.winning.entry(language.clone()).or_default();
            for (key, candidates) in lang_map {
                if let Some(head) = candidates.first() {
                    winners.insert(key.clone(), head.clone());
                }
            }
        }
    }

    /// Re-derive the language and namespace sets from the candidate lists.
    ///
    /// A language exists exactly while it has at least one entry, so a file
    /// edit that empties a language also removes it here.
    pub(crate) fn refresh_derived_sets(&mut self) {
        self.languages = self.entries.keys().cloned().collect();
        self.namespaces = self
            .entries
            .values()
            .flat_map(|lang_map| lang_map.keys())
            .filter_map(|key| split_canonical_key(key))
            .map(|(namespace, _)| namespace.to_string())
            .collect();
    }

    pub(crate) fn record_file_error(&mut self, language: &str, file: &Path, message: String) {
        self.file_errors.insert(
            file.to_path_buf(),
            FileError {
                language: language.to_string(),
                file: file.to_path_buf(),
                message,
            },
        );
    }

    pub(crate) fn record_file_mtime(&mut self, file: &Path, mtime: u64) {
        self.files.insert(file.to_path_buf(), mtime);
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub(crate) fn touch_checked_at(&mut self) {
        self.checked_at = Utc::now();
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Winning entry for a (language, canonical key) pair
    pub fn winner(&self, language: &str, key: &str) -> Option<&ResourceEntry> {
        self.winning.get(language)?.get(key)
    }

    /// All candidates for a pair, ordered by ascending priority
    pub fn candidates(&self, language: &str, key: &str) -> &[ResourceEntry] {
        self.entries
            .get(language)
            .and_then(|lang_map| lang_map.get(key))
            .map(|candidates| candidates.as_slice())
            .unwrap_or(&[])
    }

    /// The full winning view, language -> canonical key -> entry
    pub fn winning_view(&self) -> &HashMap<String, HashMap<String, ResourceEntry>> {
        &self.winning
    }

    /// Winning entries for one language
    pub fn winning_for_language(&self, language: &str) -> Option<&HashMap<String, ResourceEntry>> {
        self.winning.get(language)
    }

    pub fn languages(&self) -> &BTreeSet<String> {
        &self.languages
    }

    pub fn namespaces(&self) -> &BTreeSet<String> {
        &self.namespaces
    }

    /// Indexed files and their recorded mtimes
    pub fn files(&self) -> &HashMap<PathBuf, u64> {
        &self.files
    }

    pub fn file_mtime(&self, file: &Path) -> Option<u64> {
        self.files.get(file).copied()
    }

    pub fn errors(&self) -> impl Iterator<Item = &FileError> {
        self.file_errors.values()
    }

    pub fn error_for(&self, file: &Path) -> Option<&FileError> {
        self.file_errors.get(file)
    }

    pub fn error_count(&self) -> usize {
        self.file_errors.len()
    }

    /// Total number of winning (language, key) pairs
    pub fn key_count(&self) -> usize {
        self.winning.values().map(|lang_map| lang_map.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when the index no longer reflects the filesystem and must be
    /// rebuilt before the next query
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// When the index was last built or validated against the filesystem
    pub fn checked_at(&self) -> DateTime<Utc> {
        self.checked_at
    }
}

impl Default for ResourceIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(value: &str, file: &str, priority: u32) -> ResourceEntry {
        ResourceEntry {
            value: value.to_string(),
            file: PathBuf::from(file),
            priority,
        }
    }

    #[test]
    fn test_lower_priority_wins() {
        let mut index = ResourceIndex::new();
        index.insert_candidate("en", "common:title", entry("High", "/m/en.json", 40));
        index.insert_candidate("en", "common:title", entry("Low", "/l/en/common.json", 30));
        index.rebuild_winning_view();

        assert_eq!(index.winner("en", "common:title").unwrap().value, "Low");
        let candidates = index.candidates("en", "common:title");
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].priority, 30);
        assert_eq!(candidates[1].priority, 40);
    }

    #[test]
    fn test_retracting_winner_promotes_next_candidate() {
        let mut index = ResourceIndex::new();
        index.insert_candidate("en", "common:title", entry("Low", "/l/en/common.json", 30));
        index.insert_candidate("en", "common:title", entry("High", "/m/en.json", 40));
        index.rebuild_winning_view();
        assert_eq!(index.winner("en", "common:title").unwrap().value, "Low");

        let touched = index.retract_file(Path::new("/l/en/common.json"));
        assert_eq!(touched, vec![("en".to_string(), "common:title".to_string())]);
        for (language, key) in &touched {
            index.recompute_winner(language, key);
        }

        assert_eq!(index.winner("en", "common:title").unwrap().value, "High");
        assert_eq!(index.candidates("en", "common:title").len(), 1);
    }

    #[test]
    fn test_retracting_last_candidate_drops_key_and_language() {
        let mut index = ResourceIndex::new();
        index.insert_candidate("ja", "common:title", entry("題", "/l/ja/common.json", 30));
        index.rebuild_winning_view();
        index.refresh_derived_sets();
        assert!(index.languages().contains("ja"));

        let touched = index.retract_file(Path::new("/l/ja/common.json"));
        for (language, key) in &touched {
            index.recompute_winner(language, key);
        }
        index.refresh_derived_sets();

        assert!(index.winner("ja", "common:title").is_none());
        assert!(index.candidates("ja", "common:title").is_empty());
        assert!(!index.languages().contains("ja"));
        assert!(index.is_empty());
    }

    #[test]
    fn test_retract_clears_error_and_mtime() {
        let mut index = ResourceIndex::new();
        let file = Path::new("/l/en/common.json");
        index.record_file_mtime(file, 42);
        index.record_file_error("en", file, "failed to parse".to_string());
        assert!(index.error_for(file).is_some());

        index.retract_file(file);
        assert!(index.error_for(file).is_none());
        assert!(index.file_mtime(file).is_none());
        assert_eq!(index.error_count(), 0);
    }

    #[test]
    fn test_derived_sets_follow_entries() {
        let mut index = ResourceIndex::new();
        index.insert_candidate("en", "common:title", entry("Title", "/l/en/common.json", 30));
        index.insert_candidate("en", "nav:home", entry("Home", "/l/en/nav.json", 30));
        index.insert_candidate("ja", "common:title", entry("題", "/l/ja/common.json", 30));
        index.rebuild_winning_view();
        index.refresh_derived_sets();

        let languages: Vec<_> = index.languages().iter().cloned().collect();
        assert_eq!(languages, vec!["en", "ja"]);
        let namespaces: Vec<_> = index.namespaces().iter().cloned().collect();
        assert_eq!(namespaces, vec!["common", "nav"]);
        assert_eq!(index.key_count(), 3);
    }

    #[test]
    fn test_equal_priority_keeps_insertion_order() {
        let mut index = ResourceIndex::new();
        index.insert_candidate("en", "common:title", entry("First", "/a/en/common.json", 30));
        index.insert_candidate("en", "common:title", entry("Second", "/b/en/common.json", 30));
        index.rebuild_winning_view();

        assert_eq!(index.winner("en", "common:title").unwrap().value, "First");
    }

    #[test]
    fn test_canonical_key_round_trip() {
        let key = canonical_key("common", "login.title");
        assert_eq!(key, "common:login.title");
        assert_eq!(split_canonical_key(&key), Some(("common", "login.title")));
        assert_eq!(split_canonical_key("no-namespace"), None);
    }
}
