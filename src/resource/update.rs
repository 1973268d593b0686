//! Incremental index updates
//!
//! Applies a batch of changed paths to an existing index without a full
//! rescan. Each path's previous contribution is retracted through the
//! file-to-pairs map, the file is re-read, and winners are recomputed only
//! for the pairs that actually changed. Paths the conventions cannot place
//! (directories, files outside every root, names matching no layout) make
//! the batch give up and request a full rebuild instead.
//!
//! Invariant: an applied batch leaves the index exactly as a fresh build of
//! the same tree would.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::builder::load_resource_file;
use super::index::ResourceIndex;
use super::roots::Root;

/// Result of an incremental update attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// True when the batch was applied in place
    pub applied: bool,
    /// True when the caller must rebuild the index from scratch
    pub needs_full_rebuild: bool,
}

/// Apply a batch of changed paths to an existing index.
///
/// A deleted file is handled as pure retraction, a file that fails to parse
/// keeps a per-file error in its place, and a new file in a fresh language
/// simply adds entries. None of those force a rebuild; only paths that
/// cannot be attributed to a (language, namespace) slot do.
pub fn apply_changes(index: &mut ResourceIndex, roots: &[Root], paths: &[PathBuf]) -> ApplyOutcome {
    let mut touched: BTreeSet<(String, String)> = BTreeSet::new();

    for path in paths {
        if path.exists() && !path.is_file() {
            return give_up(index, path, "not a regular file");
        }
        let Some(root) = roots.iter().find(|root| root.contains(path)) else {
            return give_up(index, path, "outside every resource root");
        };
        let Some(shape) = root.classify(path) else {
            return give_up(index, path, "does not match the root layout");
        };

        touched.extend(index.retract_file(path));
        touched.extend(load_resource_file(index, &shape, path));
    }

    for (language, key) in &touched {
        index.recompute_winner(language, key);
    }
    index.refresh_derived_sets();
    index.clear_dirty();
    index.touch_checked_at();

    debug!(
        paths = paths.len(),
        pairs = touched.len(),
        "incremental update applied"
    );
    ApplyOutcome {
        applied: true,
        needs_full_rebuild: false,
    }
}

fn give_up(index: &mut ResourceIndex, path: &Path, reason: &str) -> ApplyOutcome {
    debug!(
        path = %path.display(),
        reason,
        "incremental update abandoned, full rebuild required"
    );
    index.mark_dirty();
    ApplyOutcome {
        applied: false,
        needs_full_rebuild: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::builder::build_index;
    use crate::resource::roots::ConventionKind;
    use std::fs;
    use tempfile::TempDir;

    fn write_file(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn apply(index: &mut ResourceIndex, roots: &[Root], paths: &[&Path]) -> ApplyOutcome {
        let owned: Vec<PathBuf> = paths.iter().map(|p| p.to_path_buf()).collect();
        apply_changes(index, roots, &owned)
    }

    /// The incremental result must be indistinguishable from a fresh build.
    async fn assert_matches_fresh_build(index: &ResourceIndex, roots: &[Root]) {
        let fresh = build_index(roots).await;

        assert_eq!(index.winning_view(), fresh.winning_view());
        assert_eq!(index.languages(), fresh.languages());
        assert_eq!(index.namespaces(), fresh.namespaces());
        assert_eq!(index.files(), fresh.files());

        for (language, lang_map) in fresh.winning_view() {
            for key in lang_map.keys() {
                assert_eq!(
                    index.candidates(language, key),
                    fresh.candidates(language, key),
                    "candidate lists diverge for {}/{}",
                    language,
                    key
                );
            }
        }

        let mut incremental: Vec<_> = index.errors().cloned().collect();
        let mut rebuilt: Vec<_> = fresh.errors().cloned().collect();
        incremental.sort_by(|a, b| a.file.cmp(&b.file));
        rebuilt.sort_by(|a, b| a.file.cmp(&b.file));
        assert_eq!(incremental, rebuilt);
    }

    #[tokio::test]
    async fn test_edit_updates_only_touched_pairs() {
        let temp = TempDir::new().unwrap();
        let locales = temp.path().join("locales");
        write_file(
            &locales.join("en/common.json"),
            r#"{"title": "Title", "subtitle": "Sub"}"#,
        );
        write_file(&locales.join("en/nav.json"), r#"{"home": "Home"}"#);
        let roots = vec![Root::new(ConventionKind::I18next, &locales)];
        let mut index = build_index(&roots).await;

        write_file(
            &locales.join("en/common.json"),
            r#"{"title": "New title", "subtitle": "Sub"}"#,
        );
        let outcome = apply(&mut index, &roots, &[&locales.join("en/common.json")]);

        assert!(outcome.applied);
        assert!(!outcome.needs_full_rebuild);
        assert_eq!(index.winner("en", "common:title").unwrap().value, "New title");
        assert_eq!(index.winner("en", "nav:home").unwrap().value, "Home");
        assert!(!index.is_dirty());
        assert_matches_fresh_build(&index, &roots).await;
    }

    #[tokio::test]
    async fn test_emptying_a_file_drops_its_language() {
        let temp = TempDir::new().unwrap();
        let locales = temp.path().join("locales");
        write_file(&locales.join("en/common.json"), r#"{"title": "Title"}"#);
        write_file(&locales.join("ja/common.json"), r#"{"title": "題"}"#);
        let roots = vec![Root::new(ConventionKind::I18next, &locales)];
        let mut index = build_index(&roots).await;
        assert!(index.languages().contains("ja"));

        write_file(&locales.join("ja/common.json"), "{}");
        let outcome = apply(&mut index, &roots, &[&locales.join("ja/common.json")]);

        assert!(outcome.applied);
        assert!(!index.languages().contains("ja"));
        assert_eq!(index.winner("en", "common:title").unwrap().value, "Title");
        assert_matches_fresh_build(&index, &roots).await;
    }

    #[tokio::test]
    async fn test_delete_is_pure_retraction() {
        let temp = TempDir::new().unwrap();
        let locales = temp.path().join("locales");
        write_file(&locales.join("en/common.json"), r#"{"title": "Title"}"#);
        write_file(&locales.join("en/nav.json"), r#"{"home": "Home"}"#);
        let roots = vec![Root::new(ConventionKind::I18next, &locales)];
        let mut index = build_index(&roots).await;

        let nav = locales.join("en/nav.json");
        fs::remove_file(&nav).unwrap();
        let outcome = apply(&mut index, &roots, &[&nav]);

        assert!(outcome.applied);
        assert!(index.winner("en", "nav:home").is_none());
        assert!(index.file_mtime(&nav).is_none());
        assert_eq!(index.error_count(), 0);
        assert_matches_fresh_build(&index, &roots).await;
    }

    #[tokio::test]
    async fn test_parse_failure_records_error_then_recovers() {
        let temp = TempDir::new().unwrap();
        let locales = temp.path().join("locales");
        let common = locales.join("en/common.json");
        write_file(&common, r#"{"title": "Title"}"#);
        let roots = vec![Root::new(ConventionKind::I18next, &locales)];
        let mut index = build_index(&roots).await;

        write_file(&common, "{ broken");
        let outcome = apply(&mut index, &roots, &[&common]);
        assert!(outcome.applied);
        assert!(index.winner("en", "common:title").is_none());
        assert!(index.error_for(&common).is_some());
        assert_matches_fresh_build(&index, &roots).await;

        write_file(&common, r#"{"title": "Fixed"}"#);
        let outcome = apply(&mut index, &roots, &[&common]);
        assert!(outcome.applied);
        assert!(index.error_for(&common).is_none());
        assert_eq!(index.winner("en", "common:title").unwrap().value, "Fixed");
        assert_matches_fresh_build(&index, &roots).await;
    }

    #[tokio::test]
    async fn test_root_file_edit_is_incremental() {
        let temp = TempDir::new().unwrap();
        let messages = temp.path().join("messages");
        let en = messages.join("en.json");
        write_file(&en, r#"{"common": {"title": "Title"}}"#);
        let roots = vec![Root::new(ConventionKind::NextIntl, &messages)];
        let mut index = build_index(&roots).await;

        write_file(
            &en,
            r#"{"common": {"title": "Title"}, "nav": {"home": "Home"}}"#,
        );
        let outcome = apply(&mut index, &roots, &[&en]);

        assert!(outcome.applied);
        assert!(index.namespaces().contains("nav"));
        assert_eq!(index.winner("en", "nav:home").unwrap().priority, 40);
        assert_matches_fresh_build(&index, &roots).await;
    }

    #[tokio::test]
    async fn test_edit_of_shadowed_file_keeps_winner() {
        let temp = TempDir::new().unwrap();
        let locales = temp.path().join("locales");
        let messages = temp.path().join("messages");
        write_file(&locales.join("en/common.json"), r#"{"title": "Primary"}"#);
        write_file(&messages.join("en/common.json"), r#"{"title": "Secondary"}"#);
        let roots = vec![
            Root::new(ConventionKind::I18next, &locales),
            Root::new(ConventionKind::NextIntl, &messages),
        ];
        let mut index = build_index(&roots).await;

        write_file(&messages.join("en/common.json"), r#"{"title": "Updated"}"#);
        let outcome = apply(&mut index, &roots, &[&messages.join("en/common.json")]);

        assert!(outcome.applied);
        let winner = index.winner("en", "common:title").unwrap();
        assert_eq!(winner.value, "Primary");
        let candidates = index.candidates("en", "common:title");
        assert_eq!(candidates[1].value, "Updated");
        assert_matches_fresh_build(&index, &roots).await;
    }

    #[tokio::test]
    async fn test_new_language_appears_incrementally() {
        let temp = TempDir::new().unwrap();
        let locales = temp.path().join("locales");
        write_file(&locales.join("en/common.json"), r#"{"title": "Title"}"#);
        let roots = vec![Root::new(ConventionKind::I18next, &locales)];
        let mut index = build_index(&roots).await;

        write_file(&locales.join("de/common.json"), r#"{"title": "Titel"}"#);
        let outcome = apply(&mut index, &roots, &[&locales.join("de/common.json")]);

        assert!(outcome.applied);
        assert!(index.languages().contains("de"));
        assert_eq!(index.winner("de", "common:title").unwrap().value, "Titel");
        assert_matches_fresh_build(&index, &roots).await;
    }

    #[tokio::test]
    async fn test_directory_path_requires_rebuild() {
        let temp = TempDir::new().unwrap();
        let locales = temp.path().join("locales");
        write_file(&locales.join("en/common.json"), r#"{"title": "Title"}"#);
        let roots = vec![Root::new(ConventionKind::I18next, &locales)];
        let mut index = build_index(&roots).await;

        let outcome = apply(&mut index, &roots, &[&locales.join("en")]);

        assert!(!outcome.applied);
        assert!(outcome.needs_full_rebuild);
        assert!(index.is_dirty());
    }

    #[tokio::test]
    async fn test_path_outside_roots_requires_rebuild() {
        let temp = TempDir::new().unwrap();
        let locales = temp.path().join("locales");
        write_file(&locales.join("en/common.json"), r#"{"title": "Title"}"#);
        let stray = temp.path().join("stray.json");
        write_file(&stray, "{}");
        let roots = vec![Root::new(ConventionKind::I18next, &locales)];
        let mut index = build_index(&roots).await;

        let outcome = apply(&mut index, &roots, &[&stray]);

        assert!(!outcome.applied);
        assert!(outcome.needs_full_rebuild);
    }

    #[tokio::test]
    async fn test_unrecognized_layout_requires_rebuild() {
        let temp = TempDir::new().unwrap();
        let locales = temp.path().join("locales");
        write_file(&locales.join("en/common.json"), r#"{"title": "Title"}"#);
        let roots = vec![Root::new(ConventionKind::I18next, &locales)];
        let mut index = build_index(&roots).await;

        // Too deep for the i18next layout.
        let deep = locales.join("en/sub/common.json");
        write_file(&deep, "{}");
        let outcome = apply(&mut index, &roots, &[&deep]);
        assert!(outcome.needs_full_rebuild);

        // Wrong extension.
        let yaml = locales.join("en/common.yaml");
        write_file(&yaml, "title: x");
        let outcome = apply(&mut index, &roots, &[&yaml]);
        assert!(outcome.needs_full_rebuild);
    }

    #[tokio::test]
    async fn test_batch_mixing_edit_create_and_delete() {
        let temp = TempDir::new().unwrap();
        let locales = temp.path().join("locales");
        write_file(&locales.join("en/common.json"), r#"{"title": "Title"}"#);
        write_file(&locales.join("en/nav.json"), r#"{"home": "Home"}"#);
        let roots = vec![Root::new(ConventionKind::I18next, &locales)];
        let mut index = build_index(&roots).await;

        write_file(&locales.join("en/common.json"), r#"{"title": "Edited"}"#);
        fs::remove_file(locales.join("en/nav.json")).unwrap();
        write_file(&locales.join("en/footer.json"), r#"{"legal": "Legal"}"#);

        let outcome = apply(
            &mut index,
            &roots,
            &[
                &locales.join("en/common.json"),
                &locales.join("en/nav.json"),
                &locales.join("en/footer.json"),
            ],
        );

        assert!(outcome.applied);
        assert_eq!(index.winner("en", "common:title").unwrap().value, "Edited");
        assert!(index.winner("en", "nav:home").is_none());
        assert_eq!(index.winner("en", "footer:legal").unwrap().value, "Legal");
        assert_matches_fresh_build(&index, &roots).await;
    }
}
