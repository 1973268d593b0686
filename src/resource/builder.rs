//! Full resource index construction
//!
//! Walks every resolved root, loads each file the convention recognizes and
//! assembles a fresh ResourceIndex. The walk yields back to the runtime
//! between files so a large project cannot starve other tasks sharing the
//! executor.

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::error::ResourceError;
use super::index::{ResourceEntry, ResourceIndex, canonical_key};
use super::roots::{ResourceFileShape, Root};

/// Build a fresh index for a set of resolved roots
pub async fn build_index(roots: &[Root]) -> ResourceIndex {
    let started = Instant::now();
    let mut index = ResourceIndex::new();

    for root in roots {
        scan_root(&mut index, root).await;
    }

    index.rebuild_winning_view();
    index.refresh_derived_sets();
    index.touch_checked_at();

    info!(
        roots = roots.len(),
        files = index.files().len(),
        languages = index.languages().len(),
        keys = index.key_count(),
        errors = index.error_count(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "resource index built"
    );
    index
}

async fn scan_root(index: &mut ResourceIndex, root: &Root) {
    if !root.path.is_dir() {
        warn!(root = %root.path.display(), "resource root is not a directory, skipping");
        return;
    }

    // Both conventions nest at most one directory deep below the root.
    let walker = WalkDir::new(&root.path)
        .min_depth(1)
        .max_depth(2)
        .sort_by_file_name();

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(
                    root = %root.path.display(),
                    error = %err,
                    "skipping unreadable entry during resource scan"
                );
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(shape) = root.classify(entry.path()) else {
            continue;
        };
        load_resource_file(index, &shape, entry.path());
        tokio::task::yield_now().await;
    }
}

/// Load one classified resource file into the index.
///
/// Read and parse failures become per-file errors instead of aborting; a
/// file that vanished between classification and read contributes nothing.
/// Returns the (language, key) pairs that gained a candidate so incremental
/// callers can recompute exactly those winners.
pub(crate) fn load_resource_file(
    index: &mut ResourceIndex,
    shape: &ResourceFileShape,
    path: &Path,
) -> Vec<(String, String)> {
    let language = shape.language().to_string();

    let document = match read_json_file(path) {
        Ok(value) => value,
        Err(err) if err.is_not_found() => return Vec::new(),
        Err(err) => {
            debug!(file = %path.display(), error = %err, "resource file failed to load");
            record_mtime(index, path);
            index.record_file_error(&language, path, err.to_string());
            return Vec::new();
        }
    };
    record_mtime(index, path);

    let mut touched = Vec::new();
    match shape {
        ResourceFileShape::I18nextNamespace { namespace, .. }
        | ResourceFileShape::NextIntlNamespace { namespace, .. } => {
            insert_flattened(
                index,
                &mut touched,
                &language,
                namespace,
                &document,
                path,
                shape.priority(),
            );
        }
        ResourceFileShape::NextIntlRootFile { .. } => match &document {
            Value::Object(namespaces) => {
                for (namespace, nested) in namespaces {
                    insert_flattened(
                        index,
                        &mut touched,
                        &language,
                        namespace,
                        nested,
                        path,
                        shape.priority(),
                    );
                }
            }
            _ => {
                index.record_file_error(&language, path, ResourceError::NotAnObject.to_string());
            }
        },
    }
    touched
}

fn record_mtime(index: &mut ResourceIndex, path: &Path) {
    if let Some(mtime) = file_mtime_nanos(path) {
        index.record_file_mtime(path, mtime);
    }
}

fn insert_flattened(
    index: &mut ResourceIndex,
    touched: &mut Vec<(String, String)>,
    language: &str,
    namespace: &str,
    document: &Value,
    file: &Path,
    priority: u32,
) {
    for (flat_key, value) in flatten_document(document) {
        let key = canonical_key(namespace, &flat_key);
        index.insert_candidate(
            language,
            &key,
            ResourceEntry {
                value,
                file: file.to_path_buf(),
                priority,
            },
        );
        touched.push((language.to_string(), key));
    }
}

/// Read and parse a JSON resource file
pub(crate) fn read_json_file(path: &Path) -> Result<Value, ResourceError> {
    let content = std::fs::read_to_string(path).map_err(|err| ResourceError::read(path, err))?;
    serde_json::from_str(&content).map_err(|err| ResourceError::parse(path, err))
}

/// Modification time as nanoseconds since the epoch, None when the file
/// cannot be stat'ed
pub(crate) fn file_mtime_nanos(path: &Path) -> Option<u64> {
    let metadata = std::fs::metadata(path).ok()?;
    let modified = metadata.modified().ok()?;
    let duration = modified
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Some(
        duration
            .as_secs()
            .saturating_mul(1_000_000_000)
            .saturating_add(u64::from(duration.subsec_nanos())),
    )
}

/// Flatten a nested JSON document into dot-separated keys.
///
/// String leaves keep their text, every other leaf keeps its JSON
/// representation. A non-object document collapses to a single value under
/// the empty key.
pub(crate) fn flatten_document(value: &Value) -> BTreeMap<String, String> {
    let mut flat = BTreeMap::new();
    flatten_into(value, "", &mut flat);
    flat
}

fn flatten_into(value: &Value, prefix: &str, flat: &mut BTreeMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                let child = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_into(nested, &child, flat);
            }
        }
        Value::String(text) => {
            flat.insert(prefix.to_string(), text.clone());
        }
        other => {
            flat.insert(prefix.to_string(), other.to_string());
        }
    }
}
