//! Resource root discovery and file classification
//!
//! A resource root is a directory that holds translation JSON files in one of
//! the supported layout conventions. Discovery walks upward from a starting
//! directory, so asking from anywhere inside a project finds the same roots.
//!
//! Merge priorities are fixed per file shape and resolved here, once, when a
//! root is constructed. Every entry loaded through a root carries the shape's
//! priority, and lower numbers win when several files define the same key.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

// ============================================================================
// Priority Table
// ============================================================================

/// Priority of `<root>/{language}/{namespace}.json` under an i18next root
pub const PRIORITY_I18NEXT_NAMESPACE: u32 = 30;

/// Priority of `<root>/{language}.json` under a next-intl root
pub const PRIORITY_NEXT_INTL_ROOT_FILE: u32 = 40;

/// Priority of `<root>/{language}/{namespace}.json` under a next-intl root
pub const PRIORITY_NEXT_INTL_NAMESPACE: u32 = 50;

// ============================================================================
// Core Types
// ============================================================================

/// Layout convention a resource root follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConventionKind {
    /// `locales/{language}/{namespace}.json` (also under `public/locales`)
    I18next,
    /// `messages/{language}.json` and `messages/{language}/{namespace}.json`
    NextIntl,
}

impl ConventionKind {
    /// Directory names probed during upward discovery, most specific first
    fn search_targets(self) -> &'static [&'static str] {
        match self {
            Self::I18next => &["public/locales", "locales"],
            Self::NextIntl => &["messages"],
        }
    }
}

/// A discovered resource root directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    pub kind: ConventionKind,
    pub path: PathBuf,
}

/// Shape of a single resource file relative to its root
///
/// The shape decides how a document's keys are namespaced and which merge
/// priority its entries carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceFileShape {
    /// `{language}/{namespace}.json` under an i18next root
    I18nextNamespace { language: String, namespace: String },
    /// `{language}.json` directly under a next-intl root, where each
    /// top-level key of the document is a namespace
    NextIntlRootFile { language: String },
    /// `{language}/{namespace}.json` under a next-intl root
    NextIntlNamespace { language: String, namespace: String },
}

impl ResourceFileShape {
    /// Merge priority for entries loaded from a file of this shape
    pub fn priority(&self) -> u32 {
        match self {
            Self::I18nextNamespace { .. } => PRIORITY_I18NEXT_NAMESPACE,
            Self::NextIntlRootFile { .. } => PRIORITY_NEXT_INTL_ROOT_FILE,
            Self::NextIntlNamespace { .. } => PRIORITY_NEXT_INTL_NAMESPACE,
        }
    }

    /// Language the file belongs to
    pub fn language(&self) -> &str {
        match self {
            Self::I18nextNamespace { language, .. }
            | Self::NextIntlRootFile { language }
            | Self::NextIntlNamespace { language, .. } => language,
        }
    }
}

impl Root {
    pub fn new(kind: ConventionKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    /// Base merge priority of this root's convention
    pub fn priority(&self) -> u32 {
        match self.kind {
            ConventionKind::I18next => PRIORITY_I18NEXT_NAMESPACE,
            ConventionKind::NextIntl => PRIORITY_NEXT_INTL_ROOT_FILE,
        }
    }

    /// True when `path` points strictly inside this root
    pub fn contains(&self, path: &Path) -> bool {
        match path.strip_prefix(&self.path) {
            Ok(relative) => !relative.as_os_str().is_empty(),
            Err(_) => false,
        }
    }

    /// Classify a path inside this root as a resource file
    ///
    /// Returns None for paths that do not match the convention's layout:
    /// wrong nesting depth, non-JSON extensions, or components that are not
    /// plain names.
    pub fn classify(&self, path: &Path) -> Option<ResourceFileShape> {
        let relative = path.strip_prefix(&self.path).ok()?;
        let mut components = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => components.push(part.to_str()?),
                _ => return None,
            }
        }

        match (self.kind, components.as_slice()) {
            (ConventionKind::I18next, [language, file]) => {
                Some(ResourceFileShape::I18nextNamespace {
                    language: (*language).to_string(),
                    namespace: json_stem(file)?,
                })
            }
            (ConventionKind::NextIntl, [file]) => Some(ResourceFileShape::NextIntlRootFile {
                language: json_stem(file)?,
            }),
            (ConventionKind::NextIntl, [language, file]) => {
                Some(ResourceFileShape::NextIntlNamespace {
                    language: (*language).to_string(),
                    namespace: json_stem(file)?,
                })
            }
            _ => None,
        }
    }
}

/// Strip a `.json` extension, rejecting empty stems
fn json_stem(file_name: &str) -> Option<String> {
    let stem = file_name.strip_suffix(".json")?;
    if stem.is_empty() {
        return None;
    }
    Some(stem.to_string())
}

// ============================================================================
// Discovery
// ============================================================================

/// Walk up from `start_dir` looking for a subdirectory named `target`.
///
/// `target` may contain a separator ("public/locales"), so nested layouts
/// are matched in one probe per ancestor.
fn find_up(start_dir: &Path, target: &str) -> Option<PathBuf> {
    let mut current = start_dir.to_path_buf();
    loop {
        let candidate = current.join(target);
        if candidate.is_dir() {
            return Some(candidate);
        }
        if !current.pop() {
            return None;
        }
    }
}

/// Resolve the resource roots visible from `start_dir`.
///
/// Each convention contributes at most one root, probed in a fixed order so
/// repeated calls from the same directory are deterministic. An empty result
/// means no convention matched anywhere up the tree.
pub fn resolve_roots(start_dir: &Path) -> Vec<Root> {
    let mut roots = Vec::new();

    for kind in [ConventionKind::I18next, ConventionKind::NextIntl] {
        for target in kind.search_targets() {
            if let Some(path) = find_up(start_dir, target) {
                debug!(kind = ?kind, path = %path.display(), "resolved resource root");
                roots.push(Root::new(kind, path));
                break;
            }
        }
    }

    roots
}

// ============================================================================
// Tests
// ============================================================================
