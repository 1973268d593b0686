//! Error types for resource file loading
//!
//! Provides ResourceError for failures while reading and parsing translation
//! resource files. These errors are recorded per file inside the index rather
//! than aborting an entire build, so a single broken file never hides the
//! rest of a project's resources.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while loading a single resource file
#[derive(Debug, Error)]
pub enum ResourceError {
    /// File could not be read from disk
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File contents are not valid JSON
    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A language root file must carry namespaces as top-level keys
    #[error("expected top-level JSON object")]
    NotAnObject,
}

impl ResourceError {
    /// Create a read error for a specific file
    pub fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Read {
            path: path.into(),
            source,
        }
    }

    /// Create a parse error for a specific file
    pub fn parse(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Parse {
            path: path.into(),
            source,
        }
    }

    /// True when the underlying cause is a missing file
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Read { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}
