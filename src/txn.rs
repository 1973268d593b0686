//! Transactional JSON writes
//!
//! Updates to resource files go through a staged sequence: serialize, write
//! to a uniquely named temp sibling, flush, fsync, then rename over the
//! destination. A failure at any stage removes the temp file and leaves the
//! destination byte-identical to what was there before. Multi-file batches
//! additionally roll back members that already committed, so observers see
//! either every file updated or none of them.

#![allow(dead_code)]

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

// ============================================================================
// Public Types
// ============================================================================

/// Stage of the atomic write sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStage {
    CreateTemp,
    Write,
    Flush,
    Sync,
    Rename,
}

impl fmt::Display for WriteStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateTemp => "create-temp",
            Self::Write => "write",
            Self::Flush => "flush",
            Self::Sync => "sync",
            Self::Rename => "rename",
        };
        write!(f, "{}", name)
    }
}

/// Serialization style for written documents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStyle {
    /// Pretty-printed with the given indent width
    Pretty { indent: usize },
    /// Single-line output
    Compact,
}

impl Default for WriteStyle {
    fn default() -> Self {
        Self::Pretty { indent: 2 }
    }
}

/// Errors from transactional writes
#[derive(Debug, Error)]
pub enum TxnError {
    /// Serialization failed before any file was touched
    #[error("failed to serialize document for {path:?}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A stage of the atomic sequence failed; the destination is untouched
    #[error("write to {path:?} failed during {stage} stage: {source}")]
    Stage {
        stage: WriteStage,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A destination could not be snapshotted before the batch started
    #[error("failed to snapshot {path:?} before batch write: {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A batch member failed; already-committed members were rolled back
    #[error("batch write failed at {path:?} ({rolled_back} committed file(s) rolled back): {source}")]
    Batch {
        path: PathBuf,
        rolled_back: usize,
        #[source]
        source: Box<TxnError>,
    },
}

impl TxnError {
    /// Stage that failed, when the failure happened inside the staged
    /// sequence
    pub fn failed_stage(&self) -> Option<WriteStage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            Self::Batch { source, .. } => source.failed_stage(),
            _ => None,
        }
    }
}

// ============================================================================
// Single-File Write
// ============================================================================

/// Atomically replace `path` with the serialized document.
///
/// The destination keeps its final-newline convention; files written for the
/// first time end with a newline.
pub async fn write_json(path: &Path, document: &Value, style: WriteStyle) -> Result<(), TxnError> {
    let prior = destination_bytes(path)
        .await
        .map_err(|source| TxnError::Snapshot {
            path: path.to_path_buf(),
            source,
        })?;
    write_document(&RealStages, path, document, style, prior.as_deref()).await
}

async fn write_document<S: WriteStages>(
    stages: &S,
    path: &Path,
    document: &Value,
    style: WriteStyle,
    prior: Option<&[u8]>,
) -> Result<(), TxnError> {
    let mut bytes = serialize_document(path, document, style)?;
    if prior.map_or(true, |existing| existing.ends_with(b"\n")) {
        bytes.push(b'\n');
    }
    write_bytes_atomic(stages, path, &bytes).await
}

fn serialize_document(path: &Path, document: &Value, style: WriteStyle) -> Result<Vec<u8>, TxnError> {
    let serialized = match style {
        WriteStyle::Compact => serde_json::to_vec(document),
        WriteStyle::Pretty { indent } => {
            let indent_str = " ".repeat(indent);
            let formatter = serde_json::ser::PrettyFormatter::with_indent(indent_str.as_bytes());
            let mut out = Vec::new();
            let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
            document.serialize(&mut serializer).map(|()| out)
        }
    };
    serialized.map_err(|source| TxnError::Serialize {
        path: path.to_path_buf(),
        source,
    })
}

/// Run the staged temp-write-fsync-rename sequence for raw bytes.
///
/// On any failure the temp file is removed and the destination is left
/// exactly as it was.
async fn write_bytes_atomic<S: WriteStages>(
    stages: &S,
    path: &Path,
    bytes: &[u8],
) -> Result<(), TxnError> {
    let temp_path = temp_sibling(path);
    debug!(path = %path.display(), temp = %temp_path.display(), "staging atomic write");

    let mut file = match stages.create(path, &temp_path).await {
        Ok(file) => file,
        Err(source) => return Err(stage_error(WriteStage::CreateTemp, path, source)),
    };

    let staged = async {
        stages
            .write(path, &mut file, bytes)
            .await
            .map_err(|err| (WriteStage::Write, err))?;
        stages
            .flush(path, &mut file)
            .await
            .map_err(|err| (WriteStage::Flush, err))?;
        stages
            .sync(path, &mut file)
            .await
            .map_err(|err| (WriteStage::Sync, err))?;
        Ok::<(), (WriteStage, io::Error)>(())
    }
    .await;

    if let Err((stage, source)) = staged {
        drop(file);
        remove_temp(&temp_path).await;
        return Err(stage_error(stage, path, source));
    }
    drop(file);

    if let Err(source) = stages.rename(path, &temp_path).await {
        remove_temp(&temp_path).await;
        return Err(stage_error(WriteStage::Rename, path, source));
    }
    Ok(())
}

fn stage_error(stage: WriteStage, path: &Path, source: io::Error) -> TxnError {
    TxnError::Stage {
        stage,
        path: path.to_path_buf(),
        source,
    }
}

/// A unique staging name beside the destination, so the final rename never
/// crosses a filesystem boundary
fn temp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "document.json".to_string());
    let unique = format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple());
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(unique),
        _ => PathBuf::from(unique),
    }
}

async fn remove_temp(temp_path: &Path) {
    if let Err(err) = fs::remove_file(temp_path).await {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(temp = %temp_path.display(), error = %err, "failed to remove staging file");
        }
    }
}

async fn destination_bytes(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

// ============================================================================
// Batched Writes
// ============================================================================

#[derive(Debug)]
struct BatchItem {
    path: PathBuf,
    document: Value,
    style: WriteStyle,
}

/// A multi-file write that commits all files or none.
///
/// Destinations are snapshotted before the first write; when a later member
/// fails, every member that already committed is restored to its snapshot.
#[derive(Debug, Default)]
pub struct WriteBatch {
    items: Vec<BatchItem>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Queue one document for the batch
    pub fn with_file(mut self, path: impl Into<PathBuf>, document: Value, style: WriteStyle) -> Self {
        self.items.push(BatchItem {
            path: path.into(),
            document,
            style,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Write every queued file, rolling all of them back on failure
    pub async fn commit(self) -> Result<(), TxnError> {
        commit_with(&RealStages, self.items).await
    }
}

async fn commit_with<S: WriteStages>(stages: &S, items: Vec<BatchItem>) -> Result<(), TxnError> {
    let mut snapshots = Vec::with_capacity(items.len());
    for item in &items {
        let prior = destination_bytes(&item.path)
            .await
            .map_err(|source| TxnError::Snapshot {
                path: item.path.clone(),
                source,
            })?;
        snapshots.push(prior);
    }

    let mut committed = 0;
    for (position, item) in items.iter().enumerate() {
        let result = write_document(
            stages,
            &item.path,
            &item.document,
            item.style,
            snapshots[position].as_deref(),
        )
        .await;

        if let Err(err) = result {
            let rolled_back = roll_back(stages, &items, &snapshots, committed).await;
            return Err(TxnError::Batch {
                path: item.path.clone(),
                rolled_back,
                source: Box::new(err),
            });
        }
        committed = position + 1;
    }

    debug!(files = items.len(), "batch write committed");
    Ok(())
}

/// Restore the first `committed` members to their snapshots, newest first.
/// Returns how many restores succeeded; failures are logged and skipped so
/// the rest of the batch still rolls back.
async fn roll_back<S: WriteStages>(
    stages: &S,
    items: &[BatchItem],
    snapshots: &[Option<Vec<u8>>],
    committed: usize,
) -> usize {
    let mut restored = 0;
    for position in (0..committed).rev() {
        let item = &items[position];
        let failure = match &snapshots[position] {
            Some(bytes) => write_bytes_atomic(stages, &item.path, bytes)
                .await
                .err()
                .map(|err| err.to_string()),
            None => match fs::remove_file(&item.path).await {
                Ok(()) => None,
                Err(err) if err.kind() == io::ErrorKind::NotFound => None,
                Err(err) => Some(err.to_string()),
            },
        };
        match failure {
            None => restored += 1,
            Some(error) => {
                warn!(path = %item.path.display(), error, "rollback failed for batch member");
            }
        }
    }
    restored
}

// ============================================================================
// Stage Seam
// ============================================================================

/// The IO stages of one atomic write, separated so tests can fail an exact
/// stage. `dest` is always the final destination, even for stages operating
/// on the temp file.
#[async_trait]
trait WriteStages: Send + Sync {
    async fn create(&self, dest: &Path, temp: &Path) -> io::Result<fs::File>;
    async fn write(&self, dest: &Path, file: &mut fs::File, bytes: &[u8]) -> io::Result<()>;
    async fn flush(&self, dest: &Path, file: &mut fs::File) -> io::Result<()>;
    async fn sync(&self, dest: &Path, file: &mut fs::File) -> io::Result<()>;
    async fn rename(&self, dest: &Path, temp: &Path) -> io::Result<()>;
}

struct RealStages;

#[async_trait]
impl WriteStages for RealStages {
    async fn create(&self, _dest: &Path, temp: &Path) -> io::Result<fs::File> {
        fs::File::create(temp).await
    }

    async fn write(&self, _dest: &Path, file: &mut fs::File, bytes: &[u8]) -> io::Result<()> {
        file.write_all(bytes).await
    }

    async fn flush(&self, _dest: &Path, file: &mut fs::File) -> io::Result<()> {
        file.flush().await
    }

    async fn sync(&self, _dest: &Path, file: &mut fs::File) -> io::Result<()> {
        file.sync_all().await
    }

    async fn rename(&self, dest: &Path, temp: &Path) -> io::Result<()> {
        fs::rename(temp, dest).await
    }
}

// ============================================================================
// Tests
// ============================================================================
