//! Recovered-file persister trait

use crate::domain::entities::RecoveredFile;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors surfaced when persisting recovered payloads.
#[derive(Error, Debug)]
pub enum FileWriterError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("output directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("disk full: {0}")]
    DiskFull(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of persisting a single recovered payload.
#[derive(Debug, Clone)]
pub struct WriteResult {
    /// Final path, after collision resolution.
    pub saved_path: PathBuf,
    /// Bytes written.
    pub saved_size: u64,
    /// SHA-256 of the written payload, hex encoded.
    pub sha256: String,
}

/// Persists recovered payloads under an output directory.
///
/// Name collisions are the writer's problem, not the core's; the core
/// hands over the synthesized filename and the payload bytes.
pub trait RecoveredFileWriter: Send + Sync {
    /// Writes one payload, resolving filename collisions.
    fn write(&self, file: &RecoveredFile, payload: &[u8]) -> Result<WriteResult, FileWriterError>;

    /// The directory payloads are written into.
    fn output_dir(&self) -> &Path;

    /// Count of files written so far.
    fn files_written(&self) -> usize;
}
