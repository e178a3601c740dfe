//! Local filesystem persister
//!
//! Writes recovered payloads under the output directory, resolving
//! name collisions with a numeric suffix and hashing every payload it
//! writes.

use crate::domain::entities::RecoveredFile;
use crate::domain::repositories::{FileWriterError, RecoveredFileWriter, WriteResult};
use log::debug;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct LocalFileWriter {
    output_dir: PathBuf,
    written: AtomicUsize,
}

impl LocalFileWriter {
    /// Creates the output directory (and parents) if needed.
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self, FileWriterError> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => {
                FileWriterError::PermissionDenied(output_dir.display().to_string())
            }
            _ => FileWriterError::Io(e),
        })?;

        Ok(Self {
            output_dir,
            written: AtomicUsize::new(0),
        })
    }

    /// First free path for `filename`, appending `_1`, `_2`, ... on
    /// collision.
    fn resolve_collision(&self, filename: &str) -> PathBuf {
        let candidate = self.output_dir.join(filename);
        if !candidate.exists() {
            return candidate;
        }

        let (stem, extension) = match filename.rsplit_once('.') {
            Some((stem, ext)) => (stem, Some(ext)),
            None => (filename, None),
        };

        for attempt in 1u32.. {
            let name = match extension {
                Some(ext) => format!("{stem}_{attempt}.{ext}"),
                None => format!("{stem}_{attempt}"),
            };
            let candidate = self.output_dir.join(name);
            if !candidate.exists() {
                return candidate;
            }
        }
        unreachable!()
    }
}

impl RecoveredFileWriter for LocalFileWriter {
    fn write(&self, file: &RecoveredFile, payload: &[u8]) -> Result<WriteResult, FileWriterError> {
        let path = self.resolve_collision(&file.filename);

        fs::write(&path, payload).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => {
                FileWriterError::PermissionDenied(path.display().to_string())
            }
            io::ErrorKind::StorageFull => FileWriterError::DiskFull(path.display().to_string()),
            _ => FileWriterError::Io(e),
        })?;

        let digest = Sha256::digest(payload);
        self.written.fetch_add(1, Ordering::Relaxed);

        debug!("persisted {} ({} bytes)", path.display(), payload.len());

        Ok(WriteResult {
            saved_path: path,
            saved_size: payload.len() as u64,
            sha256: format!("{digest:x}"),
        })
    }

    fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn files_written(&self) -> usize {
        self.written.load(Ordering::Relaxed)
    }
}
