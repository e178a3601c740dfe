//! Block device reader trait
//!
//! Read-only access to the source device. The core never writes to the
//! device; the trait has no mutating operation by construction.

use std::io;
use thiserror::Error;

/// Errors surfaced when opening or reading a source device.
#[derive(Error, Debug)]
pub enum BlockDeviceError {
    #[error("device not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("unsupported device: {0}")]
    Unsupported(String),

    #[error("read error at offset {offset}: {message}")]
    ReadError { offset: u64, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Read-only random access to a raw device or image.
///
/// Implementations must be safe to share across scan workers:
/// `read_at` takes `&self` and concurrent calls must not interfere.
/// Short reads at end of device are allowed; reads at or past the end
/// return an empty buffer.
pub trait BlockDeviceReader: Send + Sync {
    /// Opens the source read-only. Must succeed on both regular files
    /// and block devices.
    fn open(path: &str) -> Result<Self, BlockDeviceError>
    where
        Self: Sized;

    /// Total device size in bytes.
    fn size(&self) -> u64;

    /// Reads up to `length` bytes starting at `offset`.
    fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>, BlockDeviceError>;

    /// The path the device was opened from.
    fn path(&self) -> &str;
}
