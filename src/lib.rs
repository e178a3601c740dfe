//! Salvor - forensic file recovery from raw block-device images
//!
//! Reads a damaged or formatted device read-only and reconstructs file
//! payloads through two cooperating strategies: filesystem-metadata
//! walks (ext, NTFS, FAT32) and signature-based carving (JPEG, PNG,
//! PDF, ZIP). Every reconstruction carries a confidence score.

pub mod application;
pub mod binary;
pub mod domain;
pub mod infrastructure;
pub mod presentation;

pub use application::{EngineHandle, RecoveryEngine};
pub use domain::entities::{Fragment, RecoveredFile, RecoveryStatus, ScanConfig};
pub use domain::repositories::{BlockDeviceError, BlockDeviceReader, RecoveredFileWriter};
pub use domain::services::{FileSystemType, FilesystemParser, FormatEngine};
