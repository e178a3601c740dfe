//! Filesystem detection and metadata parsers

mod detector;
pub mod ext;
pub mod fat32;
pub mod ntfs;

pub use detector::{FileSystemDetector, FileSystemInfo};
pub use ext::ExtParser;
pub use fat32::Fat32Parser;
pub use ntfs::NtfsParser;
