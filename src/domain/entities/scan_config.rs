//! Scan configuration

use std::path::PathBuf;

/// Default chunk size for the signature phase: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Immutable configuration for one recovery run. Owned by the engine
/// for its whole lifetime.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Source device or image path.
    pub device_path: String,
    /// Directory the persister writes recovered payloads into.
    pub output_directory: PathBuf,
    /// Type tags to keep from the signature phase; empty keeps all.
    pub target_file_types: Vec<String>,
    /// Run the filesystem-metadata phase.
    pub use_metadata_recovery: bool,
    /// Run the signature-carving phase.
    pub use_signature_recovery: bool,
    /// Worker threads for the signature phase; 0 picks
    /// available parallelism minus one.
    pub num_threads: usize,
    /// Bytes per signature-phase chunk.
    pub chunk_size: u64,
    /// Mirror progress updates into the log.
    pub verbose_logging: bool,
}

impl ScanConfig {
    pub fn new(device_path: impl Into<String>, output_directory: impl Into<PathBuf>) -> Self {
        Self {
            device_path: device_path.into(),
            output_directory: output_directory.into(),
            target_file_types: Vec::new(),
            use_metadata_recovery: true,
            use_signature_recovery: true,
            num_threads: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            verbose_logging: false,
        }
    }

    /// True when `file_type` passes the target-type filter.
    pub fn wants_type(&self, file_type: &str) -> bool {
        self.target_file_types.is_empty()
            || self
                .target_file_types
                .iter()
                .any(|t| t.eq_ignore_ascii_case(file_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ScanConfig::new("/dev/sdb1", "/tmp/out");
        assert!(config.use_metadata_recovery);
        assert!(config.use_signature_recovery);
        assert_eq!(config.num_threads, 0);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_type_filter_case_insensitive() {
        let mut config = ScanConfig::new("/dev/sdb1", "/tmp/out");
        assert!(config.wants_type("JPEG"));

        config.target_file_types = vec!["jpeg".into(), "pdf".into()];
        assert!(config.wants_type("JPEG"));
        assert!(config.wants_type("PDF"));
        assert!(!config.wants_type("zip"));
    }
}
