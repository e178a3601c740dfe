//! Filesystem parser trait

use crate::domain::entities::RecoveredFile;

/// Filesystem families the detector can name. Metadata recovery is
/// implemented for the ext family, NTFS and FAT32; the rest exist so
/// detection can report what it saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileSystemType {
    Unknown,
    Ext2,
    Ext3,
    Ext4,
    Ntfs,
    Fat12,
    Fat16,
    Fat32,
    ExFat,
    Btrfs,
    Xfs,
    HfsPlus,
    Apfs,
    Raw,
}

impl FileSystemType {
    pub fn name(&self) -> &'static str {
        match self {
            FileSystemType::Unknown => "Unknown",
            FileSystemType::Ext2 => "ext2",
            FileSystemType::Ext3 => "ext3",
            FileSystemType::Ext4 => "ext4",
            FileSystemType::Ntfs => "NTFS",
            FileSystemType::Fat12 => "FAT12",
            FileSystemType::Fat16 => "FAT16",
            FileSystemType::Fat32 => "FAT32",
            FileSystemType::ExFat => "exFAT",
            FileSystemType::Btrfs => "Btrfs",
            FileSystemType::Xfs => "XFS",
            FileSystemType::HfsPlus => "HFS+",
            FileSystemType::Apfs => "APFS",
            FileSystemType::Raw => "Raw",
        }
    }

    /// True for the families whose on-disk structures still describe
    /// deleted files well enough to walk.
    pub fn supports_metadata_recovery(&self) -> bool {
        matches!(
            self,
            FileSystemType::Ext2
                | FileSystemType::Ext3
                | FileSystemType::Ext4
                | FileSystemType::Ntfs
                | FileSystemType::Fat32
        )
    }
}

impl std::fmt::Display for FileSystemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A metadata-based recovery strategy for one filesystem family.
///
/// Parsers borrow their parse window for the duration of one call and
/// never retain it; malformed records are skipped (logged at debug
/// level), never surfaced as errors.
pub trait FilesystemParser: Send + Sync {
    /// Whether the buffer opens with this parser's on-disk anchor (a
    /// valid superblock or boot sector).
    fn can_parse(&self, data: &[u8]) -> bool;

    /// The family this parser handles.
    fn fs_type(&self) -> FileSystemType;

    /// Walks the metadata in `data` and returns every recoverable file,
    /// deleted entries included.
    fn recover_deleted(&self, data: &[u8]) -> Vec<RecoveredFile>;

    /// Human-readable description of the filesystem in `data`.
    fn info(&self, data: &[u8]) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_recovery_support() {
        assert!(FileSystemType::Ext4.supports_metadata_recovery());
        assert!(FileSystemType::Ntfs.supports_metadata_recovery());
        assert!(FileSystemType::Fat32.supports_metadata_recovery());
        assert!(!FileSystemType::Btrfs.supports_metadata_recovery());
        assert!(!FileSystemType::Unknown.supports_metadata_recovery());
    }

    #[test]
    fn test_names() {
        assert_eq!(FileSystemType::Ext4.name(), "ext4");
        assert_eq!(FileSystemType::Ntfs.name(), "NTFS");
        assert_eq!(FileSystemType::HfsPlus.name(), "HFS+");
    }
}
