//! Filesystem family detection
//!
//! Identifies the filesystem from the first sectors of a device so the
//! engine can pick a metadata parser. Detection never aborts recovery:
//! an unknown result just skips the metadata phase.

use crate::domain::services::FileSystemType;
use byteorder::{ByteOrder, LittleEndian};
use log::{info, warn};

/// ext superblock location and field offsets within it.
const EXT_SB_OFFSET: usize = 1024;
const EXT_MAGIC_OFFSET: usize = 56;
const EXT_MAGIC: u16 = 0xEF53;
const EXT_FEATURE_COMPAT_JOURNAL: u32 = 0x0004;
const EXT_FEATURE_INCOMPAT_EXTENTS: u32 = 0x0040;

const FAT_SIGNATURE_OFFSET: usize = 510;
const BOOT_SIGNATURE: u16 = 0xAA55;

/// What the detector learned from the device head.
#[derive(Debug, Clone)]
pub struct FileSystemInfo {
    pub fs_type: FileSystemType,
    pub name: String,
    pub cluster_size: u64,
    pub total_size: u64,
    /// 0 when the filesystem does not expose it cheaply.
    pub used_size: u64,
    pub boot_sector_offset: u64,
    pub volume_label: String,
    pub is_valid: bool,
}

impl FileSystemInfo {
    fn unknown() -> Self {
        Self {
            fs_type: FileSystemType::Unknown,
            name: "Unknown".to_string(),
            cluster_size: 0,
            total_size: 0,
            used_size: 0,
            boot_sector_offset: 0,
            volume_label: String::new(),
            is_valid: false,
        }
    }

    fn bare(fs_type: FileSystemType) -> Self {
        Self {
            fs_type,
            name: fs_type.name().to_string(),
            cluster_size: 4096,
            total_size: 0,
            used_size: 0,
            boot_sector_offset: 0,
            volume_label: String::new(),
            is_valid: true,
        }
    }
}

pub struct FileSystemDetector;

impl FileSystemDetector {
    pub fn new() -> Self {
        Self
    }

    /// Detects the filesystem family from the head of the device.
    /// Priority: ext family, NTFS, FAT, then the recognize-only
    /// families.
    pub fn detect(&self, data: &[u8]) -> FileSystemInfo {
        if data.len() < 512 {
            return FileSystemInfo::unknown();
        }

        if let Some(fs_type) = detect_ext(data) {
            let info = parse_ext_info(data, fs_type);
            info!("detected {} filesystem", info.name);
            return info;
        }

        if detect_ntfs(data) {
            let info = parse_ntfs_info(data);
            info!("detected NTFS filesystem");
            return info;
        }

        if let Some(fs_type) = detect_fat(data) {
            let info = parse_fat_info(data, fs_type);
            info!("detected {} filesystem", info.name);
            return info;
        }

        if let Some(fs_type) = detect_other(data) {
            info!("detected {} filesystem", fs_type.name());
            return FileSystemInfo::bare(fs_type);
        }

        warn!("filesystem not recognized, metadata recovery unavailable");
        FileSystemInfo::unknown()
    }
}

impl Default for FileSystemDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn detect_ext(data: &[u8]) -> Option<FileSystemType> {
    if data.len() < EXT_SB_OFFSET + 264 {
        return None;
    }
    let sb = &data[EXT_SB_OFFSET..];

    if LittleEndian::read_u16(&sb[EXT_MAGIC_OFFSET..]) != EXT_MAGIC {
        return None;
    }

    let inodes_count = LittleEndian::read_u32(&sb[0..]);
    let blocks_count = LittleEndian::read_u32(&sb[4..]);
    let log_block_size = LittleEndian::read_u32(&sb[24..]);
    if inodes_count == 0 || blocks_count == 0 || log_block_size > 6 {
        return None;
    }

    let feature_compat = LittleEndian::read_u32(&sb[92..]);
    let feature_incompat = LittleEndian::read_u32(&sb[96..]);

    if feature_incompat & EXT_FEATURE_INCOMPAT_EXTENTS != 0 {
        Some(FileSystemType::Ext4)
    } else if feature_compat & EXT_FEATURE_COMPAT_JOURNAL != 0 {
        Some(FileSystemType::Ext3)
    } else {
        Some(FileSystemType::Ext2)
    }
}

fn parse_ext_info(data: &[u8], fs_type: FileSystemType) -> FileSystemInfo {
    let sb = &data[EXT_SB_OFFSET..];

    let block_size = 1024u64 << LittleEndian::read_u32(&sb[24..]);
    let total_blocks = LittleEndian::read_u32(&sb[4..]) as u64;
    let free_blocks = LittleEndian::read_u32(&sb[12..]) as u64;

    FileSystemInfo {
        fs_type,
        name: fs_type.name().to_string(),
        cluster_size: block_size,
        total_size: total_blocks * block_size,
        used_size: total_blocks.saturating_sub(free_blocks) * block_size,
        boot_sector_offset: 0,
        volume_label: read_label(&sb[120..136.min(sb.len())]),
        is_valid: true,
    }
}

fn detect_ntfs(data: &[u8]) -> bool {
    data.len() >= 512
        && &data[3..11] == b"NTFS    "
        && LittleEndian::read_u16(&data[11..]) == 512
        && data[13] != 0
        && data[13].is_power_of_two()
}

fn parse_ntfs_info(data: &[u8]) -> FileSystemInfo {
    let bytes_per_sector = LittleEndian::read_u16(&data[11..]) as u64;
    let sectors_per_cluster = data[13] as u64;
    let total_sectors = LittleEndian::read_u64(&data[40..]);

    FileSystemInfo {
        fs_type: FileSystemType::Ntfs,
        name: "NTFS".to_string(),
        cluster_size: bytes_per_sector * sectors_per_cluster,
        total_size: total_sectors * bytes_per_sector,
        used_size: 0,
        boot_sector_offset: 0,
        volume_label: String::new(),
        is_valid: true,
    }
}

fn detect_fat(data: &[u8]) -> Option<FileSystemType> {
    if data.len() < 512 || LittleEndian::read_u16(&data[FAT_SIGNATURE_OFFSET..]) != BOOT_SIGNATURE {
        return None;
    }

    if &data[3..11] == b"EXFAT   " {
        return Some(FileSystemType::ExFat);
    }

    let bytes_per_sector = LittleEndian::read_u16(&data[11..]);
    let sectors_per_cluster = data[13];
    if bytes_per_sector != 512 || sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two()
    {
        return None;
    }

    let reserved_sectors = LittleEndian::read_u16(&data[14..]) as u32;
    let num_fats = data[16] as u32;
    let root_entries = LittleEndian::read_u16(&data[17..]) as u32;
    let mut total_sectors = LittleEndian::read_u16(&data[19..]) as u32;
    if total_sectors == 0 {
        total_sectors = LittleEndian::read_u32(&data[32..]);
    }
    let mut sectors_per_fat = LittleEndian::read_u16(&data[22..]) as u32;
    if sectors_per_fat == 0 {
        sectors_per_fat = LittleEndian::read_u32(&data[36..]);
    }

    let root_dir_sectors =
        (root_entries * 32 + bytes_per_sector as u32 - 1) / bytes_per_sector as u32;
    let data_sectors = total_sectors
        .saturating_sub(reserved_sectors)
        .saturating_sub(num_fats * sectors_per_fat)
        .saturating_sub(root_dir_sectors);
    let cluster_count = data_sectors / sectors_per_cluster as u32;

    if cluster_count < 4085 {
        Some(FileSystemType::Fat12)
    } else if cluster_count < 65525 {
        Some(FileSystemType::Fat16)
    } else {
        Some(FileSystemType::Fat32)
    }
}

fn parse_fat_info(data: &[u8], fs_type: FileSystemType) -> FileSystemInfo {
    let bytes_per_sector = LittleEndian::read_u16(&data[11..]) as u64;
    let sectors_per_cluster = data[13] as u64;
    let mut total_sectors = LittleEndian::read_u16(&data[19..]) as u64;
    if total_sectors == 0 {
        total_sectors = LittleEndian::read_u32(&data[32..]) as u64;
    }

    let label_offset = if fs_type == FileSystemType::Fat32 {
        71
    } else {
        43
    };

    FileSystemInfo {
        fs_type,
        name: fs_type.name().to_string(),
        cluster_size: bytes_per_sector * sectors_per_cluster,
        total_size: total_sectors * bytes_per_sector,
        used_size: 0,
        boot_sector_offset: 0,
        volume_label: read_label(&data[label_offset..(label_offset + 11).min(data.len())]),
        is_valid: true,
    }
}

fn detect_other(data: &[u8]) -> Option<FileSystemType> {
    if data.len() >= 1026 && &data[1024..1026] == b"H+" {
        return Some(FileSystemType::HfsPlus);
    }
    if data.len() >= 65608 && &data[65600..65608] == b"_BHRfS_M" {
        return Some(FileSystemType::Btrfs);
    }
    if data.len() >= 4 && &data[0..4] == b"XFSB" {
        return Some(FileSystemType::Xfs);
    }
    None
}

fn read_label(raw: &[u8]) -> String {
    raw.iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect::<String>()
        .trim()
        .to_string()
}
