//! FAT32 filesystem parser
//!
//! Two passes over the volume: a directory walk from the root cluster
//! that follows FAT chains (live files, long names intact), and a
//! brute-force sweep of the data area for 0xE5-marked deleted entries
//! whose directory may no longer be reachable.

use crate::binary::{looks_textual, sniff_file_type};
use crate::domain::entities::{Fragment, RecoveredFile};
use crate::domain::services::{FileSystemType, FilesystemParser};
use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, info};
use std::collections::HashSet;
use std::io::Cursor;

const BOOT_SECTOR_LEN: usize = 512;
const END_MARKER: u16 = 0xAA55;
const DIR_ENTRY_LEN: usize = 32;

const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LONG_NAME: u8 = 0x0F;

const DELETED_MARKER: u8 = 0xE5;
const ENTRY_END: u8 = 0x00;

/// Data-cluster numbers live in [2, 0x0FFFFFF7).
const MIN_CLUSTER: u32 = 2;
const BAD_CLUSTER: u32 = 0x0FFF_FFF7;
const FAT_ENTRY_MASK: u32 = 0x0FFF_FFFF;

const MAX_ENTRIES: usize = 100_000;
const MAX_DELETED_SCAN_CLUSTERS: u64 = 1000;
const MAX_FILE_SIZE: u32 = 1 << 30;
const SNIFF_LEN: usize = 512;

const CONFIDENCE_LIVE: f64 = 0.85;
const CONFIDENCE_DELETED: f64 = 0.60;

/// Fields of the FAT32 boot sector this parser needs.
#[derive(Debug)]
struct BootSector {
    bytes_per_sector: u16,
    sectors_per_cluster: u8,
    reserved_sector_count: u16,
    table_count: u8,
    table_size_16: u16,
    table_size_32: u32,
    root_cluster: u32,
    volume_label: String,
    fat_type_ok: bool,
    end_marker: u16,
}

impl BootSector {
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < BOOT_SECTOR_LEN {
            return None;
        }
        let mut cursor = Cursor::new(data);

        cursor.set_position(11);
        let bytes_per_sector = cursor.read_u16::<LittleEndian>().ok()?;
        let sectors_per_cluster = cursor.read_u8().ok()?;
        let reserved_sector_count = cursor.read_u16::<LittleEndian>().ok()?;
        let table_count = cursor.read_u8().ok()?;

        cursor.set_position(22);
        let table_size_16 = cursor.read_u16::<LittleEndian>().ok()?;

        cursor.set_position(36);
        let table_size_32 = cursor.read_u32::<LittleEndian>().ok()?;

        cursor.set_position(44);
        let root_cluster = cursor.read_u32::<LittleEndian>().ok()?;

        let volume_label = data[71..82]
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| b as char)
            .collect::<String>()
            .trim_end()
            .to_string();

        cursor.set_position(510);
        let end_marker = cursor.read_u16::<LittleEndian>().ok()?;

        Some(Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sector_count,
            table_count,
            table_size_16,
            table_size_32,
            root_cluster,
            volume_label,
            fat_type_ok: &data[82..90] == b"FAT32   ",
            end_marker,
        })
    }

    fn is_valid(&self) -> bool {
        self.end_marker == END_MARKER
            && self.bytes_per_sector == 512
            && self.sectors_per_cluster != 0
            && self.sectors_per_cluster.is_power_of_two()
            && self.table_size_16 == 0
            && self.table_size_32 > 0
            && self.root_cluster >= MIN_CLUSTER
            && self.fat_type_ok
    }

    fn fat_offset(&self) -> u64 {
        self.reserved_sector_count as u64 * self.bytes_per_sector as u64
    }

    fn data_offset(&self) -> u64 {
        self.fat_offset()
            + self.table_count as u64 * self.table_size_32 as u64 * self.bytes_per_sector as u64
    }

    fn cluster_size(&self) -> u64 {
        self.sectors_per_cluster as u64 * self.bytes_per_sector as u64
    }

    fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_offset() + (cluster as u64 - 2) * self.cluster_size()
    }
}

/// One 32-byte short directory entry.
struct DirEntry {
    raw_name: [u8; 11],
    attributes: u8,
    first_cluster_high: u16,
    first_cluster_low: u16,
    file_size: u32,
}

impl DirEntry {
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < DIR_ENTRY_LEN {
            return None;
        }

        let mut raw_name = [0u8; 11];
        raw_name.copy_from_slice(&data[0..11]);

        let mut cursor = Cursor::new(data);
        cursor.set_position(11);
        let attributes = cursor.read_u8().ok()?;

        cursor.set_position(20);
        let first_cluster_high = cursor.read_u16::<LittleEndian>().ok()?;

        cursor.set_position(26);
        let first_cluster_low = cursor.read_u16::<LittleEndian>().ok()?;
        let file_size = cursor.read_u32::<LittleEndian>().ok()?;

        Some(Self {
            raw_name,
            attributes,
            first_cluster_high,
            first_cluster_low,
            file_size,
        })
    }

    fn first_cluster(&self) -> u32 {
        (self.first_cluster_high as u32) << 16 | self.first_cluster_low as u32
    }

    fn is_directory(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }

    /// 8.3 name lowercased with a `.` separator.
    fn short_name(&self) -> String {
        let base: String = self.raw_name[..8]
            .iter()
            .filter(|&&b| b != b' ')
            .map(|&b| (b as char).to_ascii_lowercase())
            .collect();
        let ext: String = self.raw_name[8..]
            .iter()
            .filter(|&&b| b != b' ')
            .map(|&b| (b as char).to_ascii_lowercase())
            .collect();

        if ext.is_empty() {
            base
        } else {
            format!("{base}.{ext}")
        }
    }
}

fn is_valid_cluster(cluster: u32) -> bool {
    (MIN_CLUSTER..BAD_CLUSTER).contains(&cluster)
}

pub struct Fat32Parser;

impl Fat32Parser {
    pub fn new() -> Self {
        Self
    }

    /// Next cluster in the chain, from the (masked) 32-bit FAT entry.
    fn fat_entry(&self, data: &[u8], boot: &BootSector, cluster: u32) -> Option<u32> {
        let entry_offset = boot.fat_offset() + cluster as u64 * 4;
        let bytes = data.get(entry_offset as usize..entry_offset as usize + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) & FAT_ENTRY_MASK)
    }

    /// Fragments for a live file: the FAT chain from `first_cluster`,
    /// adjacent clusters coalesced, clipped to `file_size` bytes.
    fn chain_fragments(
        &self,
        data: &[u8],
        boot: &BootSector,
        first_cluster: u32,
        file_size: u64,
    ) -> Vec<Fragment> {
        let cluster_size = boot.cluster_size();
        let mut fragments: Vec<Fragment> = Vec::new();
        let mut remaining = file_size;
        let mut cluster = first_cluster;
        let mut visited = HashSet::new();

        while remaining > 0 && is_valid_cluster(cluster) && visited.insert(cluster) {
            let offset = boot.cluster_offset(cluster);
            let size = remaining.min(cluster_size);
            if offset + size > data.len() as u64 {
                break;
            }

            if let Some(last) = fragments.last_mut() {
                if last.end() == offset {
                    last.size += size;
                    remaining -= size;
                    cluster = match self.fat_entry(data, boot, cluster) {
                        Some(next) => next,
                        None => break,
                    };
                    continue;
                }
            }

            fragments.push(Fragment::new(offset, size));
            remaining -= size;
            cluster = match self.fat_entry(data, boot, cluster) {
                Some(next) => next,
                None => break,
            };
        }

        fragments
    }

    /// Live pass: walk directories from the root cluster, assembling
    /// long names and queueing subdirectories.
    fn walk_directories(&self, data: &[u8], boot: &BootSector) -> Vec<RecoveredFile> {
        let cluster_size = boot.cluster_size() as usize;
        let mut recovered = Vec::new();
        let mut pending = vec![boot.root_cluster];
        let mut visited = HashSet::new();
        let mut entries_seen = 0usize;
        let mut lfn_stack: Vec<Vec<u8>> = Vec::new();

        while let Some(mut cluster) = pending.pop() {
            // Follow this directory's own cluster chain.
            loop {
                if !is_valid_cluster(cluster) || !visited.insert(cluster) {
                    break;
                }

                let cluster_start = boot.cluster_offset(cluster);
                if cluster_start + cluster_size as u64 > data.len() as u64 {
                    break;
                }
                let cluster_bytes =
                    &data[cluster_start as usize..cluster_start as usize + cluster_size];

                let mut end_of_directory = false;
                for entry_bytes in cluster_bytes.chunks_exact(DIR_ENTRY_LEN) {
                    entries_seen += 1;
                    if entries_seen > MAX_ENTRIES {
                        return recovered;
                    }

                    let first_byte = entry_bytes[0];
                    if first_byte == ENTRY_END {
                        end_of_directory = true;
                        break;
                    }
                    if first_byte == DELETED_MARKER {
                        // The deleted pass handles these.
                        lfn_stack.clear();
                        continue;
                    }

                    let Some(entry) = DirEntry::parse(entry_bytes) else {
                        continue;
                    };

                    if entry.attributes == ATTR_LONG_NAME {
                        lfn_stack.push(entry_bytes.to_vec());
                        continue;
                    }
                    if entry.attributes & ATTR_VOLUME_ID != 0 {
                        lfn_stack.clear();
                        continue;
                    }

                    let long_name = assemble_long_name(&lfn_stack);
                    lfn_stack.clear();
                    let name = if long_name.is_empty() {
                        entry.short_name()
                    } else {
                        long_name
                    };

                    if entry.is_directory() {
                        if name != "." && name != ".." && is_valid_cluster(entry.first_cluster()) {
                            pending.push(entry.first_cluster());
                        }
                        continue;
                    }

                    if name.is_empty() || entry.file_size == 0 {
                        continue;
                    }

                    let fragments = self.chain_fragments(
                        data,
                        boot,
                        entry.first_cluster(),
                        entry.file_size as u64,
                    );
                    if fragments.is_empty() {
                        continue;
                    }

                    let file_type = extension_of(&name);
                    debug!("live entry {name} ({} bytes)", entry.file_size);
                    recovered.push(RecoveredFile::fragmented(
                        name,
                        &file_type,
                        fragments,
                        CONFIDENCE_LIVE,
                    ));
                }

                if end_of_directory {
                    break;
                }
                cluster = match self.fat_entry(data, boot, cluster) {
                    Some(next) => next,
                    None => break,
                };
            }
        }

        recovered
    }

    /// Deleted pass: sweep the data area for 0xE5-marked entries. The
    /// FAT chain of a deleted file is gone, so coverage is the first
    /// cluster only.
    fn sweep_deleted(&self, data: &[u8], boot: &BootSector) -> Vec<RecoveredFile> {
        let cluster_size = boot.cluster_size();
        let data_start = boot.data_offset();
        let mut recovered = Vec::new();
        let mut entries_seen = 0usize;

        for cluster_index in 0..MAX_DELETED_SCAN_CLUSTERS {
            let cluster_start = data_start + cluster_index * cluster_size;
            if cluster_start + cluster_size > data.len() as u64 {
                break;
            }

            let cluster_bytes =
                &data[cluster_start as usize..(cluster_start + cluster_size) as usize];

            for entry_bytes in cluster_bytes.chunks_exact(DIR_ENTRY_LEN) {
                entries_seen += 1;
                if entries_seen > MAX_ENTRIES {
                    return recovered;
                }

                if entry_bytes[0] != DELETED_MARKER {
                    continue;
                }

                let Some(entry) = DirEntry::parse(entry_bytes) else {
                    continue;
                };
                if entry.attributes == ATTR_LONG_NAME
                    || entry.attributes & ATTR_VOLUME_ID != 0
                    || entry.is_directory()
                {
                    continue;
                }
                if entry.file_size == 0 || entry.file_size >= MAX_FILE_SIZE {
                    continue;
                }

                let first_cluster = entry.first_cluster();
                if !is_valid_cluster(first_cluster) {
                    continue;
                }
                let payload_offset = boot.cluster_offset(first_cluster);
                if payload_offset >= data.len() as u64 {
                    continue;
                }

                // The lead byte was overwritten by the deletion marker;
                // restore it as an underscore.
                let mut restored = entry.raw_name;
                restored[0] = b'_';
                let name = DirEntry {
                    raw_name: restored,
                    ..entry
                }
                .short_name();

                // Only the first cluster is trustworthy without a FAT
                // chain.
                let covered = (entry.file_size as u64)
                    .min(cluster_size)
                    .min(data.len() as u64 - payload_offset);
                if covered == 0 {
                    continue;
                }

                let fragment = Fragment::new(payload_offset, covered);
                let file_type = classify_payload(data, &fragment, &name);

                debug!("deleted entry {name} ({covered} bytes, type {file_type})");
                recovered.push(RecoveredFile::fragmented(
                    name,
                    &file_type,
                    vec![fragment],
                    CONFIDENCE_DELETED,
                ));
            }
        }

        recovered
    }
}

impl Default for Fat32Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl FilesystemParser for Fat32Parser {
    fn can_parse(&self, data: &[u8]) -> bool {
        BootSector::parse(data).is_some_and(|boot| boot.is_valid())
    }

    fn fs_type(&self) -> FileSystemType {
        FileSystemType::Fat32
    }

    fn recover_deleted(&self, data: &[u8]) -> Vec<RecoveredFile> {
        let Some(boot) = BootSector::parse(data).filter(|b| b.is_valid()) else {
            debug!("FAT32 boot sector invalid, nothing to recover");
            return Vec::new();
        };

        if boot.data_offset() >= data.len() as u64 || boot.fat_offset() >= data.len() as u64 {
            debug!("FAT32 data area outside the parse window");
            return Vec::new();
        }

        info!(
            "FAT32 walk: FAT at {}, data at {}, cluster size {}",
            boot.fat_offset(),
            boot.data_offset(),
            boot.cluster_size()
        );

        let mut recovered = self.sweep_deleted(data, &boot);
        recovered.extend(self.walk_directories(data, &boot));

        info!("FAT32 metadata pass found {} files", recovered.len());
        recovered
    }

    fn info(&self, data: &[u8]) -> String {
        match BootSector::parse(data).filter(|b| b.is_valid()) {
            Some(boot) => format!(
                "FAT32 filesystem\ncluster size: {} bytes\nFAT offset: {}\ndata offset: {}\nroot cluster: {}\nlabel: {}",
                boot.cluster_size(),
                boot.fat_offset(),
                boot.data_offset(),
                boot.root_cluster,
                if boot.volume_label.is_empty() {
                    "<none>"
                } else {
                    boot.volume_label.as_str()
                },
            ),
            None => "FAT32 filesystem (unrecognized boot sector)".to_string(),
        }
    }
}

/// Assembles a long filename from buffered LFN entries, which precede
/// the short entry in reverse order on disk.
fn assemble_long_name(lfn_entries: &[Vec<u8>]) -> String {
    let mut name = String::new();

    for entry in lfn_entries.iter().rev() {
        if entry.len() < DIR_ENTRY_LEN {
            continue;
        }

        // name1: 5 units at 1, name2: 6 units at 14, name3: 2 units at
        // 28. A 0x0000 terminator or 0xFFFF padding ends a field.
        let unit_ranges = [(1usize, 5usize), (14, 6), (28, 2)];
        for (start, count) in unit_ranges {
            for i in 0..count {
                let at = start + i * 2;
                let unit = u16::from_le_bytes([entry[at], entry[at + 1]]);
                if unit == 0 || unit == 0xFFFF {
                    break;
                }
                if unit < 128 {
                    name.push(unit as u8 as char);
                }
            }
        }
    }

    name
}

fn extension_of(name: &str) -> String {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Prefers the payload's magic over the directory entry's extension.
fn classify_payload(data: &[u8], fragment: &Fragment, name: &str) -> String {
    let start = fragment.offset as usize;
    let end = (start + SNIFF_LEN).min(data.len()).min(fragment.end() as usize);
    if start < end {
        let head = &data[start..end];
        if let Some(tag) = sniff_file_type(head) {
            return tag.to_string();
        }
        if looks_textual(head) {
            return "txt".to_string();
        }
    }
    extension_of(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 256 KiB FAT32 image: boot sector, one FAT at sector 32, data
    /// area at 24576 (cluster 2 = root directory). Root holds a live
    /// entry (`TEST    TXT`, cluster 3, 100 bytes) and a deleted one
    /// (0xE5 + `ELETED  TXT`, cluster 4, 200 bytes).
    pub(super) fn synthetic_fat32_image() -> Vec<u8> {
        let mut image = vec![0u8; 256 * 1024];

        // Boot sector
        image[11..13].copy_from_slice(&512u16.to_le_bytes());
        image[13] = 8; // 4 KiB clusters
        image[14..16].copy_from_slice(&32u16.to_le_bytes()); // reserved
        image[16] = 1; // one FAT
        image[36..40].copy_from_slice(&16u32.to_le_bytes()); // FAT sectors
        image[44..48].copy_from_slice(&2u32.to_le_bytes()); // root cluster
        image[71..76].copy_from_slice(b"VOL  ");
        image[82..90].copy_from_slice(b"FAT32   ");
        image[510..512].copy_from_slice(&END_MARKER.to_le_bytes());

        // FAT at 16384: end-of-chain marks for clusters 2, 3, 4.
        let fat = 32 * 512;
        for cluster in [2usize, 3, 4] {
            image[fat + cluster * 4..fat + cluster * 4 + 4]
                .copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
        }

        // Root directory at data offset 24576 (cluster 2).
        let root = 24576;

        // Live entry: TEST.TXT, cluster 3, 100 bytes.
        image[root..root + 11].copy_from_slice(b"TEST    TXT");
        image[root + 11] = 0x20; // archive
        image[root + 26..root + 28].copy_from_slice(&3u16.to_le_bytes());
        image[root + 28..root + 32].copy_from_slice(&100u32.to_le_bytes());

        // Deleted entry: lead byte of "DELETED TXT" overwritten with
        // 0xE5, cluster 4, 200 bytes.
        let e = root + 32;
        let mut deleted_name = [0u8; 11];
        deleted_name[0] = DELETED_MARKER;
        deleted_name[1..8].copy_from_slice(b"ELETED ");
        deleted_name[8..11].copy_from_slice(b"TXT");
        image[e..e + 11].copy_from_slice(&deleted_name);
        image[e + 11] = 0x20;
        image[e + 26..e + 28].copy_from_slice(&4u16.to_le_bytes());
        image[e + 28..e + 32].copy_from_slice(&200u32.to_le_bytes());

        // Cluster 3 payload (live): text.
        let c3 = 24576 + 4096;
        image[c3..c3 + 17].copy_from_slice(b"live file payload");

        // Cluster 4 payload (deleted): text.
        let c4 = 24576 + 2 * 4096;
        image[c4..c4 + 20].copy_from_slice(b"deleted file payload");

        image
    }

    #[test]
    fn test_can_parse() {
        let image = synthetic_fat32_image();
        assert!(Fat32Parser::new().can_parse(&image));
        assert!(!Fat32Parser::new().can_parse(&vec![0u8; 4096]));
    }

    #[test]
    fn test_boot_sector_geometry() {
        let image = synthetic_fat32_image();
        let boot = BootSector::parse(&image).unwrap();
        assert!(boot.is_valid());
        assert_eq!(boot.fat_offset(), 16384);
        assert_eq!(boot.data_offset(), 24576);
        assert_eq!(boot.cluster_size(), 4096);
        assert_eq!(boot.cluster_offset(2), 24576);
    }

    #[test]
    fn test_deleted_entry_recovered() {
        let image = synthetic_fat32_image();
        let files = Fat32Parser::new().recover_deleted(&image);

        let deleted = files
            .iter()
            .find(|f| f.filename.starts_with('_'))
            .expect("deleted entry not found");
        assert!(deleted.filename.eq_ignore_ascii_case("_eleted.txt"));
        assert_eq!(deleted.file_size, 200);
        assert!((deleted.confidence_score - CONFIDENCE_DELETED).abs() < 1e-9);
        assert_eq!(deleted.start_offset, 24576 + 2 * 4096);
        assert!(deleted.is_well_formed(image.len() as u64));
    }

    #[test]
    fn test_live_entry_recovered() {
        let image = synthetic_fat32_image();
        let files = Fat32Parser::new().recover_deleted(&image);

        let live = files
            .iter()
            .find(|f| f.filename == "test.txt")
            .expect("live entry not found");
        assert_eq!(live.file_size, 100);
        assert!((live.confidence_score - CONFIDENCE_LIVE).abs() < 1e-9);
        assert_eq!(live.start_offset, 24576 + 4096);
    }

    #[test]
    fn test_long_name_assembly() {
        // Two LFN entries carrying "longfilename.dat" in reverse.
        let make_lfn = |order: u8, text: &[u8]| {
            let mut entry = vec![0u8; DIR_ENTRY_LEN];
            entry[0] = order;
            entry[11] = ATTR_LONG_NAME;
            let mut units: Vec<u16> = text.iter().map(|&b| b as u16).collect();
            units.resize(13, 0xFFFF);
            for (i, &unit) in units.iter().enumerate() {
                let at = match i {
                    0..=4 => 1 + i * 2,
                    5..=10 => 14 + (i - 5) * 2,
                    _ => 28 + (i - 11) * 2,
                };
                entry[at..at + 2].copy_from_slice(&unit.to_le_bytes());
            }
            entry
        };

        // On-disk order: last part first.
        let stack = vec![make_lfn(0x42, b"me.dat"), make_lfn(0x01, b"longfilena")];
        // Reverse iteration starts from the bottom of the stack.
        assert_eq!(assemble_long_name(&stack), "longfilename.dat");
    }

    #[test]
    fn test_cluster_validity_bounds() {
        assert!(!is_valid_cluster(0));
        assert!(!is_valid_cluster(1));
        assert!(is_valid_cluster(2));
        assert!(is_valid_cluster(BAD_CLUSTER - 1));
        assert!(!is_valid_cluster(BAD_CLUSTER));
        assert!(!is_valid_cluster(0x0FFF_FFF8));
    }
}
