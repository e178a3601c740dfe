//! NTFS filesystem parser
//!
//! Walks the MFT for FILE records, reading names from `$FILE_NAME`
//! attributes and data locations from `$DATA` attributes (resident
//! values or decoded run lists). Records whose in-use flag is clear, or
//! whose sequence number has advanced, are treated as deleted.

use crate::domain::entities::{Fragment, RecoveredFile};
use crate::domain::services::{FileSystemType, FilesystemParser};
use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, info};
use std::io::Cursor;

const BOOT_SECTOR_LEN: usize = 512;
const NTFS_OEM_ID: &[u8; 8] = b"NTFS    ";
const END_MARKER: u16 = 0xAA55;

const MFT_SIGNATURE: &[u8; 4] = b"FILE";
const MFT_RECORD_IN_USE: u16 = 0x0001;
const MFT_RECORD_IS_DIRECTORY: u16 = 0x0002;
const MAX_RECORD_SIZE: u32 = 4096;

const AT_FILE_NAME: u32 = 0x30;
const AT_DATA: u32 = 0x80;
const AT_END: u32 = 0xFFFF_FFFF;

/// Win32 and Win32+DOS name namespaces, preferred over DOS 8.3 names.
const NS_WIN32: u8 = 2;
const NS_WIN32_DOS: u8 = 3;

const MAX_MFT_RECORDS: u32 = 100_000;
const MAX_RUN_CLUSTERS: u64 = 50_000;

const CONFIDENCE_DELETED: f64 = 0.70;
const CONFIDENCE_LIVE: f64 = 0.95;

/// Fields of the NTFS boot sector this parser needs.
#[derive(Debug)]
struct BootSector {
    bytes_per_sector: u16,
    sectors_per_cluster: u8,
    mft_lcn: u64,
    mft_mirror_lcn: u64,
    clusters_per_mft_record: i8,
    end_marker: u16,
    oem_ok: bool,
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

        cursor.set_position(48);
        let mft_lcn = cursor.read_u64::<LittleEndian>().ok()?;
        let mft_mirror_lcn = cursor.read_u64::<LittleEndian>().ok()?;

        cursor.set_position(64);
        let clusters_per_mft_record = cursor.read_i8().ok()?;

        cursor.set_position(510);
        let end_marker = cursor.read_u16::<LittleEndian>().ok()?;

        Some(Self {
            bytes_per_sector,
            sectors_per_cluster,
            mft_lcn,
            mft_mirror_lcn,
            clusters_per_mft_record,
            end_marker,
            oem_ok: &data[3..11] == NTFS_OEM_ID,
        })
    }

    fn is_valid(&self) -> bool {
        self.oem_ok
            && self.end_marker == END_MARKER
            && self.bytes_per_sector == 512
            && self.sectors_per_cluster != 0
            && self.sectors_per_cluster.is_power_of_two()
            && self.mft_lcn != 0
            && self.mft_mirror_lcn != 0
    }

    fn cluster_size(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    fn mft_offset(&self) -> u64 {
        self.mft_lcn * self.cluster_size()
    }

    /// Positive values count clusters; negative values encode the
    /// record size as a power of two (typically 1024).
    fn mft_record_size(&self) -> u64 {
        if self.clusters_per_mft_record > 0 {
            self.clusters_per_mft_record as u64 * self.cluster_size()
        } else {
            let shift = -(self.clusters_per_mft_record as i32) as u32;
            if shift >= 32 {
                0
            } else {
                1u64 << shift
            }
        }
    }
}

/// Fixed header of one MFT FILE record.
struct MftRecord {
    sequence_number: u16,
    first_attribute_offset: u16,
    flags: u16,
    used_size: u32,
    allocated_size: u32,
}

impl MftRecord {
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 48 || &data[0..4] != MFT_SIGNATURE {
            return None;
        }
        let mut cursor = Cursor::new(data);

        cursor.set_position(16);
        let sequence_number = cursor.read_u16::<LittleEndian>().ok()?;

        cursor.set_position(20);
        let first_attribute_offset = cursor.read_u16::<LittleEndian>().ok()?;
        let flags = cursor.read_u16::<LittleEndian>().ok()?;
        let used_size = cursor.read_u32::<LittleEndian>().ok()?;
        let allocated_size = cursor.read_u32::<LittleEndian>().ok()?;

        Some(Self {
            sequence_number,
            first_attribute_offset,
            flags,
            used_size,
            allocated_size,
        })
    }

    fn is_valid(&self) -> bool {
        self.used_size <= self.allocated_size && self.allocated_size <= MAX_RECORD_SIZE
    }

    fn is_directory(&self) -> bool {
        self.flags & MFT_RECORD_IS_DIRECTORY != 0
    }

    /// Deleted when the in-use flag is clear, or (heuristically) when
    /// the sequence number shows the record has been reused before.
    fn is_deleted(&self) -> bool {
        self.flags & MFT_RECORD_IN_USE == 0 || self.sequence_number > 1
    }
}

/// One attribute header inside a FILE record.
struct Attribute {
    attr_type: u32,
    length: u32,
    non_resident: bool,
    // Resident
    value_length: u32,
    value_offset: u16,
    // Non-resident
    run_list_offset: u16,
    data_size: u64,
}

impl Attribute {
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 16 {
            return None;
        }
        let mut cursor = Cursor::new(data);

        let attr_type = cursor.read_u32::<LittleEndian>().ok()?;
        if attr_type == AT_END {
            return Some(Self {
                attr_type,
                length: 0,
                non_resident: false,
                value_length: 0,
                value_offset: 0,
                run_list_offset: 0,
                data_size: 0,
            });
        }

        let length = cursor.read_u32::<LittleEndian>().ok()?;
        let non_resident = cursor.read_u8().ok()? != 0;

        let mut attribute = Self {
            attr_type,
            length,
            non_resident,
            value_length: 0,
            value_offset: 0,
            run_list_offset: 0,
            data_size: 0,
        };

        if non_resident {
            if data.len() < 56 {
                return None;
            }
            cursor.set_position(32);
            attribute.run_list_offset = cursor.read_u16::<LittleEndian>().ok()?;
            cursor.set_position(48);
            attribute.data_size = cursor.read_u64::<LittleEndian>().ok()?;
        } else {
            if data.len() < 24 {
                return None;
            }
            cursor.set_position(16);
            attribute.value_length = cursor.read_u32::<LittleEndian>().ok()?;
            attribute.value_offset = cursor.read_u16::<LittleEndian>().ok()?;
        }

        Some(attribute)
    }
}

pub struct NtfsParser;

impl NtfsParser {
    pub fn new() -> Self {
        Self
    }

    /// Extracts the filename from the record's `$FILE_NAME` attributes,
    /// preferring the Win32 namespaces over DOS 8.3 aliases.
    fn extract_filename(&self, record: &[u8], first_attribute: usize) -> Option<String> {
        let mut fallback = None;

        for (offset, attribute) in attribute_walk(record, first_attribute) {
            if attribute.attr_type != AT_FILE_NAME || attribute.non_resident {
                continue;
            }

            let value_start = offset + attribute.value_offset as usize;
            let value_end = value_start + attribute.value_length as usize;
            if value_end > record.len() || attribute.value_length < 66 {
                continue;
            }
            let value = &record[value_start..value_end];

            let name_length = value[64] as usize;
            let namespace = value[65];
            let name_end = 66 + name_length * 2;
            if name_length == 0 || name_end > value.len() {
                continue;
            }

            let name = decode_utf16le_name(&value[66..name_end]);
            if name.is_empty() {
                continue;
            }

            if namespace == NS_WIN32 || namespace == NS_WIN32_DOS {
                return Some(name);
            }
            fallback.get_or_insert(name);
        }

        fallback
    }

    /// Extracts data fragments from the record's `$DATA` attribute.
    /// `record_base` is the record's absolute offset in the parse
    /// window, needed to place resident payloads.
    fn extract_data(
        &self,
        record: &[u8],
        first_attribute: usize,
        record_base: u64,
        cluster_size: u64,
    ) -> (Vec<Fragment>, u64) {
        for (offset, attribute) in attribute_walk(record, first_attribute) {
            if attribute.attr_type != AT_DATA {
                continue;
            }

            if !attribute.non_resident {
                let value_start = offset + attribute.value_offset as usize;
                let size = attribute.value_length as u64;
                if size == 0 || value_start + size as usize > record.len() {
                    return (Vec::new(), 0);
                }
                let fragment = Fragment::new(record_base + value_start as u64, size);
                return (vec![fragment], size);
            }

            let run_start = offset + attribute.run_list_offset as usize;
            if run_start >= record.len() {
                return (Vec::new(), 0);
            }
            let runs = parse_run_list(&record[run_start..], cluster_size);
            let fragments = clip_runs_to_size(runs, attribute.data_size);
            let covered = fragments.iter().map(|f| f.size).sum();
            return (fragments, covered);
        }

        (Vec::new(), 0)
    }
}

impl Default for NtfsParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FilesystemParser for NtfsParser {
    fn can_parse(&self, data: &[u8]) -> bool {
        BootSector::parse(data).is_some_and(|boot| boot.is_valid())
    }

    fn fs_type(&self) -> FileSystemType {
        FileSystemType::Ntfs
    }

    fn recover_deleted(&self, data: &[u8]) -> Vec<RecoveredFile> {
        let Some(boot) = BootSector::parse(data).filter(|b| b.is_valid()) else {
            debug!("NTFS boot sector invalid, nothing to recover");
            return Vec::new();
        };

        let mft_offset = boot.mft_offset();
        let record_size = boot.mft_record_size();
        let cluster_size = boot.cluster_size();

        if mft_offset >= data.len() as u64 || record_size == 0 {
            debug!("MFT offset {mft_offset} outside the parse window");
            return Vec::new();
        }

        info!("walking MFT at offset {mft_offset}, record size {record_size}");

        let mut recovered = Vec::new();
        let mut offset = mft_offset;
        let mut records_seen = 0u32;

        while offset + record_size <= data.len() as u64 && records_seen < MAX_MFT_RECORDS {
            let record_bytes = &data[offset as usize..(offset + record_size) as usize];
            records_seen += 1;
            let record_base = offset;
            offset += record_size;

            let Some(record) = MftRecord::parse(record_bytes) else {
                continue;
            };
            if !record.is_valid() || record.is_directory() {
                continue;
            }

            let first_attribute = record.first_attribute_offset as usize;
            let Some(filename) = self.extract_filename(record_bytes, first_attribute) else {
                continue;
            };

            let (fragments, covered) =
                self.extract_data(record_bytes, first_attribute, record_base, cluster_size);
            if fragments.is_empty() || covered == 0 {
                continue;
            }

            let confidence = if record.is_deleted() {
                CONFIDENCE_DELETED
            } else {
                CONFIDENCE_LIVE
            };

            let file_type = filename
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_lowercase())
                .filter(|ext| !ext.is_empty())
                .unwrap_or_else(|| "unknown".to_string());

            debug!(
                "MFT record {}: {} ({} bytes, {})",
                records_seen,
                filename,
                covered,
                if record.is_deleted() { "deleted" } else { "live" }
            );

            recovered.push(RecoveredFile::fragmented(
                filename, &file_type, fragments, confidence,
            ));
        }

        info!(
            "NTFS metadata pass found {} files in {} records",
            recovered.len(),
            records_seen
        );
        recovered
    }

    fn info(&self, data: &[u8]) -> String {
        match BootSector::parse(data).filter(|b| b.is_valid()) {
            Some(boot) => format!(
                "NTFS filesystem\ncluster size: {} bytes\nMFT offset: {}\nMFT record size: {} bytes",
                boot.cluster_size(),
                boot.mft_offset(),
                boot.mft_record_size(),
            ),
            None => "NTFS filesystem (unrecognized boot sector)".to_string(),
        }
    }
}

/// Iterates attribute headers from `first_attribute` until the end
/// marker, a zero length, or the record boundary.
fn attribute_walk(record: &[u8], first_attribute: usize) -> Vec<(usize, Attribute)> {
    let mut attributes = Vec::new();
    let mut offset = first_attribute;

    while offset + 16 <= record.len() {
        let Some(attribute) = Attribute::parse(&record[offset..]) else {
            break;
        };
        if attribute.attr_type == AT_END || attribute.length == 0 {
            break;
        }
        let next = offset + attribute.length as usize;
        if next > record.len() {
            break;
        }
        attributes.push((offset, attribute));
        offset = next;
    }

    attributes
}

/// Decodes a UTF-16LE name to ASCII: printable characters pass,
/// control characters become `_`, everything else `?`.
fn decode_utf16le_name(raw: &[u8]) -> String {
    raw.chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .map(|unit| match unit {
            32..=126 => unit as u8 as char,
            0..=31 => '_',
            _ => '?',
        })
        .collect()
}

/// Decodes an NTFS run list into `(device offset, byte length)` runs.
///
/// Each run header's low nibble is the byte width of the length field,
/// the high nibble the width of the signed cluster delta. A zero
/// header ends the list. Sparse runs (zero offset width) allocate no
/// disk space: they produce no fragment but do not stop iteration.
fn parse_run_list(run_data: &[u8], cluster_size: u64) -> Vec<Fragment> {
    let mut runs = Vec::new();
    let mut pos = 0usize;
    let mut current_lcn: i64 = 0;
    let mut total_clusters: u64 = 0;

    while pos < run_data.len() {
        let header = run_data[pos];
        if header == 0 {
            break;
        }
        pos += 1;

        let length_width = (header & 0x0F) as usize;
        let offset_width = (header >> 4) as usize;
        if length_width == 0 || length_width > 8 || offset_width > 8 {
            break;
        }
        if pos + length_width + offset_width > run_data.len() {
            break;
        }

        let mut run_clusters: u64 = 0;
        for i in 0..length_width {
            run_clusters |= (run_data[pos + i] as u64) << (i * 8);
        }
        pos += length_width;

        if offset_width == 0 {
            // Sparse run: no on-disk data, keep walking.
            continue;
        }

        let mut delta: i64 = 0;
        for i in 0..offset_width {
            delta |= (run_data[pos + i] as i64) << (i * 8);
        }
        // Sign-extend from the top bit of the offset field.
        let shift = 64 - offset_width * 8;
        delta = (delta << shift) >> shift;
        pos += offset_width;

        current_lcn += delta;
        if current_lcn < 0 || run_clusters == 0 {
            break;
        }

        if total_clusters + run_clusters > MAX_RUN_CLUSTERS {
            debug!("run list exceeds {MAX_RUN_CLUSTERS} clusters, truncating");
            break;
        }
        total_clusters += run_clusters;

        runs.push(Fragment::new(
            current_lcn as u64 * cluster_size,
            run_clusters * cluster_size,
        ));
    }

    runs
}

/// Clips run fragments so their sizes sum to at most `file_size`.
fn clip_runs_to_size(runs: Vec<Fragment>, file_size: u64) -> Vec<Fragment> {
    let mut fragments = Vec::new();
    let mut remaining = file_size;

    for run in runs {
        if remaining == 0 {
            break;
        }
        let size = run.size.min(remaining);
        fragments.push(Fragment::new(run.offset, size));
        remaining -= size;
    }

    fragments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_list_simple_and_sparse() {
        // Run 1: header 0x11 -> 1-byte length (4 clusters), 1-byte
        // offset (+2). Run 2: header 0x01 -> sparse, 3 clusters.
        // Run 3: header 0x11 -> 2 clusters at delta +5.
        let data = [0x11, 0x04, 0x02, 0x01, 0x03, 0x11, 0x02, 0x05, 0x00];
        let runs = parse_run_list(&data, 4096);

        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0], Fragment::new(2 * 4096, 4 * 4096));
        // Sparse run skipped, delta accumulates from LCN 2.
        assert_eq!(runs[1], Fragment::new(7 * 4096, 2 * 4096));
    }

    #[test]
    fn test_run_list_negative_delta() {
        // 3 clusters at +10, then 1 cluster at -4 (0xFC sign-extends).
        let data = [0x11, 0x03, 0x0A, 0x11, 0x01, 0xFC, 0x00];
        let runs = parse_run_list(&data, 512);

        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].offset, 10 * 512);
        assert_eq!(runs[1].offset, 6 * 512);
    }

    #[test]
    fn test_clip_runs() {
        let runs = vec![Fragment::new(0, 4096), Fragment::new(8192, 4096)];
        let clipped = clip_runs_to_size(runs, 5000);
        assert_eq!(clipped.len(), 2);
        assert_eq!(clipped[0].size, 4096);
        assert_eq!(clipped[1].size, 904);
    }

    #[test]
    fn test_decode_name_sanitizes() {
        // "a<NUL>b" in UTF-16LE plus a non-ASCII unit.
        let raw = [b'a', 0, 0, 0, b'b', 0, 0x3B, 0x26];
        assert_eq!(decode_utf16le_name(&raw), "a_b?");
    }

    #[test]
    fn test_boot_sector_validation() {
        let mut data = vec![0u8; 512];
        data[3..11].copy_from_slice(NTFS_OEM_ID);
        data[11..13].copy_from_slice(&512u16.to_le_bytes());
        data[13] = 8;
        data[48..56].copy_from_slice(&4u64.to_le_bytes()); // MFT LCN
        data[56..64].copy_from_slice(&8u64.to_le_bytes()); // mirror
        data[64] = (-10i8) as u8; // 1024-byte records
        data[510..512].copy_from_slice(&END_MARKER.to_le_bytes());

        let boot = BootSector::parse(&data).unwrap();
        assert!(boot.is_valid());
        assert_eq!(boot.cluster_size(), 4096);
        assert_eq!(boot.mft_record_size(), 1024);
        assert_eq!(boot.mft_offset(), 16384);

        // Non-power-of-two cluster factor is rejected.
        data[13] = 3;
        assert!(!BootSector::parse(&data).unwrap().is_valid());
    }
}
