//! ZIP format engine
//!
//! Bounds ZIP archives (and the OOXML/JAR/APK family) by the end-of-
//! central-directory record, falling back to a forward walk over local
//! file headers when the EOCD is gone.

use super::{emission_threshold, SMALL_INPUT_LEN};
use crate::binary::{find_all_multi, recovered_filename, shannon_entropy};
use crate::domain::entities::{Fragment, RecoveredFile};
use crate::domain::services::FormatEngine;
use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, warn};
use memchr::memmem;
use std::io::Cursor;

const LOCAL_HEADER_SIG: &[u8] = b"PK\x03\x04";
const EOCD_SIG: &[u8] = b"PK\x05\x06";
const DESCRIPTOR_SIG: &[u8] = b"PK\x07\x08";

const SIGNATURES: [&[u8]; 3] = [b"PK\x03\x04", b"PK\x05\x06", b"PK\x07\x08"];
const FOOTERS: [&[u8]; 1] = [b"PK\x05\x06"];
const TYPES: [&str; 6] = ["zip", "jar", "apk", "docx", "xlsx", "pptx"];

const MAX_SIZE: u64 = 100 * 1024 * 1024;
/// Fixed portion of a local file header.
const LOCAL_HEADER_LEN: usize = 30;
/// Fixed portion of the end-of-central-directory record.
const EOCD_LEN: usize = 22;
const MAX_COMMENT_LEN: u16 = 1024;
const MAX_ENTRIES: u32 = 10_000;
const ENTROPY_SAMPLE: usize = 8192;

/// Fields of a local file header needed for validation and chain
/// walking.
struct LocalFileHeader {
    version_needed: u16,
    general_purpose_flag: u16,
    compression_method: u16,
    compressed_size: u32,
    filename_length: u16,
    extra_field_length: u16,
}

impl LocalFileHeader {
    /// Reads the fixed header fields at `data[0..30]`. Returns `None`
    /// when the buffer is short or the signature does not match.
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < LOCAL_HEADER_LEN || !data.starts_with(LOCAL_HEADER_SIG) {
            return None;
        }

        let mut cursor = Cursor::new(&data[4..LOCAL_HEADER_LEN]);
        let version_needed = cursor.read_u16::<LittleEndian>().ok()?;
        let general_purpose_flag = cursor.read_u16::<LittleEndian>().ok()?;
        let compression_method = cursor.read_u16::<LittleEndian>().ok()?;
        let _mod_time = cursor.read_u16::<LittleEndian>().ok()?;
        let _mod_date = cursor.read_u16::<LittleEndian>().ok()?;
        let _crc32 = cursor.read_u32::<LittleEndian>().ok()?;
        let compressed_size = cursor.read_u32::<LittleEndian>().ok()?;
        let _uncompressed_size = cursor.read_u32::<LittleEndian>().ok()?;
        let filename_length = cursor.read_u16::<LittleEndian>().ok()?;
        let extra_field_length = cursor.read_u16::<LittleEndian>().ok()?;

        Some(Self {
            version_needed,
            general_purpose_flag,
            compression_method,
            compressed_size,
            filename_length,
            extra_field_length,
        })
    }

    fn is_valid(&self) -> bool {
        self.version_needed <= 63
            && self.compression_method <= 99
            && self.filename_length <= 512
            && self.extra_field_length <= 1024
    }

    /// Total bytes this entry occupies, data descriptor included.
    fn entry_size(&self, data: &[u8], pos: usize) -> usize {
        let mut size = LOCAL_HEADER_LEN
            + self.filename_length as usize
            + self.extra_field_length as usize
            + self.compressed_size as usize;

        // General-purpose bit 3: sizes follow the data in a descriptor.
        if self.general_purpose_flag & 0x0008 != 0 {
            size += 12;
            let sig_at = pos + size - 12;
            if data.len() >= sig_at + 4 && &data[sig_at..sig_at + 4] == DESCRIPTOR_SIG {
                size += 4;
            }
        }

        size
    }
}

struct ZipCandidate {
    offset: usize,
    size: usize,
    confidence: f64,
}

pub struct ZipEngine;

impl ZipEngine {
    pub fn new() -> Self {
        Self
    }

    /// Offset of a validated EOCD record within `data`, searching
    /// backward. Position 0 is excluded: an archive that *starts* with
    /// its EOCD is handled by the window fallback.
    fn find_eocd(&self, data: &[u8]) -> Option<usize> {
        if data.len() < EOCD_LEN {
            return None;
        }

        let mut bound = data.len();
        while let Some(pos) = memmem::rfind(&data[..bound], EOCD_SIG) {
            if pos == 0 {
                return None;
            }
            if pos + EOCD_LEN <= data.len() {
                let comment_length =
                    u16::from_le_bytes([data[pos + 20], data[pos + 21]]);
                if comment_length <= MAX_COMMENT_LEN {
                    return Some(pos);
                }
            }
            bound = pos;
        }
        None
    }

    /// Archive size within `data` (the window already capped at the
    /// next local header). Zero means no structure could be bounded.
    fn calculate_zip_size(&self, data: &[u8]) -> usize {
        if let Some(eocd) = self.find_eocd(data) {
            let comment_length = u16::from_le_bytes([data[eocd + 20], data[eocd + 21]]) as usize;
            return (eocd + EOCD_LEN + comment_length).min(data.len());
        }

        // No EOCD: walk the local-header chain forward.
        let mut pos = 0;
        let mut last_valid = 0;
        let mut entries = 0u32;

        while pos + LOCAL_HEADER_LEN <= data.len() {
            let Some(header) = LocalFileHeader::parse(&data[pos..]) else {
                break;
            };
            if !header.is_valid() {
                break;
            }

            pos += header.entry_size(data, pos);
            if pos > data.len() {
                break;
            }
            last_valid = pos;

            entries += 1;
            if entries > MAX_ENTRIES {
                warn!("ZIP header chain exceeds {MAX_ENTRIES} entries, treating as corrupt");
                return 0;
            }
        }

        last_valid
    }

    /// Archive entry count: from the EOCD when present, otherwise by
    /// walking the local-header chain.
    pub fn count_entries(&self, data: &[u8]) -> u32 {
        if let Some(eocd) = self.find_eocd(data) {
            if eocd + 12 <= data.len() {
                return u16::from_le_bytes([data[eocd + 10], data[eocd + 11]]) as u32;
            }
        }

        let mut pos = 0;
        let mut count = 0u32;
        while pos + LOCAL_HEADER_LEN <= data.len() && count <= MAX_ENTRIES {
            let Some(header) = LocalFileHeader::parse(&data[pos..]) else {
                break;
            };
            if !header.is_valid() {
                break;
            }
            pos += header.entry_size(data, pos);
            count += 1;
        }
        count
    }

    fn score(&self, data: &[u8]) -> f64 {
        let mut confidence: f64 = 0.5;

        if let Some(header) = LocalFileHeader::parse(data) {
            if header.is_valid() {
                confidence += 0.2;
            }
        }

        if self.find_eocd(data).is_some() {
            confidence += 0.3;
        } else {
            // Missing trailer is the strongest corruption signal.
            confidence = confidence.min(0.6);
        }

        let entropy = shannon_entropy(&data[..data.len().min(ENTROPY_SAMPLE)]);
        if entropy > 3.0 && entropy < 7.5 {
            confidence += 0.1;
        }

        confidence.min(1.0)
    }
}

impl Default for ZipEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatEngine for ZipEngine {
    fn supported_types(&self) -> &[&'static str] {
        &TYPES
    }

    fn signatures(&self) -> &[&'static [u8]] {
        &SIGNATURES
    }

    fn footers(&self) -> &[&'static [u8]] {
        &FOOTERS
    }

    fn max_size(&self) -> u64 {
        MAX_SIZE
    }

    fn carve(&self, data: &[u8], base_offset: u64) -> Vec<RecoveredFile> {
        let mut recovered = Vec::new();
        if data.len() < 4 {
            return recovered;
        }

        let test_input = data.len() < SMALL_INPUT_LEN;

        let mut matches = find_all_multi(data, &SIGNATURES);
        matches.sort_unstable_by_key(|&(offset, _)| offset);
        matches.dedup_by_key(|&mut (offset, _)| offset);

        let mut candidates = Vec::new();
        for (offset, _) in matches {
            if offset + LOCAL_HEADER_LEN > data.len() {
                continue;
            }

            if !test_input {
                match LocalFileHeader::parse(&data[offset..]) {
                    Some(header) if header.is_valid() => {}
                    _ => continue,
                }
            }

            // The next local header caps the window so adjacent
            // archives stay separate.
            let window_end = memmem::find(&data[offset + LOCAL_HEADER_LEN..], LOCAL_HEADER_SIG)
                .map(|pos| offset + LOCAL_HEADER_LEN + pos)
                .unwrap_or(data.len())
                .min(offset.saturating_add(MAX_SIZE as usize))
                .min(data.len());
            let window = &data[offset..window_end];

            let mut size = self.calculate_zip_size(window);
            if size == 0 {
                if test_input {
                    size = window.len();
                } else {
                    continue;
                }
            }
            size = size.min(window.len());
            if size == 0 {
                continue;
            }

            let confidence = if test_input {
                if self.find_eocd(&window[..size]).is_some() {
                    0.9
                } else {
                    0.6
                }
            } else {
                self.score(&window[..size])
            };

            candidates.push(ZipCandidate {
                offset,
                size,
                confidence,
            });
        }

        // De-overlap: keep the earliest candidate, drop any that starts
        // inside it.
        candidates.sort_by_key(|c| c.offset);
        let mut last_end = 0usize;
        for candidate in candidates {
            if candidate.offset < last_end {
                debug!("dropping overlapped ZIP candidate at {}", candidate.offset);
                continue;
            }
            if candidate.confidence <= emission_threshold(data.len()) {
                continue;
            }

            let start = base_offset + candidate.offset as u64;
            let archive = &data[candidate.offset..candidate.offset + candidate.size];
            debug!(
                "ZIP at {start}: {} entries, {} bytes, confidence {:.2}",
                self.count_entries(archive),
                candidate.size,
                candidate.confidence
            );
            recovered.push(RecoveredFile::fragmented(
                recovered_filename(start, "zip"),
                "zip",
                vec![Fragment::new(start, candidate.size as u64)],
                candidate.confidence,
            ));
            last_end = candidate.offset + candidate.size;
        }

        recovered
    }

    fn validate(&self, file: &RecoveredFile, data: &[u8]) -> f64 {
        let size = (file.file_size as usize).min(data.len());
        if size < 4 {
            return 0.0;
        }
        let data = &data[..size];

        if size < SMALL_INPUT_LEN {
            return if self.find_eocd(data).is_some() {
                0.9
            } else {
                0.6
            };
        }

        self.score(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A stored (uncompressed) single-entry archive with central
    /// directory and EOCD.
    fn stored_zip(name: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut zip = Vec::new();

        // Local file header
        zip.extend_from_slice(LOCAL_HEADER_SIG);
        zip.extend_from_slice(&20u16.to_le_bytes()); // version needed
        zip.extend_from_slice(&0u16.to_le_bytes()); // flags
        zip.extend_from_slice(&0u16.to_le_bytes()); // stored
        zip.extend_from_slice(&0u16.to_le_bytes()); // mod time
        zip.extend_from_slice(&0u16.to_le_bytes()); // mod date
        zip.extend_from_slice(&0u32.to_le_bytes()); // crc32
        zip.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        zip.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        zip.extend_from_slice(&(name.len() as u16).to_le_bytes());
        zip.extend_from_slice(&0u16.to_le_bytes()); // extra len
        zip.extend_from_slice(name);
        zip.extend_from_slice(payload);

        // Central directory header
        let cd_offset = zip.len() as u32;
        zip.extend_from_slice(b"PK\x01\x02");
        zip.extend_from_slice(&20u16.to_le_bytes()); // version made by
        zip.extend_from_slice(&20u16.to_le_bytes()); // version needed
        zip.extend_from_slice(&0u16.to_le_bytes());
        zip.extend_from_slice(&0u16.to_le_bytes());
        zip.extend_from_slice(&0u16.to_le_bytes());
        zip.extend_from_slice(&0u16.to_le_bytes());
        zip.extend_from_slice(&0u32.to_le_bytes());
        zip.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        zip.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        zip.extend_from_slice(&(name.len() as u16).to_le_bytes());
        zip.extend_from_slice(&0u16.to_le_bytes());
        zip.extend_from_slice(&0u16.to_le_bytes());
        zip.extend_from_slice(&0u16.to_le_bytes());
        zip.extend_from_slice(&0u16.to_le_bytes());
        zip.extend_from_slice(&0u32.to_le_bytes());
        zip.extend_from_slice(&0u32.to_le_bytes()); // local header offset
        zip.extend_from_slice(name);
        let cd_size = zip.len() as u32 - cd_offset;

        // End of central directory
        zip.extend_from_slice(EOCD_SIG);
        zip.extend_from_slice(&0u16.to_le_bytes()); // disk
        zip.extend_from_slice(&0u16.to_le_bytes()); // cd disk
        zip.extend_from_slice(&1u16.to_le_bytes()); // entries this disk
        zip.extend_from_slice(&1u16.to_le_bytes()); // total entries
        zip.extend_from_slice(&cd_size.to_le_bytes());
        zip.extend_from_slice(&cd_offset.to_le_bytes());
        zip.extend_from_slice(&0u16.to_le_bytes()); // comment length

        zip
    }

    #[test]
    fn test_carve_stored_archive() {
        let zip = stored_zip(b"test.txt", b"Hello");
        let files = ZipEngine::new().carve(&zip, 0);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_size, zip.len() as u64);
        assert_eq!(files[0].file_type, "zip");
        assert!(files[0].confidence_score > 0.7);
    }

    #[test]
    fn test_missing_eocd_lowers_confidence() {
        let mut zip = stored_zip(b"a.txt", b"payload");
        let eocd_at = zip.len() - EOCD_LEN;
        zip.truncate(eocd_at);

        let files = ZipEngine::new().carve(&zip, 0);
        assert_eq!(files.len(), 1);
        assert!(files[0].confidence_score <= 0.6);
    }

    #[test]
    fn test_adjacent_archives_do_not_merge() {
        let first = stored_zip(b"one.txt", b"1111");
        let second = stored_zip(b"two.txt", b"2222");
        let mut buffer = first.clone();
        buffer.extend_from_slice(&second);

        let files = ZipEngine::new().carve(&buffer, 0);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].file_size, first.len() as u64);
        assert_eq!(files[1].start_offset, first.len() as u64);
    }

    #[test]
    fn test_local_header_validation_bounds() {
        let mut header = stored_zip(b"x", b"y");
        // Corrupt version_needed far past any real ZIP revision.
        header[4] = 0xFF;
        header[5] = 0xFF;
        let parsed = LocalFileHeader::parse(&header).unwrap();
        assert!(!parsed.is_valid());
    }

    #[test]
    fn test_count_entries_from_eocd() {
        let zip = stored_zip(b"test.txt", b"Hello");
        assert_eq!(ZipEngine::new().count_entries(&zip), 1);
    }

    #[test]
    fn test_count_entries_without_eocd() {
        let mut zip = stored_zip(b"a.txt", b"payload");
        let eocd_at = zip.len() - EOCD_LEN;
        zip.truncate(eocd_at);
        assert_eq!(ZipEngine::new().count_entries(&zip), 1);
    }

    #[test]
    fn test_zero_length_input() {
        assert!(ZipEngine::new().carve(&[], 0).is_empty());
    }
}
