//! JPEG format engine
//!
//! Bounds JPEG files by scanning for the EOI marker, with a
//! segment-chain walk as fallback estimator when the marker never
//! shows up.

use super::{emission_threshold, MIN_CARVED_SIZE};
use crate::binary::{confidence_score, find_all_multi, recovered_filename, shannon_entropy};
use crate::domain::entities::{Fragment, RecoveredFile};
use crate::domain::services::FormatEngine;
use log::debug;

const SIGNATURES: [&[u8]; 3] = [
    &[0xFF, 0xD8, 0xFF, 0xE0], // JFIF
    &[0xFF, 0xD8, 0xFF, 0xE1], // EXIF
    &[0xFF, 0xD8, 0xFF, 0xDB], // raw quantization-first
];
const FOOTERS: [&[u8]; 1] = [&[0xFF, 0xD9]];
const TYPES: [&str; 2] = ["JPEG", "JPG"];

const MAX_SIZE: u64 = 100 * 1024 * 1024;
const MIN_JPEG_LEN: usize = 10;
const MAX_SEGMENTS: usize = 100;
const ENTROPY_SAMPLE: usize = 4096;

pub struct JpegEngine;

impl JpegEngine {
    pub fn new() -> Self {
        Self
    }

    /// Byte length of the JPEG starting at `start`, when a boundary can
    /// be established. The bool is true when a real EOI marker bounded
    /// the file, false when the segment-walk estimate was used.
    fn find_jpeg_end(&self, data: &[u8], start: usize) -> Option<(usize, bool)> {
        if start + MIN_JPEG_LEN >= data.len() {
            return None;
        }

        let limit = data.len().min(start.saturating_add(MAX_SIZE as usize));
        let mut i = start + MIN_JPEG_LEN;
        while i + 1 < limit {
            if data[i] == 0xFF && data[i + 1] == 0xD9 {
                return Some((i + 2 - start, true));
            }
            i += 1;
        }

        // No EOI in range: estimate from the segment chain. The result
        // may overshoot the true end when trailing garbage parses as a
        // segment, so it carries lower confidence downstream.
        let estimate = segment_walk_end(&data[start..limit]);
        if estimate > 0 {
            Some((estimate, false))
        } else {
            None
        }
    }
}

impl Default for JpegEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatEngine for JpegEngine {
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
        if data.len() < MIN_JPEG_LEN {
            return recovered;
        }

        let mut matches = find_all_multi(data, &SIGNATURES);
        matches.sort_unstable_by_key(|&(offset, _)| offset);

        for (offset, _) in matches {
            let Some((size, _bounded)) = self.find_jpeg_end(data, offset) else {
                continue;
            };

            if (size as u64) < MIN_CARVED_SIZE && data.len() >= 1024 {
                continue;
            }

            let mut file = RecoveredFile::fragmented(
                recovered_filename(base_offset + offset as u64, "jpg"),
                "JPEG",
                vec![Fragment::new(base_offset + offset as u64, size as u64)],
                0.0,
            );
            let confidence = self.validate(&file, &data[offset..offset + size]);

            if confidence > emission_threshold(data.len()) {
                if let Some((width, height)) = frame_dimensions(&data[offset..offset + size]) {
                    debug!("JPEG at {} is {width}x{height}", file.start_offset);
                }
                debug!(
                    "JPEG at offset {}, size {}, confidence {:.2}",
                    file.start_offset, size, confidence
                );
                file.confidence_score = confidence;
                recovered.push(file);
            }
        }

        recovered
    }

    fn validate(&self, file: &RecoveredFile, data: &[u8]) -> f64 {
        let size = (file.file_size as usize).min(data.len());
        if size < MIN_JPEG_LEN {
            return 0.0;
        }
        let data = &data[..size];

        let header_ok = SIGNATURES.iter().any(|sig| data.starts_with(sig));
        let footer_ok = data[size - 2] == 0xFF && data[size - 1] == 0xD9;
        let structure_ok = has_valid_segments(data);
        let entropy = shannon_entropy(&data[..size.min(ENTROPY_SAMPLE)]);

        confidence_score(header_ok, footer_ok, entropy, structure_ok)
    }
}

/// Walks the segment chain and returns the offset just past the last
/// coherent segment (0 when the chain never starts).
fn segment_walk_end(data: &[u8]) -> usize {
    let mut offset = 2; // past SOI
    let mut last_valid = 0;
    let mut segments = 0;

    while offset + 1 < data.len() && segments < MAX_SEGMENTS {
        if data[offset] != 0xFF {
            break;
        }
        let marker = data[offset + 1];

        match marker {
            // Byte stuffing and fill bytes carry no length.
            0x00 | 0xFF => {
                offset += 2;
                continue;
            }
            0xD9 => return offset + 2,
            // Restart markers have no length field.
            0xD0..=0xD7 => {
                offset += 2;
                last_valid = offset;
                segments += 1;
                continue;
            }
            _ => {}
        }

        if offset + 3 >= data.len() {
            break;
        }
        let length = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        if length < 2 || offset + 2 + length > data.len() {
            break;
        }
        offset += 2 + length;
        last_valid = offset;
        segments += 1;
    }

    last_valid
}

/// Image dimensions from the first SOF0/SOF2 frame header, searched
/// within the leading 1 KiB.
pub fn frame_dimensions(data: &[u8]) -> Option<(u16, u16)> {
    let scan = data.len().min(1024);
    for i in 0..scan.saturating_sub(9) {
        if data[i] == 0xFF && (data[i + 1] == 0xC0 || data[i + 1] == 0xC2) {
            let height = u16::from_be_bytes([data[i + 5], data[i + 6]]);
            let width = u16::from_be_bytes([data[i + 7], data[i + 8]]);
            if width > 0 && height > 0 {
                return Some((width, height));
            }
        }
    }
    None
}

/// Structure check: the chain walk sees at least one coherent segment.
fn has_valid_segments(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }

    let mut offset = 2;
    let mut segments = 0;

    while offset + 1 < data.len() && segments < MAX_SEGMENTS {
        if data[offset] != 0xFF {
            break;
        }
        let marker = data[offset + 1];

        match marker {
            0x00 | 0xFF => {
                offset += 2;
                continue;
            }
            0xD9 => return true,
            0xD0..=0xD7 => {
                offset += 2;
                segments += 1;
                continue;
            }
            _ => {}
        }

        if offset + 3 >= data.len() {
            break;
        }
        let length = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        if length < 2 {
            break;
        }
        offset += 2 + length;
        segments += 1;
    }

    segments > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_jpeg() -> Vec<u8> {
        // SOI + APP0 (JFIF, length 16) + payload + EOI
        let mut jpeg = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
        jpeg.extend_from_slice(b"JFIF");
        jpeg.extend(std::iter::repeat(0x11).take(10));
        jpeg.extend((0u16..80).map(|i| (i * 7 % 251) as u8));
        jpeg.extend_from_slice(&[0xFF, 0xD9]);
        jpeg
    }

    #[test]
    fn test_carve_emits_nothing_for_empty_input() {
        assert!(JpegEngine::new().carve(&[], 0).is_empty());
    }

    #[test]
    fn test_carve_minimal_jpeg() {
        let jpeg = minimal_jpeg();
        let files = JpegEngine::new().carve(&jpeg, 0);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_size, jpeg.len() as u64);
        assert_eq!(files[0].file_type, "JPEG");
    }

    #[test]
    fn test_signature_at_final_bytes_yields_nothing() {
        let mut data = vec![0u8; 64];
        let n = data.len();
        data[n - 4..].copy_from_slice(&[0xFF, 0xD8, 0xFF, 0xE0]);
        assert!(JpegEngine::new().carve(&data, 0).is_empty());
    }

    #[test]
    fn test_segment_walk_stops_on_garbage() {
        // SOI + one APP0 segment, then non-marker bytes.
        let mut data = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x04, 0xAA, 0xBB];
        data.extend_from_slice(&[0x10, 0x20, 0x30]);
        assert_eq!(segment_walk_end(&data), 8);
        assert!(has_valid_segments(&data));
    }

    #[test]
    fn test_frame_dimensions_from_sof0() {
        // SOI + SOF0: length 11, precision 8, 480x640, 1 component.
        let data = [
            0xFF, 0xD8, 0xFF, 0xC0, 0x00, 0x0B, 0x08, 0x01, 0xE0, 0x02, 0x80, 0x01, 0x11, 0x00,
        ];
        assert_eq!(frame_dimensions(&data), Some((640, 480)));
        assert_eq!(frame_dimensions(&[0xFF, 0xD8]), None);
    }

    #[test]
    fn test_base_offset_is_applied() {
        let jpeg = minimal_jpeg();
        let files = JpegEngine::new().carve(&jpeg, 7000);
        assert_eq!(files[0].start_offset, 7000);
        assert!(files[0].filename.contains("recovered_"));
    }
}
