//! PDF format engine
//!
//! Bounds PDF documents by the trailing `%%EOF`, searched backward from
//! the next document header so adjacent PDFs never swallow each other.

use super::{emission_threshold, MIN_CARVED_SIZE, SMALL_INPUT_LEN};
use crate::binary::{confidence_score, find_all, recovered_filename, shannon_entropy};
use crate::domain::entities::{Fragment, RecoveredFile};
use crate::domain::services::FormatEngine;
use log::debug;
use memchr::memmem;

const PDF_SIGNATURE: &[u8] = b"%PDF-";
const SIGNATURES: [&[u8]; 1] = [PDF_SIGNATURE];
const FOOTERS: [&[u8]; 3] = [b"%%EOF", b"\n%%EOF", b"\r\n%%EOF"];
const TYPES: [&str; 1] = ["PDF"];

const MAX_SIZE: u64 = 1024 * 1024 * 1024;
const MIN_PDF_LEN: usize = 20;
const ENTROPY_SAMPLE: usize = 4096;
/// Trailer search window when re-validating a whole document.
const TRAILER_WINDOW: usize = 1024;
/// Caps for the structural fallback estimator.
const ESTIMATE_SCAN: usize = 32 * 1024;
const ESTIMATE_PADDING: usize = 100;
const ESTIMATE_CAP: usize = 10 * 1024 * 1024;

pub struct PdfEngine;

impl PdfEngine {
    pub fn new() -> Self {
        Self
    }

    /// Byte length of the PDF starting at `start`.
    ///
    /// The next `%PDF-` occurrence is a hard upper bound; the last
    /// `%%EOF` before it wins. Without a footer the next-document
    /// boundary is used, and failing both, a structural estimate from
    /// the last object keyword (heuristic, reflected in confidence).
    fn find_pdf_end(&self, data: &[u8], start: usize) -> Option<usize> {
        if start + MIN_PDF_LEN >= data.len() {
            return None;
        }

        let next_pdf = memmem::find(&data[start + PDF_SIGNATURE.len()..], PDF_SIGNATURE)
            .map(|pos| start + PDF_SIGNATURE.len() + pos);

        let bound = next_pdf
            .unwrap_or(data.len())
            .min(start.saturating_add(MAX_SIZE as usize))
            .min(data.len());

        if let Some(pos) = memmem::rfind(&data[start..bound], b"%%EOF") {
            return Some(pos + b"%%EOF".len());
        }

        if let Some(boundary) = next_pdf {
            debug!("PDF at {start} has no trailer, bounded by next document at {boundary}");
            return Some(boundary - start);
        }

        Some(estimate_pdf_size(&data[start..bound]))
    }
}

impl Default for PdfEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatEngine for PdfEngine {
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
        if data.len() < MIN_PDF_LEN {
            return recovered;
        }

        for offset in find_all(data, PDF_SIGNATURE) {
            let Some(size) = self.find_pdf_end(data, offset) else {
                continue;
            };
            if size == 0 {
                continue;
            }
            if (size as u64) < MIN_CARVED_SIZE && data.len() >= SMALL_INPUT_LEN {
                continue;
            }

            let mut file = RecoveredFile::fragmented(
                recovered_filename(base_offset + offset as u64, "pdf"),
                "PDF",
                vec![Fragment::new(base_offset + offset as u64, size as u64)],
                0.0,
            );
            let confidence = self.validate(&file, &data[offset..offset + size]);

            if confidence > emission_threshold(data.len()) {
                if let Some(version) = pdf_version(&data[offset..offset + size]) {
                    debug!("PDF at {} declares version {version}", file.start_offset);
                }
                debug!(
                    "PDF at offset {}, size {}, confidence {:.2}",
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
        if size < MIN_PDF_LEN {
            return 0.0;
        }
        let data = &data[..size];

        let header_ok = data.starts_with(PDF_SIGNATURE);
        let footer_ok = has_valid_trailer(data);
        let structure_ok = has_valid_structure(data);
        let entropy = shannon_entropy(&data[..size.min(ENTROPY_SAMPLE)]);

        // A document without its trailer was bounded heuristically:
        // pin the score at 0.5 so the uncertainty is visible.
        if !footer_ok {
            return 0.5;
        }

        confidence_score(header_ok, footer_ok, entropy, structure_ok)
    }
}

/// Version string from the header, e.g. `1.4`.
pub fn pdf_version(data: &[u8]) -> Option<String> {
    if !data.starts_with(PDF_SIGNATURE) || data.len() < 8 {
        return None;
    }

    let version: String = data[PDF_SIGNATURE.len()..]
        .iter()
        .take(3)
        .take_while(|&&b| b.is_ascii_digit() || b == b'.')
        .map(|&b| b as char)
        .collect();

    if version.is_empty() {
        None
    } else {
        Some(version)
    }
}

/// Looks for `%%EOF` near the end of the document (anywhere in very
/// small fixtures).
fn has_valid_trailer(data: &[u8]) -> bool {
    if data.len() < 100 {
        return memmem::find(data, b"%%EOF").is_some();
    }

    let window = data.len().min(TRAILER_WINDOW);
    memmem::find(&data[data.len() - window..], b"%%EOF").is_some()
}

/// Structure check: a versioned header and at least one object.
fn has_valid_structure(data: &[u8]) -> bool {
    let head = &data[..data.len().min(MIN_PDF_LEN)];
    if !head.starts_with(b"%PDF-1.") {
        return false;
    }

    let scan = &data[..data.len().min(ENTROPY_SAMPLE)];
    memmem::find(scan, b" obj").is_some()
}

/// Fallback size estimate: past the last object keyword plus padding,
/// capped at 10 MiB.
fn estimate_pdf_size(data: &[u8]) -> usize {
    let scan = &data[..data.len().min(ESTIMATE_SCAN)];

    let last_keyword = [&b"endstream"[..], &b"endobj"[..], &b" obj"[..]]
        .iter()
        .filter_map(|needle| memmem::rfind(scan, needle).map(|pos| pos + needle.len()))
        .max();

    match last_keyword {
        Some(end) => (end + ESTIMATE_PADDING).min(data.len()).min(ESTIMATE_CAP),
        None => data.len().min(ESTIMATE_CAP),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pdf_doc() -> Vec<u8> {
        let mut doc = b"%PDF-1.4\n".to_vec();
        doc.extend_from_slice(b"1 0 obj\n<< /Type /Catalog >>\nendobj\n");
        doc.extend_from_slice(b"xref\n0 1\ntrailer\n<< /Size 1 >>\nstartxref\n9\n");
        doc.extend_from_slice(b"%%EOF");
        doc
    }

    #[test]
    fn test_carve_single_document() {
        let doc = pdf_doc();
        let files = PdfEngine::new().carve(&doc, 0);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_size, doc.len() as u64);
        assert!(files[0].confidence_score > 0.7);
    }

    #[test]
    fn test_adjacent_documents_are_split() {
        let doc = pdf_doc();
        let mut buffer = doc.clone();
        buffer.extend(std::iter::repeat(0u8).take(50));
        let second_start = buffer.len();
        buffer.extend_from_slice(&doc);

        let files = PdfEngine::new().carve(&buffer, 0);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].start_offset, 0);
        assert_eq!(files[0].file_size, doc.len() as u64);
        assert_eq!(files[1].start_offset, second_start as u64);
        assert_eq!(files[1].file_size, doc.len() as u64);
    }

    #[test]
    fn test_missing_trailer_pins_confidence() {
        let mut doc = b"%PDF-1.4\n".to_vec();
        doc.extend_from_slice(b"1 0 obj\n<< /Length 5 >>\nstream\nhello\nendstream\nendobj\n");

        let files = PdfEngine::new().carve(&doc, 0);
        assert_eq!(files.len(), 1);
        assert!((files[0].confidence_score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_pdf_version_extraction() {
        assert_eq!(pdf_version(b"%PDF-1.4\nrest"), Some("1.4".to_string()));
        assert_eq!(pdf_version(b"%PDF-2.0\n"), Some("2.0".to_string()));
        assert_eq!(pdf_version(b"not a pdf"), None);
    }

    #[test]
    fn test_zero_length_input() {
        assert!(PdfEngine::new().carve(&[], 0).is_empty());
    }
}
