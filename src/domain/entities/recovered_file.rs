//! Recovered file entity
//!
//! The sole value type crossing component boundaries: one reconstructed
//! payload, where it lives on the source device, and how much the
//! reconstruction can be trusted.

use crate::binary::recovered_filename;

/// A contiguous byte range on the source device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    /// Byte offset on the device.
    pub offset: u64,
    /// Length in bytes.
    pub size: u64,
}

impl Fragment {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Offset one past the last byte of the range.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// A file reconstructed from the source device.
///
/// Invariants: `file_size > 0`; fragment sizes sum to `file_size`;
/// fragments do not overlap; `confidence_score` lies in [0, 1]; a
/// single-fragment file's fragment equals `(start_offset, file_size)`.
#[derive(Debug, Clone)]
pub struct RecoveredFile {
    /// Synthesized output label.
    pub filename: String,
    /// Short type tag: `"JPEG"`, `"PDF"`, `"zip"`, a filesystem-derived
    /// extension, or `"unknown"`.
    pub file_type: String,
    /// Device offset of the first payload byte.
    pub start_offset: u64,
    /// Payload length in bytes.
    pub file_size: u64,
    /// How likely the reconstruction is faithful, in [0, 1].
    pub confidence_score: f64,
    /// True iff the payload spans more than one fragment.
    pub is_fragmented: bool,
    /// Ordered device ranges whose sizes sum to `file_size`.
    pub fragments: Vec<Fragment>,
    /// SHA-256 of the persisted payload; filled by the persister, never
    /// by the recovery core.
    pub hash_sha256: Option<String>,
}

impl RecoveredFile {
    /// Builds a contiguous (single fragment) record with a synthesized
    /// filename.
    pub fn contiguous(file_type: &str, start_offset: u64, file_size: u64, confidence: f64) -> Self {
        Self {
            filename: recovered_filename(start_offset, file_type),
            file_type: file_type.to_string(),
            start_offset,
            file_size,
            confidence_score: confidence.clamp(0.0, 1.0),
            is_fragmented: false,
            fragments: vec![Fragment::new(start_offset, file_size)],
            hash_sha256: None,
        }
    }

    /// Builds a record from an explicit fragment list. The file size is
    /// the fragment sizes' sum and the start offset is the first
    /// fragment's.
    pub fn fragmented(
        filename: String,
        file_type: &str,
        fragments: Vec<Fragment>,
        confidence: f64,
    ) -> Self {
        let start_offset = fragments.first().map_or(0, |f| f.offset);
        let file_size = fragments.iter().map(|f| f.size).sum();
        Self {
            filename,
            file_type: file_type.to_string(),
            start_offset,
            file_size,
            confidence_score: confidence.clamp(0.0, 1.0),
            is_fragmented: fragments.len() > 1,
            fragments,
            hash_sha256: None,
        }
    }

    /// Total bytes covered by the fragment list.
    pub fn fragment_bytes(&self) -> u64 {
        self.fragments.iter().map(|f| f.size).sum()
    }

    /// Checks the structural invariants against a device of
    /// `device_size` bytes.
    pub fn is_well_formed(&self, device_size: u64) -> bool {
        if self.file_size == 0 || self.fragments.is_empty() {
            return false;
        }
        if !(0.0..=1.0).contains(&self.confidence_score) {
            return false;
        }
        if self.fragment_bytes() != self.file_size {
            return false;
        }
        if self.is_fragmented != (self.fragments.len() > 1) {
            return false;
        }
        if self.fragments.len() == 1 {
            let f = &self.fragments[0];
            if f.offset != self.start_offset || f.size != self.file_size {
                return false;
            }
        }

        // Fragments must be device-bounded and pairwise disjoint.
        let mut ranges: Vec<&Fragment> = self.fragments.iter().collect();
        ranges.sort_by_key(|f| f.offset);
        let mut previous_end = 0u64;
        for fragment in ranges {
            if fragment.size == 0 || fragment.end() > device_size {
                return false;
            }
            if fragment.offset < previous_end {
                return false;
            }
            previous_end = fragment.end();
        }

        true
    }
}
