//! Shared binary primitives
//!
//! Free functions used by every carver and filesystem parser: pattern
//! search, Shannon entropy, confidence aggregation and output-name
//! synthesis. All of them operate on borrowed byte slices and keep no
//! state.

use aho_corasick::AhoCorasick;
use memchr::memmem;

/// Entropy range treated as "plausible file content" by the confidence
/// aggregator. Most compressed formats land in [6, 8].
const ENTROPY_FULL_CREDIT: f64 = 6.0;
const ENTROPY_HALF_CREDIT: f64 = 4.0;

/// Finds every offset at which `needle` occurs in `haystack`,
/// overlapping matches included.
///
/// An empty needle, or a needle longer than the haystack, yields no
/// matches.
pub fn find_all(haystack: &[u8], needle: &[u8]) -> Vec<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return Vec::new();
    }

    let finder = memmem::Finder::new(needle);
    let mut offsets = Vec::new();
    let mut start = 0;
    while let Some(pos) = finder.find(&haystack[start..]) {
        offsets.push(start + pos);
        // Advance a single byte so overlapping occurrences are reported.
        start += pos + 1;
    }
    offsets
}

/// Multi-pattern variant of [`find_all`]: returns `(offset, pattern
/// index)` pairs for every overlapping occurrence of any needle.
pub fn find_all_multi(haystack: &[u8], needles: &[&[u8]]) -> Vec<(usize, usize)> {
    if needles.is_empty() || haystack.is_empty() {
        return Vec::new();
    }

    let Ok(automaton) = AhoCorasick::new(needles) else {
        return Vec::new();
    };

    automaton
        .find_overlapping_iter(haystack)
        .map(|m| (m.start(), m.pattern().as_usize()))
        .collect()
}

/// Shannon entropy of `data` over the 256-bin byte histogram, in bits
/// per byte. Empty input scores 0.0; the maximum is 8.0.
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut freq = [0u64; 256];
    for &byte in data {
        freq[byte as usize] += 1;
    }

    let n = data.len() as f64;
    freq.iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / n;
            -p * p.log2()
        })
        .sum()
}

/// Aggregates the four carving quality signals into a confidence score
/// in [0, 1].
///
/// Weights: header 0.4, footer 0.2, entropy 0.2 (full credit in
/// [6.0, 8.0], half credit in [4.0, 6.0)), structure 0.2.
pub fn confidence_score(
    header_ok: bool,
    footer_ok: bool,
    entropy: f64,
    structure_ok: bool,
) -> f64 {
    let mut score: f64 = 0.0;

    if header_ok {
        score += 0.4;
    }
    if footer_ok {
        score += 0.2;
    }
    if (ENTROPY_FULL_CREDIT..=8.0).contains(&entropy) {
        score += 0.2;
    } else if (ENTROPY_HALF_CREDIT..ENTROPY_FULL_CREDIT).contains(&entropy) {
        score += 0.1;
    }
    if structure_ok {
        score += 0.2;
    }

    score.min(1.0)
}

/// Synthesizes an output name for a payload recovered at `offset`:
/// `recovered_<hex16 offset>.<extension lowercased>`.
pub fn recovered_filename(offset: u64, file_type: &str) -> String {
    format!("recovered_{:016x}.{}", offset, file_type.to_lowercase())
}

/// Sniffs a file type tag from the leading bytes of a payload using a
/// fixed magic table. Used by the metadata parsers when the directory
/// entry carries no usable extension.
pub fn sniff_file_type(data: &[u8]) -> Option<&'static str> {
    if data.len() < 4 {
        return None;
    }

    match data {
        [0xFF, 0xD8, 0xFF, ..] => Some("jpg"),
        [0x89, b'P', b'N', b'G', ..] => Some("png"),
        [b'%', b'P', b'D', b'F', ..] => Some("pdf"),
        [b'P', b'K', 0x03, 0x04, ..] => Some("zip"),
        [b'G', b'I', b'F', b'8', ..] => Some("gif"),
        [0x49, 0x49, 0x2A, 0x00, ..] | [0x4D, 0x4D, 0x00, 0x2A, ..] => Some("tiff"),
        [0x7F, b'E', b'L', b'F', ..] => Some("elf"),
        [b'%', b'!', b'P', b'S', ..] => Some("ps"),
        _ => None,
    }
}

/// True when at least 90% of `data` is printable ASCII (or common
/// whitespace), the heuristic used to tag unlabeled payloads as text.
pub fn looks_textual(data: &[u8]) -> bool {
    if data.is_empty() {
        return false;
    }

    let printable = data
        .iter()
        .filter(|&&b| (0x20..0x7F).contains(&b) || b == b'\n' || b == b'\r' || b == b'\t')
        .count();

    printable * 10 >= data.len() * 9
}
