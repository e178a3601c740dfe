//! Recovery engine integration tests
//!
//! Full-pipeline runs over temporary disk images: carving plus
//! persistence, deduplication, cancellation, the status taxonomy and
//! run-to-run idempotence.

use rstest::*;
use salvor::{RecoveryEngine, RecoveryStatus, ScanConfig};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

// ============================================================================
// Fixtures
// ============================================================================

fn write_image(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    let mut file = fs::File::create(&path).unwrap();
    file.write_all(data).unwrap();
    file.sync_all().unwrap();
    path
}

/// 4 MiB image of 0xAA noise with one complete JPEG at offset 500_000.
#[fixture]
fn jpeg_image() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();

    let mut data = vec![0xAAu8; 4 * 1024 * 1024];
    let start = 500_000;
    data[start..start + 10]
        .copy_from_slice(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46]);
    for i in 0..100 {
        data[start + 10 + i] = (i % 256) as u8;
    }
    data[start + 110] = 0xFF;
    data[start + 111] = 0xD9;

    let path = write_image(&dir, "jpeg.img", &data);
    (dir, path)
}

/// FAT32 image with a deleted `_ELETED.TXT` entry (see the filesystem
/// tests for the layout).
#[fixture]
fn fat32_image() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();

    let mut image = vec![0u8; 256 * 1024];
    image[11..13].copy_from_slice(&512u16.to_le_bytes());
    image[13] = 8;
    image[14..16].copy_from_slice(&32u16.to_le_bytes());
    image[16] = 1;
    image[32..36].copy_from_slice(&1_000_000u32.to_le_bytes());
    image[36..40].copy_from_slice(&16u32.to_le_bytes());
    image[44..48].copy_from_slice(&2u32.to_le_bytes());
    image[82..90].copy_from_slice(b"FAT32   ");
    image[510..512].copy_from_slice(&0xAA55u16.to_le_bytes());

    let fat = 32 * 512;
    for cluster in [2usize, 3, 4] {
        image[fat + cluster * 4..fat + cluster * 4 + 4]
            .copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
    }

    let root = 24576;
    image[root..root + 11].copy_from_slice(b"TEST    TXT");
    image[root + 11] = 0x20;
    image[root + 26..root + 28].copy_from_slice(&3u16.to_le_bytes());
    image[root + 28..root + 32].copy_from_slice(&100u32.to_le_bytes());

    let e = root + 32;
    image[e] = 0xE5;
    image[e + 1..e + 8].copy_from_slice(b"ELETED ");
    image[e + 8..e + 11].copy_from_slice(b"TXT");
    image[e + 11] = 0x20;
    image[e + 26..e + 28].copy_from_slice(&4u16.to_le_bytes());
    image[e + 28..e + 32].copy_from_slice(&200u32.to_le_bytes());

    let path = write_image(&dir, "fat32.img", &image);
    (dir, path)
}

fn config_for(image: &PathBuf, output: &TempDir) -> ScanConfig {
    ScanConfig::new(
        image.to_str().unwrap(),
        output.path().join("out"),
    )
}

// ============================================================================
// Signature phase end to end
// ============================================================================

#[rstest]
fn test_recover_jpeg_from_image(jpeg_image: (TempDir, PathBuf)) {
    let (_dir, image) = jpeg_image;
    let output = TempDir::new().unwrap();

    let mut config = config_for(&image, &output);
    config.num_threads = 2;
    let mut engine = RecoveryEngine::new(config);

    let status = engine.start_recovery();
    assert_eq!(status, RecoveryStatus::Success);
    assert!(!engine.is_running());
    assert_eq!(engine.recovered_file_count(), 1);

    let file = &engine.recovered_files()[0];
    assert_eq!(file.start_offset, 500_000);
    assert_eq!(file.file_size, 112);
    assert_eq!(file.file_type, "JPEG");
    assert!(file.confidence_score >= 0.7);
    assert!(file.hash_sha256.is_some());

    // The persister wrote the payload under the output directory.
    let saved: Vec<_> = fs::read_dir(output.path().join("out"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(saved.len(), 1);
    assert_eq!(fs::metadata(&saved[0]).unwrap().len(), 112);
}

#[rstest]
fn test_type_filter_drops_unwanted(jpeg_image: (TempDir, PathBuf)) {
    let (_dir, image) = jpeg_image;
    let output = TempDir::new().unwrap();

    let mut config = config_for(&image, &output);
    config.target_file_types = vec!["pdf".into()];
    let mut engine = RecoveryEngine::new(config);

    assert_eq!(engine.start_recovery(), RecoveryStatus::Success);
    assert_eq!(engine.recovered_file_count(), 0);
}

#[rstest]
fn test_progress_reaches_completion(jpeg_image: (TempDir, PathBuf)) {
    let (_dir, image) = jpeg_image;
    let output = TempDir::new().unwrap();

    let mut engine = RecoveryEngine::new(config_for(&image, &output));
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    engine.set_progress_callback(Box::new(move |progress, _status| {
        sink.lock().unwrap().push(progress);
    }));

    engine.start_recovery();
    assert!((engine.progress() - 100.0).abs() < 1e-9);

    let values = seen.lock().unwrap();
    assert!(!values.is_empty());
    // Phase-boundary values arrive in order.
    assert_eq!(*values.last().unwrap(), 100.0);
    assert!(values.contains(&5.0));
}

// ============================================================================
// Metadata phase end to end
// ============================================================================

#[rstest]
fn test_fat32_metadata_recovery_through_engine(fat32_image: (TempDir, PathBuf)) {
    let (_dir, image) = fat32_image;
    let output = TempDir::new().unwrap();

    let mut config = config_for(&image, &output);
    config.use_signature_recovery = false;
    let mut engine = RecoveryEngine::new(config);

    assert_eq!(engine.start_recovery(), RecoveryStatus::Success);

    let deleted = engine
        .recovered_files()
        .iter()
        .find(|f| f.filename.starts_with('_'))
        .expect("deleted FAT32 entry not recovered");
    assert!(deleted.filename.to_uppercase().starts_with("_ELETED.TXT"));
    assert_eq!(deleted.file_size, 200);
    assert!((deleted.confidence_score - 0.60).abs() < 1e-9);
}

// ============================================================================
// Deduplication and idempotence
// ============================================================================

#[rstest]
fn test_no_duplicate_offset_size_pairs(fat32_image: (TempDir, PathBuf)) {
    let (_dir, image) = fat32_image;
    let output = TempDir::new().unwrap();

    let mut engine = RecoveryEngine::new(config_for(&image, &output));
    engine.start_recovery();

    let mut keys: Vec<(u64, u64)> = engine
        .recovered_files()
        .iter()
        .map(|f| (f.start_offset, f.file_size))
        .collect();
    let total = keys.len();
    keys.sort_unstable();
    keys.dedup();
    assert_eq!(keys.len(), total, "dedup left identical (offset, size) pairs");
}

#[rstest]
fn test_pipeline_is_idempotent(jpeg_image: (TempDir, PathBuf)) {
    let (_dir, image) = jpeg_image;

    let run = || {
        let output = TempDir::new().unwrap();
        let mut engine = RecoveryEngine::new(config_for(&image, &output));
        engine.start_recovery();
        let mut set: Vec<(u64, u64, String)> = engine
            .recovered_files()
            .iter()
            .map(|f| (f.start_offset, f.file_size, f.file_type.clone()))
            .collect();
        set.sort();
        set
    };

    assert_eq!(run(), run());
}

// ============================================================================
// Cancellation
// ============================================================================

#[test]
fn test_stop_during_first_progress_callback() {
    let dir = TempDir::new().unwrap();
    let image = write_image(&dir, "zeros.img", &vec![0u8; 64 * 1024 * 1024]);
    let output = TempDir::new().unwrap();

    let mut engine = RecoveryEngine::new(config_for(&image, &output));
    let handle = engine.handle();
    let stopped = Arc::new(AtomicBool::new(false));

    let stop_handle = handle.clone();
    let stop_flag = Arc::clone(&stopped);
    engine.set_progress_callback(Box::new(move |_progress, _status| {
        if !stop_flag.swap(true, Ordering::Relaxed) {
            stop_handle.stop();
        }
    }));

    let status = engine.start_recovery();
    assert!(!engine.is_running());
    assert!(!handle.is_running());
    assert_eq!(status, RecoveryStatus::Success);
    assert!(engine.recovered_files().is_empty());
}

// ============================================================================
// Status taxonomy
// ============================================================================

#[test]
fn test_missing_device_is_device_not_found() {
    let output = TempDir::new().unwrap();
    let config = ScanConfig::new("/definitely/not/a/device", output.path().join("out"));
    let mut engine = RecoveryEngine::new(config);
    assert_eq!(engine.start_recovery(), RecoveryStatus::DeviceNotFound);
}

#[test]
fn test_empty_paths_fail_fast() {
    let mut engine = RecoveryEngine::new(ScanConfig::new("", "/tmp/x"));
    assert_eq!(engine.start_recovery(), RecoveryStatus::Failed);

    let mut engine = RecoveryEngine::new(ScanConfig::new("/tmp/x", ""));
    assert_eq!(engine.start_recovery(), RecoveryStatus::Failed);
}

#[rstest]
fn test_disabled_phases_yield_empty_success(jpeg_image: (TempDir, PathBuf)) {
    let (_dir, image) = jpeg_image;
    let output = TempDir::new().unwrap();

    let mut config = config_for(&image, &output);
    config.use_metadata_recovery = false;
    config.use_signature_recovery = false;
    let mut engine = RecoveryEngine::new(config);

    assert_eq!(engine.start_recovery(), RecoveryStatus::Success);
    assert!(engine.recovered_files().is_empty());
}
