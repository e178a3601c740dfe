//! Recovery engine
//!
//! Drives the two-phase pipeline over one device: filesystem detection
//! and metadata recovery first, then a chunked parallel signature scan,
//! then deduplication and persistence. The engine owns its
//! configuration, device reader, registered parsers and engines, and
//! the accumulating result set; scan workers return owned vectors that
//! are merged here.

use crate::domain::entities::{RecoveredFile, RecoveryStatus, ScanConfig};
use crate::domain::repositories::{BlockDeviceError, BlockDeviceReader, RecoveredFileWriter};
use crate::domain::services::{FilesystemParser, FormatEngine};
use crate::infrastructure::block_device::FileBlockDevice;
use crate::infrastructure::carvers::{JpegEngine, PdfEngine, PngEngine, ZipEngine};
use crate::infrastructure::file_systems::{ExtParser, Fat32Parser, FileSystemDetector, NtfsParser};
use crate::infrastructure::persistence::LocalFileWriter;
use log::{debug, error, info, warn};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Bytes of the device head handed to the filesystem detector.
const DETECTION_HEAD: usize = 8192;
/// Upper bound on the partition window loaded for a metadata parser.
const METADATA_WINDOW: u64 = 100 * 1024 * 1024;

pub type ProgressCallback = Box<dyn Fn(f64, &str) + Send + Sync>;

/// Shared run state, observable and stoppable from other threads.
struct EngineState {
    is_running: AtomicBool,
    should_stop: AtomicBool,
    progress_bits: AtomicU64,
}

impl EngineState {
    fn new() -> Self {
        Self {
            is_running: AtomicBool::new(false),
            should_stop: AtomicBool::new(false),
            progress_bits: AtomicU64::new(0),
        }
    }

    fn progress(&self) -> f64 {
        f64::from_bits(self.progress_bits.load(Ordering::Relaxed))
    }

    fn set_progress(&self, value: f64) {
        self.progress_bits.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Cloneable control handle: lets another thread stop a running
/// recovery or poll its progress.
#[derive(Clone)]
pub struct EngineHandle {
    state: Arc<EngineState>,
}

impl EngineHandle {
    pub fn stop(&self) {
        self.state.should_stop.store(true, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running.load(Ordering::Relaxed)
    }

    pub fn progress(&self) -> f64 {
        self.state.progress()
    }
}

pub struct RecoveryEngine {
    config: ScanConfig,
    format_engines: Vec<Box<dyn FormatEngine>>,
    filesystem_parsers: Vec<Box<dyn FilesystemParser>>,
    progress_callback: Option<ProgressCallback>,
    recovered: Vec<RecoveredFile>,
    state: Arc<EngineState>,
}

impl RecoveryEngine {
    /// Builds an engine with the default carvers (JPEG, PDF, PNG, ZIP)
    /// and parsers (ext, NTFS, FAT32) registered.
    pub fn new(config: ScanConfig) -> Self {
        let mut engine = Self::bare(config);
        engine.add_format_engine(Box::new(JpegEngine::new()));
        engine.add_format_engine(Box::new(PdfEngine::new()));
        engine.add_format_engine(Box::new(PngEngine::new()));
        engine.add_format_engine(Box::new(ZipEngine::new()));
        engine.add_filesystem_parser(Box::new(ExtParser::new()));
        engine.add_filesystem_parser(Box::new(NtfsParser::new()));
        engine.add_filesystem_parser(Box::new(Fat32Parser::new()));
        engine
    }

    /// Builds an engine with nothing registered; callers supply their
    /// own engines and parsers.
    pub fn bare(config: ScanConfig) -> Self {
        Self {
            config,
            format_engines: Vec::new(),
            filesystem_parsers: Vec::new(),
            progress_callback: None,
            recovered: Vec::new(),
            state: Arc::new(EngineState::new()),
        }
    }

    pub fn add_format_engine(&mut self, engine: Box<dyn FormatEngine>) {
        self.format_engines.push(engine);
    }

    pub fn add_filesystem_parser(&mut self, parser: Box<dyn FilesystemParser>) {
        self.filesystem_parsers.push(parser);
    }

    pub fn set_progress_callback(&mut self, callback: ProgressCallback) {
        self.progress_callback = Some(callback);
    }

    /// Control handle usable from other threads while recovery runs.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            state: Arc::clone(&self.state),
        }
    }

    pub fn stop_recovery(&self) {
        self.state.should_stop.store(true, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running.load(Ordering::Relaxed)
    }

    pub fn progress(&self) -> f64 {
        self.state.progress()
    }

    pub fn recovered_files(&self) -> &[RecoveredFile] {
        &self.recovered
    }

    pub fn recovered_file_count(&self) -> usize {
        self.recovered.len()
    }

    /// Runs the full pipeline. Blocking; observe or cancel through an
    /// [`EngineHandle`].
    pub fn start_recovery(&mut self) -> RecoveryStatus {
        if self.is_running() {
            warn!("recovery already in progress");
            return RecoveryStatus::Failed;
        }

        if self.config.device_path.is_empty() {
            error!("no device path configured");
            return RecoveryStatus::Failed;
        }
        if self.config.output_directory.as_os_str().is_empty() {
            error!("no output directory configured");
            return RecoveryStatus::Failed;
        }

        self.state.is_running.store(true, Ordering::Relaxed);
        self.state.should_stop.store(false, Ordering::Relaxed);
        self.state.set_progress(0.0);
        self.recovered.clear();

        let status = self.run_pipeline();

        self.state.is_running.store(false, Ordering::Relaxed);
        status
    }

    fn run_pipeline(&mut self) -> RecoveryStatus {
        info!("starting recovery for {}", self.config.device_path);

        let device = match FileBlockDevice::open(&self.config.device_path) {
            Ok(device) => device,
            Err(BlockDeviceError::AccessDenied(path)) => {
                error!("device {path} refused read access");
                return RecoveryStatus::AccessDenied;
            }
            Err(e) => {
                error!("cannot open device: {e}");
                return RecoveryStatus::DeviceNotFound;
            }
        };

        let writer = match LocalFileWriter::new(&self.config.output_directory) {
            Ok(writer) => writer,
            Err(e) => {
                error!("cannot create output directory: {e}");
                return RecoveryStatus::InsufficientSpace;
            }
        };

        self.update_progress(5.0, "initialization complete");

        if self.config.use_metadata_recovery && !self.stop_requested() {
            self.update_progress(10.0, "running metadata-based recovery");
            let metadata_files = self.metadata_phase(&device);
            self.recovered.extend(metadata_files);
            self.update_progress(30.0, "metadata recovery complete");
        }

        if self.config.use_signature_recovery && !self.stop_requested() {
            self.update_progress(35.0, "running signature-based recovery");
            let carved = self.signature_phase(&device);
            self.recovered.extend(carved);
            self.update_progress(80.0, "signature recovery complete");
        }

        self.update_progress(85.0, "post-processing results");
        self.deduplicate();

        let mut write_failures = 0usize;
        if !self.stop_requested() {
            self.update_progress(90.0, "saving recovered files");
            write_failures = self.persist_all(&device, &writer);
        }

        self.update_progress(100.0, "recovery complete");
        info!(
            "recovery finished: {} files, {} persisted",
            self.recovered.len(),
            writer.files_written()
        );

        if write_failures > 0 {
            RecoveryStatus::PartialSuccess
        } else {
            RecoveryStatus::Success
        }
    }

    /// Phase 1: detect the filesystem and hand a partition window to
    /// the first parser that accepts it.
    fn metadata_phase(&self, device: &dyn BlockDeviceReader) -> Vec<RecoveredFile> {
        let head = match device.read_at(0, DETECTION_HEAD) {
            Ok(head) if !head.is_empty() => head,
            _ => {
                warn!("cannot read device head, skipping metadata phase");
                return Vec::new();
            }
        };

        let detection = FileSystemDetector::new().detect(&head);
        if !detection.is_valid {
            return Vec::new();
        }
        if !detection.fs_type.supports_metadata_recovery() {
            info!("{} offers no metadata recovery, carving only", detection.name);
            return Vec::new();
        }
        info!(
            "metadata phase: {} ({} bytes per cluster)",
            detection.name, detection.cluster_size
        );

        let Some(parser) = self
            .filesystem_parsers
            .iter()
            .find(|parser| parser.can_parse(&head))
        else {
            warn!("no registered parser accepts {}", detection.name);
            return Vec::new();
        };

        let window_len = device.size().min(METADATA_WINDOW) as usize;
        let window = match device.read_at(0, window_len) {
            Ok(window) if !window.is_empty() => window,
            _ => {
                warn!("cannot read partition window");
                return Vec::new();
            }
        };

        let files = parser.recover_deleted(&window);
        info!("metadata phase recovered {} candidates", files.len());
        files
    }

    /// Phase 2: fixed non-overlapping chunks, scanned in parallel by
    /// every registered engine. Workers pull chunk indices and return
    /// owned result vectors; this thread merges them.
    fn signature_phase(&self, device: &(dyn BlockDeviceReader)) -> Vec<RecoveredFile> {
        let device_size = device.size();
        let chunk_size = self.config.chunk_size.max(1);
        let chunk_count = device_size.div_ceil(chunk_size);
        let threads = effective_thread_count(self.config.num_threads);

        info!(
            "signature phase: {chunk_count} chunks of {chunk_size} bytes on {threads} threads"
        );

        let engines: Vec<&(dyn FormatEngine)> = self
            .format_engines
            .iter()
            .map(|e| e.as_ref())
            .filter(|engine| {
                engine
                    .supported_types()
                    .iter()
                    .any(|t| self.config.wants_type(t))
            })
            .collect();
        if engines.is_empty() {
            return Vec::new();
        }

        let pool = match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
            Ok(pool) => pool,
            Err(e) => {
                error!("cannot build scan pool: {e}");
                return Vec::new();
            }
        };

        let completed = AtomicUsize::new(0);

        let chunk_results: Vec<Vec<RecoveredFile>> = pool.install(|| {
            (0..chunk_count)
                .into_par_iter()
                .map(|index| {
                    if self.stop_requested() {
                        return Vec::new();
                    }

                    let chunk_start = index * chunk_size;
                    let wanted = (chunk_size.min(device_size - chunk_start)) as usize;
                    let chunk = match device.read_at(chunk_start, wanted) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            warn!("chunk {index} unreadable: {e}");
                            return Vec::new();
                        }
                    };
                    // Short reads at end of device are still scanned.
                    if chunk.is_empty() {
                        return Vec::new();
                    }

                    let mut found = Vec::new();
                    for engine in &engines {
                        if self.stop_requested() {
                            break;
                        }
                        found.extend(
                            engine
                                .carve(&chunk, chunk_start)
                                .into_iter()
                                .filter(|file| self.config.wants_type(&file.file_type)),
                        );
                    }

                    let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                    let progress = 35.0 + 45.0 * done as f64 / chunk_count as f64;
                    self.update_progress(
                        progress,
                        &format!("scanning chunk {done}/{chunk_count}"),
                    );

                    found
                })
                .collect()
        });

        let carved: Vec<RecoveredFile> = chunk_results.into_iter().flatten().collect();
        info!("signature phase found {} candidates", carved.len());
        carved
    }

    /// Sorts by `(start_offset, file_size)` and drops consecutive
    /// records sharing both, keeping the first.
    fn deduplicate(&mut self) {
        let before = self.recovered.len();
        self.recovered
            .sort_by_key(|file| (file.start_offset, file.file_size));
        self.recovered
            .dedup_by(|a, b| a.start_offset == b.start_offset && a.file_size == b.file_size);

        let removed = before - self.recovered.len();
        if removed > 0 {
            info!("deduplication removed {removed} records");
        }
    }

    /// Hands each record to the persister. Returns the number of
    /// write failures; unreadable payloads are skipped without
    /// counting as failures.
    fn persist_all(&mut self, device: &dyn BlockDeviceReader, writer: &LocalFileWriter) -> usize {
        let mut failures = 0;

        for file in &mut self.recovered {
            if self.state.should_stop.load(Ordering::Relaxed) {
                break;
            }

            let Some(payload) = read_payload(device, file) else {
                warn!("payload of {} unreadable, skipping", file.filename);
                continue;
            };

            match writer.write(file, &payload) {
                Ok(result) => {
                    file.hash_sha256 = Some(result.sha256);
                    if self.config.verbose_logging {
                        info!(
                            "saved {} ({} bytes, confidence {:.2})",
                            result.saved_path.display(),
                            result.saved_size,
                            file.confidence_score
                        );
                    }
                }
                Err(e) => {
                    error!("failed to persist {}: {e}", file.filename);
                    failures += 1;
                }
            }
        }

        failures
    }

    fn stop_requested(&self) -> bool {
        self.state.should_stop.load(Ordering::Relaxed)
    }

    fn update_progress(&self, progress: f64, status: &str) {
        self.state.set_progress(progress);

        if let Some(callback) = &self.progress_callback {
            callback(progress, status);
        }
        if self.config.verbose_logging {
            info!("progress {progress:.1}% - {status}");
        }
        debug!("progress {progress:.1}% - {status}");
    }
}

/// Reassembles a record's payload from its fragments.
fn read_payload(device: &dyn BlockDeviceReader, file: &RecoveredFile) -> Option<Vec<u8>> {
    let mut payload = Vec::with_capacity(file.file_size as usize);

    for fragment in &file.fragments {
        let bytes = device.read_at(fragment.offset, fragment.size as usize).ok()?;
        if bytes.len() as u64 != fragment.size {
            return None;
        }
        payload.extend(bytes);
    }

    Some(payload)
}

/// Auto thread count: available parallelism minus one, at least one.
fn effective_thread_count(configured: usize) -> usize {
    if configured > 0 {
        return configured;
    }

    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_thread_count() {
        assert_eq!(effective_thread_count(4), 4);
        assert!(effective_thread_count(0) >= 1);
    }

    #[test]
    fn test_empty_config_fails() {
        let mut engine = RecoveryEngine::new(ScanConfig::new("", "/tmp/out"));
        assert_eq!(engine.start_recovery(), RecoveryStatus::Failed);

        let mut engine = RecoveryEngine::new(ScanConfig::new("/dev/null", ""));
        assert_eq!(engine.start_recovery(), RecoveryStatus::Failed);
    }

    #[test]
    fn test_missing_device_reports_not_found() {
        let config = ScanConfig::new("/nonexistent/device/path", std::env::temp_dir());
        let mut engine = RecoveryEngine::new(config);
        assert_eq!(engine.start_recovery(), RecoveryStatus::DeviceNotFound);
        assert!(!engine.is_running());
    }
}
