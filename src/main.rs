use anyhow::{Context, Result};
use clap::Parser;
use salvor::domain::repositories::BlockDeviceReader;
use salvor::domain::services::{FilesystemParser, FormatEngine};
use salvor::infrastructure::block_device::FileBlockDevice;
use salvor::infrastructure::carvers::{JpegEngine, PdfEngine, PngEngine, ZipEngine};
use salvor::infrastructure::file_systems::{
    ExtParser, Fat32Parser, FileSystemDetector, NtfsParser,
};
use salvor::presentation::cli::{parse_file_types, Cli, Commands, ProgressReporter};
use salvor::{RecoveryEngine, RecoveryStatus, ScanConfig};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

/// Routes Ctrl-C to a cooperative engine stop: the workers finish
/// their current chunk and already-persisted files stay on disk.
fn watch_for_interrupt(handle: salvor::EngineHandle) {
    unsafe {
        libc::signal(libc::SIGINT, on_interrupt as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_interrupt as libc::sighandler_t);
    }

    std::thread::spawn(move || loop {
        if INTERRUPTED.load(Ordering::Relaxed) {
            eprintln!("\nInterrupt received, stopping recovery...");
            handle.stop();
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    });
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match cli.command {
        Commands::Recover {
            device,
            output,
            types,
            threads,
            chunk_size_mb,
            no_metadata,
            no_signature,
        } => run_recover(
            device,
            output,
            types,
            threads,
            chunk_size_mb,
            no_metadata,
            no_signature,
            cli.verbose,
        ),
        Commands::Scan {
            device,
            types,
            chunk_size_mb,
        } => run_scan(device, types, chunk_size_mb, cli.verbose),
        Commands::Info { device } => show_info(&device),
        Commands::ListEngines => {
            list_engines();
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_recover(
    device: String,
    output: PathBuf,
    types: Option<Vec<String>>,
    threads: usize,
    chunk_size_mb: u64,
    no_metadata: bool,
    no_signature: bool,
    verbose: bool,
) -> Result<()> {
    println!("Salvor file recovery\nDevice: {device}\nOutput: {}", output.display());

    let mut config = ScanConfig::new(device, output);
    config.target_file_types = parse_file_types(types);
    config.num_threads = threads;
    config.chunk_size = chunk_size_mb.max(1) * 1024 * 1024;
    config.use_metadata_recovery = !no_metadata;
    config.use_signature_recovery = !no_signature;
    config.verbose_logging = verbose;

    let mut engine = RecoveryEngine::new(config);
    let progress = ProgressReporter::for_recovery();
    engine.set_progress_callback(progress.callback());
    watch_for_interrupt(engine.handle());

    let status = engine.start_recovery();
    progress.finish(&format!("Recovery {status}"));

    print_summary(engine.recovered_files());

    match status {
        RecoveryStatus::Success | RecoveryStatus::PartialSuccess => Ok(()),
        other => anyhow::bail!("recovery failed: {other}"),
    }
}

fn run_scan(
    device: String,
    types: Option<Vec<String>>,
    chunk_size_mb: u64,
    verbose: bool,
) -> Result<()> {
    println!("Salvor scan (no files will be written)\nDevice: {device}");

    // A scan is a recovery run pointed at a scratch directory, with
    // persistence results discarded afterwards.
    let scratch = tempdir_for_scan()?;

    let mut config = ScanConfig::new(device, scratch.clone());
    config.target_file_types = parse_file_types(types);
    config.chunk_size = chunk_size_mb.max(1) * 1024 * 1024;
    config.verbose_logging = verbose;

    let mut engine = RecoveryEngine::new(config);
    let progress = ProgressReporter::for_recovery();
    engine.set_progress_callback(progress.callback());

    let status = engine.start_recovery();
    progress.finish(&format!("Scan {status}"));

    print_summary(engine.recovered_files());
    let _ = std::fs::remove_dir_all(&scratch);

    match status {
        RecoveryStatus::Success | RecoveryStatus::PartialSuccess => Ok(()),
        other => anyhow::bail!("scan failed: {other}"),
    }
}

fn tempdir_for_scan() -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("salvor-scan-{}", std::process::id()));
    std::fs::create_dir_all(&dir).context("cannot create scratch directory")?;
    Ok(dir)
}

fn show_info(device_path: &str) -> Result<()> {
    let device = FileBlockDevice::open(device_path).context("failed to open device")?;
    println!("Device: {} ({} bytes)", device.path(), device.size());

    let head = device
        .read_at(0, 8192)
        .context("failed to read device head")?;

    let info = FileSystemDetector::new().detect(&head);
    println!("Filesystem:   {}", info.name);
    println!("Cluster size: {} bytes", info.cluster_size);
    println!("Total size:   {} bytes", info.total_size);
    if !info.volume_label.is_empty() {
        println!("Label:        {}", info.volume_label);
    }

    let parsers: Vec<Box<dyn FilesystemParser>> = vec![
        Box::new(ExtParser::new()),
        Box::new(NtfsParser::new()),
        Box::new(Fat32Parser::new()),
    ];
    if let Some(parser) = parsers.iter().find(|p| p.can_parse(&head)) {
        println!("\n{}", parser.info(&head));
    }

    Ok(())
}

fn list_engines() {
    let engines: Vec<Box<dyn FormatEngine>> = vec![
        Box::new(JpegEngine::new()),
        Box::new(PdfEngine::new()),
        Box::new(PngEngine::new()),
        Box::new(ZipEngine::new()),
    ];

    println!("Registered format engines\n");
    for engine in &engines {
        println!("  {}", engine.supported_types().join(", "));
        for signature in engine.signatures() {
            let hex: Vec<String> = signature.iter().map(|b| format!("{b:02X}")).collect();
            println!("    header: {}", hex.join(" "));
        }
        println!("    max size: {} bytes\n", engine.max_size());
    }
}

fn print_summary(files: &[salvor::RecoveredFile]) {
    if files.is_empty() {
        println!("\nNo recoverable files found.");
        return;
    }

    let mut by_type: BTreeMap<&str, (usize, u64)> = BTreeMap::new();
    for file in files {
        let entry = by_type.entry(file.file_type.as_str()).or_default();
        entry.0 += 1;
        entry.1 += file.file_size;
    }

    println!("\nRecovered {} files:", files.len());
    for (file_type, (count, bytes)) in by_type {
        println!("  {file_type:>8}: {count:>5} files, {bytes} bytes");
    }
}
