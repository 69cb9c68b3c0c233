//! sitemove - Command-line interface for the FTP site transfer engine.
//!
//! Reads endpoint settings from the environment (and `.env`), applies
//! command-line overrides, runs one transfer and appends its report to a
//! CSV file. Exit status: 0 success, 1 completed with failures, 2 fatal.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use engine::{
    CompressionLevel, Connector, EngineError, FtpConnector, Manifest, Outcome, PlanKind,
    ProgressObserver, ProgressSnapshot, ProgressTracker, TransferConfig, TransferJob,
    TransferResult, CSV_HEADERS,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How often the background logger records a progress snapshot.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5);

/// sitemove - Copy a directory tree from one FTP server to another
#[derive(Parser, Debug)]
#[command(name = "sitemove")]
#[command(version = "0.1.0")]
#[command(about = "Copy a directory tree between FTP servers through local staging")]
struct Args {
    /// Remote directory to transfer, relative to the login directory
    /// (overrides TRANSFER_PATH and TARGET_PATH)
    #[arg(long, value_name = "PATH")]
    path: Option<String>,

    /// Split large trees into size-bounded chunks
    #[arg(long)]
    chunking: bool,

    /// Chunk byte budget [default: 52428800]
    #[arg(long, value_name = "BYTES")]
    chunk_size: Option<u64>,

    /// 1 uploads file by file; 2-9 uploads .tar.gz archives [default: 1]
    #[arg(long, value_name = "LEVEL", value_parser = clap::value_parser!(u32).range(1..=9))]
    compression_level: Option<u32>,

    /// Enable verbose output
    #[arg(long)]
    verbose: bool,

    /// CSV file the run report is appended to
    #[arg(long, value_name = "FILE", default_value = "transfers_results.csv")]
    report_file: PathBuf,

    /// Also write the run report as JSON
    #[arg(long, value_name = "FILE")]
    json_report: Option<PathBuf>,

    /// Log file (appended)
    #[arg(long, value_name = "FILE", default_value = "general.log")]
    log_file: PathBuf,
}

/// CLI implementation of ProgressObserver for displaying transfer progress
struct CliProgress {
    verbose: bool,
    start_time: Instant,
    last_progress_update: Mutex<Option<Instant>>,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        CliProgress {
            verbose,
            start_time: Instant::now(),
            last_progress_update: Mutex::new(None),
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    fn print_progress_bar(percent: u32) -> String {
        let percent = percent.min(100);
        let filled = (percent / 5) as usize;
        let empty = 20 - filled;
        format!(
            "[{}{}] {}%",
            "=".repeat(filled),
            " ".repeat(empty),
            percent
        )
    }
}

impl ProgressObserver for CliProgress {
    fn on_run_started(&self, manifest: &Manifest, plan: PlanKind) {
        eprintln!("Preparing transfer...");
        eprintln!("  Plan: {}", plan);
        eprintln!(
            "  Total: {} across {} files and {} directories",
            Self::format_bytes(manifest.total_bytes()),
            manifest.file_count(),
            manifest.dir_count()
        );
        eprintln!();
    }

    fn on_unit_started(&self, unit: &str) {
        if self.verbose {
            eprintln!("Starting: {}", unit);
        }
    }

    fn on_unit_completed(&self, unit: &str, progress: &ProgressSnapshot) {
        if self.verbose {
            eprintln!("Done: {}", unit);
        }

        // Throttle progress updates to avoid spam (max once per 200ms)
        let Ok(mut last) = self.last_progress_update.lock() else {
            return;
        };
        let complete = progress.percentage() >= 100.0;
        if let Some(at) = *last {
            if at.elapsed().as_millis() < 200 && !complete {
                return;
            }
        }
        *last = Some(Instant::now());

        eprint!(
            "\rProgress: {} | {}/{}",
            Self::print_progress_bar(progress.percentage() as u32),
            Self::format_bytes(progress.bytes_completed),
            Self::format_bytes(progress.bytes_total)
        );
        let _ = std::io::Write::flush(&mut std::io::stderr());
    }

    fn on_unit_failed(&self, unit: &str, error: &EngineError) {
        eprintln!();
        eprintln!("Failed: {}: {}", unit, error);
    }

    fn on_run_completed(&self, result: &TransferResult) {
        eprintln!();
        eprintln!("Transfer {}", result.success);
        eprintln!(
            "Summary: {} files, {} directories",
            result.file_count, result.directory_count
        );
        eprintln!(
            "Bytes transferred: {} of {}",
            Self::format_bytes(result.transferred_size),
            Self::format_bytes(result.total_size)
        );
        eprintln!("Elapsed: {}", Self::format_duration(self.start_time.elapsed()));

        if !result.errors.is_empty() {
            eprintln!();
            eprintln!("Errors:");
            for message in &result.errors {
                eprintln!("  {}", message);
            }
        }
    }
}

/// Logs a progress snapshot at a fixed interval until stopped.
struct SnapshotLogger {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl SnapshotLogger {
    fn spawn(progress: Arc<ProgressTracker>, every: Duration) -> Self {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::spawn(move || loop {
            match stopped.recv_timeout(every) {
                Err(RecvTimeoutError::Timeout) => {
                    let snap = progress.snapshot();
                    info!(
                        "Progress: {:.1}% ({}/{} files, {}/{} bytes, {:.2} MB/s, {}s elapsed)",
                        snap.percentage(),
                        snap.files_completed,
                        snap.files_total,
                        snap.bytes_completed,
                        snap.bytes_total,
                        snap.throughput_bps() / (1024.0 * 1024.0),
                        snap.elapsed_seconds()
                    );
                }
                _ => break,
            }
        });
        SnapshotLogger { stop, handle }
    }

    fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            warn!("Progress logger thread panicked");
        }
    }
}

/// Parse arguments, run one transfer, map the outcome to an exit code
fn main() {
    let args = Args::parse();

    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(e) if e.not_found() => {}
        Err(e) => eprintln!("Warning: could not load .env: {}", e),
    }

    if let Err(e) = init_logging(args.verbose, &args.log_file) {
        eprintln!("Error: {:#}", e);
        std::process::exit(2);
    }

    let exit_code = match run_cli(&args, &FtpConnector) {
        Ok(Outcome::Success) => 0,
        Ok(Outcome::Failed) => 1,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            2
        }
    };

    std::process::exit(exit_code);
}

/// Install the stderr and log-file subscribers
fn init_logging(verbose: bool, log_file: &Path) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("Cannot open log file {}", log_file.display()))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .context("Cannot install logger")
}

/// Main CLI logic - separated for testability
fn run_cli<C: Connector>(args: &Args, connector: &C) -> Result<Outcome> {
    let config = build_config(args, |key| std::env::var(key).ok())?;
    execute(args, config, connector)
}

/// Load configuration from `lookup` and apply command-line overrides
fn build_config<F>(args: &Args, lookup: F) -> Result<TransferConfig>
where
    F: Fn(&str) -> Option<String>,
{
    // --path stands in for TRANSFER_PATH, so the variable may be unset
    let mut config = TransferConfig::from_lookup(|key| match (&args.path, key) {
        (Some(path), "TRANSFER_PATH") => Some(path.clone()),
        _ => lookup(key),
    })
    .context("Invalid configuration")?;

    if let Some(path) = &args.path {
        config.set_transfer_path(path);
    }
    if args.chunking {
        config.use_chunking = true;
    }
    if let Some(size) = args.chunk_size {
        config.max_chunk_size = size;
    }
    if let Some(level) = args.compression_level {
        config.compression_level = CompressionLevel::new(level).context("Invalid configuration")?;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Run the job and persist its report, whatever the outcome
fn execute<C: Connector>(args: &Args, config: TransferConfig, connector: &C) -> Result<Outcome> {
    let job = TransferJob::new(config).context("Invalid configuration")?;
    info!(
        "Transfer {} -> {} (chunking: {}, chunk size: {}, compression level: {})",
        job.config().source_path,
        job.config().target_path,
        job.config().use_chunking,
        job.config().max_chunk_size,
        job.config().compression_level.get()
    );

    let snapshots = SnapshotLogger::spawn(job.progress(), SNAPSHOT_INTERVAL);
    let observer = CliProgress::new(args.verbose);
    let outcome = job.run(connector, Some(&observer));
    snapshots.stop();

    match outcome {
        Ok(result) => {
            persist_report(args, &result)?;
            Ok(result.success)
        }
        Err(failure) => {
            if let Err(e) = persist_report(args, &failure.report) {
                error!("Could not save report: {:#}", e);
            }
            Err(anyhow::Error::new(failure))
        }
    }
}

fn persist_report(args: &Args, result: &TransferResult) -> Result<()> {
    append_csv(&args.report_file, result)?;
    info!("Report appended to {}", args.report_file.display());
    if let Some(path) = &args.json_report {
        write_json(path, result)?;
        info!("JSON report written to {}", path.display());
    }
    Ok(())
}

/// Append one row, writing the header first when the file is new or empty
fn append_csv(path: &Path, result: &TransferResult) -> Result<()> {
    let needs_header = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Cannot open report file {}", path.display()))?;

    let mut writer = csv::Writer::from_writer(file);
    if needs_header {
        writer.write_record(CSV_HEADERS)?;
    }
    writer.write_record(result.csv_record(Local::now()))?;
    writer.flush()?;
    Ok(())
}

fn write_json(path: &Path, result: &TransferResult) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Cannot create JSON report {}", path.display()))?;
    serde_json::to_writer_pretty(file, result)?;
    Ok(())
}
