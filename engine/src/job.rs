//! Run orchestration.
//!
//! A `TransferJob` drives one run through its phases:
//!
//! 1. open the source and target sessions (with retry); a session whose
//!    connection breaks mid-run reopens it on its next operation
//! 2. analyze the source tree into a manifest
//! 3. plan direct or chunked
//! 4. execute the plan through a fresh staging directory
//! 5. finalize the report
//!
//! Failures in phases 1 and 2 (and staging setup) abort the run and come
//! back as a `JobFailure` that still carries a FAILED report. Failures of
//! individual units during execution are recorded and the run completes.
//! Sessions are closed and staging is removed on every path.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::analyzer;
use crate::config::TransferConfig;
use crate::connection::{Connector, RemoteFs, Session};
use crate::error::EngineError;
use crate::executor::{ExecutionSummary, TransferExecutor};
use crate::model::TransferResult;
use crate::planner::{self, PlanOptions};
use crate::progress::{ProgressObserver, ProgressTracker};
use crate::report::ReportBuilder;
use crate::retry::{RetryPolicy, Sleeper, ThreadSleeper};
use crate::staging::Staging;

/// State shared by every component taking part in one run.
pub struct RunContext {
    pub run_id: Uuid,
    pub retry: RetryPolicy,
    pub sleeper: Arc<dyn Sleeper>,
    pub progress: Arc<ProgressTracker>,
    pub report: ReportBuilder,
}

/// Phase in which a run was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Analyze,
    Staging,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Connect => write!(f, "connect"),
            Phase::Analyze => write!(f, "analyze"),
            Phase::Staging => write!(f, "staging"),
        }
    }
}

/// A run that could not get as far as transferring anything.
#[derive(Debug, thiserror::Error)]
#[error("Transfer aborted during {phase}: {error}")]
pub struct JobFailure {
    pub phase: Phase,
    #[source]
    pub error: EngineError,
    /// FAILED report for the aborted run, ready to be persisted
    pub report: TransferResult,
}

/// One configured run.
pub struct TransferJob {
    config: TransferConfig,
    run_id: Uuid,
    progress: Arc<ProgressTracker>,
    sleeper: Arc<dyn Sleeper>,
}

impl TransferJob {
    /// Create a run for a validated configuration.
    ///
    /// # Errors
    /// Returns `EngineError::Config` if the configuration is invalid
    pub fn new(config: TransferConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(TransferJob {
            config,
            run_id: Uuid::new_v4(),
            progress: Arc::new(ProgressTracker::new()),
            sleeper: Arc::new(ThreadSleeper),
        })
    }

    /// Replace how backoff delays are waited out.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Handle for reading progress from another thread while `run` executes.
    pub fn progress(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.progress)
    }

    /// Execute the run to completion.
    ///
    /// # Returns
    /// The finalized report. It may still say FAILED when some units failed.
    ///
    /// # Errors
    /// Returns `JobFailure` when the run was aborted before transferring
    pub fn run<C: Connector>(
        self,
        connector: &C,
        observer: Option<&dyn ProgressObserver>,
    ) -> Result<TransferResult, JobFailure> {
        let TransferJob {
            config,
            run_id,
            progress,
            sleeper,
        } = self;
        let mut ctx = RunContext {
            run_id,
            retry: config.retry.clone(),
            sleeper,
            progress,
            report: ReportBuilder::begin(run_id, &config.source_path, &config.target_path),
        };

        info!(
            "Run {}: {}:{}/{} -> {}:{}/{}",
            run_id,
            config.source.host,
            config.source.port,
            config.source_path,
            config.target.host,
            config.target.port,
            config.target_path
        );

        let mut source = match Session::open(
            connector,
            &config.source,
            &config.timeouts,
            &ctx.retry,
            ctx.sleeper.as_ref(),
        ) {
            Ok(session) => session,
            Err(e) => return Err(abort(ctx, Phase::Connect, e, observer)),
        };
        let mut target = match Session::open(
            connector,
            &config.target,
            &config.timeouts,
            &ctx.retry,
            ctx.sleeper.as_ref(),
        ) {
            Ok(session) => session,
            Err(e) => {
                close_quietly(&mut source, "source");
                return Err(abort(ctx, Phase::Connect, e, observer));
            }
        };

        let outcome = transfer(&config, &mut ctx, &mut source, &mut target, observer);
        if source.reconnects() + target.reconnects() > 0 {
            info!(
                "Sessions reopened during run: source {}, target {}",
                source.reconnects(),
                target.reconnects()
            );
        }
        close_quietly(&mut source, "source");
        close_quietly(&mut target, "target");

        let (total_bytes, summary) = match outcome {
            Ok(done) => done,
            Err((phase, e)) => return Err(abort(ctx, phase, e, observer)),
        };

        let result = ctx.report.finish(
            total_bytes,
            summary.bytes_transferred,
            summary.files_transferred,
            summary.dirs_created,
        );
        info!(
            "Run {} finished: {} ({} of {} bytes, {} files, {} directories, {} errors, {}s)",
            run_id,
            result.success,
            result.transferred_size,
            result.total_size,
            result.file_count,
            result.directory_count,
            result.errors.len(),
            result.duration_seconds
        );
        if let Some(observer) = observer {
            observer.on_run_completed(&result);
        }
        Ok(result)
    }
}

/// Analyze, plan and execute with both sessions open.
fn transfer<S: RemoteFs, T: RemoteFs>(
    config: &TransferConfig,
    ctx: &mut RunContext,
    source: &mut S,
    target: &mut T,
    observer: Option<&dyn ProgressObserver>,
) -> Result<(u64, ExecutionSummary), (Phase, EngineError)> {
    let manifest =
        analyzer::analyze(&mut *source, &config.source_path).map_err(|e| (Phase::Analyze, e))?;
    ctx.progress
        .set_totals(manifest.total_bytes(), manifest.file_count());

    let plan = planner::plan(&manifest, PlanOptions::from(config));
    info!(
        "Plan: {} ({} files, {} bytes, chunking {}, chunk budget {} bytes)",
        plan,
        manifest.file_count(),
        manifest.total_bytes(),
        config.use_chunking,
        config.max_chunk_size
    );

    let staging =
        Staging::create(&config.staging_dir, ctx.run_id).map_err(|e| (Phase::Staging, e))?;
    if let Some(observer) = observer {
        observer.on_run_started(&manifest, plan);
    }

    let summary = TransferExecutor::new(source, target, &staging, ctx, config)
        .with_observer(observer)
        .execute(&manifest, plan);

    if let Err(e) = staging.close() {
        warn!("Failed to clean up staging: {}", e);
    }
    Ok((manifest.total_bytes(), summary))
}

fn abort(
    mut ctx: RunContext,
    phase: Phase,
    error: EngineError,
    observer: Option<&dyn ProgressObserver>,
) -> JobFailure {
    ctx.report.add_error(format!("{} failed: {}", phase, error));
    let report = ctx.report.finish(0, 0, 0, 0);
    if let Some(observer) = observer {
        observer.on_run_completed(&report);
    }
    JobFailure {
        phase,
        error,
        report,
    }
}

fn close_quietly<R: RemoteFs>(conn: &mut R, side: &str) {
    if let Err(e) = conn.close() {
        warn!("Failed to close {} session: {}", side, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::CompressionLevel;
    use crate::config::{EndpointConfig, Timeouts};
    use crate::model::{Manifest, Outcome, PlanKind};
    use crate::progress::ProgressSnapshot;
    use crate::testutil::{MemoryConnector, MemoryFs, RecordingSleeper};
    use flate2::read::GzDecoder;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    const SOURCE: &str = "old.example.org";
    const TARGET: &str = "new.example.org";

    fn endpoint(host: &str) -> EndpointConfig {
        EndpointConfig {
            host: host.to_string(),
            port: 21,
            user: "user".to_string(),
            password: "secret".to_string(),
        }
    }

    fn config(staging: &Path) -> TransferConfig {
        TransferConfig {
            source: endpoint(SOURCE),
            target: endpoint(TARGET),
            source_path: "public_html".to_string(),
            target_path: "public_html".to_string(),
            use_chunking: false,
            max_chunk_size: 1024,
            compression_level: CompressionLevel::default(),
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
            staging_dir: staging.to_path_buf(),
        }
    }

    fn site() -> MemoryFs {
        let fs = MemoryFs::new();
        fs.add_file("public_html/index.html", "<html>home</html>");
        fs.add_file("public_html/css/site.css", vec![b'c'; 700]);
        fs.add_file("public_html/img/logo.png", vec![7u8; 900]);
        fs.add_file("public_html/img/icons/fav.ico", vec![1u8; 300]);
        fs.add_dir("public_html/uploads");
        fs
    }

    struct Fixture {
        connector: MemoryConnector,
        source: MemoryFs,
        target: MemoryFs,
        sleeper: Arc<RecordingSleeper>,
        staging: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let source = site();
        let target = MemoryFs::new();
        let connector = MemoryConnector::new();
        connector.add_endpoint(SOURCE, source.clone());
        connector.add_endpoint(TARGET, target.clone());
        Fixture {
            connector,
            source,
            target,
            sleeper: Arc::new(RecordingSleeper::new()),
            staging: tempfile::tempdir().expect("Failed to create temp dir"),
        }
    }

    impl Fixture {
        fn run_with(
            &self,
            config: TransferConfig,
            observer: Option<&dyn ProgressObserver>,
        ) -> Result<TransferResult, JobFailure> {
            TransferJob::new(config)
                .expect("Failed to create job")
                .with_sleeper(self.sleeper.clone())
                .run(&self.connector, observer)
        }

        fn run(&self, config: TransferConfig) -> Result<TransferResult, JobFailure> {
            self.run_with(config, None)
        }

        fn staging_is_empty(&self) -> bool {
            std::fs::read_dir(self.staging.path())
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(true)
        }
    }

    fn unpack(data: &[u8]) -> BTreeMap<String, Vec<u8>> {
        let mut archive = tar::Archive::new(GzDecoder::new(data));
        let mut files = BTreeMap::new();
        for entry in archive.entries().expect("Failed to read archive") {
            let mut entry = entry.expect("Failed to read entry");
            let path = entry.path().unwrap().to_string_lossy().trim_end_matches('/').to_string();
            let mut content = Vec::new();
            std::io::Read::read_to_end(&mut entry, &mut content).unwrap();
            files.insert(path, content);
        }
        files
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<String>>,
        percentages: Mutex<Vec<f64>>,
    }

    impl ProgressObserver for RecordingObserver {
        fn on_run_started(&self, manifest: &Manifest, plan: PlanKind) {
            self.events
                .lock()
                .unwrap()
                .push(format!("start {} {}", plan, manifest.file_count()));
        }

        fn on_unit_started(&self, unit: &str) {
            self.events.lock().unwrap().push(format!("begin {}", unit));
        }

        fn on_unit_completed(&self, unit: &str, progress: &ProgressSnapshot) {
            self.events.lock().unwrap().push(format!("done {}", unit));
            self.percentages.lock().unwrap().push(progress.percentage());
        }

        fn on_unit_failed(&self, unit: &str, _error: &EngineError) {
            self.events.lock().unwrap().push(format!("failed {}", unit));
        }

        fn on_run_completed(&self, result: &TransferResult) {
            self.events.lock().unwrap().push(format!("end {}", result.success));
        }
    }

    #[test]
    fn test_direct_run_mirrors_tree() {
        let fx = fixture();
        let result = fx.run(config(fx.staging.path())).expect("Expected run to complete");

        assert_eq!(result.success, Outcome::Success);
        assert_eq!(result.total_size, 1917);
        assert_eq!(result.transferred_size, 1917);
        assert_eq!(result.file_count, 4);
        assert_eq!(result.directory_count, 4);
        assert!(result.errors.is_empty());

        for path in fx.source.file_paths() {
            assert_eq!(fx.target.file(&path), fx.source.file(&path), "{} differs", path);
        }
        assert!(fx.target.has_dir("public_html/uploads"));
        assert!(fx.target.has_dir("public_html/img/icons"));
        assert!(fx.staging_is_empty());
        assert_eq!(fx.source.closes(), 1);
        assert_eq!(fx.target.closes(), 1);
        assert!(fx.sleeper.delays().is_empty());
    }

    #[test]
    fn test_different_target_path() {
        let fx = fixture();
        let mut cfg = config(fx.staging.path());
        cfg.target_path = "www/site".to_string();
        let result = fx.run(cfg).expect("Expected run to complete");

        assert_eq!(result.success, Outcome::Success);
        assert_eq!(
            fx.target.file("www/site/css/site.css"),
            fx.source.file("public_html/css/site.css")
        );
    }

    #[test]
    fn test_connect_succeeds_after_two_failures() {
        let fx = fixture();
        fx.connector.fail_connects(SOURCE, 2);
        let result = fx.run(config(fx.staging.path())).expect("Expected run to complete");

        assert_eq!(result.success, Outcome::Success);
        assert_eq!(fx.connector.connect_attempts(SOURCE), 3);
        assert_eq!(
            fx.sleeper.delays(),
            vec![Duration::from_secs(2), Duration::from_secs(4)]
        );
    }

    #[test]
    fn test_connect_exhausted_aborts_with_report() {
        let fx = fixture();
        fx.connector.fail_connects(TARGET, 10);
        let failure = fx.run(config(fx.staging.path())).expect_err("Expected abort");

        assert_eq!(failure.phase, Phase::Connect);
        assert!(matches!(failure.error, EngineError::Connect { .. }));
        assert_eq!(failure.report.success, Outcome::Failed);
        assert_eq!(failure.report.errors.len(), 1);
        assert!(failure.report.errors[0].contains(TARGET));
        assert_eq!(fx.connector.connect_attempts(TARGET), 3);
        assert_eq!(fx.source.closes(), 1);
        assert!(fx.target.file_paths().is_empty());
    }

    #[test]
    fn test_missing_source_root_aborts() {
        let fx = fixture();
        let mut cfg = config(fx.staging.path());
        cfg.source_path = "no_such_dir".to_string();
        let failure = fx.run(cfg).expect_err("Expected abort");

        assert_eq!(failure.phase, Phase::Analyze);
        assert!(matches!(failure.error, EngineError::NotFound { .. }));
        assert_eq!(failure.report.success, Outcome::Failed);
        assert_eq!(fx.source.closes(), 1);
        assert_eq!(fx.target.closes(), 1);
        assert!(fx.staging_is_empty());
    }

    #[test]
    fn test_size_mismatch_is_retried_and_counted_once() {
        let fx = fixture();
        fx.target.misreport_size("public_html/img/logo.png", 1);
        let result = fx.run(config(fx.staging.path())).expect("Expected run to complete");

        assert_eq!(result.success, Outcome::Success);
        assert_eq!(result.file_count, 4);
        assert_eq!(result.transferred_size, result.total_size);
        let stores = fx.target.stores();
        assert_eq!(
            stores.iter().filter(|p| p.as_str() == "public_html/img/logo.png").count(),
            2
        );
        assert_eq!(fx.sleeper.delays(), vec![Duration::from_secs(2)]);
    }

    #[test]
    fn test_interrupted_download_is_retried() {
        let fx = fixture();
        fx.source.fail_retrieve("public_html/css/site.css", 2);
        let result = fx.run(config(fx.staging.path())).expect("Expected run to complete");

        assert_eq!(result.success, Outcome::Success);
        assert_eq!(
            fx.target.file("public_html/css/site.css"),
            Some(vec![b'c'; 700])
        );
    }

    #[test]
    fn test_connection_reset_reopens_session() {
        let fx = fixture();
        fx.source.reset_on_retrieve("public_html/css/site.css", 1);
        let result = fx.run(config(fx.staging.path())).expect("Expected run to complete");

        assert_eq!(result.success, Outcome::Success);
        assert_eq!(result.file_count, 4);
        assert!(result.errors.is_empty());
        for path in fx.source.file_paths() {
            assert_eq!(fx.target.file(&path), fx.source.file(&path), "{} differs", path);
        }
        assert_eq!(fx.connector.connect_attempts(SOURCE), 2);
        assert_eq!(fx.connector.connect_attempts(TARGET), 1);
        assert_eq!(fx.sleeper.delays(), vec![Duration::from_secs(2)]);
        assert_eq!(fx.source.closes(), 1);
    }

    #[test]
    fn test_failed_uploads_are_retried() {
        let fx = fixture();
        fx.target.fail_store("public_html/index.html", 2);
        let result = fx.run(config(fx.staging.path())).expect("Expected run to complete");

        assert_eq!(result.success, Outcome::Success);
        assert_eq!(result.file_count, 4);
        assert_eq!(
            fx.target.file("public_html/index.html"),
            Some(b"<html>home</html>".to_vec())
        );
        assert_eq!(
            fx.sleeper.delays(),
            vec![Duration::from_secs(2), Duration::from_secs(4)]
        );
    }

    #[test]
    fn test_exhausted_upload_does_not_stop_later_chunks() {
        let fx = fixture();
        fx.target.fail_store("public_html/css/site.css", 10);
        let mut cfg = config(fx.staging.path());
        cfg.use_chunking = true;
        cfg.max_chunk_size = 1000;
        let result = fx.run(cfg).expect("Expected run to complete");

        assert_eq!(result.success, Outcome::Failed);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("css/site.css:"));
        assert_eq!(result.file_count, 3);
        assert_eq!(result.transferred_size, 1917 - 700);
        assert!(fx.target.file("public_html/css/site.css").is_none());
        assert_eq!(
            fx.target.file("public_html/img/logo.png"),
            Some(vec![7u8; 900])
        );
        assert!(fx.target.file("public_html/index.html").is_some());
        assert!(fx.staging_is_empty());
    }

    #[test]
    fn test_failing_file_does_not_stop_run() {
        let fx = fixture();
        fx.source.fail_retrieve("public_html/img/logo.png", 10);
        let observer = RecordingObserver::default();
        let result = fx
            .run_with(config(fx.staging.path()), Some(&observer))
            .expect("Expected run to complete");

        assert_eq!(result.success, Outcome::Failed);
        assert_eq!(result.file_count, 3);
        assert_eq!(result.transferred_size, 1917 - 900);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("img/logo.png"));
        assert!(fx.target.file("public_html/img/logo.png").is_none());
        assert!(fx.target.file("public_html/img/icons/fav.ico").is_some());
        assert!(fx.staging_is_empty());

        let events = observer.events.lock().unwrap().clone();
        assert_eq!(events.first().map(String::as_str), Some("start direct 4"));
        assert!(events.contains(&"failed img/logo.png".to_string()));
        assert_eq!(events.last().map(String::as_str), Some("end FAILED"));
    }

    #[test]
    fn test_chunked_run_file_by_file() {
        let fx = fixture();
        let mut cfg = config(fx.staging.path());
        cfg.use_chunking = true;
        cfg.max_chunk_size = 1000;
        let observer = RecordingObserver::default();
        let result = fx
            .run_with(cfg, Some(&observer))
            .expect("Expected run to complete");

        assert_eq!(result.success, Outcome::Success);
        assert_eq!(result.file_count, 4);
        assert_eq!(result.directory_count, 4);
        for path in fx.source.file_paths() {
            assert_eq!(fx.target.file(&path), fx.source.file(&path));
        }
        let events = observer.events.lock().unwrap().clone();
        assert!(events[0].starts_with("start chunked"));
        for unit in events.iter().filter_map(|e| e.strip_prefix("begin ")) {
            assert!(
                events.contains(&format!("done {}", unit))
                    || events.contains(&format!("failed {}", unit)),
                "{} started but never finished",
                unit
            );
        }

        let percentages = observer.percentages.lock().unwrap().clone();
        assert!(percentages.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(percentages.last().copied(), Some(100.0));
    }

    #[test]
    fn test_direct_archive_run() {
        let fx = fixture();
        let mut cfg = config(fx.staging.path());
        cfg.compression_level = CompressionLevel::new(6).unwrap();
        let result = fx.run(cfg).expect("Expected run to complete");

        assert_eq!(result.success, Outcome::Success);
        assert_eq!(result.file_count, 4);
        assert_eq!(result.directory_count, 4);
        assert_eq!(fx.target.file_paths(), vec!["public_html/public_html.tar.gz"]);

        let archive = fx.target.file("public_html/public_html.tar.gz").unwrap();
        let members = unpack(&archive);
        assert_eq!(members.get("css/site.css"), Some(&vec![b'c'; 700]));
        assert_eq!(members.get("img/icons/fav.ico"), Some(&vec![1u8; 300]));
        assert!(members.contains_key("uploads"));
        assert!(fx.staging_is_empty());
    }

    #[test]
    fn test_chunked_archive_run() {
        let fx = fixture();
        let mut cfg = config(fx.staging.path());
        cfg.use_chunking = true;
        cfg.max_chunk_size = 1000;
        cfg.compression_level = CompressionLevel::SMALLEST;
        let result = fx.run(cfg).expect("Expected run to complete");

        assert_eq!(result.success, Outcome::Success);
        assert_eq!(result.file_count, 4);
        assert_eq!(result.directory_count, 4);

        let archives = fx.target.file_paths();
        assert!(archives.len() >= 2);
        assert!(archives.contains(&"public_html/public_html.part0001.tar.gz".to_string()));

        let mut all = BTreeMap::new();
        for path in &archives {
            all.extend(unpack(&fx.target.file(path).unwrap()));
        }
        for source_path in fx.source.file_paths() {
            let rel = source_path.trim_start_matches("public_html/");
            assert_eq!(all.get(rel), fx.source.file(&source_path).as_ref());
        }
        assert!(all.contains_key("uploads"));
    }

    #[test]
    fn test_degraded_listing_run() {
        let fx = fixture();
        fx.source.set_structured_listing(false);
        let result = fx.run(config(fx.staging.path())).expect("Expected run to complete");

        assert_eq!(result.success, Outcome::Success);
        assert_eq!(result.total_size, 1917);
        assert_eq!(fx.source.size_queries(), 4);
    }

    #[test]
    fn test_empty_source_succeeds() {
        let fx = fixture();
        fx.source.add_dir("empty_site");
        let mut cfg = config(fx.staging.path());
        cfg.source_path = "empty_site".to_string();
        cfg.target_path = "empty_site".to_string();
        let result = fx.run(cfg).expect("Expected run to complete");

        assert_eq!(result.success, Outcome::Success);
        assert_eq!(result.total_size, 0);
        assert!(fx.target.has_dir("empty_site"));
    }

    #[test]
    fn test_progress_handle_reaches_completion() {
        let fx = fixture();
        let job = TransferJob::new(config(fx.staging.path()))
            .expect("Failed to create job")
            .with_sleeper(fx.sleeper.clone());
        let progress = job.progress();
        assert_eq!(progress.snapshot().percentage(), 0.0);

        job.run(&fx.connector, None).expect("Expected run to complete");
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.percentage(), 100.0);
        assert_eq!(snapshot.files_completed, 4);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let staging = tempfile::tempdir().expect("Failed to create temp dir");
        let mut cfg = config(staging.path());
        cfg.max_chunk_size = 0;
        assert!(matches!(
            TransferJob::new(cfg),
            Err(EngineError::Config { .. })
        ));
    }
}
