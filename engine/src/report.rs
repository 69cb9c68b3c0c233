//! Run report assembly.
//!
//! A `ReportBuilder` is opened when a run starts and collects error messages
//! as they happen. `finish` consumes it, so each run produces exactly one
//! `TransferResult`, on success and on failure alike.

use std::time::Instant;

use chrono::{DateTime, Local};
use tracing::error;
use uuid::Uuid;

use crate::model::{Outcome, TransferResult};

/// Protocol identifier recorded in every report.
pub const PROTOCOL: &str = "ftp";

/// Timestamp layout used in persisted reports.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Column order of the persisted result table.
pub const CSV_HEADERS: [&str; 14] = [
    "timestamp",
    "success",
    "protocol",
    "source_path",
    "target_path",
    "start_time",
    "end_time",
    "duration_seconds",
    "total_size_mb",
    "transferred_size_mb",
    "transfer_speed_mbps",
    "file_count",
    "directory_count",
    "errors",
];

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Accumulates the facts of one run until it is finalized.
#[derive(Debug)]
pub struct ReportBuilder {
    run_id: Uuid,
    source_path: String,
    target_path: String,
    start_time: DateTime<Local>,
    started: Instant,
    errors: Vec<String>,
}

impl ReportBuilder {
    /// Record the start of a run.
    pub fn begin(run_id: Uuid, source_path: &str, target_path: &str) -> Self {
        ReportBuilder {
            run_id,
            source_path: source_path.to_string(),
            target_path: target_path.to_string(),
            start_time: Local::now(),
            started: Instant::now(),
            errors: Vec::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Append an error message; order of calls is preserved.
    pub fn add_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        error!("{}", message);
        self.errors.push(message);
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Stamp the end time and compute derived fields.
    ///
    /// The run counts as successful only when no error was recorded and
    /// every planned byte arrived.
    pub fn finish(
        self,
        total_size: u64,
        transferred_size: u64,
        file_count: u64,
        directory_count: u64,
    ) -> TransferResult {
        let end_time = Local::now();
        let elapsed = self.started.elapsed().as_secs_f64();
        let throughput_bps = if elapsed > 0.0 {
            transferred_size as f64 / elapsed
        } else {
            0.0
        };
        let success = if self.errors.is_empty() && transferred_size == total_size {
            Outcome::Success
        } else {
            Outcome::Failed
        };

        TransferResult {
            run_id: self.run_id,
            success,
            protocol: PROTOCOL.to_string(),
            source_path: self.source_path,
            target_path: self.target_path,
            start_time: self.start_time,
            end_time,
            duration_seconds: (end_time - self.start_time).num_seconds().max(0) as u64,
            total_size,
            transferred_size,
            throughput_bps,
            file_count,
            directory_count,
            errors: self.errors,
        }
    }
}

impl TransferResult {
    /// One row of the result table, in `CSV_HEADERS` order.
    ///
    /// `timestamp` is when the row is written. Sizes are in MB (1024²
    /// bytes) and the speed in MB/s, both with two decimals.
    pub fn csv_record(&self, timestamp: DateTime<Local>) -> Vec<String> {
        vec![
            timestamp.format(TIMESTAMP_FORMAT).to_string(),
            self.success.to_string(),
            self.protocol.clone(),
            self.source_path.clone(),
            self.target_path.clone(),
            self.start_time.format(TIMESTAMP_FORMAT).to_string(),
            self.end_time.format(TIMESTAMP_FORMAT).to_string(),
            self.duration_seconds.to_string(),
            format!("{:.2}", self.total_size as f64 / BYTES_PER_MB),
            format!("{:.2}", self.transferred_size as f64 / BYTES_PER_MB),
            format!("{:.2}", self.throughput_bps / BYTES_PER_MB),
            self.file_count.to_string(),
            self.directory_count.to_string(),
            self.errors.join("; "),
        ]
    }
}
