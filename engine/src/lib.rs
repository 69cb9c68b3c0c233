//! # sitemove Engine - FTP Site Transfer Library
//!
//! A headless engine that copies a directory tree from one FTP server to
//! another through local staging. Designed to be driven by a CLI or by
//! automation.
//!
//! ## Overview
//!
//! The engine provides:
//! - Depth-first analysis of the source tree (MLSD, or NLST + SIZE)
//! - Direct or size-bounded chunked transfer plans
//! - Optional `.tar.gz` packing of each unit before upload
//! - Per-operation retry with exponential backoff
//! - Size verification after every transfer
//! - Per-unit error isolation and a single report per run
//! - Progress reporting via an observer trait and a lock-free tracker
//!
//! ## Basic Usage
//!
//! ```no_run
//! use engine::{FtpConnector, TransferConfig, TransferJob};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TransferConfig::from_env()?;
//! let job = TransferJob::new(config)?;
//!
//! match job.run(&FtpConnector, None) {
//!     Ok(result) => println!("{}: {} bytes", result.success, result.transferred_size),
//!     Err(failure) => eprintln!("{}", failure),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (Entry, Manifest, Chunk, TransferResult)
//! - **error**: Error types and retry classification
//! - **config**: Environment-driven configuration
//! - **retry**: Retry policy, state machine and backoff
//! - **connection**: Remote session trait and the FTP implementation
//! - **listing**: MLSD / NLST response parsing
//! - **analyzer**: Source tree enumeration
//! - **planner** / **chunker**: Direct vs chunked planning, chunk building
//! - **compress**: tar.gz packing
//! - **staging**: Per-run local scratch space
//! - **executor**: Moving units from source to target
//! - **progress**: Progress counters and observer trait
//! - **report**: Run report assembly and CSV layout
//! - **job**: Run orchestration

pub mod analyzer;
pub mod chunker;
pub mod compress;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod job;
pub mod listing;
pub mod model;
pub mod paths;
pub mod planner;
pub mod progress;
pub mod report;
pub mod retry;
pub mod staging;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export main types and functions
pub use compress::CompressionLevel;
pub use config::{EndpointConfig, Timeouts, TransferConfig};
pub use connection::{Connector, FtpConnection, FtpConnector, RemoteFs, Session};
pub use error::EngineError;
pub use job::{JobFailure, Phase, TransferJob};
pub use model::{Chunk, Entry, EntryKind, Manifest, Outcome, PlanKind, TransferResult};
pub use progress::{ProgressObserver, ProgressSnapshot, ProgressTracker};
pub use report::{ReportBuilder, CSV_HEADERS, PROTOCOL, TIMESTAMP_FORMAT};
pub use retry::{RetryPolicy, Sleeper, ThreadSleeper};
