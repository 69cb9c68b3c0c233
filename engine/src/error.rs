//! Error types for the transfer engine.
//!
//! The primary error type is `EngineError`. Run-level failures (bad
//! configuration, unreachable endpoint, missing source root) abort the run.
//! Unit-level failures (one file, one chunk) are recorded in the run report
//! and the run moves on to the next unit.

use std::io;
use std::path::PathBuf;

/// Errors produced by the engine.
///
/// Whether an operation that failed with one of these may be attempted again
/// is decided by [`EngineError::is_retryable`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Missing or invalid configuration value
    #[error("Configuration error: {key}: {reason}")]
    Config { key: String, reason: String },

    /// Could not open, authenticate, or configure a session
    #[error("Failed to connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    /// Source root does not exist or is not a directory
    #[error("Remote directory not found: {path}")]
    NotFound { path: String },

    /// Transport failure while listing, retrieving or storing
    #[error("Transfer failed for {path}: {reason}")]
    Transfer { path: String, reason: String },

    /// Byte count after a transfer differs from the expected size
    #[error("Size mismatch for {path}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    /// Archiving a staged directory failed
    #[error("Compression failed for {}: {source}", path.display())]
    Compression { path: PathBuf, source: io::Error },

    /// Local scratch storage could not be read or written
    #[error("Staging error at {}: {source}", path.display())]
    Staging { path: PathBuf, source: io::Error },

    /// Remote-supplied path would escape the staging area
    #[error("Invalid path: {path} ({reason})")]
    InvalidPath { path: String, reason: String },
}

impl EngineError {
    /// Returns true if the failed operation may be attempted again.
    ///
    /// Session and transport problems are usually transient (resets,
    /// timeouts, a short read), so are size mismatches. Local disk problems,
    /// bad configuration and missing paths will not fix themselves.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Transfer { .. } | Self::SizeMismatch { .. }
        )
    }

    pub(crate) fn config(key: &str, reason: impl Into<String>) -> Self {
        EngineError::Config {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn transfer(path: &str, reason: impl ToString) -> Self {
        EngineError::Transfer {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn staging(path: impl Into<PathBuf>, source: io::Error) -> Self {
        EngineError::Staging {
            path: path.into(),
            source,
        }
    }
}
