//! Core data model for transfer runs.
//!
//! This module defines the data structures flowing through a run:
//! - Entry / Manifest: what the source tree contains
//! - Chunk: a size-bounded slice of the manifest's files
//! - PlanKind: how the manifest will be moved
//! - TransferResult: the finalized record of one run

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Kind of a remote entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryKind {
    File,
    Directory,
}

/// A single file or directory found under the source root.
///
/// Produced by the analyzer and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Path relative to the source root, `/`-separated
    pub path: String,

    /// File or directory
    pub kind: EntryKind,

    /// Size in bytes (0 for directories)
    pub size: u64,

    /// Last modification time, when the endpoint reports it
    pub modified: Option<DateTime<Utc>>,
}

impl Entry {
    pub fn file(path: impl Into<String>, size: u64) -> Self {
        Entry {
            path: path.into(),
            kind: EntryKind::File,
            size,
            modified: None,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Entry {
            path: path.into(),
            kind: EntryKind::Directory,
            size: 0,
            modified: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Ordered listing of everything under the source root, with totals.
///
/// Order is depth-first in listing order, so a directory always precedes
/// the entries inside it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<Entry>,
    total_bytes: u64,
    file_count: u64,
    dir_count: u64,
}

impl Manifest {
    /// Build a manifest from entries in traversal order, computing totals.
    pub fn new(entries: Vec<Entry>) -> Self {
        let mut total_bytes = 0;
        let mut file_count = 0;
        let mut dir_count = 0;
        for entry in &entries {
            match entry.kind {
                EntryKind::File => {
                    total_bytes += entry.size;
                    file_count += 1;
                }
                EntryKind::Directory => dir_count += 1,
            }
        }
        Manifest {
            entries,
            total_bytes,
            file_count,
            dir_count,
        }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// File entries only, in manifest order.
    pub fn files(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter().filter(|e| !e.is_dir())
    }

    /// Directory entries only, in manifest order.
    pub fn directories(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter().filter(|e| e.is_dir())
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn file_count(&self) -> u64 {
        self.file_count
    }

    pub fn dir_count(&self) -> u64 {
        self.dir_count
    }
}

/// A size-bounded group of files processed as one download/upload unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 1-based sequence number
    pub sequence: u32,

    /// Files in manifest order; directories are implied by their paths
    pub files: Vec<Entry>,

    /// Sum of the file sizes
    pub total_bytes: u64,
}

/// How a manifest is moved to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    /// One pass over the whole manifest
    Direct,
    /// Size-bounded chunks, each staged and uploaded on its own
    Chunked,
}

impl std::fmt::Display for PlanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanKind::Direct => write!(f, "direct"),
            PlanKind::Chunked => write!(f, "chunked"),
        }
    }
}

/// Final verdict of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILED")]
    Failed,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        *self == Outcome::Success
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success => write!(f, "SUCCESS"),
            Outcome::Failed => write!(f, "FAILED"),
        }
    }
}

/// Immutable record of one run, handed to report persistence.
///
/// Only `ReportBuilder::finish` creates one.
#[derive(Debug, Clone, Serialize)]
pub struct TransferResult {
    /// Unique identifier of the run
    pub run_id: Uuid,

    pub success: Outcome,

    /// Transport protocol identifier (always "ftp")
    pub protocol: String,

    pub source_path: String,

    pub target_path: String,

    pub start_time: DateTime<Local>,

    pub end_time: DateTime<Local>,

    /// Whole seconds between start and end
    pub duration_seconds: u64,

    /// Planned bytes (sum of manifest file sizes)
    pub total_size: u64,

    /// Bytes that reached the target
    pub transferred_size: u64,

    /// Bytes per second over the run's wall-clock time
    pub throughput_bps: f64,

    pub file_count: u64,

    pub directory_count: u64,

    /// Error messages in the order they were recorded
    pub errors: Vec<String>,
}
