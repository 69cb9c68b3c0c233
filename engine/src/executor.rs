//! Transfer execution.
//!
//! Moves a planned manifest from the source session to the target session
//! through the local staging area. Two shapes of unit exist:
//!
//! - file by file (compression level 1): each file is downloaded, uploaded
//!   to the mirrored path and discarded; directories are created up front
//! - archive (level above 1): a unit's files are downloaded, packed into a
//!   `.tar.gz` and the archive is uploaded into the target directory
//!
//! A direct plan is one unit covering the whole manifest; a chunked plan is
//! one unit per chunk, drained in sequence order. Every remote operation is
//! retried under the run's policy. A unit that still fails is recorded in
//! the report and the run moves on.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::chunker::build_chunks;
use crate::compress::{compress_dir, CompressionLevel};
use crate::config::TransferConfig;
use crate::connection::RemoteFs;
use crate::error::EngineError;
use crate::job::RunContext;
use crate::model::{Chunk, Entry, Manifest, PlanKind};
use crate::paths::{join_remote, local_path_for, remote_ancestors, remote_basename, remote_parent};
use crate::progress::ProgressObserver;
use crate::retry;
use crate::staging::{ensure_parent_dir_exists, preserve_mtime, Staging};

/// Packs a staged unit directory into an archive; returns the archive size.
pub type Packer = fn(&Path, CompressionLevel, &Path) -> Result<u64, EngineError>;

/// What actually reached the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    /// Source bytes of every file that reached the target
    pub bytes_transferred: u64,
    pub files_transferred: u64,
    pub dirs_created: u64,
}

/// Drives one run's units from source to target.
pub struct TransferExecutor<'a, S: RemoteFs + ?Sized, T: RemoteFs + ?Sized> {
    source: &'a mut S,
    target: &'a mut T,
    staging: &'a Staging,
    ctx: &'a mut RunContext,
    observer: Option<&'a dyn ProgressObserver>,
    source_root: String,
    target_root: String,
    level: CompressionLevel,
    packer: Packer,
    max_chunk_size: u64,
    /// Target directories known to exist
    remote_dirs: HashSet<String>,
    /// Manifest directories delivered inside an uploaded archive
    shipped_dirs: HashSet<String>,
    summary: ExecutionSummary,
}

impl<'a, S: RemoteFs + ?Sized, T: RemoteFs + ?Sized> TransferExecutor<'a, S, T> {
    pub fn new(
        source: &'a mut S,
        target: &'a mut T,
        staging: &'a Staging,
        ctx: &'a mut RunContext,
        config: &TransferConfig,
    ) -> Self {
        TransferExecutor {
            source,
            target,
            staging,
            ctx,
            observer: None,
            source_root: config.source_path.clone(),
            target_root: config.target_path.clone(),
            level: config.compression_level,
            packer: compress_dir,
            max_chunk_size: config.max_chunk_size,
            remote_dirs: HashSet::new(),
            shipped_dirs: HashSet::new(),
            summary: ExecutionSummary::default(),
        }
    }

    pub fn with_observer(mut self, observer: Option<&'a dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Replace how archive units are packed.
    pub fn with_packer(mut self, packer: Packer) -> Self {
        self.packer = packer;
        self
    }

    /// Execute `plan` over `manifest` and report what reached the target.
    pub fn execute(self, manifest: &Manifest, plan: PlanKind) -> ExecutionSummary {
        match plan {
            PlanKind::Direct => self.execute_direct(manifest),
            PlanKind::Chunked => {
                let chunks = build_chunks(manifest, self.max_chunk_size);
                info!(
                    "Split {} bytes into {} chunks",
                    manifest.total_bytes(),
                    chunks.len()
                );
                self.execute_chunked(manifest, &chunks)
            }
        }
    }

    /// Move the whole manifest as a single unit.
    pub fn execute_direct(mut self, manifest: &Manifest) -> ExecutionSummary {
        if self.level.uses_archive() {
            self.warn_archive_mode();
            let files: Vec<&Entry> = manifest.files().collect();
            let dirs: Vec<&Entry> = manifest.directories().collect();
            let name = format!("{}.tar.gz", self.archive_stem());
            self.ship_archive("direct", &name, &files, &dirs);
        } else {
            self.create_directories(manifest);
            match self.staging.unit_dir("direct") {
                Ok(unit) => {
                    for file in manifest.files() {
                        self.transfer_file(file, &unit);
                    }
                    self.discard(&unit);
                }
                Err(e) => self.fail_unit("staging", e),
            }
        }
        self.summary
    }

    /// Move the manifest chunk by chunk, in sequence order.
    pub fn execute_chunked(mut self, manifest: &Manifest, chunks: &[Chunk]) -> ExecutionSummary {
        let archive = self.level.uses_archive();
        if archive {
            self.warn_archive_mode();
        } else {
            self.create_directories(manifest);
        }

        // Directories with no file below them ride along with the first chunk
        let empty_dirs: Vec<&Entry> = manifest
            .directories()
            .filter(|d| !manifest.files().any(|f| is_within(&f.path, &d.path)))
            .collect();
        let stem = self.archive_stem();

        for chunk in chunks {
            info!(
                "Chunk {}/{}: {} files, {} bytes",
                chunk.sequence,
                chunks.len(),
                chunk.files.len(),
                chunk.total_bytes
            );
            let unit_name = format!("chunk-{:04}", chunk.sequence);

            if archive {
                let files: Vec<&Entry> = chunk.files.iter().collect();
                let mut dirs: Vec<&Entry> = manifest
                    .directories()
                    .filter(|d| chunk.files.iter().any(|f| is_within(&f.path, &d.path)))
                    .collect();
                if chunk.sequence == 1 {
                    dirs.extend(empty_dirs.iter().copied());
                }
                let name = format!("{}.part{:04}.tar.gz", stem, chunk.sequence);
                self.ship_archive(&unit_name, &name, &files, &dirs);
                continue;
            }

            match self.staging.unit_dir(&unit_name) {
                Ok(unit) => {
                    for file in &chunk.files {
                        self.transfer_file(file, &unit);
                    }
                    self.discard(&unit);
                }
                Err(e) => self.fail_unit(&format!("chunk {}", chunk.sequence), e),
            }
        }
        self.summary
    }

    fn warn_archive_mode(&self) {
        warn!(
            "Compression level {} uploads .tar.gz archives into {}; FTP cannot extract them remotely",
            self.level.get(),
            self.target_root
        );
    }

    fn archive_stem(&self) -> String {
        match remote_basename(&self.source_root) {
            "" | "." | ".." => "transfer".to_string(),
            name => name.to_string(),
        }
    }

    /// Create every manifest directory (and the target root) on the target.
    fn create_directories(&mut self, manifest: &Manifest) {
        if let Err(e) = self.ensure_remote_dir("") {
            let root = self.target_root.clone();
            self.fail_unit(&root, e);
        }
        for dir in manifest.directories() {
            match self.ensure_remote_dir(&dir.path) {
                Ok(()) => self.summary.dirs_created += 1,
                Err(e) => self.fail_unit(&dir.path, e),
            }
        }
    }

    /// Download, upload and discard one file.
    fn transfer_file(&mut self, file: &Entry, unit: &Path) {
        if let Some(observer) = self.observer {
            observer.on_unit_started(&file.path);
        }

        let result = self.download(file, unit).and_then(|local| {
            let uploaded = self.upload(&local, &file.path);
            self.discard(&local);
            uploaded
        });

        match result {
            Ok(_) => {
                self.summary.bytes_transferred += file.size;
                self.summary.files_transferred += 1;
                self.ctx.progress.advance(file.size, 1);
                if let Some(observer) = self.observer {
                    observer.on_unit_completed(&file.path, &self.ctx.progress.snapshot());
                }
            }
            Err(e) => self.fail_unit(&file.path, e),
        }
    }

    /// Stage `files` (and `dirs`) under `unit_name`, pack them and upload the
    /// archive as `archive_name` into the target root.
    fn ship_archive(&mut self, unit_name: &str, archive_name: &str, files: &[&Entry], dirs: &[&Entry]) {
        if let Some(observer) = self.observer {
            observer.on_unit_started(archive_name);
        }
        let unit = match self.staging.unit_dir(unit_name) {
            Ok(unit) => unit,
            Err(e) => {
                self.fail_unit(archive_name, e);
                return;
            }
        };

        let mut staged_dirs = Vec::with_capacity(dirs.len());
        for dir in dirs {
            let created = local_path_for(&unit, &dir.path).and_then(|path| {
                fs::create_dir_all(&path).map_err(|e| EngineError::staging(&path, e))
            });
            match created {
                Ok(()) => staged_dirs.push(*dir),
                Err(e) => self.fail_unit(&dir.path, e),
            }
        }

        let mut staged = Vec::with_capacity(files.len());
        for file in files {
            match self.download(file, &unit) {
                Ok(_) => staged.push(*file),
                Err(e) => self.fail_unit(&file.path, e),
            }
        }

        let archive_path = self.staging.archive_path(archive_name);
        let result = (self.packer)(&unit, self.level, &archive_path)
            .and_then(|size| {
                debug!("Packed {} files into {} ({} bytes)", staged.len(), archive_name, size);
                self.upload(&archive_path, archive_name)
            });
        self.discard(&unit);
        self.discard(&archive_path);

        match result {
            Ok(_) => {
                let bytes: u64 = staged.iter().map(|f| f.size).sum();
                let count = staged.len() as u64;
                self.summary.bytes_transferred += bytes;
                self.summary.files_transferred += count;
                for dir in staged_dirs {
                    if self.shipped_dirs.insert(dir.path.clone()) {
                        self.summary.dirs_created += 1;
                    }
                }
                self.ctx.progress.advance(bytes, count);
                info!("Uploaded {} ({} files, {} bytes)", archive_name, count, bytes);
                if let Some(observer) = self.observer {
                    observer.on_unit_completed(archive_name, &self.ctx.progress.snapshot());
                }
            }
            Err(e) => self.fail_unit(archive_name, e),
        }
    }

    /// Fetch one source file into the unit directory, verifying its size.
    fn download(&mut self, file: &Entry, unit: &Path) -> Result<PathBuf, EngineError> {
        let local = local_path_for(unit, &file.path)?;
        ensure_parent_dir_exists(&local)?;
        let remote = join_remote(&self.source_root, &file.path);

        let source = &mut *self.source;
        let label = format!("Download {}", remote);
        retry::run(&self.ctx.retry, self.ctx.sleeper.as_ref(), &label, |_| {
            let out = File::create(&local).map_err(|e| EngineError::staging(&local, e))?;
            let mut writer = BufWriter::new(out);
            let received = source.retrieve(&remote, &mut writer)?;
            writer.flush().map_err(|e| EngineError::staging(&local, e))?;
            verify_size(&remote, file.size, received)
        })?;

        if let Some(modified) = file.modified {
            preserve_mtime(&local, modified);
        }
        Ok(local)
    }

    /// Store a staged file at `rel` under the target root, verifying the
    /// byte count sent and, when the target can tell, the size it holds.
    fn upload(&mut self, local: &Path, rel: &str) -> Result<u64, EngineError> {
        self.ensure_remote_dir(remote_parent(rel).unwrap_or(""))?;
        let remote = join_remote(&self.target_root, rel);
        let expected = fs::metadata(local)
            .map_err(|e| EngineError::staging(local, e))?
            .len();

        let target = &mut *self.target;
        let label = format!("Upload {}", remote);
        retry::run(&self.ctx.retry, self.ctx.sleeper.as_ref(), &label, |_| {
            let mut file = File::open(local).map_err(|e| EngineError::staging(local, e))?;
            let sent = target.store(&mut file, &remote)?;
            verify_size(&remote, expected, sent)?;
            if let Some(reported) = target.size(&remote)? {
                verify_size(&remote, expected, reported)?;
            }
            Ok(sent)
        })
    }

    /// Make sure `rel` (relative to the target root) exists on the target.
    fn ensure_remote_dir(&mut self, rel: &str) -> Result<(), EngineError> {
        let full = join_remote(&self.target_root, rel);
        for dir in remote_ancestors(&full) {
            if self.remote_dirs.contains(&dir) {
                continue;
            }
            let target = &mut *self.target;
            let label = format!("Create directory {}", dir);
            retry::run(&self.ctx.retry, self.ctx.sleeper.as_ref(), &label, |_| {
                target.make_dir(&dir)
            })?;
            debug!("Directory ready: {}", dir);
            self.remote_dirs.insert(dir);
        }
        Ok(())
    }

    fn discard(&self, path: &Path) {
        if let Err(e) = self.staging.discard(path) {
            warn!("{}", e);
        }
    }

    fn fail_unit(&mut self, unit: &str, error: EngineError) {
        self.ctx.report.add_error(format!("{}: {}", unit, error));
        if let Some(observer) = self.observer {
            observer.on_unit_failed(unit, &error);
        }
    }
}

fn verify_size(path: &str, expected: u64, actual: u64) -> Result<(), EngineError> {
    if expected == actual {
        Ok(())
    } else {
        Err(EngineError::SizeMismatch {
            path: path.to_string(),
            expected,
            actual,
        })
    }
}

/// True when `path` lies somewhere below directory `dir`.
fn is_within(path: &str, dir: &str) -> bool {
    path.strip_prefix(dir)
        .is_some_and(|rest| rest.starts_with('/'))
}
