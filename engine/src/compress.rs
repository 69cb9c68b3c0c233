//! Compression stage: packs a staged directory into a gzip'd tar archive.
//!
//! The level only trades speed for ratio. Whatever the level, unpacking the
//! archive yields the same relative paths with the same bytes.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use crate::error::EngineError;

/// Effort level, 1 (fastest) to 9 (smallest).
///
/// Level 1 is the default and means "no archive": files are uploaded one by
/// one. Higher levels stage each unit into an archive before upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel(u32);

impl CompressionLevel {
    pub const FASTEST: CompressionLevel = CompressionLevel(1);
    pub const SMALLEST: CompressionLevel = CompressionLevel(9);

    pub fn new(level: u32) -> Result<Self, EngineError> {
        if (1..=9).contains(&level) {
            Ok(CompressionLevel(level))
        } else {
            Err(EngineError::config(
                "COMPRESSION_LEVEL",
                format!("{} is not between 1 and 9", level),
            ))
        }
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// True when units should be archived before upload.
    pub fn uses_archive(self) -> bool {
        self.0 > 1
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        CompressionLevel::FASTEST
    }
}

/// Archive everything under `dir` into `archive_path` (`.tar.gz`).
///
/// Entries are added in sorted path order so the same tree always produces
/// the same member order. `archive_path` must lie outside `dir`.
///
/// # Returns
/// Size of the written archive in bytes
///
/// # Errors
/// Returns `EngineError::Compression` if reading the tree or writing the
/// archive fails
pub fn compress_dir(
    dir: &Path,
    level: CompressionLevel,
    archive_path: &Path,
) -> Result<u64, EngineError> {
    let wrap = |source: std::io::Error| EngineError::Compression {
        path: dir.to_path_buf(),
        source,
    };

    let file = File::create(archive_path).map_err(wrap)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::new(level.get()));
    let mut builder = tar::Builder::new(encoder);

    append_tree(&mut builder, dir, Path::new("")).map_err(wrap)?;

    let encoder = builder.into_inner().map_err(wrap)?;
    let mut writer = encoder.finish().map_err(wrap)?;
    writer.flush().map_err(wrap)?;
    drop(writer);

    let size = fs::metadata(archive_path).map_err(wrap)?.len();
    debug!(
        "Archived {} into {} ({} bytes, level {})",
        dir.display(),
        archive_path.display(),
        size,
        level.get()
    );
    Ok(size)
}

fn append_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    dir: &Path,
    rel: &Path,
) -> std::io::Result<()> {
    let mut children: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    children.sort_by_key(|entry| entry.file_name());

    for child in children {
        let path = child.path();
        let name = rel.join(child.file_name());
        if child.file_type()?.is_dir() {
            builder.append_dir(&name, &path)?;
            append_tree(builder, &path, &name)?;
        } else {
            builder.append_path_with_name(&path, &name)?;
        }
    }
    Ok(())
}
