//! Source tree analysis.
//!
//! Walks the source root depth-first and produces the `Manifest` every later
//! stage works from. Structured listings carry sizes; with degraded listings
//! each file costs one extra size query.

use tracing::{debug, info, warn};

use crate::connection::RemoteFs;
use crate::error::EngineError;
use crate::model::{Entry, EntryKind, Manifest};
use crate::paths::join_remote;

/// Enumerate everything under `root` on the source.
///
/// Entries are relative to `root`, in listing order, each directory pushed
/// before its contents.
///
/// # Errors
/// Returns `EngineError::NotFound` if `root` is not a directory, or the
/// first listing/size error encountered
pub fn analyze<R: RemoteFs + ?Sized>(conn: &mut R, root: &str) -> Result<Manifest, EngineError> {
    if !conn.is_directory(root)? {
        return Err(EngineError::NotFound {
            path: root.to_string(),
        });
    }
    if !conn.supports_structured_listing() {
        info!("Analyzing {} with degraded listings", root);
    }

    let mut entries = Vec::new();
    walk(conn, root, "", &mut entries)?;
    let manifest = Manifest::new(entries);

    info!(
        "Analyzed {}: {} files, {} directories, {} bytes",
        root,
        manifest.file_count(),
        manifest.dir_count(),
        manifest.total_bytes()
    );
    Ok(manifest)
}

fn walk<R: RemoteFs + ?Sized>(
    conn: &mut R,
    dir: &str,
    rel: &str,
    entries: &mut Vec<Entry>,
) -> Result<(), EngineError> {
    for child in conn.list(dir)? {
        let child_abs = join_remote(dir, &child.name);
        let child_rel = join_remote(rel, &child.name);

        match child.kind {
            EntryKind::Directory => {
                entries.push(Entry {
                    modified: child.modified,
                    ..Entry::directory(child_rel.as_str())
                });
                walk(conn, &child_abs, &child_rel, entries)?;
            }
            EntryKind::File => {
                let size = match child.size {
                    Some(size) => size,
                    None => conn.size(&child_abs)?.unwrap_or_else(|| {
                        warn!("Size of {} unknown; counting it as 0 bytes", child_abs);
                        0
                    }),
                };
                debug!("Found {} ({} bytes)", child_rel, size);
                entries.push(Entry {
                    modified: child.modified,
                    ..Entry::file(child_rel, size)
                });
            }
        }
    }
    Ok(())
}
