//! Splits a manifest's files into size-bounded chunks.
//!
//! Greedy, in manifest order: a file joins the open chunk if it fits,
//! otherwise the chunk is closed and a new one started. A file larger than
//! the budget travels alone in its own chunk. Directories are not chunked;
//! they are implied by the paths of the files inside each chunk.

use tracing::debug;

use crate::model::{Chunk, Manifest};

/// Partition the manifest's files into chunks of at most `max_bytes`.
///
/// Every file lands in exactly one chunk. Same input, same chunks.
pub fn build_chunks(manifest: &Manifest, max_bytes: u64) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut current = Chunk {
        sequence: 1,
        files: Vec::new(),
        total_bytes: 0,
    };

    for file in manifest.files() {
        let fits = current.total_bytes.saturating_add(file.size) <= max_bytes;
        if !current.files.is_empty() && !fits {
            let next = current.sequence + 1;
            chunks.push(std::mem::replace(
                &mut current,
                Chunk {
                    sequence: next,
                    files: Vec::new(),
                    total_bytes: 0,
                },
            ));
        }
        current.total_bytes += file.size;
        current.files.push(file.clone());
    }
    if !current.files.is_empty() {
        chunks.push(current);
    }

    debug!(
        "Split {} files into {} chunks of at most {} bytes",
        manifest.file_count(),
        chunks.len(),
        max_bytes
    );
    chunks
}
