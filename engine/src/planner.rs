//! Chooses between one direct pass and size-bounded chunks.

use crate::config::TransferConfig;
use crate::model::{Manifest, PlanKind};

/// The settings that influence planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanOptions {
    pub use_chunking: bool,
    pub max_chunk_size: u64,
}

impl From<&TransferConfig> for PlanOptions {
    fn from(config: &TransferConfig) -> Self {
        PlanOptions {
            use_chunking: config.use_chunking,
            max_chunk_size: config.max_chunk_size,
        }
    }
}

/// Chunk only when chunking is enabled and the tree exceeds one chunk.
pub fn plan(manifest: &Manifest, options: PlanOptions) -> PlanKind {
    if options.use_chunking && manifest.total_bytes() > options.max_chunk_size {
        PlanKind::Chunked
    } else {
        PlanKind::Direct
    }
}
