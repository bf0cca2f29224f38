//! C3: per-batch CPU-bound parallel dispatch for tile decode/transform/encode.
//!
//! Sized to the rayon global thread pool (same sizing call the teacher used
//! for its histogram/layer-list scans) rather than a persistent
//! channel-based pool: the driver never dispatches batch *k+1* before batch
//! *k* completes, so a fresh joined parallel iterator per batch is simpler
//! than managing a long-lived pool across batches.

use std::collections::HashSet;

use rayon::prelude::*;

use crate::codec;
use crate::transform;

/// One input row for a batch.
pub struct TileJob {
    pub zoom_level: i64,
    pub tile_column: i64,
    pub tile_row: i64,
    pub tile_data: Vec<u8>,
}

/// Outcome of processing a single tile.
pub enum TileOutcome {
    /// Decode failed; counted as a non-fatal per-tile failure, row left
    /// untouched.
    DecodeFailed {
        zoom_level: i64,
        tile_column: i64,
        tile_row: i64,
    },
    /// Decoded fine but nothing changed; row left untouched.
    Unchanged,
    /// Decoded, transformed, and re-encoded; row must be rewritten.
    Modified {
        zoom_level: i64,
        tile_column: i64,
        tile_row: i64,
        tile_data: Vec<u8>,
    },
}

/// Returns the worker count this pool will use, for callers that want to
/// report it (e.g. in logs).
pub fn worker_count() -> usize {
    rayon::current_num_threads()
}

/// Process one batch of tile jobs in parallel. No shared mutable state:
/// `layers_to_keep` is an immutable snapshot borrowed by every job.
pub fn process_batch(jobs: Vec<TileJob>, layers_to_keep: &HashSet<String>) -> Vec<TileOutcome> {
    jobs.into_par_iter()
        .map(|job| process_one(job, layers_to_keep))
        .collect()
}

fn process_one(job: TileJob, layers_to_keep: &HashSet<String>) -> TileOutcome {
    let tile = match codec::decode(&job.tile_data) {
        Ok(tile) => tile,
        Err(err) => {
            tracing::warn!(
                zoom_level = job.zoom_level,
                tile_column = job.tile_column,
                tile_row = job.tile_row,
                error = %err,
                "failed to decode tile, leaving row untouched"
            );
            return TileOutcome::DecodeFailed {
                zoom_level: job.zoom_level,
                tile_column: job.tile_column,
                tile_row: job.tile_row,
            };
        }
    };

    let (tile, modified) = transform::transform(tile, layers_to_keep);
    if !modified {
        return TileOutcome::Unchanged;
    }

    match codec::encode(&tile) {
        Ok(tile_data) => TileOutcome::Modified {
            zoom_level: job.zoom_level,
            tile_column: job.tile_column,
            tile_row: job.tile_row,
            tile_data,
        },
        Err(err) => {
            tracing::warn!(
                zoom_level = job.zoom_level,
                tile_column = job.tile_column,
                tile_row = job.tile_row,
                error = %err,
                "failed to re-encode transformed tile, leaving row untouched"
            );
            TileOutcome::DecodeFailed {
                zoom_level: job.zoom_level,
                tile_column: job.tile_column,
                tile_row: job.tile_row,
            }
        }
    }
}
