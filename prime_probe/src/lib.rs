#![deny(unsafe_op_in_unsafe_fn)]

//! Prime+Probe over the last level cache, measured by sweep counting.
//!
//! Only a coarse (millisecond) clock is assumed. Instead of timing single
//! accesses, the engine counts how many full probe passes over a page's worth
//! of eviction sets complete within a fixed window.

use cache_utils::GeometryError;
use thiserror::Error;

pub mod engine;
pub mod eviction_set;
pub mod sweep;

pub use engine::PrimeProbeEngine;
pub use eviction_set::{shuffle, EvictionBuffer, EvictionSetBuilder, SetHeadTable};
pub use sweep::{count_sweeps, SweepSampler};

/// Eviction buffer size: larger than any LLC we target, so a full traversal
/// flushes whatever was cached before.
pub const EVICTION_BUFFER_BYTES: usize = 32 * cache_utils::BYTES_PER_MB;

#[derive(Debug, Error)]
pub enum PrimeProbeError {
    #[error("invalid cache geometry: {0}")]
    Geometry(#[from] GeometryError),
    #[error("failed to map the eviction buffer: {0}")]
    Mmap(#[from] nix::Error),
    #[error("geometry needs {needed} buffer words but the eviction buffer holds {available}")]
    BufferTooSmall { needed: usize, available: usize },
}
