//! # fdsketch
//!
//! Streaming, mergeable matrix sketching across parallel workers.
//!
//! Each worker compresses its partition of a row stream with a rank-adaptive
//! Frequent Directions sketch ([`fdsketch_core::SketchUpdater`]), optionally
//! pre-filtered by priority sampling. Local sketches are combined by a
//! `div_by`-ary [`merge::MergeTree`] over a [`comm::Communicator`], and the
//! merged sketch's right singular vectors are used by
//! [`compression::CompressionApplier`] to project each worker's rows.
//!
//! ```ignore
//! use fdsketch::builder::SketchBuilder;
//! use fdsketch::pipeline::run_local_cluster;
//! use fdsketch::source::MatrixSource;
//! use fdsketch::storage::MemoryStore;
//!
//! let config = SketchBuilder::new(64).with_ell(20).with_alpha(0.2).build()?;
//! let sources = MatrixSource::partitioned(rows, 4);
//! let store = MemoryStore::default();
//! let reports = run_local_cluster(&config, sources, &store)?;
//! ```

pub mod builder;
pub mod comm;
pub mod compression;
pub mod merge;
pub mod pipeline;
pub mod preprocess;
pub mod source;
pub mod storage;

pub use fdsketch_core::{
    PriorityReservoir, ShrinkReference, SketchError, SketchParams, SketchUpdater,
};

use thiserror::Error;

use crate::comm::CommError;
use crate::storage::StorageError;

/// Top-level error for the sketching pipeline.
#[derive(Error, Debug)]
pub enum FdError {
    #[error(transparent)]
    Sketch(#[from] SketchError),

    #[error(transparent)]
    Comm(#[from] CommError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Rejected while building or validating a configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The input collaborator failed to deliver a batch
    #[error("Source error: {0}")]
    Source(String),

    /// A worker thread panicked or the run was aborted by a peer
    #[error("Worker {rank} failed: {reason}")]
    Worker { rank: usize, reason: String },
}

pub type Result<T> = std::result::Result<T, FdError>;

#[cfg(test)]
mod tests;
