//! Per-worker records: local sketches, merged sketches and projections.
//!
//! Every record is addressed by a [`RecordKey`] `(run_id, stage, rank)`.
//! [`MemoryStore`] keeps records in process; [`parquet::ParquetStore`]
//! (feature `storage`) writes them as Parquet files with a JSON sidecar.

#[cfg(feature = "storage")]
pub mod parquet;

use std::fmt;

use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::matrix::DenseMatrix;
use thiserror::Error;

use fdsketch_core::linalg::dense_from_rows;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Arrow error: {0}")]
    Arrow(String),
    #[error("Parquet error: {0}")]
    Parquet(String),
    #[error("Serde error: {0}")]
    Serde(String),
    #[error("Invalid: {0}")]
    Invalid(String),
    #[error("Record not found: {0}")]
    NotFound(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

// ============================================================================
// Records
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Written once per worker after local sketching.
    Local,
    /// Written by rank 0 for every worker after the merge.
    Merged,
    /// Final per-worker projection output.
    Projected,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Local => write!(f, "local"),
            Stage::Merged => write!(f, "merged"),
            Stage::Projected => write!(f, "projected"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub run_id: String,
    pub stage: Stage,
    pub rank: usize,
}

impl RecordKey {
    pub fn new(run_id: impl Into<String>, stage: Stage, rank: usize) -> Self {
        Self {
            run_id: run_id.into(),
            stage,
            rank,
        }
    }

    /// File-system safe name, `{run_id}_{stage}_{rank}`.
    pub fn name(&self) -> String {
        format!("{}_{}_{}", self.run_id, self.stage, self.rank)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A sketch summary plus the bookkeeping needed to merge metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct SketchRecord {
    /// `ell × n_features` summary rows.
    pub sketch: Vec<Vec<f64>>,
    pub n_features: usize,
    pub rows_incorporated: usize,
    /// Half-open global row ranges fed to the sketch.
    pub tracked_index_ranges: Vec<(usize, usize)>,
}

impl SketchRecord {
    pub fn matrix(&self) -> DenseMatrix<f64> {
        dense_from_rows(&self.sketch, self.n_features)
    }

    pub fn ell(&self) -> usize {
        self.sketch.len()
    }
}

/// Low-dimensional coordinates of one worker's rows.
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectionRecord {
    /// Global index of each projected row.
    pub row_indices: Vec<usize>,
    /// `N × n_components`, aligned with `row_indices`.
    pub projected_coordinates: Vec<Vec<f64>>,
    pub n_components: usize,
    /// Optional low-resolution copies of the projected rows.
    pub thumbnails: Option<Vec<Vec<f64>>>,
}

impl ProjectionRecord {
    pub fn len(&self) -> usize {
        self.row_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_indices.is_empty()
    }
}

/// Keyed persistence shared by every worker of a run.
pub trait RecordStore: Send + Sync {
    fn put_sketch(&self, key: &RecordKey, record: &SketchRecord) -> StorageResult<()>;

    fn get_sketch(&self, key: &RecordKey) -> StorageResult<SketchRecord>;

    fn put_projection(&self, key: &RecordKey, record: &ProjectionRecord) -> StorageResult<()>;

    fn get_projection(&self, key: &RecordKey) -> StorageResult<ProjectionRecord>;
}

// ============================================================================
// In-memory store
// ============================================================================

/// Concurrent in-process store; workers write their records without
/// coordinating with each other.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sketches: DashMap<RecordKey, SketchRecord>,
    projections: DashMap<RecordKey, ProjectionRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sketch_count(&self) -> usize {
        self.sketches.len()
    }

    pub fn projection_count(&self) -> usize {
        self.projections.len()
    }
}

impl RecordStore for MemoryStore {
    fn put_sketch(&self, key: &RecordKey, record: &SketchRecord) -> StorageResult<()> {
        debug!("MemoryStore: put sketch {}", key);
        self.sketches.insert(key.clone(), record.clone());
        Ok(())
    }

    fn get_sketch(&self, key: &RecordKey) -> StorageResult<SketchRecord> {
        self.sketches
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::NotFound(key.name()))
    }

    fn put_projection(&self, key: &RecordKey, record: &ProjectionRecord) -> StorageResult<()> {
        debug!("MemoryStore: put projection {}", key);
        self.projections.insert(key.clone(), record.clone());
        Ok(())
    }

    fn get_projection(&self, key: &RecordKey) -> StorageResult<ProjectionRecord> {
        self.projections
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::NotFound(key.name()))
    }
}
