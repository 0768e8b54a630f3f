//! Per-worker pipeline and an in-process cluster runner.
//!
//! A worker runs four stages separated by barriers:
//! 1. local sketching of its partition, written as a `Local` record
//! 2. tree merge of every worker's re-read local record
//! 3. rank 0 aggregates bookkeeping and writes a `Merged` record per rank
//! 4. projection of the worker's rows onto the merged basis, written as a
//!    `Projected` record
//!
//! A failure in any worker is fatal for the run: peers blocked on it see a
//! timeout or a disconnect and fail in turn.

use std::thread;

use log::{debug, error, info, warn};

use fdsketch_core::{PriorityReservoir, SketchUpdater};

use crate::builder::SketchConfig;
use crate::comm::{Communicator, Message, Tag, local_mesh};
use crate::compression::CompressionApplier;
use crate::merge::MergeTree;
use crate::preprocess::RowPreprocessor;
use crate::source::{Batch, BatchSource};
use crate::storage::{ProjectionRecord, RecordKey, RecordStore, SketchRecord, Stage};
use crate::{FdError, Result};

pub const NOTICE_TAG: Tag = 23;

/// Summary of one worker's run.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerReport {
    pub rank: usize,
    /// Rows pulled from the source.
    pub rows_seen: usize,
    /// Rows that survived preprocessing and were projected.
    pub rows_kept: usize,
    /// Rows written into the local sketch (after sampling).
    pub rows_sketched: usize,
    /// Final local sketch rank, after any rank adaptation.
    pub local_ell: usize,
    pub n_components: usize,
}

/// Rows kept for the projection stage.
#[derive(Default)]
struct Retained {
    indices: Vec<usize>,
    rows: Vec<Vec<f64>>,
    thumbnails: Option<Vec<Vec<f64>>>,
}

pub struct Worker<'a, C: Communicator, S: RecordStore + ?Sized> {
    config: &'a SketchConfig,
    comm: C,
    store: &'a S,
    tree: MergeTree,
    preprocessor: RowPreprocessor,
}

impl<'a, C: Communicator, S: RecordStore + ?Sized> Worker<'a, C, S> {
    /// # Errors
    /// `FdError::Config` if the communicator size is not a power of
    /// `config.div_by`. Nothing has been sent at that point.
    pub fn new(config: &'a SketchConfig, comm: C, store: &'a S) -> Result<Self> {
        let tree = MergeTree::new(comm.size(), config.div_by)?;
        let preprocessor = RowPreprocessor::new(config.preprocess.clone())?;
        Ok(Self {
            config,
            comm,
            store,
            tree,
            preprocessor,
        })
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    fn key(&self, stage: Stage, rank: usize) -> RecordKey {
        RecordKey::new(self.config.run_id.clone(), stage, rank)
    }

    pub fn run(&mut self, source: &mut dyn BatchSource) -> Result<WorkerReport> {
        let rank = self.rank();
        info!("rank {}/{}: starting run {}", rank, self.comm.size(), self.config.run_id);

        let (local, retained, rows_seen, local_ell) = self.sketch_local(source)?;
        let rows_sketched = local.rows_incorporated;
        self.store.put_sketch(&self.key(Stage::Local, rank), &local)?;
        self.comm.barrier()?;

        self.merge_stage()?;
        self.comm.barrier()?;

        let rows_kept = retained.indices.len();
        let n_components = self.project_stage(retained)?;
        self.comm.barrier()?;

        let report = WorkerReport {
            rank,
            rows_seen,
            rows_kept,
            rows_sketched,
            local_ell,
            n_components,
        };
        info!("rank {}: done, {:?}", rank, report);
        Ok(report)
    }

    fn sketch_local(
        &mut self,
        source: &mut dyn BatchSource,
    ) -> Result<(SketchRecord, Retained, usize, usize)> {
        let rank = self.rank();
        let config = self.config;
        let mut updater = SketchUpdater::new(config.sketch_params(rank))?;
        let mut reservoir = if config.sampling_enabled() {
            Some(PriorityReservoir::new(
                config.reservoir_capacity(config.batch_size),
                config.worker_seed(rank),
            )?)
        } else {
            None
        };

        let mut retained = Retained::default();
        let mut tracked = Vec::new();
        let mut rows_seen = 0usize;
        let mut with_thumbnails = None;

        while let Some(batch) = source.next_batch(config.batch_size)? {
            if batch.is_empty() {
                continue;
            }
            rows_seen += batch.len();
            tracked.push(batch.index_range());

            let kept_rows = self.retain_batch(&batch, &mut retained, &mut with_thumbnails)?;

            let to_sketch = match reservoir.as_mut() {
                Some(res) => {
                    for row in &kept_rows {
                        res.update(row.clone());
                    }
                    res.drain()
                }
                None => kept_rows.clone(),
            };
            debug!(
                "rank {}: batch at {} -> {} kept, {} sketched",
                rank,
                batch.start_index,
                kept_rows.len(),
                to_sketch.len()
            );
            updater.ingest(&to_sketch)?;
            retained.rows.extend(kept_rows);
        }

        updater.flush()?;
        if rows_seen == 0 {
            warn!("rank {}: source delivered no rows", rank);
        }
        info!(
            "rank {}: local sketch done, {} rows seen, {} sketched, ell={}, {} rotations",
            rank,
            rows_seen,
            updater.rows_incorporated(),
            updater.ell(),
            updater.rotations()
        );

        let record = SketchRecord {
            sketch: updater.summary_rows(),
            n_features: config.n_features,
            rows_incorporated: updater.rows_incorporated(),
            tracked_index_ranges: tracked,
        };
        Ok((record, retained, rows_seen, updater.ell()))
    }

    /// Preprocess `batch`, record the survivors in `retained` and return
    /// their rows. Thumbnails come from preprocessing when it renders them,
    /// otherwise from the batch; either way there is exactly one per kept row.
    fn retain_batch(
        &self,
        batch: &Batch,
        retained: &mut Retained,
        with_thumbnails: &mut Option<bool>,
    ) -> Result<Vec<Vec<f64>>> {
        let rendered = self.preprocessor.options().thumbnail_bin.is_some();
        let supplied = match &batch.thumbnails {
            Some(thumbs) if thumbs.len() != batch.len() => {
                return Err(FdError::Source(format!(
                    "batch at {} has {} thumbnails for {} rows",
                    batch.start_index,
                    thumbs.len(),
                    batch.len()
                )));
            }
            Some(thumbs) if !rendered => Some(thumbs),
            _ => None,
        };

        let has_thumbnails = rendered || supplied.is_some();
        match *with_thumbnails {
            None => *with_thumbnails = Some(has_thumbnails),
            Some(expected) if expected != has_thumbnails => {
                return Err(FdError::Source(format!(
                    "batch at {} {} thumbnails unlike earlier batches",
                    batch.start_index,
                    if has_thumbnails { "carries" } else { "lacks" }
                )));
            }
            Some(_) => {}
        }

        let processed = self.preprocessor.process(&batch.rows);
        let mut kept_rows = Vec::with_capacity(processed.len());
        for p in processed {
            retained.indices.push(batch.start_index + p.position);
            let thumbnail = match (p.thumbnail, supplied) {
                (Some(t), _) => Some(t),
                (None, Some(thumbs)) => Some(thumbs[p.position].clone()),
                (None, None) => None,
            };
            if let Some(t) = thumbnail {
                retained.thumbnails.get_or_insert_with(Vec::new).push(t);
            }
            kept_rows.push(p.row);
        }
        Ok(kept_rows)
    }

    fn merge_stage(&mut self) -> Result<()> {
        let rank = self.rank();
        let size = self.comm.size();
        let local = self.store.get_sketch(&self.key(Stage::Local, rank))?;

        let mut merger = SketchUpdater::new(self.config.merge_params(local.ell(), rank))?;
        merger.ingest(&local.sketch)?;
        let merged = self.tree.merge(&mut self.comm, &mut merger)?;

        if rank == 0 {
            let mut rows_incorporated = 0usize;
            let mut ranges = Vec::new();
            for r in 0..size {
                let record = self.store.get_sketch(&self.key(Stage::Local, r))?;
                rows_incorporated += record.rows_incorporated;
                ranges.extend(record.tracked_index_ranges);
            }
            if merged.is_none() {
                return Err(FdError::Worker {
                    rank,
                    reason: "merge finished without a result".to_string(),
                });
            }

            let record = SketchRecord {
                sketch: merger.summary_rows(),
                n_features: self.config.n_features,
                rows_incorporated,
                tracked_index_ranges: ranges,
            };
            for r in 0..size {
                self.store.put_sketch(&self.key(Stage::Merged, r), &record)?;
            }
            info!(
                "Merged sketch written for {} ranks ({} rows incorporated)",
                size, rows_incorporated
            );
            self.comm.broadcast(
                0,
                NOTICE_TAG,
                Some(Message::Text(self.key(Stage::Merged, 0).name())),
            )?;
        } else {
            let notice = self.comm.broadcast(0, NOTICE_TAG, None)?;
            debug!("rank {}: merge notice {:?}", rank, notice);
        }
        Ok(())
    }

    fn project_stage(&mut self, retained: Retained) -> Result<usize> {
        let rank = self.rank();
        let merged = self.store.get_sketch(&self.key(Stage::Merged, rank))?;
        let applier = CompressionApplier::new(&merged.matrix())?;
        let coords = applier.project(&retained.rows)?;

        let record = ProjectionRecord {
            row_indices: retained.indices,
            projected_coordinates: coords,
            n_components: applier.n_components(),
            thumbnails: retained.thumbnails,
        };
        self.store.put_projection(&self.key(Stage::Projected, rank), &record)?;
        info!(
            "rank {}: projected {} rows onto {} components",
            rank,
            record.len(),
            record.n_components
        );
        Ok(record.n_components)
    }
}

/// Run one worker thread per source over an in-process mesh.
///
/// Returns every worker's report, ordered by rank, or the error that aborted
/// the run. When several workers fail, an error that did not originate in
/// communication is preferred, since peers usually fail with a timeout or
/// disconnect as a consequence.
pub fn run_local_cluster<B, S>(
    config: &SketchConfig,
    sources: Vec<B>,
    store: &S,
) -> Result<Vec<WorkerReport>>
where
    B: BatchSource,
    S: RecordStore + ?Sized,
{
    let size = sources.len();
    MergeTree::new(size, config.div_by)?;
    info!("Launching local cluster: {} workers, run {}", size, config.run_id);

    let comms = local_mesh(size, config.comm_timeout);
    let results: Vec<Result<WorkerReport>> = thread::scope(|scope| {
        let handles: Vec<_> = comms
            .into_iter()
            .zip(sources)
            .map(|(comm, mut source)| {
                scope.spawn(move || {
                    let mut worker = Worker::new(config, comm, store)?;
                    worker.run(&mut source)
                })
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(rank, h)| {
                h.join().unwrap_or_else(|_| {
                    Err(FdError::Worker {
                        rank,
                        reason: "worker thread panicked".to_string(),
                    })
                })
            })
            .collect()
    });

    let mut reports = Vec::with_capacity(size);
    let mut errors = Vec::new();
    for (rank, result) in results.into_iter().enumerate() {
        match result {
            Ok(report) => reports.push(report),
            Err(e) => {
                error!("rank {} failed: {}", rank, e);
                errors.push(e);
            }
        }
    }

    if errors.is_empty() {
        return Ok(reports);
    }
    let root_cause = errors
        .iter()
        .position(|e| !matches!(e, FdError::Comm(_)))
        .unwrap_or(0);
    Err(errors.swap_remove(root_cause))
}
