//! Hierarchical merge of per-worker sketches.
//!
//! At level `L` the ranks divisible by `jump = div_by^L` form groups of
//! `div_by` members spaced `jump` apart; the lowest rank of each group
//! receives the other members' summaries and folds each one into its own
//! sketch through [`SketchUpdater::ingest`]. After `log_{div_by}(size)`
//! levels rank 0 holds the merged sketch.

use log::{debug, info};
use smartcore::linalg::basic::matrix::DenseMatrix;

use fdsketch_core::SketchUpdater;

use crate::comm::{CommError, Communicator, Message, Tag};
use crate::{FdError, Result};

pub const MERGE_TAG: Tag = 17;

/// What one rank does at one level of the tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeStep {
    /// Receive and ingest a summary from each listed rank, in order.
    Receive(Vec<usize>),
    /// Send the current summary to the group root.
    Send(usize),
    Idle,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeTree {
    size: usize,
    div_by: usize,
    levels: usize,
}

impl MergeTree {
    /// # Errors
    /// `FdError::Config` unless `div_by >= 2` and `size == div_by^k` for some `k >= 0`.
    pub fn new(size: usize, div_by: usize) -> Result<Self> {
        if div_by < 2 {
            return Err(FdError::Config(format!(
                "merge branching factor must be at least 2, got {}",
                div_by
            )));
        }
        if size == 0 {
            return Err(FdError::Config("merge tree needs at least one worker".into()));
        }

        let mut power = 1usize;
        let mut levels = 0usize;
        while power < size {
            power = power.checked_mul(div_by).ok_or_else(|| {
                FdError::Config(format!("worker count {} overflows the merge tree", size))
            })?;
            levels += 1;
        }
        if power != size {
            return Err(FdError::Config(format!(
                "worker count {} is not a power of {}; the merge tree would be unbalanced",
                size, div_by
            )));
        }

        debug!("MergeTree: size={}, div_by={}, levels={}", size, div_by, levels);
        Ok(Self {
            size,
            div_by,
            levels,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn div_by(&self) -> usize {
        self.div_by
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    /// The role of `rank` at every level, from the leaves up.
    pub fn plan(&self, rank: usize) -> Vec<MergeStep> {
        let mut jump = 1usize;
        let mut steps = Vec::with_capacity(self.levels);
        for _ in 0..self.levels {
            let span = jump * self.div_by;
            let step = if rank % jump != 0 {
                MergeStep::Idle
            } else {
                let root = rank - rank % span;
                if rank == root {
                    MergeStep::Receive((root + jump..root + span).step_by(jump).collect())
                } else {
                    MergeStep::Send(root)
                }
            };
            steps.push(step);
            jump = span;
        }
        steps
    }

    /// Run the tree. `merger` must already hold this rank's local summary.
    ///
    /// Returns the merged `ell × d` summary on rank 0 and `None` elsewhere.
    ///
    /// # Errors
    /// Any communication failure, a non-sketch message, or a summary of the
    /// wrong width. None of these leave a usable partial result.
    pub fn merge<C: Communicator + ?Sized>(
        &self,
        comm: &mut C,
        merger: &mut SketchUpdater,
    ) -> Result<Option<DenseMatrix<f64>>> {
        let rank = comm.rank();
        if comm.size() != self.size {
            return Err(FdError::Config(format!(
                "communicator has {} ranks, merge tree was built for {}",
                comm.size(),
                self.size
            )));
        }
        info!("rank {}: starting merge over {} levels", rank, self.levels);

        for (level, step) in self.plan(rank).into_iter().enumerate() {
            match step {
                MergeStep::Receive(peers) => {
                    for peer in peers {
                        let rows = match comm.recv(peer, MERGE_TAG)? {
                            Message::Sketch(rows) => rows,
                            other => {
                                return Err(CommError::UnexpectedMessage {
                                    rank,
                                    detail: format!("expected a sketch from rank {}, got {:?}", peer, other),
                                }
                                .into());
                            }
                        };
                        debug!(
                            "rank {}: level {} ingesting {} rows from rank {}",
                            rank,
                            level,
                            rows.len(),
                            peer
                        );
                        merger.ingest(&rows)?;
                    }
                }
                MergeStep::Send(root) => {
                    merger.flush()?;
                    debug!("rank {}: level {} sending summary to rank {}", rank, level, root);
                    comm.send(root, MERGE_TAG, Message::Sketch(merger.summary_rows()))?;
                }
                MergeStep::Idle => {}
            }
        }

        if rank == 0 {
            merger.flush()?;
            info!(
                "Merge complete: ell={}, rows incorporated={}",
                merger.ell(),
                merger.rows_incorporated()
            );
            Ok(Some(merger.summary()))
        } else {
            Ok(None)
        }
    }
}
