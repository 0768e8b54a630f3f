//! Rank-adaptive alpha Frequent Directions.
//!
//! The sketch is a `2·ell × d` matrix. Rows `[0, ell)` hold the current
//! summary, rows `[ell, 2·ell)` are an append-only buffer. When the buffer is
//! full the whole matrix is rotated with an SVD and the trailing directions are
//! shrunk so that at least one buffer's worth of rows becomes free again
//! (Ghashami, Liberty, Phillips, Woodruff 2016; Ghashami, Desai, Phillips 2014).
//!
//! Rank adaptation watches how much of each rotated buffer falls outside the
//! new summary's leading directions. When that share exceeds
//! [`RECON_ERROR_THRESHOLD`] the sketch grows by [`RANK_INCREMENT`] rows at the
//! next full buffer, provided the current batch still carries enough rows to
//! fill the grown buffer. `ell` never shrinks.
//!
//! Merging is the same operation as streaming: feed another sketch's summary
//! rows to [`SketchUpdater::ingest`].

use log::{debug, info, trace, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use smartcore::linalg::basic::arrays::{Array, Array2, MutArray};
use smartcore::linalg::basic::matrix::DenseMatrix;

use crate::error::{Result, SketchError};
use crate::linalg::{dot, frobenius_squared, rows_of, squared_norm, thin_svd};

/// Rows added to `ell` on each rank-growth step.
pub const RANK_INCREMENT: usize = 10;
/// Estimated relative reconstruction error that triggers rank growth.
pub const RECON_ERROR_THRESHOLD: f64 = 0.08;
/// Pending rows beyond `ell` required before a rank-adaptation step.
pub const RANK_ADAPT_MARGIN: usize = 15;
/// Leading sketch directions used by the error estimator.
pub const ERROR_ESTIMATE_COMPONENTS: usize = 10;
/// Random test vectors averaged by the error estimator.
pub const ERROR_SAMPLES: usize = 10;

/// Singular value subtracted (in squares) during the shrink step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ShrinkReference {
    /// `S[ell-1]`: the last retained direction is zeroed.
    #[default]
    LastRetained,
    /// `S[ell]`: the first discarded direction; all `ell` rows may survive.
    FirstDiscarded,
}

/// Construction parameters for a [`SketchUpdater`].
#[derive(Clone, Debug, PartialEq)]
pub struct SketchParams {
    pub ell: usize,
    pub n_features: usize,
    pub alpha: f64,
    pub rank_adapt: bool,
    pub shrink_reference: ShrinkReference,
    pub seed: Option<u64>,
}

impl SketchParams {
    pub fn new(ell: usize, n_features: usize) -> Self {
        Self {
            ell,
            n_features,
            alpha: 0.0,
            rank_adapt: false,
            shrink_reference: ShrinkReference::default(),
            seed: None,
        }
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_rank_adapt(mut self, rank_adapt: bool) -> Self {
        self.rank_adapt = rank_adapt;
        self
    }

    pub fn with_shrink_reference(mut self, reference: ShrinkReference) -> Self {
        self.shrink_reference = reference;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.ell == 0 {
            return Err(SketchError::InvalidConfig("ell must be positive".into()));
        }
        if self.n_features == 0 {
            return Err(SketchError::InvalidConfig(
                "feature dimension must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(SketchError::InvalidConfig(format!(
                "alpha must lie in [0, 1], got {}",
                self.alpha
            )));
        }
        Ok(())
    }
}

/// Per-worker Frequent Directions state. Not shared across threads; all
/// mutation goes through `&mut self`.
#[derive(Clone, Debug)]
pub struct SketchUpdater {
    d: usize,
    ell: usize,
    m: usize,
    alpha: f64,
    rank_adapt: bool,
    shrink_reference: ShrinkReference,
    sketch: DenseMatrix<f64>,
    next_zero_row: usize,
    rows_incorporated: usize,
    increase_ell: bool,
    rotations: usize,
    rng: ChaCha8Rng,
}

impl SketchUpdater {
    pub fn new(params: SketchParams) -> Result<Self> {
        params.validate()?;
        let m = 2 * params.ell;
        let seed = params.seed.unwrap_or_else(rand::random::<u64>);
        info!(
            "SketchUpdater: ell={}, d={}, alpha={}, rank_adapt={}, shrink={:?}",
            params.ell, params.n_features, params.alpha, params.rank_adapt, params.shrink_reference
        );
        Ok(Self {
            d: params.n_features,
            ell: params.ell,
            m,
            alpha: params.alpha,
            rank_adapt: params.rank_adapt,
            shrink_reference: params.shrink_reference,
            sketch: DenseMatrix::<f64>::zeros(m, params.n_features),
            next_zero_row: 0,
            rows_incorporated: 0,
            increase_ell: false,
            rotations: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    pub fn ell(&self) -> usize {
        self.ell
    }

    /// Total rows of the working matrix (`2·ell`).
    pub fn m(&self) -> usize {
        self.m
    }

    pub fn n_features(&self) -> usize {
        self.d
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn next_zero_row(&self) -> usize {
        self.next_zero_row
    }

    pub fn rows_incorporated(&self) -> usize {
        self.rows_incorporated
    }

    pub fn rotations(&self) -> usize {
        self.rotations
    }

    pub fn growth_pending(&self) -> bool {
        self.increase_ell
    }

    /// The full working matrix, summary and buffer.
    pub fn working_matrix(&self) -> &DenseMatrix<f64> {
        &self.sketch
    }

    /// The `ell × d` summary rows.
    pub fn summary(&self) -> DenseMatrix<f64> {
        let mut out = DenseMatrix::<f64>::zeros(self.ell, self.d);
        for i in 0..self.ell {
            for j in 0..self.d {
                out.set((i, j), *self.sketch.get((i, j)));
            }
        }
        out
    }

    pub fn summary_rows(&self) -> Vec<Vec<f64>> {
        rows_of(&self.sketch, 0, self.ell)
    }

    /// Singular values of the working matrix, descending.
    pub fn singular_values(&self) -> Result<Vec<f64>> {
        Ok(thin_svd(&self.sketch)?.singular_values)
    }

    /// Ingest a batch of rows in order.
    ///
    /// Rows with non-finite entries are dropped with a warning. Returns the
    /// number of rows actually written to the sketch.
    ///
    /// # Errors
    /// `DimensionMismatch` if any row has the wrong width (checked before any
    /// row is written), `Decomposition` if a rotation fails.
    pub fn ingest(&mut self, rows: &[Vec<f64>]) -> Result<usize> {
        if let Some(bad) = rows.iter().find(|r| r.len() != self.d) {
            return Err(SketchError::DimensionMismatch {
                expected: self.d,
                got: bad.len(),
            });
        }

        let accepted: Vec<&Vec<f64>> = rows
            .iter()
            .filter(|r| r.iter().all(|v| v.is_finite()))
            .collect();
        let dropped = rows.len() - accepted.len();
        if dropped > 0 {
            warn!("Dropped {} rows with non-finite values before ingestion", dropped);
        }

        let total = accepted.len();
        debug!(
            "Factoring {} rows into {}-row, ell={} sketch",
            total, self.rows_incorporated, self.ell
        );

        for (i, row) in accepted.into_iter().enumerate() {
            let can_rank_adapt = total - i > self.ell + RANK_ADAPT_MARGIN;

            if self.next_zero_row >= self.m {
                if self.increase_ell && can_rank_adapt && self.rank_adapt {
                    self.grow_rank();
                } else {
                    let buffer = rows_of(&self.sketch, self.ell, self.m);
                    self.rotate()?;
                    if can_rank_adapt && self.rank_adapt {
                        let err = self.reconstruction_error_estimate(&buffer)?;
                        trace!("Buffer reconstruction error estimate {:.5}", err);
                        if err > RECON_ERROR_THRESHOLD {
                            debug!(
                                "Reconstruction error {:.4} > {}, rank growth pending",
                                err, RECON_ERROR_THRESHOLD
                            );
                            self.increase_ell = true;
                        }
                    }
                }
            }

            let target = self.next_zero_row;
            for (j, v) in row.iter().enumerate() {
                self.sketch.set((target, j), *v);
            }
            self.next_zero_row += 1;
            self.rows_incorporated += 1;
        }

        Ok(total)
    }

    /// Ingest every row of `block`. Same path as streamed data.
    pub fn ingest_matrix(&mut self, block: &DenseMatrix<f64>) -> Result<usize> {
        let (n, _) = block.shape();
        self.ingest(&rows_of(block, 0, n))
    }

    /// Rotate if the buffer holds rows not yet folded into the summary, so
    /// that [`summary`](Self::summary) reflects every ingested row.
    pub fn flush(&mut self) -> Result<()> {
        if self.next_zero_row > self.ell {
            debug!(
                "Flushing {} buffered rows into the summary",
                self.next_zero_row - self.ell
            );
            self.rotate()?;
        }
        Ok(())
    }

    /// Rotate/shrink step on the full working matrix.
    pub fn rotate(&mut self) -> Result<()> {
        let svd = thin_svd(&self.sketch)?;
        let rank = svd.numerical_rank(self.m, self.d);
        let s = &svd.singular_values;
        let mut rotated = DenseMatrix::<f64>::zeros(self.m, self.d);

        if rank >= self.ell {
            let ell = self.ell;
            let reference = match self.shrink_reference {
                ShrinkReference::LastRetained => s[ell - 1],
                ShrinkReference::FirstDiscarded => s.as_slice().get(ell).copied().unwrap_or(0.0),
            };
            let reference_sq = reference * reference;

            let mut clamped = 0usize;
            let mut shrunk: Vec<f64> = s[..ell]
                .iter()
                .map(|si| {
                    let diff = si * si - reference_sq;
                    if diff < 0.0 {
                        clamped += 1;
                        0.0
                    } else {
                        diff.sqrt()
                    }
                })
                .collect();
            if self.shrink_reference == ShrinkReference::LastRetained {
                shrunk[ell - 1] = 0.0;
            }
            if clamped > 0 {
                debug!("Clamped {} negative squared differences to zero", clamped);
            }

            let unshrunk = ((ell as f64) * (1.0 - self.alpha)).floor() as usize;
            for i in 0..unshrunk.min(ell) {
                shrunk[i] = s[i];
            }

            for (i, scale) in shrunk.iter().enumerate() {
                for (j, v) in svd.right[i].iter().enumerate() {
                    rotated.set((i, j), scale * v);
                }
            }
            self.next_zero_row = ell;
        } else {
            debug!(
                "Sketch rank {} below ell={}, keeping {} unshrunk rows",
                rank, self.ell, rank
            );
            for i in 0..rank {
                for (j, v) in svd.right[i].iter().enumerate() {
                    rotated.set((i, j), s[i] * v);
                }
            }
            self.next_zero_row = rank;
        }

        self.sketch = rotated;
        self.rotations += 1;
        trace!(
            "Rotation {} done, next_zero_row={}",
            self.rotations,
            self.next_zero_row
        );
        Ok(())
    }

    /// Randomized estimate of the share of `batch`'s energy outside the
    /// sketch's leading [`ERROR_ESTIMATE_COMPONENTS`] right singular directions:
    /// `sqrt(‖(I − GGᵗ)Bᵗ‖²_F / ‖B‖²_F)`, with the numerator estimated from
    /// [`ERROR_SAMPLES`] unit Gaussian test vectors (Bujanovic, Kressner 2021).
    pub fn reconstruction_error_estimate(&mut self, batch: &[Vec<f64>]) -> Result<f64> {
        let denom = frobenius_squared(batch);
        if batch.is_empty() || denom <= 0.0 {
            return Ok(0.0);
        }

        let svd = thin_svd(&self.sketch)?;
        // directions with a zero singular value carry no sketch information
        let k = ERROR_ESTIMATE_COMPONENTS.min(svd.numerical_rank(self.m, self.d));
        let basis = &svd.right[..k];
        let n = batch.len();

        let mut acc = 0.0;
        for _ in 0..ERROR_SAMPLES {
            let sample: Vec<f64> = (0..n).map(|_| StandardNormal.sample(&mut self.rng)).collect();
            let norm = squared_norm(&sample).sqrt();
            if norm == 0.0 {
                continue;
            }

            // y = Bᵗ v̂
            let mut y = vec![0.0; self.d];
            for (row, p) in batch.iter().zip(&sample) {
                let w = p / norm;
                for (yj, bj) in y.iter_mut().zip(row) {
                    *yj += w * bj;
                }
            }

            // y − G Gᵗ y
            let mut residual = y.clone();
            for g in basis {
                let c = dot(g, &y);
                for (rj, gj) in residual.iter_mut().zip(g) {
                    *rj -= c * gj;
                }
            }
            acc += squared_norm(&residual);
        }

        let estimate = acc / ERROR_SAMPLES as f64 * n as f64;
        Ok((estimate / denom).max(0.0).sqrt())
    }

    fn grow_rank(&mut self) {
        let old_m = self.m;
        self.ell += RANK_INCREMENT;
        self.m = 2 * self.ell;

        let mut grown = DenseMatrix::<f64>::zeros(self.m, self.d);
        for i in 0..old_m {
            for j in 0..self.d {
                grown.set((i, j), *self.sketch.get((i, j)));
            }
        }
        self.sketch = grown;
        self.increase_ell = false;
        info!("Increasing sketch rank to ell={} (m={})", self.ell, self.m);
    }
}
