//! Row conditioning applied before sketching.
//!
//! Steps run in a fixed order on every row:
//! 1. rows holding NaN or infinities are dropped
//! 2. negative entries are clamped to zero
//! 3. the row intensity (sum of entries) is recorded
//! 4. optional quantile thresholding zeroes every entry at or below the
//!    row's `threshold_quantile`
//! 5. optional low-intensity rejection drops rows whose intensity is below
//!    `min_intensity`
//! 6. optional normalisation divides by the intensity (rows below
//!    `min_intensity` become all-zero)
//! 7. optional mean-pool downsampling by `bin_factor`
//!
//! Thumbnails, when requested, are mean-pooled by `thumbnail_bin` from the
//! row as it stands after step 6, so they show what was sketched.

use log::{debug, trace};
use rayon::prelude::*;

use crate::{FdError, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct PreprocessOptions {
    pub threshold_quantile: Option<f64>,
    pub no_zero_intensity: bool,
    pub normalize_intensity: bool,
    pub min_intensity: f64,
    pub bin_factor: usize,
    pub thumbnail_bin: Option<usize>,
}

impl Default for PreprocessOptions {
    fn default() -> Self {
        Self {
            threshold_quantile: None,
            no_zero_intensity: false,
            normalize_intensity: false,
            min_intensity: 0.0,
            bin_factor: 1,
            thumbnail_bin: None,
        }
    }
}

impl PreprocessOptions {
    pub fn with_threshold_quantile(mut self, q: f64) -> Self {
        self.threshold_quantile = Some(q);
        self
    }

    pub fn with_min_intensity(mut self, min_intensity: f64) -> Self {
        self.min_intensity = min_intensity;
        self
    }

    pub fn with_no_zero_intensity(mut self, enable: bool) -> Self {
        self.no_zero_intensity = enable;
        self
    }

    pub fn with_normalize_intensity(mut self, enable: bool) -> Self {
        self.normalize_intensity = enable;
        self
    }

    pub fn with_bin_factor(mut self, bin_factor: usize) -> Self {
        self.bin_factor = bin_factor;
        self
    }

    /// Keep a low-resolution copy of every surviving row.
    pub fn with_thumbnail_bin(mut self, bin: usize) -> Self {
        self.thumbnail_bin = Some(bin);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(q) = self.threshold_quantile {
            if !(0.0..=1.0).contains(&q) {
                return Err(FdError::Config(format!(
                    "threshold quantile must lie in [0, 1], got {}",
                    q
                )));
            }
        }
        if !self.min_intensity.is_finite() {
            return Err(FdError::Config("min intensity must be finite".into()));
        }
        if self.bin_factor == 0 {
            return Err(FdError::Config("bin factor must be positive".into()));
        }
        if self.thumbnail_bin == Some(0) {
            return Err(FdError::Config("thumbnail bin must be positive".into()));
        }
        Ok(())
    }

    /// Width of a processed row built from a raw row of width `raw`.
    pub fn output_width(&self, raw: usize) -> usize {
        raw.div_ceil(self.bin_factor)
    }
}

/// Mean-pool `row` over consecutive windows of `factor` entries. A trailing
/// partial window is averaged over the entries it has.
pub fn bin_row(row: &[f64], factor: usize) -> Vec<f64> {
    if factor <= 1 {
        return row.to_vec();
    }
    row.chunks(factor)
        .map(|c| c.iter().sum::<f64>() / c.len() as f64)
        .collect()
}

/// Linear-interpolated quantile of `values` (`q` in `[0, 1]`).
pub fn quantile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// A row that survived preprocessing.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessedRow {
    /// Position of the source row within its batch.
    pub position: usize,
    pub row: Vec<f64>,
    pub thumbnail: Option<Vec<f64>>,
}

#[derive(Clone, Debug)]
pub struct RowPreprocessor {
    options: PreprocessOptions,
}

impl RowPreprocessor {
    pub fn new(options: PreprocessOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { options })
    }

    pub fn options(&self) -> &PreprocessOptions {
        &self.options
    }

    /// Process one row. `None` means the row is rejected.
    pub fn process_row(&self, row: &[f64]) -> Option<Vec<f64>> {
        self.condition(row)
            .map(|out| bin_row(&out, self.options.bin_factor))
    }

    /// Steps 1 to 6, before downsampling.
    fn condition(&self, row: &[f64]) -> Option<Vec<f64>> {
        if row.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let opts = &self.options;

        let mut out: Vec<f64> = row.iter().map(|v| v.max(0.0)).collect();
        let intensity: f64 = out.iter().sum();

        if let Some(q) = opts.threshold_quantile {
            let cut = quantile(&out, q);
            for v in out.iter_mut() {
                if *v <= cut {
                    *v = 0.0;
                }
            }
        }

        if opts.no_zero_intensity && intensity < opts.min_intensity {
            trace!("Rejecting row with intensity {:.4}", intensity);
            return None;
        }

        if opts.normalize_intensity {
            if intensity < opts.min_intensity || intensity <= 0.0 {
                out.iter_mut().for_each(|v| *v = 0.0);
            } else {
                out.iter_mut().for_each(|v| *v /= intensity);
            }
        }

        Some(out)
    }

    /// Process a batch, returning every row that survives in input order,
    /// with its thumbnail if `thumbnail_bin` is set.
    pub fn process(&self, rows: &[Vec<f64>]) -> Vec<ProcessedRow> {
        let opts = &self.options;
        let kept: Vec<ProcessedRow> = rows
            .par_iter()
            .enumerate()
            .filter_map(|(position, row)| {
                let out = self.condition(row)?;
                Some(ProcessedRow {
                    position,
                    thumbnail: opts.thumbnail_bin.map(|bin| bin_row(&out, bin)),
                    row: bin_row(&out, opts.bin_factor),
                })
            })
            .collect();
        if kept.len() < rows.len() {
            debug!(
                "Preprocessing dropped {} of {} rows",
                rows.len() - kept.len(),
                rows.len()
            );
        }
        kept
    }
}
