//! Projection of rows onto the merged sketch's principal directions.

use log::{debug, info};
use rayon::prelude::*;
use smartcore::linalg::basic::arrays::Array;
use smartcore::linalg::basic::matrix::DenseMatrix;

use fdsketch_core::linalg::{dot, thin_svd};
use fdsketch_core::SketchError;

use crate::Result;

/// Orthonormal basis from the right singular vectors of a merged sketch.
///
/// Directions with a zero singular value are left out, so a sketch of rank
/// `r < ell` projects to `r` coordinates.
#[derive(Clone, Debug)]
pub struct CompressionApplier {
    basis: Vec<Vec<f64>>,
    singular_values: Vec<f64>,
    n_features: usize,
}

impl CompressionApplier {
    pub fn new(merged: &DenseMatrix<f64>) -> Result<Self> {
        let (rows, n_features) = merged.shape();
        let svd = thin_svd(merged)?;
        let rank = svd.numerical_rank(rows, n_features);

        let basis: Vec<Vec<f64>> = svd.right.into_iter().take(rank).collect();
        let singular_values: Vec<f64> = svd.singular_values.into_iter().take(rank).collect();
        info!(
            "CompressionApplier: {} components from a {}x{} sketch",
            basis.len(),
            rows,
            n_features
        );

        Ok(Self {
            basis,
            singular_values,
            n_features,
        })
    }

    /// Keep only the leading `k` components.
    pub fn truncate(mut self, k: usize) -> Self {
        self.basis.truncate(k);
        self.singular_values.truncate(k);
        self
    }

    /// Rows of `Vᵗ`, one per component.
    pub fn basis(&self) -> &[Vec<f64>] {
        &self.basis
    }

    pub fn singular_values(&self) -> &[f64] {
        &self.singular_values
    }

    pub fn n_components(&self) -> usize {
        self.basis.len()
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// `k`-dimensional coordinates of every row, in input order.
    pub fn project(&self, rows: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        if let Some(bad) = rows.iter().find(|r| r.len() != self.n_features) {
            return Err(SketchError::DimensionMismatch {
                expected: self.n_features,
                got: bad.len(),
            }
            .into());
        }
        debug!("Projecting {} rows onto {} components", rows.len(), self.basis.len());

        Ok(rows
            .par_iter()
            .map(|row| self.basis.iter().map(|v| dot(row, v)).collect())
            .collect())
    }
}
