//! # fdsketch-core
//!
//! Numerics for streaming matrix sketching:
//!
//! - [`SketchUpdater`]: rank-adaptive alpha Frequent Directions with a
//!   rotate/shrink step driven by a thin SVD.
//! - [`PriorityReservoir`]: weighted row subsampling by priority sampling.
//! - [`linalg`]: `DenseMatrix` helpers and the SVD wrapper both rely on.

pub mod error;
pub mod linalg;
pub mod reservoir;
pub mod sketch;

pub use error::{Result, SketchError};
pub use linalg::{ThinSvd, thin_svd};
pub use reservoir::{PriorityReservoir, ReservoirItem};
pub use sketch::{ShrinkReference, SketchParams, SketchUpdater};

#[cfg(test)]
mod tests;
