//! Input collaborators.
//!
//! The pipeline pulls rows through [`BatchSource`]; it makes no assumption
//! about where rows come from. [`MatrixSource`] serves an in-memory
//! partition and is what tests and the local cluster runner use.

use std::ops::Range;

use log::debug;

use crate::{FdError, Result};

/// A contiguous run of rows pulled from a source.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Batch {
    /// Global index of `rows[0]`.
    pub start_index: usize,
    pub rows: Vec<Vec<f64>>,
    /// Source-rendered low-resolution copies of `rows`, one per row. Used
    /// only when preprocessing does not render thumbnails itself.
    pub thumbnails: Option<Vec<Vec<f64>>>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Half-open global index range covered by this batch.
    pub fn index_range(&self) -> (usize, usize) {
        (self.start_index, self.start_index + self.rows.len())
    }
}

pub trait BatchSource: Send {
    /// Up to `n` further rows, or `None` once the source is exhausted.
    fn next_batch(&mut self, n: usize) -> Result<Option<Batch>>;
}

/// Rows `[start, start + total/size)` assigned to `rank` out of `size` workers.
///
/// Trailing `total % size` rows are not assigned to anyone.
pub fn partition_range(total: usize, size: usize, rank: usize, start_offset: usize) -> Result<Range<usize>> {
    if size == 0 || rank >= size {
        return Err(FdError::Config(format!(
            "cannot partition for rank {} of {} workers",
            rank, size
        )));
    }
    let start = start_offset + total * rank / size;
    Ok(start..start + total / size)
}

/// In-memory source over one worker's rows.
#[derive(Clone, Debug)]
pub struct MatrixSource {
    rows: Vec<Vec<f64>>,
    start_index: usize,
    cursor: usize,
}

impl MatrixSource {
    /// `rows[0]` has global index `start_index`.
    pub fn new(rows: Vec<Vec<f64>>, start_index: usize) -> Self {
        Self {
            rows,
            start_index,
            cursor: 0,
        }
    }

    /// Split `rows` across `size` workers with [`partition_range`].
    pub fn partitioned(rows: &[Vec<f64>], size: usize) -> Result<Vec<Self>> {
        (0..size)
            .map(|rank| {
                let range = partition_range(rows.len(), size, rank, 0)?;
                debug!("Partition for rank {}: {:?}", rank, range);
                Ok(Self::new(rows[range.clone()].to_vec(), range.start))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.rows.len() - self.cursor
    }
}

impl BatchSource for MatrixSource {
    fn next_batch(&mut self, n: usize) -> Result<Option<Batch>> {
        if n == 0 {
            return Err(FdError::Source("requested an empty batch".into()));
        }
        if self.cursor >= self.rows.len() {
            return Ok(None);
        }
        let end = (self.cursor + n).min(self.rows.len());
        let batch = Batch {
            start_index: self.start_index + self.cursor,
            rows: self.rows[self.cursor..end].to_vec(),
            thumbnails: None,
        };
        self.cursor = end;
        Ok(Some(batch))
    }
}
