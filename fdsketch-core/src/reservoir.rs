//! Priority sampling of matrix rows.
//!
//! Each row `a` gets weight `w = ‖a‖²` and priority `p = w / u` with
//! `u ~ Unif(0, 1]`. The reservoir keeps the `capacity` rows with the largest
//! priorities, which gives a weighted sample without replacement whose subset
//! sums can be estimated without bias (Duffield, Lund, Thorup 2007).
//!
//! `*_with_rng` entry points take a caller-supplied generator so tests can
//! replay a sampling decision exactly.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use log::{debug, trace};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::{Result, SketchError};
use crate::linalg::squared_norm;

/// A retained row with its sampling priority and original weight.
#[derive(Clone, Debug)]
pub struct ReservoirItem {
    pub row: Vec<f64>,
    pub priority: f64,
    pub weight: f64,
    seq: u64,
}

impl PartialEq for ReservoirItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ReservoirItem {}

impl PartialOrd for ReservoirItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReservoirItem {
    // equal priorities: the older item ranks lower and is evicted first
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Bounded max-priority reservoir with min-priority eviction.
#[derive(Clone, Debug)]
pub struct PriorityReservoir {
    capacity: usize,
    heap: BinaryHeap<Reverse<ReservoirItem>>,
    next_seq: u64,
    seen: usize,
    rng: ChaCha8Rng,
}

impl PriorityReservoir {
    /// Create a reservoir that retains at most `capacity` rows.
    ///
    /// # Errors
    /// `InvalidConfig` when `capacity == 0`.
    pub fn new(capacity: usize, seed: Option<u64>) -> Result<Self> {
        if capacity == 0 {
            return Err(SketchError::InvalidConfig(
                "reservoir capacity must be positive".to_string(),
            ));
        }
        let seed = seed.unwrap_or_else(rand::random::<u64>);
        debug!("PriorityReservoir: capacity={}, seed={}", capacity, seed);
        Ok(Self {
            capacity,
            heap: BinaryHeap::with_capacity(capacity + 1),
            next_seq: 0,
            seen: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Rows offered since construction (or the last drain).
    pub fn seen(&self) -> usize {
        self.seen
    }

    /// Offer one row, drawing `u` from the reservoir's own generator.
    pub fn update(&mut self, row: Vec<f64>) {
        let u = 1.0 - self.rng.random::<f64>();
        self.push_with_uniform(row, u);
    }

    /// Offer one row, drawing `u` from `rng`.
    pub fn update_with_rng<R: Rng + ?Sized>(&mut self, row: Vec<f64>, rng: &mut R) {
        let u = 1.0 - rng.random::<f64>();
        self.push_with_uniform(row, u);
    }

    fn push_with_uniform(&mut self, row: Vec<f64>, u: f64) {
        let weight = squared_norm(&row);
        let priority = weight / u;
        trace!("reservoir push: w={:.6}, u={:.6}, p={:.6}", weight, u, priority);

        self.heap.push(Reverse(ReservoirItem {
            row,
            priority,
            weight,
            seq: self.next_seq,
        }));
        self.next_seq += 1;
        self.seen += 1;

        if self.heap.len() > self.capacity {
            if let Some(Reverse(evicted)) = self.heap.pop() {
                trace!("reservoir evict: p={:.6}", evicted.priority);
            }
        }
    }

    /// Smallest retained priority, the current admission threshold once full.
    pub fn min_priority(&self) -> Option<f64> {
        self.heap.peek().map(|Reverse(item)| item.priority)
    }

    /// Remove and return every retained item, lowest priority first.
    pub fn drain_items(&mut self) -> Vec<ReservoirItem> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(Reverse(item)) = self.heap.pop() {
            out.push(item);
        }
        self.seen = 0;
        out
    }

    /// Remove and return every retained row.
    pub fn drain(&mut self) -> Vec<Vec<f64>> {
        let rows: Vec<Vec<f64>> = self.drain_items().into_iter().map(|i| i.row).collect();
        debug!("reservoir drained {} rows", rows.len());
        rows
    }
}
