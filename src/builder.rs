//! Run configuration.
//!
//! [`SketchBuilder`] collects parameters with consuming `with_*` setters and
//! validates them once in [`SketchBuilder::build`]. The resulting
//! [`SketchConfig`] is immutable and shared by every worker of a run; its
//! typed view ([`SketchConfig::config_typed`]) is persisted next to every
//! record so a stored sketch can be traced back to the parameters that made it.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use fdsketch_core::{ShrinkReference, SketchParams};

use crate::preprocess::PreprocessOptions;
use crate::{FdError, Result};

pub const DEFAULT_ELL: usize = 10;
pub const DEFAULT_MERGE_ALPHA: f64 = 0.2;
pub const DEFAULT_COMM_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Debug, PartialEq)]
pub struct SketchBuilder {
    pub(crate) n_features: usize,
    pub(crate) ell: usize,
    pub(crate) alpha: f64,
    pub(crate) rank_adapt: bool,
    pub(crate) shrink_reference: ShrinkReference,

    // (0, 1]; below 1 every batch is priority-sampled before sketching
    pub(crate) sampling_factor: f64,
    pub(crate) batch_size: Option<usize>,

    pub(crate) div_by: usize,
    pub(crate) merge_alpha: f64,
    pub(crate) comm_timeout: Duration,

    pub(crate) seed: Option<u64>,
    pub(crate) preprocess: PreprocessOptions,
    pub(crate) run_id: Option<String>,
}

impl SketchBuilder {
    /// Start a configuration for rows of width `n_features`.
    pub fn new(n_features: usize) -> Self {
        debug!("Creating SketchBuilder for d={}", n_features);
        Self {
            n_features,
            ell: DEFAULT_ELL,
            alpha: 0.0,
            rank_adapt: false,
            shrink_reference: ShrinkReference::default(),
            sampling_factor: 1.0,
            batch_size: None,
            div_by: 2,
            merge_alpha: DEFAULT_MERGE_ALPHA,
            comm_timeout: DEFAULT_COMM_TIMEOUT,
            seed: None,
            preprocess: PreprocessOptions::default(),
            run_id: None,
        }
    }

    // -------------------- Sketch --------------------

    /// Initial sketch rank. Rank adaptation may grow it, never shrink it.
    pub fn with_ell(mut self, ell: usize) -> Self {
        info!("Setting sketch rank ell={}", ell);
        self.ell = ell;
        self
    }

    /// Fraction of the sketch subject to shrinkage; the leading
    /// `floor(ell·(1-alpha))` directions are kept exact.
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        info!("Setting alpha={}", alpha);
        self.alpha = alpha;
        self
    }

    pub fn with_rank_adapt(mut self, rank_adapt: bool) -> Self {
        info!("Setting rank adaptation: {}", rank_adapt);
        self.rank_adapt = rank_adapt;
        self
    }

    pub fn with_shrink_reference(mut self, reference: ShrinkReference) -> Self {
        info!("Setting shrink reference: {:?}", reference);
        self.shrink_reference = reference;
        self
    }

    // -------------------- Batching --------------------

    /// Keep `floor(n · factor)` rows of every `n`-row batch by priority sampling.
    pub fn with_sampling_factor(mut self, factor: f64) -> Self {
        info!("Setting sampling factor: {}", factor);
        self.sampling_factor = factor;
        self
    }

    /// Override the default batch size of `floor(2·ell / sampling_factor)`.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        info!("Setting batch size: {}", batch_size);
        self.batch_size = Some(batch_size);
        self
    }

    // -------------------- Merge --------------------

    /// Branching factor of the merge tree. The worker count must be a power of it.
    pub fn with_div_by(mut self, div_by: usize) -> Self {
        info!("Setting merge branching factor div_by={}", div_by);
        self.div_by = div_by;
        self
    }

    pub fn with_merge_alpha(mut self, alpha: f64) -> Self {
        info!("Setting merge alpha={}", alpha);
        self.merge_alpha = alpha;
        self
    }

    /// Upper bound on any single send, receive or barrier.
    pub fn with_comm_timeout(mut self, timeout: Duration) -> Self {
        info!("Setting communication timeout: {:?}", timeout);
        if timeout < Duration::from_millis(100) {
            warn!("Communication timeout {:?} is very short, slow workers will abort the run", timeout);
        }
        self.comm_timeout = timeout;
        self
    }

    // -------------------- Misc --------------------

    /// Seed for reservoirs and error estimates. Worker `r` derives `seed + r`.
    pub fn with_seed(mut self, seed: u64) -> Self {
        info!("Setting seed: {}", seed);
        self.seed = Some(seed);
        self
    }

    pub fn with_preprocessing(mut self, options: PreprocessOptions) -> Self {
        info!("Configuring preprocessing: {:?}", options);
        self.preprocess = options;
        self
    }

    /// Name under which records are stored. Defaults to a UTC timestamp.
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        let run_id = run_id.into();
        info!("Setting run id: {}", run_id);
        self.run_id = Some(run_id);
        self
    }

    /// Validate and freeze the configuration.
    ///
    /// # Errors
    /// `FdError::Config` for any out-of-range parameter.
    pub fn build(self) -> Result<SketchConfig> {
        if self.n_features == 0 {
            return Err(FdError::Config("feature dimension must be positive".into()));
        }
        if self.ell == 0 {
            return Err(FdError::Config("ell must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(FdError::Config(format!(
                "alpha must lie in [0, 1], got {}",
                self.alpha
            )));
        }
        if !(0.0..=1.0).contains(&self.merge_alpha) {
            return Err(FdError::Config(format!(
                "merge alpha must lie in [0, 1], got {}",
                self.merge_alpha
            )));
        }
        if !(self.sampling_factor > 0.0 && self.sampling_factor <= 1.0) {
            return Err(FdError::Config(format!(
                "sampling factor must lie in (0, 1], got {}",
                self.sampling_factor
            )));
        }
        if self.div_by < 2 {
            return Err(FdError::Config(format!(
                "merge branching factor must be at least 2, got {}",
                self.div_by
            )));
        }
        self.preprocess.validate()?;

        let batch_size = self
            .batch_size
            .unwrap_or(((2 * self.ell) as f64 / self.sampling_factor).floor() as usize);
        if batch_size == 0 {
            return Err(FdError::Config("batch size must be positive".into()));
        }
        if self.sampling_factor < 1.0 && (batch_size as f64 * self.sampling_factor).floor() < 1.0 {
            return Err(FdError::Config(format!(
                "batch size {} with sampling factor {} leaves an empty reservoir",
                batch_size, self.sampling_factor
            )));
        }

        let run_id = self
            .run_id
            .unwrap_or_else(|| chrono::Utc::now().format("%y%m%d%H%M%S").to_string());

        let config = SketchConfig {
            n_features: self.n_features,
            ell: self.ell,
            alpha: self.alpha,
            rank_adapt: self.rank_adapt,
            shrink_reference: self.shrink_reference,
            sampling_factor: self.sampling_factor,
            batch_size,
            div_by: self.div_by,
            merge_alpha: self.merge_alpha,
            comm_timeout: self.comm_timeout,
            seed: self.seed,
            preprocess: self.preprocess,
            run_id,
        };
        info!("Built configuration: {}", config);
        Ok(config)
    }
}

/// Validated, immutable run configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct SketchConfig {
    pub n_features: usize,
    pub ell: usize,
    pub alpha: f64,
    pub rank_adapt: bool,
    pub shrink_reference: ShrinkReference,
    pub sampling_factor: f64,
    pub batch_size: usize,
    pub div_by: usize,
    pub merge_alpha: f64,
    pub comm_timeout: Duration,
    pub seed: Option<u64>,
    pub preprocess: PreprocessOptions,
    pub run_id: String,
}

impl SketchConfig {
    /// Parameters for a worker's local sketch.
    pub fn sketch_params(&self, rank: usize) -> SketchParams {
        let mut params = SketchParams::new(self.ell, self.n_features)
            .with_alpha(self.alpha)
            .with_rank_adapt(self.rank_adapt)
            .with_shrink_reference(self.shrink_reference);
        if let Some(seed) = self.worker_seed(rank) {
            params = params.with_seed(seed);
        }
        params
    }

    /// Parameters for the merge-stage sketch of a worker whose local summary
    /// has `local_ell` rows.
    pub fn merge_params(&self, local_ell: usize, rank: usize) -> SketchParams {
        let mut params = SketchParams::new(local_ell, self.n_features)
            .with_alpha(self.merge_alpha)
            .with_rank_adapt(false)
            .with_shrink_reference(self.shrink_reference);
        if let Some(seed) = self.worker_seed(rank) {
            params = params.with_seed(seed.wrapping_add(0x9E37_79B9));
        }
        params
    }

    pub fn worker_seed(&self, rank: usize) -> Option<u64> {
        self.seed.map(|s| s.wrapping_add(rank as u64))
    }

    /// Rows kept from a batch of `n` when sampling is active.
    pub fn reservoir_capacity(&self, n: usize) -> usize {
        (n as f64 * self.sampling_factor).floor() as usize
    }

    pub fn sampling_enabled(&self) -> bool {
        self.sampling_factor < 1.0
    }

    pub fn config_typed(&self) -> HashMap<String, ConfigValue> {
        let mut config = HashMap::new();

        config.insert("n_features".to_string(), ConfigValue::Usize(self.n_features));
        config.insert("ell".to_string(), ConfigValue::Usize(self.ell));
        config.insert("alpha".to_string(), ConfigValue::F64(self.alpha));
        config.insert("rank_adapt".to_string(), ConfigValue::Bool(self.rank_adapt));
        config.insert(
            "shrink_reference".to_string(),
            ConfigValue::String(format!("{:?}", self.shrink_reference)),
        );
        config.insert(
            "sampling_factor".to_string(),
            ConfigValue::F64(self.sampling_factor),
        );
        config.insert("batch_size".to_string(), ConfigValue::Usize(self.batch_size));
        config.insert("div_by".to_string(), ConfigValue::Usize(self.div_by));
        config.insert("merge_alpha".to_string(), ConfigValue::F64(self.merge_alpha));
        config.insert(
            "comm_timeout_ms".to_string(),
            ConfigValue::U64(self.comm_timeout.as_millis() as u64),
        );
        config.insert("seed".to_string(), ConfigValue::OptionU64(self.seed));
        config.insert("run_id".to_string(), ConfigValue::String(self.run_id.clone()));

        let p = &self.preprocess;
        config.insert(
            "threshold_quantile".to_string(),
            ConfigValue::OptionF64(p.threshold_quantile),
        );
        config.insert(
            "no_zero_intensity".to_string(),
            ConfigValue::Bool(p.no_zero_intensity),
        );
        config.insert(
            "normalize_intensity".to_string(),
            ConfigValue::Bool(p.normalize_intensity),
        );
        config.insert("min_intensity".to_string(), ConfigValue::F64(p.min_intensity));
        config.insert("bin_factor".to_string(), ConfigValue::Usize(p.bin_factor));
        config.insert(
            "thumbnail_bin".to_string(),
            ConfigValue::OptionU64(p.thumbnail_bin.map(|b| b as u64)),
        );

        config
    }
}

impl fmt::Display for SketchConfig {
    /// Comma-separated `key=value` pairs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run_id={}, \
             n_features={}, \
             ell={}, \
             alpha={}, \
             rank_adapt={}, \
             shrink_reference={:?}, \
             sampling_factor={}, \
             batch_size={}, \
             div_by={}, \
             merge_alpha={}, \
             comm_timeout={:?}, \
             seed={}",
            self.run_id,
            self.n_features,
            self.ell,
            self.alpha,
            self.rank_adapt,
            self.shrink_reference,
            self.sampling_factor,
            self.batch_size,
            self.div_by,
            self.merge_alpha,
            self.comm_timeout,
            self.seed.map_or("None".to_string(), |v| v.to_string()),
        )
    }
}

/// Configuration value that keeps its type through a JSON round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigValue {
    Bool(bool),
    Usize(usize),
    F64(f64),
    U64(u64),
    String(String),
    OptionF64(Option<f64>),
    OptionU64(Option<u64>),
}

impl ConfigValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_usize(&self) -> Option<usize> {
        match self {
            ConfigValue::Usize(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::F64(v) => Some(*v),
            ConfigValue::OptionF64(v) => *v,
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ConfigValue::U64(v) => Some(*v),
            ConfigValue::OptionU64(v) => *v,
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(v) => write!(f, "{}", v),
            ConfigValue::Usize(v) => write!(f, "{}", v),
            ConfigValue::F64(v) => write!(f, "{}", v),
            ConfigValue::U64(v) => write!(f, "{}", v),
            ConfigValue::String(v) => write!(f, "{}", v),
            ConfigValue::OptionF64(opt) => match opt {
                Some(v) => write!(f, "{}", v),
                None => write!(f, "None"),
            },
            ConfigValue::OptionU64(opt) => match opt {
                Some(v) => write!(f, "{}", v),
                None => write!(f, "None"),
            },
        }
    }
}
