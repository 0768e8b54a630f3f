mod test_comm;
mod test_storage;

use std::sync::Once;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

static INIT: Once = Once::new();

pub fn init() {
    INIT.call_once(|| {
        // Read RUST_LOG env variable, default to "info" if not set
        let env = env_logger::Env::default().default_filter_or("info");

        let _ = env_logger::Builder::from_env(env)
            .is_test(true)
            .try_init();
    });
}

/// `n × d` rows from a rank-`r` Gaussian signal with decaying scales plus noise.
pub fn low_rank_rows(n: usize, d: usize, r: usize, noise: f64, seed: u64) -> Vec<Vec<f64>> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let basis: Vec<Vec<f64>> = (0..r)
        .map(|_| (0..d).map(|_| StandardNormal.sample(&mut rng)).collect())
        .collect();

    (0..n)
        .map(|_| {
            let coeffs: Vec<f64> = (0..r)
                .map(|k| {
                    let z: f64 = StandardNormal.sample(&mut rng);
                    z * (r - k) as f64 * 3.0
                })
                .collect();
            (0..d)
                .map(|j| {
                    let e: f64 = StandardNormal.sample(&mut rng);
                    coeffs.iter().zip(&basis).map(|(c, b)| c * b[j]).sum::<f64>() + noise * e
                })
                .collect()
        })
        .collect()
}

/// Share of total energy held by the top `k` squared singular values.
pub fn top_energy_share(singular_values: &[f64], k: usize) -> f64 {
    let total: f64 = singular_values.iter().map(|s| s * s).sum();
    if total == 0.0 {
        return 0.0;
    }
    singular_values.iter().take(k).map(|s| s * s).sum::<f64>() / total
}
