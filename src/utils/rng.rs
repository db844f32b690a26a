use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Random source owned by a filter or initializer instance.
///
/// One instance per consumer keeps every run reproducible under a seed;
/// nothing in the engine touches a global RNG.
#[derive(Debug, Clone)]
pub struct LocRng {
    rng: StdRng,
}

impl LocRng {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Uniform draw from `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    pub fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next_f64()
    }

    pub fn gaussian(&mut self, mean: f64, stdev: f64) -> f64 {
        let z: f64 = self.rng.sample(StandardNormal);
        mean + stdev * z
    }

    /// Rejection-sampled Gaussian restricted to `[lo, hi]`.
    pub fn truncated_gaussian(&mut self, mean: f64, stdev: f64, lo: f64, hi: f64) -> f64 {
        const MAX_TRIES: usize = 1000;
        for _ in 0..MAX_TRIES {
            let v = self.gaussian(mean, stdev);
            if (lo..=hi).contains(&v) {
                return v;
            }
        }
        self.gaussian(mean, stdev).clamp(lo, hi)
    }

    pub fn bernoulli(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    /// `k` indices drawn from `0..n`.
    ///
    /// Without replacement while `k <= n` (partial Fisher-Yates); with
    /// replacement otherwise, so a small seed set can still feed a large
    /// particle cloud.
    pub fn random_subset(&mut self, n: usize, k: usize) -> Vec<usize> {
        if k <= n {
            let mut indices: Vec<usize> = (0..n).collect();
            for i in 0..k {
                let j = i + self.rng.gen_range(0..n - i);
                indices.swap(i, j);
            }
            indices.truncate(k);
            indices
        } else {
            (0..k).map(|_| self.rng.gen_range(0..n)).collect()
        }
    }
}
