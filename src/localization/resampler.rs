use std::collections::BTreeMap;

use crate::data::State;
use crate::error::{CancelToken, LocError};
use crate::utils::rng::LocRng;

/// Effective sample size `1 / sum(w_i^2)` of a normalized particle set.
pub fn effective_sample_size(states: &[State]) -> f64 {
    let sum_sq: f64 = states.iter().map(|s| s.weight * s.weight).sum();
    if sum_sq <= 0.0 {
        0.0
    } else {
        1.0 / sum_sq
    }
}

/// Normalize weights in place; NaN or negative weights are dropped to zero.
/// A fully degenerate set falls back to uniform. Returns the number of
/// dropped particles.
pub fn normalize_weights(states: &mut [State]) -> usize {
    let mut dropped = 0;
    for state in states.iter_mut() {
        if !state.weight.is_finite() || state.weight < 0.0 {
            state.weight = 0.0;
            dropped += 1;
        }
    }
    let total: f64 = states.iter().map(|s| s.weight).sum();
    if total > 0.0 {
        for state in states.iter_mut() {
            state.weight /= total;
        }
    } else {
        let uniform = 1.0 / states.len() as f64;
        for state in states.iter_mut() {
            state.weight = uniform;
        }
    }
    dropped
}

/// Weighted resampling strategy; dispatched once per update.
pub trait Resampler: Send {
    /// Draw a same-sized particle set; all output weights are `1/N`.
    fn resample(
        &self,
        states: &[State],
        rng: &mut LocRng,
        cancel: &CancelToken,
    ) -> Result<Vec<State>, LocError>;
}

/// Low-variance (systematic) resampling: a single uniform draw in
/// `[0, 1/N)` and one pass over the cumulative weights.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystematicResampler;

impl SystematicResampler {
    /// Deterministic core, exposed so tests can pin the start pointer.
    pub fn resample_from(states: &[State], u0: f64) -> Vec<State> {
        let n = states.len();
        let uniform = 1.0 / n as f64;
        let mut out = Vec::with_capacity(n);
        let mut index = 0;
        let mut cum = states[0].weight;
        for k in 0..n {
            let pointer = u0 + k as f64 * uniform;
            while pointer > cum && index < n - 1 {
                index += 1;
                cum += states[index].weight;
            }
            let mut picked = states[index];
            picked.weight = uniform;
            out.push(picked);
        }
        out
    }
}

impl Resampler for SystematicResampler {
    fn resample(
        &self,
        states: &[State],
        rng: &mut LocRng,
        cancel: &CancelToken,
    ) -> Result<Vec<State>, LocError> {
        cancel.check()?;
        let u0 = rng.next_f64() / states.len() as f64;
        Ok(Self::resample_from(states, u0))
    }
}

/// Systematic resampling bucketed by spatial grid cell.
///
/// Particles are binned by `(floor(x/g), floor(y/g), floor)`; each bin gets
/// a quota proportional to its total weight (largest-remainder rounding)
/// and resamples internally, preserving spatial diversity that a global
/// pass would collapse.
#[derive(Debug, Clone, Copy)]
pub struct GridResampler {
    pub grid_size: f64,
}

impl Default for GridResampler {
    fn default() -> Self {
        Self { grid_size: 5.0 }
    }
}

impl Resampler for GridResampler {
    fn resample(
        &self,
        states: &[State],
        rng: &mut LocRng,
        cancel: &CancelToken,
    ) -> Result<Vec<State>, LocError> {
        let n = states.len();
        let mut bins: BTreeMap<(i64, i64, i32), (f64, Vec<usize>)> = BTreeMap::new();
        for (i, state) in states.iter().enumerate() {
            cancel.check()?;
            let location = state.location();
            let key = (
                (location.x / self.grid_size).floor() as i64,
                (location.y / self.grid_size).floor() as i64,
                location.floor_int(),
            );
            let entry = bins.entry(key).or_insert((0.0, Vec::new()));
            entry.0 += state.weight;
            entry.1.push(i);
        }

        let total: f64 = bins.values().map(|(w, _)| w).sum();
        if total <= 0.0 {
            // degenerate set: fall back to a plain systematic pass
            let mut uniform = states.to_vec();
            normalize_weights(&mut uniform);
            return SystematicResampler.resample(&uniform, rng, cancel);
        }

        // Largest-remainder quota per bin.
        let mut quotas: Vec<(usize, f64)> = Vec::with_capacity(bins.len());
        let mut assigned = 0usize;
        for (weight, _) in bins.values() {
            let share = weight / total * n as f64;
            let base = share.floor() as usize;
            assigned += base;
            quotas.push((base, share - share.floor()));
        }
        let mut order: Vec<usize> = (0..quotas.len()).collect();
        order.sort_by(|&a, &b| quotas[b].1.total_cmp(&quotas[a].1).then(a.cmp(&b)));
        for &bin in order.iter().take(n - assigned) {
            quotas[bin].0 += 1;
        }

        let uniform = 1.0 / n as f64;
        let mut out = Vec::with_capacity(n);
        for ((_, (bin_weight, members)), (quota, _)) in bins.iter().zip(quotas) {
            if quota == 0 {
                continue;
            }
            cancel.check()?;
            // weights renormalized within the bin
            let mut local: Vec<State> = members
                .iter()
                .map(|&i| {
                    let mut s = states[i];
                    s.weight /= bin_weight.max(f64::MIN_POSITIVE);
                    s
                })
                .collect();
            normalize_weights(&mut local);
            let u0 = rng.next_f64() / local.len() as f64;
            let picked = SystematicResampler::resample_from(&local, u0);
            for k in 0..quota {
                let mut s = picked[k % picked.len()];
                s.weight = uniform;
                out.push(s);
            }
        }
        debug_assert_eq!(out.len(), n);
        Ok(out)
    }
}
