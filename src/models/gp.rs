use nalgebra::{Cholesky, DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CancelToken, LocError};

/// Kernel hyperparameters: an RBF over the 3D position with an extra
/// floor-mismatch term.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpHyperParams {
    /// Lengthscale of the positional RBF [m].
    pub lengthscale: f64,
    /// Lengthscale of the floor-mismatch term [floors].
    pub floor_lengthscale: f64,
    pub signal_variance: f64,
    pub noise_variance: f64,
}

impl Default for GpHyperParams {
    fn default() -> Self {
        Self {
            lengthscale: 4.0,
            floor_lengthscale: 0.5,
            signal_variance: 4.0,
            noise_variance: 1.0,
        }
    }
}

/// Small hyperparameter grid searched by `fit_cv`.
pub fn default_candidates() -> Vec<GpHyperParams> {
    let mut candidates = Vec::new();
    for &lengthscale in &[2.0, 4.0, 8.0] {
        for &signal_variance in &[1.0, 4.0, 16.0] {
            for &noise_variance in &[1.0, 4.0] {
                candidates.push(GpHyperParams {
                    lengthscale,
                    floor_lengthscale: 0.5,
                    signal_variance,
                    noise_variance,
                });
            }
        }
    }
    candidates
}

/// Gaussian-process posterior mean over RSSI residuals.
///
/// Trained on `X` (n x 4 sample coordinates) against `dY` (n x m residual
/// columns, one per beacon) with an activity mask `A`. A single Gram matrix
/// is factored once; per-beacon prediction reads the cached weight matrix
/// `W = (K + sigma_n^2 I)^-1 dY`. Predictive variance is not exposed here;
/// the observation model carries a per-beacon noise estimate instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaussianProcess {
    x: DMatrix<f64>,
    dy: DMatrix<f64>,
    actives: DMatrix<f64>,
    params: GpHyperParams,
    weights: DMatrix<f64>,
}

const MAX_RIDGE_ATTEMPTS: usize = 8;

impl GaussianProcess {
    /// Fit with fixed hyperparameters. A Gram matrix that fails to factor is
    /// retried with a tenfold-inflated nugget up to a fixed number of times.
    pub fn fit(
        x: DMatrix<f64>,
        dy: DMatrix<f64>,
        actives: DMatrix<f64>,
        params: GpHyperParams,
    ) -> Result<Self, LocError> {
        let n = x.nrows();
        if n == 0 || dy.nrows() != n || actives.shape() != dy.shape() {
            return Err(LocError::Data(
                "GP training matrices are empty or inconsistently sized".into(),
            ));
        }
        let gram = Self::gram(&x, &params);
        let (chol, noise) = Self::factor_with_ridge(&gram, params.noise_variance)?;
        if noise > params.noise_variance {
            warn!(noise, "gram matrix required ridge inflation");
        }
        let weights = chol.solve(&dy);
        Ok(Self {
            x,
            dy,
            actives,
            params: GpHyperParams {
                noise_variance: noise,
                ..params
            },
            weights,
        })
    }

    /// Select hyperparameters by leave-one-out cross-validation over
    /// `candidates` (the default grid when empty), then fit once.
    pub fn fit_cv(
        x: DMatrix<f64>,
        dy: DMatrix<f64>,
        actives: DMatrix<f64>,
        candidates: &[GpHyperParams],
        cancel: &CancelToken,
    ) -> Result<Self, LocError> {
        let grid;
        let candidates = if candidates.is_empty() {
            grid = default_candidates();
            &grid
        } else {
            candidates
        };
        cancel.check()?;

        let scores: Vec<Option<(f64, GpHyperParams)>> = candidates
            .par_iter()
            .map(|&params| {
                if cancel.is_cancelled() {
                    return None;
                }
                Self::loo_score(&x, &dy, &actives, params)
                    .ok()
                    .map(|score| (score, params))
            })
            .collect();
        cancel.check()?;

        let best = scores
            .into_iter()
            .flatten()
            .filter(|(score, _)| score.is_finite())
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .ok_or(LocError::SingularGram)?;
        debug!(score = best.0, params = ?best.1, "selected GP hyperparameters");
        Self::fit(x, dy, actives, best.1)
    }

    pub fn params(&self) -> &GpHyperParams {
        &self.params
    }

    /// Posterior mean residual at `query` for the selected beacon columns,
    /// in the order given.
    pub fn predict(&self, query: &[f64; 4], columns: &[usize]) -> Vec<f64> {
        let n = self.x.nrows();
        let mut kvec = DVector::zeros(n);
        for i in 0..n {
            let row = self.x.row(i);
            kvec[i] = Self::kernel(&self.params, query, &[row[0], row[1], row[2], row[3]]);
        }
        columns
            .iter()
            .map(|&j| kvec.dot(&self.weights.column(j).clone_owned()))
            .collect()
    }

    // Leave-one-out residuals via r_i = (K^-1 y)_i / (K^-1)_ii, scored on
    // active entries.
    fn loo_score(
        x: &DMatrix<f64>,
        dy: &DMatrix<f64>,
        actives: &DMatrix<f64>,
        params: GpHyperParams,
    ) -> Result<f64, LocError> {
        let gram = Self::gram(x, &params);
        let (chol, _) = Self::factor_with_ridge(&gram, params.noise_variance)?;
        let kinv = chol.inverse();
        let alpha = &kinv * dy;
        let diag = kinv.diagonal();

        let mut sum = 0.0;
        let mut count = 0.0;
        for j in 0..dy.ncols() {
            for i in 0..dy.nrows() {
                if actives[(i, j)] != 0.0 {
                    let r = alpha[(i, j)] / diag[i];
                    sum += r * r;
                    count += 1.0;
                }
            }
        }
        if count == 0.0 {
            return Ok(f64::INFINITY);
        }
        Ok(sum / count)
    }

    fn factor_with_ridge(
        gram: &DMatrix<f64>,
        noise_variance: f64,
    ) -> Result<(Cholesky<f64, nalgebra::Dyn>, f64), LocError> {
        let n = gram.nrows();
        let mut noise = noise_variance.max(1e-12);
        for _ in 0..MAX_RIDGE_ATTEMPTS {
            let k = gram + DMatrix::identity(n, n) * noise;
            if let Some(chol) = Cholesky::new(k) {
                return Ok((chol, noise));
            }
            noise *= 10.0;
        }
        Err(LocError::SingularGram)
    }

    fn gram(x: &DMatrix<f64>, params: &GpHyperParams) -> DMatrix<f64> {
        let n = x.nrows();
        DMatrix::from_fn(n, n, |i, j| {
            let (a, b) = (x.row(i), x.row(j));
            Self::kernel(
                params,
                &[a[0], a[1], a[2], a[3]],
                &[b[0], b[1], b[2], b[3]],
            )
        })
    }

    fn kernel(params: &GpHyperParams, a: &[f64; 4], b: &[f64; 4]) -> f64 {
        let d2 = (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2);
        let floor_diff = a[3] - b[3];
        params.signal_variance
            * (-0.5 * d2 / params.lengthscale.powi(2)).exp()
            * (-0.5 * (floor_diff / params.floor_lengthscale).powi(2)).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn line_training_set() -> (DMatrix<f64>, DMatrix<f64>, DMatrix<f64>) {
        // residual field dy = sin(x/3) * 5 sampled on a line
        let n = 12;
        let x = DMatrix::from_fn(n, 4, |i, c| if c == 0 { i as f64 } else { 0.0 });
        let dy = DMatrix::from_fn(n, 1, |i, _| 5.0 * (i as f64 / 3.0).sin());
        let actives = DMatrix::from_element(n, 1, 1.0);
        (x, dy, actives)
    }

    #[test]
    fn posterior_mean_tracks_training_values() {
        let (x, dy, actives) = line_training_set();
        let params = GpHyperParams {
            noise_variance: 1e-6,
            ..GpHyperParams::default()
        };
        let gp = GaussianProcess::fit(x, dy.clone(), actives, params).unwrap();
        for i in 0..dy.nrows() {
            let pred = gp.predict(&[i as f64, 0.0, 0.0, 0.0], &[0])[0];
            assert_relative_eq!(pred, dy[(i, 0)], epsilon = 1e-2);
        }
    }

    #[test]
    fn prediction_decays_away_from_data() {
        let (x, dy, actives) = line_training_set();
        let gp = GaussianProcess::fit(x, dy, actives, GpHyperParams::default()).unwrap();
        let far = gp.predict(&[1000.0, 0.0, 0.0, 0.0], &[0])[0];
        assert_relative_eq!(far, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn duplicate_rows_trigger_ridge_fallback_not_failure() {
        let x = DMatrix::from_row_slice(4, 4, &[
            1.0, 1.0, 0.0, 0.0,
            1.0, 1.0, 0.0, 0.0,
            2.0, 1.0, 0.0, 0.0,
            3.0, 1.0, 0.0, 0.0,
        ]);
        let dy = DMatrix::from_column_slice(4, 1, &[1.0, 1.0, 2.0, 3.0]);
        let actives = DMatrix::from_element(4, 1, 1.0);
        let params = GpHyperParams {
            noise_variance: 0.0,
            ..GpHyperParams::default()
        };
        let gp = GaussianProcess::fit(x, dy, actives, params).unwrap();
        let pred = gp.predict(&[1.0, 1.0, 0.0, 0.0], &[0])[0];
        assert!(pred.is_finite());
    }

    #[test]
    fn cross_validation_selects_a_finite_candidate() {
        let (x, dy, actives) = line_training_set();
        let cancel = CancelToken::new();
        let gp = GaussianProcess::fit_cv(x, dy, actives, &[], &cancel).unwrap();
        let pred = gp.predict(&[3.0, 0.0, 0.0, 0.0], &[0])[0];
        assert!(pred.is_finite());
    }

    #[test]
    fn cancelled_token_aborts_cross_validation() {
        let (x, dy, actives) = line_training_set();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            GaussianProcess::fit_cv(x, dy, actives, &[], &cancel),
            Err(LocError::Cancelled)
        ));
    }

    #[test]
    fn floor_mismatch_suppresses_correlation() {
        let (x, dy, actives) = line_training_set();
        let gp = GaussianProcess::fit(x, dy, actives, GpHyperParams::default()).unwrap();
        let same_floor = gp.predict(&[5.0, 0.0, 0.0, 0.0], &[0])[0];
        let other_floor = gp.predict(&[5.0, 0.0, 0.0, 3.0], &[0])[0];
        assert!(other_floor.abs() < same_floor.abs() * 1e-6);
    }
}
