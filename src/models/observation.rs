use std::io::{Read, Write};

use nalgebra::{DMatrix, Matrix4, Vector4};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::TrainParams;
use crate::data::{Beacon, BeaconId, BleBeacon, Location, NormalParameter, Sample, State, MIN_RSSI};
use crate::error::{CancelToken, LocError};
use crate::models::gp::GaussianProcess;
use crate::models::itu::ItuModelFunction;
use crate::utils::{log_pdf_normal, log_pdf_student_t, mahalanobis_sq};

/// Schema version written by `save`.
pub const MODEL_SCHEMA_VERSION: u32 = 1;

// Guards the log densities against a degenerate fitted stdev.
const STDEV_FLOOR: f64 = 1e-6;

/// Joint scan likelihood of one state, with diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Likelihood {
    pub log_likelihood: f64,
    /// Sum of squared standardized residuals across scored beacons.
    pub mahalanobis_sq: f64,
    pub known: usize,
    pub unknown: usize,
}

/// Distribution used to score an RSSI residual.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LikelihoodKind {
    Normal,
    StudentT { dof: f64 },
}

impl LikelihoodKind {
    pub fn log_pdf(&self, x: f64, mean: f64, stdev: f64) -> f64 {
        let stdev = stdev.max(STDEV_FLOOR);
        match self {
            LikelihoodKind::Normal => log_pdf_normal(x, mean, stdev),
            LikelihoodKind::StudentT { dof } => log_pdf_student_t(x, mean, stdev, *dof),
        }
    }
}

/// Per-state RSSI likelihood of a beacon scan.
///
/// Dispatched once per update, not per particle.
pub trait ObservationModel: Send + Sync {
    /// Predicted RSSI distribution of every registered beacon in the scan.
    fn predict(&self, state: &State, scan: &[Beacon]) -> FxHashMap<BeaconId, NormalParameter>;

    fn log_likelihood(&self, state: &State, scan: &[Beacon]) -> Likelihood;
}

/// Diagnostics counters aggregated over one training run.
#[derive(Debug, Clone, Default)]
pub struct TrainReport {
    pub n_samples: usize,
    pub n_samples_averaged: usize,
    pub dropped_beacon_readings: usize,
    pub itu_sweeps: usize,
    pub itu_converged: bool,
    pub diverged_beacons: usize,
    pub nan_stdev_beacons: usize,
}

/// Observation model composing a per-beacon ITU path-loss mean, a
/// Gaussian-process residual over the survey geometry and a per-beacon
/// noise estimate.
#[derive(Debug, Clone)]
pub struct GaussianProcessLdplModel {
    beacons: Vec<BleBeacon>,
    id_index: FxHashMap<BeaconId, usize>,
    itu_functions: FxHashMap<BeaconId, ItuModelFunction>,
    itu_parameters: Vec<Vector4<f64>>,
    gp: GaussianProcess,
    rssi_stdevs: Vec<f64>,
    stdev_for_unknown: f64,
    /// Stdev multiplier applied when the state and a beacon sit on
    /// different floors.
    pub coeff_diff_floor_stdev: f64,
    /// Score beacons absent from the registry against `MIN_RSSI`.
    pub fills_unknown_beacon_rssi: bool,
    /// Subtract the per-particle RSSI bias before scoring.
    pub considers_bias: bool,
    pub likelihood: LikelihoodKind,
}

impl GaussianProcessLdplModel {
    /// Batch-train the composed model from labeled survey samples.
    pub fn train(
        beacons: Vec<BleBeacon>,
        samples: &[Sample],
        params: &TrainParams,
        cancel: &CancelToken,
    ) -> Result<(Self, TrainReport), LocError> {
        if beacons.is_empty() {
            return Err(LocError::EmptyBeacons);
        }
        let id_index = BleBeacon::index_map(&beacons);
        let itu_functions: FxHashMap<BeaconId, ItuModelFunction> = beacons
            .iter()
            .map(|b| (b.id, ItuModelFunction::new(params.distance_offset)))
            .collect();

        let (samples, dropped) = Sample::filter_unregistered_beacons(samples, &id_index);
        let n_readings: usize = samples.iter().map(|s| s.beacons.len()).sum();
        if samples.is_empty() || n_readings == 0 {
            return Err(LocError::NoValidSample { dropped });
        }
        let averaged = Sample::averaged(&samples);
        info!(
            n_samples = samples.len(),
            n_averaged = averaged.len(),
            dropped,
            "training observation model"
        );

        let mut report = TrainReport {
            n_samples: samples.len(),
            n_samples_averaged: averaged.len(),
            dropped_beacon_readings: dropped,
            ..TrainReport::default()
        };

        let itu_parameters = fit_itu_model(
            &beacons,
            &id_index,
            &itu_functions,
            &averaged,
            params,
            cancel,
            &mut report,
        )?;

        // Residual matrix over the averaged samples; unobserved cells are
        // filled with the RSSI floor and every observed cell is active.
        let n = averaged.len();
        let m = beacons.len();
        let mut y = DMatrix::from_element(n, m, MIN_RSSI);
        let mut actives = DMatrix::zeros(n, m);
        let mut x = DMatrix::zeros(n, 4);
        for (i, sample) in averaged.iter().enumerate() {
            let coords = sample.location.to_vec4();
            for (c, value) in coords.iter().enumerate() {
                x[(i, c)] = *value;
            }
            for beacon in &sample.beacons {
                let j = id_index[&beacon.id];
                y[(i, j)] = beacon.rssi;
                actives[(i, j)] = 1.0;
            }
        }
        let mut dy = DMatrix::zeros(n, m);
        for (i, sample) in averaged.iter().enumerate() {
            for (j, ble) in beacons.iter().enumerate() {
                let itu = &itu_functions[&ble.id];
                let mean = itu.predict_at(&itu_parameters[j], &sample.location, &ble.location);
                dy[(i, j)] = y[(i, j)] - mean;
            }
        }

        let gp = GaussianProcess::fit_cv(x, dy, actives, &[], cancel)?;

        let mut model = Self {
            beacons,
            id_index,
            itu_functions,
            itu_parameters,
            gp,
            rssi_stdevs: Vec::new(),
            stdev_for_unknown: 0.0,
            coeff_diff_floor_stdev: params.coeff_diff_floor_stdev,
            fills_unknown_beacon_rssi: true,
            considers_bias: false,
            likelihood: LikelihoodKind::Normal,
        };

        // Noise is estimated against the raw (non-averaged) samples.
        model.rssi_stdevs = model.compute_rssi_stdevs(&samples, &mut report);
        model.stdev_for_unknown = rms(&model.rssi_stdevs);
        debug!(stdev_for_unknown = model.stdev_for_unknown, "noise estimation done");

        Ok((model, report))
    }

    /// Apply the runtime knobs that live on the filter configuration:
    /// bias handling and the likelihood family.
    pub fn apply_config(&mut self, config: &crate::config::FilterConfig) {
        self.considers_bias = config.considers_bias;
        self.fills_unknown_beacon_rssi = config.fills_unknown_beacon_rssi;
        self.likelihood = match config.t_distribution_dof {
            Some(dof) => LikelihoodKind::StudentT { dof },
            None => LikelihoodKind::Normal,
        };
    }

    pub fn beacons(&self) -> &[BleBeacon] {
        &self.beacons
    }

    pub fn itu_parameters(&self) -> &[Vector4<f64>] {
        &self.itu_parameters
    }

    pub fn rssi_stdevs(&self) -> &[f64] {
        &self.rssi_stdevs
    }

    pub fn stdev_for_unknown(&self) -> f64 {
        self.stdev_for_unknown
    }

    fn compute_rssi_stdevs(&self, samples: &[Sample], report: &mut TrainReport) -> Vec<f64> {
        let m = self.beacons.len();
        let mut sums = vec![0.0; m];
        let mut counts = vec![0usize; m];
        for sample in samples {
            let indices: Vec<usize> = sample
                .beacons
                .iter()
                .filter_map(|b| self.id_index.get(&b.id).copied())
                .collect();
            let residuals = self.gp.predict(&sample.location.to_vec4(), &indices);
            for (beacon, (j, dy_pred)) in sample.beacons.iter().zip(
                indices.iter().copied().zip(residuals),
            ) {
                let ble = &self.beacons[j];
                let itu = &self.itu_functions[&ble.id];
                let mean = itu.predict_at(&self.itu_parameters[j], &sample.location, &ble.location);
                let difference = beacon.rssi - (mean + dy_pred);
                sums[j] += difference * difference;
                counts[j] += 1;
            }
        }

        let mut stdevs: Vec<f64> = (0..m)
            .map(|j| {
                if counts[j] == 0 {
                    f64::NAN
                } else {
                    (sums[j] / counts[j] as f64).sqrt()
                }
            })
            .collect();
        let fallback = rms(&stdevs);
        for (j, stdev) in stdevs.iter_mut().enumerate() {
            if stdev.is_nan() {
                warn!(beacon = self.beacons[j].id, "no raw observation; stdev replaced by RMS");
                report.nan_stdev_beacons += 1;
                *stdev = fallback;
            }
        }
        stdevs
    }

    /// Registry column indices of the scan's known beacons, in scan order.
    fn known_indices(&self, scan: &[Beacon]) -> Vec<usize> {
        scan.iter()
            .filter_map(|b| self.id_index.get(&b.id).copied())
            .collect()
    }

    /// Serialize as schema-tagged JSON.
    pub fn save<W: Write>(&self, writer: W) -> Result<(), LocError> {
        let file = ModelFileV1 {
            version: MODEL_SCHEMA_VERSION,
            beacons: self.beacons.clone(),
            itu_offsets: self
                .beacons
                .iter()
                .map(|b| (b.id, self.itu_functions[&b.id].distance_offset))
                .collect(),
            itu_parameters: self
                .itu_parameters
                .iter()
                .map(|p| [p[0], p[1], p[2], p[3]])
                .collect(),
            gp: self.gp.clone(),
            rssi_stdevs: self.rssi_stdevs.clone(),
        };
        serde_json::to_writer(writer, &file).map_err(|e| LocError::Data(e.to_string()))
    }

    /// Load a schema-tagged JSON model. Version 0 carried a single global
    /// ITU distance offset, broadcast here to every registered beacon.
    pub fn load<R: Read>(reader: R) -> Result<Self, LocError> {
        let value: serde_json::Value =
            serde_json::from_reader(reader).map_err(|e| LocError::Data(e.to_string()))?;
        let version = value.get("version").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        let (beacons, offsets, itu_parameters, gp, rssi_stdevs) = match version {
            0 => {
                let file: ModelFileV0 =
                    serde_json::from_value(value).map_err(|e| LocError::Data(e.to_string()))?;
                let offsets = file
                    .beacons
                    .iter()
                    .map(|b| (b.id, file.itu_offset))
                    .collect();
                (
                    file.beacons,
                    offsets,
                    file.itu_parameters,
                    file.gp,
                    file.rssi_stdevs,
                )
            }
            MODEL_SCHEMA_VERSION => {
                let file: ModelFileV1 =
                    serde_json::from_value(value).map_err(|e| LocError::Data(e.to_string()))?;
                (
                    file.beacons,
                    file.itu_offsets,
                    file.itu_parameters,
                    file.gp,
                    file.rssi_stdevs,
                )
            }
            other => return Err(LocError::UnknownModelVersion(other)),
        };
        if beacons.is_empty() {
            return Err(LocError::EmptyBeacons);
        }
        let id_index = BleBeacon::index_map(&beacons);
        let itu_functions = offsets
            .into_iter()
            .map(|(id, offset)| (id, ItuModelFunction::new(offset)))
            .collect();
        let itu_parameters = itu_parameters
            .into_iter()
            .map(|p| Vector4::new(p[0], p[1], p[2], p[3]))
            .collect();
        let stdev_for_unknown = rms(&rssi_stdevs);
        Ok(Self {
            beacons,
            id_index,
            itu_functions,
            itu_parameters,
            gp,
            rssi_stdevs,
            stdev_for_unknown,
            coeff_diff_floor_stdev: 1.0,
            fills_unknown_beacon_rssi: true,
            considers_bias: false,
            likelihood: LikelihoodKind::Normal,
        })
    }
}

impl ObservationModel for GaussianProcessLdplModel {
    fn predict(&self, state: &State, scan: &[Beacon]) -> FxHashMap<BeaconId, NormalParameter> {
        let indices = self.known_indices(scan);
        let residuals = self.gp.predict(&state.location().to_vec4(), &indices);

        let mut predictions = FxHashMap::default();
        let mut local = 0;
        for beacon in scan {
            let Some(&j) = self.id_index.get(&beacon.id) else {
                continue;
            };
            let ble = &self.beacons[j];
            let itu = &self.itu_functions[&ble.id];
            let mean = itu.predict_at(&self.itu_parameters[j], state.location(), &ble.location)
                + residuals[local];
            local += 1;

            let mut stdev = self.rssi_stdevs[j];
            if self.coeff_diff_floor_stdev != 1.0
                && Location::is_different_floor(state.location(), &ble.location)
            {
                stdev *= self.coeff_diff_floor_stdev;
            }
            predictions.insert(beacon.id, NormalParameter { mean, stdev });
        }
        predictions
    }

    fn log_likelihood(&self, state: &State, scan: &[Beacon]) -> Likelihood {
        let predictions = self.predict(state, scan);

        let mut joint = 0.0;
        let mut maha = 0.0;
        let mut known = 0;
        let mut unknown = 0;
        for beacon in scan {
            let mut rssi = beacon.rssi;
            if self.considers_bias {
                rssi -= state.rssi_bias;
            }
            if let Some(stats) = predictions.get(&beacon.id) {
                let stdev = stats.stdev.max(STDEV_FLOOR);
                joint += self.likelihood.log_pdf(rssi, stats.mean, stdev);
                maha += mahalanobis_sq(rssi, stats.mean, stdev);
                known += 1;
            } else {
                unknown += 1;
                if self.fills_unknown_beacon_rssi {
                    let stdev = self.stdev_for_unknown.max(STDEV_FLOOR);
                    joint += self.likelihood.log_pdf(rssi, MIN_RSSI, stdev);
                    maha += mahalanobis_sq(rssi, MIN_RSSI, stdev);
                }
            }
        }
        Likelihood {
            log_likelihood: joint,
            mahalanobis_sq: maha,
            known,
            unknown,
        }
    }
}

/// Iterative reweighted least squares over per-beacon ITU parameters with a
/// shared shrinkage prior.
fn fit_itu_model(
    beacons: &[BleBeacon],
    id_index: &FxHashMap<BeaconId, usize>,
    itu_functions: &FxHashMap<BeaconId, ItuModelFunction>,
    averaged: &[Sample],
    params: &TrainParams,
    cancel: &CancelToken,
    report: &mut TrainReport,
) -> Result<Vec<Vector4<f64>>, LocError> {
    let n = averaged.len();
    let m = beacons.len();

    // Initial shared estimate: plain least squares over in-range
    // observations only.
    let mut phi_t_phi = Matrix4::zeros();
    let mut phi_t_y = Vector4::zeros();
    let mut n_active = 0usize;
    for sample in averaged {
        for beacon in &sample.beacons {
            if !beacon.in_rssi_range() {
                continue;
            }
            let j = id_index[&beacon.id];
            let itu = &itu_functions[&beacon.id];
            let phi = itu.transform_feature(&sample.location, &beacons[j].location);
            phi_t_phi += phi * phi.transpose();
            phi_t_y += phi * beacon.rssi;
            n_active += 1;
        }
    }
    if n_active == 0 {
        return Err(LocError::NoValidSample { dropped: 0 });
    }
    let mut prior = solve4(&phi_t_phi, &phi_t_y).unwrap_or_else(Vector4::zeros);
    debug!(?prior, n_active, "initial ITU parameters");

    // Per-beacon feature/target matrices; targets are floor-filled for
    // unobserved cells so the prediction-driven mask can see them.
    let mut features: Vec<Vec<Vector4<f64>>> = Vec::with_capacity(m);
    let mut targets: Vec<Vec<f64>> = vec![vec![MIN_RSSI; n]; m];
    for (j, ble) in beacons.iter().enumerate() {
        let itu = &itu_functions[&ble.id];
        features.push(
            averaged
                .iter()
                .map(|s| itu.transform_feature(&s.location, &ble.location))
                .collect(),
        );
        for (i, sample) in averaged.iter().enumerate() {
            if let Some(b) = sample.beacons.iter().find(|b| b.id == ble.id) {
                targets[j][i] = b.rssi;
            }
        }
    }

    let lambda = Matrix4::from_diagonal(&Vector4::from(params.lambdas));
    let mut thetas = vec![prior; m];
    let mut converged = false;
    for sweep in 0..params.max_iteration {
        cancel.check()?;
        report.itu_sweeps = sweep + 1;

        thetas = thetas
            .par_iter()
            .enumerate()
            .map(|(j, theta)| {
                let mut a = lambda;
                let mut b = lambda * prior;
                for (phi, &y) in features[j].iter().zip(&targets[j]) {
                    // entries the current fit predicts above the floor
                    if phi.dot(theta) > MIN_RSSI {
                        a += phi * phi.transpose();
                        b += phi * y;
                    }
                }
                solve4(&a, &b).unwrap_or(*theta)
            })
            .collect();

        // Shrink the shared prior toward the mean of the per-beacon fits.
        let mut mean = Vector4::zeros();
        for theta in &thetas {
            mean += theta / m as f64;
        }
        let mut new_prior = prior;
        for k in 0..4 {
            let denom = params.lambdas[k] + params.rhos[k];
            if denom > 0.0 {
                new_prior[k] = params.lambdas[k] * mean[k] / denom;
            }
        }
        let diff = (prior - new_prior).norm();
        prior = new_prior;
        if diff < params.tolerance {
            converged = true;
            break;
        }
    }
    report.itu_converged = converged;
    if !converged {
        warn!(sweeps = report.itu_sweeps, "ITU parameters did not converge");
    }

    // Diverging fits fall back to the shared prior.
    for theta in &mut thetas {
        if !theta.iter().all(|v| v.is_finite()) {
            *theta = prior;
            report.diverged_beacons += 1;
        }
    }
    Ok(thetas)
}

// Column-pivoted QR with a tiny-ridge retry for rank-deficient systems
// (all-zero cross-floor columns are common).
fn solve4(a: &Matrix4<f64>, b: &Vector4<f64>) -> Option<Vector4<f64>> {
    if let Some(solution) = a.col_piv_qr().solve(b) {
        if solution.iter().all(|v| v.is_finite()) {
            return Some(solution);
        }
    }
    let ridged = a + Matrix4::identity() * 1e-9;
    ridged
        .col_piv_qr()
        .solve(b)
        .filter(|s| s.iter().all(|v| v.is_finite()))
}

fn rms(values: &[f64]) -> f64 {
    let valid: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if valid.is_empty() {
        return 0.0;
    }
    (valid.iter().map(|v| v * v).sum::<f64>() / valid.len() as f64).sqrt()
}

#[derive(Serialize, Deserialize)]
struct ModelFileV1 {
    version: u32,
    beacons: Vec<BleBeacon>,
    itu_offsets: Vec<(BeaconId, f64)>,
    itu_parameters: Vec<[f64; 4]>,
    gp: GaussianProcess,
    rssi_stdevs: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
struct ModelFileV0 {
    beacons: Vec<BleBeacon>,
    itu_offset: f64,
    itu_parameters: Vec<[f64; 4]>,
    gp: GaussianProcess,
    rssi_stdevs: Vec<f64>,
}

/// Fixed-shape observation model for exercising the filter plumbing in
/// tests: log-likelihood falls off with squared distance from a center.
#[derive(Debug, Clone)]
pub struct StubModel {
    pub center: Location,
    pub scale: f64,
}

impl ObservationModel for StubModel {
    fn predict(&self, _state: &State, _scan: &[Beacon]) -> FxHashMap<BeaconId, NormalParameter> {
        FxHashMap::default()
    }

    fn log_likelihood(&self, state: &State, scan: &[Beacon]) -> Likelihood {
        let d = Location::distance(state.location(), &self.center);
        Likelihood {
            log_likelihood: -self.scale * d * d,
            mahalanobis_sq: d * d,
            known: scan.len(),
            unknown: 0,
        }
    }
}
