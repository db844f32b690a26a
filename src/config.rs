//! Runtime configuration.
//!
//! Plain structs with `Default` implementations; everything is assigned
//! before the filter is constructed and read-only afterwards. Angles are
//! radians, distances meters, velocities m/s, RSSI dBm.

use std::f64::consts::PI;

use crate::error::LocError;

/// Top-level knobs of the streaming filter.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Particle count, fixed at construction.
    pub n_states: usize,
    /// Resample when the effective sample size drops below `alpha_weaken * n_states`.
    pub alpha_weaken: f64,
    /// Per-particle probability of being replaced by a scan-conditioned draw
    /// after each beacon update.
    pub mixture_probability: f64,
    pub uses_observation_dependent_initializer: bool,
    /// Debug mode: widens the motion distributions and disables wall detection.
    pub random_walker: bool,
    /// Enables the per-particle RSSI-bias estimation path.
    pub considers_bias: bool,
    /// Degrees of freedom; `Some(dof)` with dof >= 1 swaps the Gaussian
    /// likelihood for a Student-t.
    pub t_distribution_dof: Option<f64>,
    /// Score beacons absent from the registry against `min_rssi`.
    pub fills_unknown_beacon_rssi: bool,
    /// Attach the particle cloud to each emitted estimate.
    pub outputs_particles: bool,
    /// Seed of the filter-owned RNG.
    pub seed: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            n_states: 1000,
            alpha_weaken: 0.3,
            mixture_probability: 0.0,
            uses_observation_dependent_initializer: false,
            random_walker: false,
            considers_bias: false,
            t_distribution_dof: None,
            fills_unknown_beacon_rssi: true,
            outputs_particles: false,
            seed: 0,
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<(), LocError> {
        if self.n_states == 0 {
            return Err(LocError::Config("n_states must be positive".into()));
        }
        if !(self.alpha_weaken > 0.0 && self.alpha_weaken <= 1.0) {
            return Err(LocError::Config("alpha_weaken must be in (0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&self.mixture_probability) {
            return Err(LocError::Config("mixture_probability must be in [0, 1]".into()));
        }
        if let Some(dof) = self.t_distribution_dof {
            if dof < 1.0 {
                return Err(LocError::Config("t-distribution dof must be >= 1".into()));
            }
        }
        Ok(())
    }
}

/// Priors of the pose attributes assigned at initialization and diffused
/// during prediction.
#[derive(Debug, Clone, Copy)]
pub struct PosePrior {
    pub mean_velocity: f64,
    pub std_velocity: f64,
    pub min_velocity: f64,
    pub max_velocity: f64,
    /// Standard deviation of the noise added to the particle velocity per step.
    pub diffusion_velocity: f64,
    /// Standard deviation of the noise added to the measured heading.
    pub std_orientation: f64,
    pub std_x: f64,
    pub std_y: f64,
}

impl Default for PosePrior {
    fn default() -> Self {
        Self {
            mean_velocity: 1.0,
            std_velocity: 0.6,
            min_velocity: 0.1,
            max_velocity: 3.0,
            diffusion_velocity: 0.30,
            std_orientation: 3.0 / 180.0 * PI,
            std_x: 0.25,
            std_y: 0.25,
        }
    }
}

impl PosePrior {
    pub fn validate(&self) -> Result<(), LocError> {
        if !(self.min_velocity <= self.mean_velocity && self.mean_velocity <= self.max_velocity) {
            return Err(LocError::Config(
                "velocity prior must satisfy min <= mean <= max".into(),
            ));
        }
        if self.std_velocity < 0.0 || self.diffusion_velocity < 0.0 {
            return Err(LocError::Config("velocity deviations must be non-negative".into()));
        }
        Ok(())
    }
}

/// Priors of the per-particle bias parameters.
#[derive(Debug, Clone, Copy)]
pub struct BiasPrior {
    pub mean_rssi_bias: f64,
    pub std_rssi_bias: f64,
    /// Standard deviation of the RSSI-bias drift [dBm/s].
    pub diffusion_rssi_bias: f64,
    pub min_rssi_bias: f64,
    pub max_rssi_bias: f64,
    /// Standard deviation of the orientation-bias drift [rad/s].
    pub diffusion_orientation_bias: f64,
}

impl Default for BiasPrior {
    fn default() -> Self {
        Self {
            mean_rssi_bias: 0.0,
            std_rssi_bias: 2.0,
            diffusion_rssi_bias: 0.2,
            min_rssi_bias: -10.0,
            max_rssi_bias: 10.0,
            diffusion_orientation_bias: 10.0 / 180.0 * PI,
        }
    }
}

impl BiasPrior {
    pub fn validate(&self) -> Result<(), LocError> {
        if self.min_rssi_bias > self.max_rssi_bias {
            return Err(LocError::Config("rssi bias bounds are inverted".into()));
        }
        Ok(())
    }
}

/// Building-aware motion constraints.
#[derive(Debug, Clone, Copy)]
pub struct MotionProperty {
    /// Clamp on the heading change rate between successive predictions.
    pub angular_velocity_limit: f64,
    /// Wall crossings steeper than this incidence angle are rejected.
    pub max_incidence_angle: f64,
    /// Weight multiplier applied to rejected particles.
    pub weight_decay_rate: f64,
    /// Disabled in random-walker mode.
    pub checks_walls: bool,
}

impl Default for MotionProperty {
    fn default() -> Self {
        Self {
            angular_velocity_limit: 30.0 / 180.0 * PI,
            max_incidence_angle: 45.0 / 180.0 * PI,
            weight_decay_rate: 0.9,
            checks_walls: true,
        }
    }
}

/// Parameters of the observation-dependent Metropolis initializer.
#[derive(Debug, Clone, Copy)]
pub struct MetropolisParams {
    pub burn_in: usize,
    /// Proposal jump radius in the floor plane [m].
    pub radius_2d: f64,
    /// Chain thinning interval.
    pub interval: usize,
    /// Sort the chain by log-likelihood before sampling.
    pub with_ordering: bool,
}

impl Default for MetropolisParams {
    fn default() -> Self {
        Self {
            burn_in: 1000,
            radius_2d: 10.0,
            interval: 1,
            with_ordering: true,
        }
    }
}

/// Parameters of the batch observation-model training.
#[derive(Debug, Clone)]
pub struct TrainParams {
    pub max_iteration: usize,
    pub tolerance: f64,
    /// Per-coefficient ridge toward the shared prior.
    pub lambdas: [f64; 4],
    /// Per-coefficient shrinkage of the shared prior itself.
    pub rhos: [f64; 4],
    pub distance_offset: f64,
    /// Stdev multiplier applied when the state and the beacon are on
    /// different floors.
    pub coeff_diff_floor_stdev: f64,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            max_iteration: 10_000,
            tolerance: 1e-5,
            lambdas: [1000.0, 0.001, 1000.0, 1000.0],
            rhos: [0.0, 0.0, 100.0, 100.0],
            distance_offset: 1.0,
            coeff_diff_floor_stdev: 1.0,
        }
    }
}

/// Widen the motion distributions for the random-walker debug mode.
pub fn apply_random_walker(pose: &mut PosePrior, bias: &mut BiasPrior, motion: &mut MotionProperty) {
    pose.mean_velocity = 1.5;
    pose.std_velocity = 1.5;
    pose.diffusion_velocity = 1.5;
    pose.std_orientation = 2.0 * PI;
    bias.diffusion_orientation_bias = 2.0 * PI;
    motion.angular_velocity_limit = 2.0 * PI;
    motion.checks_walls = false;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(FilterConfig::default().validate().is_ok());
        assert!(PosePrior::default().validate().is_ok());
        assert!(BiasPrior::default().validate().is_ok());
    }

    #[test]
    fn bad_config_is_rejected() {
        let mut config = FilterConfig::default();
        config.n_states = 0;
        assert!(matches!(config.validate(), Err(LocError::Config(_))));

        let mut config = FilterConfig::default();
        config.t_distribution_dof = Some(0.5);
        assert!(config.validate().is_err());

        let mut pose = PosePrior::default();
        pose.min_velocity = 5.0;
        assert!(pose.validate().is_err());
    }

    #[test]
    fn random_walker_disables_wall_checks() {
        let mut pose = PosePrior::default();
        let mut bias = BiasPrior::default();
        let mut motion = MotionProperty::default();
        apply_random_walker(&mut pose, &mut bias, &mut motion);
        assert!(!motion.checks_walls);
        assert!(pose.std_orientation > PI);
    }
}
