use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::FilterConfig;
use crate::data::{Beacon, Location, Pose, State};
use crate::error::{CancelToken, LocError};
use crate::localization::beacon_filter::BeaconFilterChain;
use crate::localization::initializer::StatusInitializer;
use crate::localization::metropolis::MetropolisSampler;
use crate::localization::resampler::{effective_sample_size, normalize_weights, Resampler};
use crate::models::motion::{FloorCue, MotionInput, SystemModel};
use crate::models::observation::ObservationModel;
use crate::sensors::{Acceleration, Attitude, OrientationMeter, Pedometer};
use crate::utils::circular_mean;
use crate::utils::rng::LocRng;

/// Pose estimate emitted after each scan update.
#[derive(Debug, Clone)]
pub struct Estimate {
    pub timestamp_ms: u64,
    pub pose: Pose,
    /// Particle cloud, attached only when `outputs_particles` is set.
    pub particles: Option<Vec<State>>,
}

/// Streaming particle filter over inertial and BLE scan events.
///
/// Owns the particle set and wires the system model, observation model,
/// resampler and initializers together. Single-threaded: callers must not
/// invoke the update methods concurrently on one instance; events must
/// arrive in monotonic timestamp order per stream.
pub struct StreamParticleFilter {
    config: FilterConfig,
    particles: Vec<State>,
    scratch: Vec<State>,
    system_model: Box<dyn SystemModel>,
    observation_model: Arc<dyn ObservationModel>,
    resampler: Box<dyn Resampler>,
    initializer: Arc<StatusInitializer>,
    obs_dep_initializer: Option<MetropolisSampler>,
    beacon_filter: BeaconFilterChain,
    orientation_meter: Box<dyn OrientationMeter>,
    pedometer: Box<dyn Pedometer>,
    rng: LocRng,
    cancel: CancelToken,
    pending_floor_cue: FloorCue,
    last_inertial_ms: Option<u64>,
    last_acceleration_ms: Option<u64>,
    last_beacon_ms: Option<u64>,
    last_predict_ms: Option<u64>,
}

impl StreamParticleFilter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: FilterConfig,
        system_model: Box<dyn SystemModel>,
        observation_model: Arc<dyn ObservationModel>,
        resampler: Box<dyn Resampler>,
        initializer: Arc<StatusInitializer>,
        obs_dep_initializer: Option<MetropolisSampler>,
        beacon_filter: BeaconFilterChain,
        orientation_meter: Box<dyn OrientationMeter>,
        pedometer: Box<dyn Pedometer>,
    ) -> Result<Self, LocError> {
        config.validate()?;
        if config.uses_observation_dependent_initializer && obs_dep_initializer.is_none() {
            return Err(LocError::Config(
                "observation-dependent initializer requested but not provided".into(),
            ));
        }
        let mut rng = LocRng::from_seed(config.seed);
        let particles = initializer.initialize_states(config.n_states, &mut rng);
        Ok(Self {
            scratch: Vec::with_capacity(particles.len()),
            config,
            particles,
            system_model,
            observation_model,
            resampler,
            initializer,
            obs_dep_initializer,
            beacon_filter,
            orientation_meter,
            pedometer,
            rng,
            cancel: CancelToken::new(),
            pending_floor_cue: FloorCue::None,
            last_inertial_ms: None,
            last_acceleration_ms: None,
            last_beacon_ms: None,
            last_predict_ms: None,
        })
    }

    pub fn particles(&self) -> &[State] {
        &self.particles
    }

    /// Handle for cancelling long-running work from another context.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// External floor-change cue, consumed by the next prediction.
    pub fn put_floor_cue(&mut self, cue: FloorCue) {
        self.pending_floor_cue = cue;
    }

    /// Feed one orientation sample.
    pub fn update_inertial(&mut self, timestamp_ms: u64, attitude: &Attitude) -> Result<(), LocError> {
        check_order(&mut self.last_inertial_ms, timestamp_ms)?;
        self.orientation_meter.put(timestamp_ms, attitude);
        Ok(())
    }

    /// Feed one accelerometer sample; a reported step boundary triggers a
    /// prediction over all particles.
    pub fn update_acceleration(
        &mut self,
        timestamp_ms: u64,
        acc: &Acceleration,
    ) -> Result<(), LocError> {
        check_order(&mut self.last_acceleration_ms, timestamp_ms)?;
        let stepped = self.pedometer.put(timestamp_ms, acc);
        if stepped {
            self.predict(timestamp_ms);
        }
        Ok(())
    }

    /// Feed one beacon scan and emit a pose estimate.
    pub fn update_beacons(
        &mut self,
        timestamp_ms: u64,
        scan: &[Beacon],
    ) -> Result<Estimate, LocError> {
        check_order(&mut self.last_beacon_ms, timestamp_ms)?;

        let filtered = self.beacon_filter.apply(scan.to_vec());
        if filtered.is_empty() {
            warn!(timestamp_ms, "scan empty after filtering; dropped");
            return Ok(self.estimate(timestamp_ms));
        }

        // Stage the update so a cancellation leaves the particle set as it
        // was.
        self.scratch.clear();
        self.scratch.extend_from_slice(&self.particles);

        // log-weight accumulation, normalized by log-sum-exp
        let mut log_weights: Vec<f64> = self
            .scratch
            .iter()
            .map(|state| {
                state.weight.ln()
                    + self
                        .observation_model
                        .log_likelihood(state, &filtered)
                        .log_likelihood
            })
            .collect();
        let max = log_weights
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(f64::NEG_INFINITY, f64::max);
        if max.is_finite() {
            for lw in &mut log_weights {
                *lw -= max;
            }
        }
        for (state, lw) in self.scratch.iter_mut().zip(&log_weights) {
            state.weight = lw.exp();
        }
        let dropped = normalize_weights(&mut self.scratch);
        if dropped > 0 {
            debug!(dropped, "degenerate particle weights dropped");
        }

        let ess = effective_sample_size(&self.scratch);
        if ess < self.config.alpha_weaken * self.config.n_states as f64 {
            debug!(ess, "resampling");
            self.scratch = self
                .resampler
                .resample(&self.scratch, &mut self.rng, &self.cancel)?;
        }

        self.mix_in_recovery_states(&filtered);

        std::mem::swap(&mut self.particles, &mut self.scratch);
        Ok(self.estimate(timestamp_ms))
    }

    /// Re-seed every particle from the survey prior.
    pub fn reset_status(&mut self) {
        self.particles = self
            .initializer
            .initialize_states(self.config.n_states, &mut self.rng);
    }

    /// Re-seed around a known pose (e.g. an entrance fix).
    pub fn reset_status_around(
        &mut self,
        mean_pose: &Pose,
        stdev_pose: &Pose,
        measured_orientation: f64,
    ) -> Result<(), LocError> {
        self.particles = self.initializer.reset_states(
            self.config.n_states,
            mean_pose,
            stdev_pose,
            measured_orientation,
            &mut self.rng,
        )?;
        Ok(())
    }

    fn predict(&mut self, timestamp_ms: u64) {
        let Some(heading) = self.orientation_meter.yaw() else {
            debug!(timestamp_ms, "step before any heading sample; skipped");
            return;
        };
        let dt = match self.last_predict_ms {
            Some(last) => (timestamp_ms.saturating_sub(last)) as f64 / 1000.0,
            None => 0.0,
        };
        self.last_predict_ms = Some(timestamp_ms);
        let input = MotionInput {
            dt,
            stepped: true,
            heading,
            floor_cue: std::mem::take(&mut self.pending_floor_cue),
        };
        self.system_model
            .predict(&mut self.particles, &input, &mut self.rng);
    }

    /// Scan-conditioned mixture recovery: zero-weight particles plus a
    /// random `mixture_probability` fraction are replaced by draws from the
    /// observation-dependent initializer.
    fn mix_in_recovery_states(&mut self, scan: &[Beacon]) {
        let Some(metro) = self.obs_dep_initializer.as_mut() else {
            return;
        };
        let mut replace: Vec<usize> = Vec::new();
        for (i, state) in self.scratch.iter().enumerate() {
            if state.weight == 0.0 || self.rng.bernoulli(self.config.mixture_probability) {
                replace.push(i);
            }
        }
        if replace.is_empty() {
            return;
        }
        metro.set_input(scan);
        metro.burn_in(&mut self.rng);
        let fresh = metro.sampling(replace.len(), &mut self.rng);
        let uniform = 1.0 / self.config.n_states as f64;
        for (slot, mut state) in replace.into_iter().zip(fresh) {
            state.weight = uniform;
            self.scratch[slot] = state;
        }
        normalize_weights(&mut self.scratch);
    }

    fn estimate(&self, timestamp_ms: u64) -> Estimate {
        let mut location = Location::new(0.0, 0.0, 0.0, 0.0);
        let mut velocity = 0.0;
        let mut normal_velocity = 0.0;
        for state in &self.particles {
            let w = state.weight;
            location.x += w * state.location().x;
            location.y += w * state.location().y;
            location.z += w * state.location().z;
            location.floor += w * state.location().floor;
            velocity += w * state.pose.velocity;
            normal_velocity += w * state.pose.normal_velocity;
        }
        let orientation = circular_mean(
            self.particles
                .iter()
                .map(|s| (s.pose.orientation, s.weight)),
        );
        Estimate {
            timestamp_ms,
            pose: Pose {
                location,
                orientation,
                velocity,
                normal_velocity,
            },
            particles: self
                .config
                .outputs_particles
                .then(|| self.particles.clone()),
        }
    }
}

fn check_order(last: &mut Option<u64>, now: u64) -> Result<(), LocError> {
    if let Some(prev) = *last {
        if now < prev {
            return Err(LocError::OutOfOrderTimestamp { prev, now });
        }
    }
    *last = Some(now);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BiasPrior, MetropolisParams, MotionProperty, PosePrior};
    use crate::data::Sample;
    use crate::localization::resampler::SystematicResampler;
    use crate::map::{Building, CoordinateSystem, FloorMap, Raster};
    use crate::models::motion::{PoseRandomWalker, PoseRandomWalkerInBuilding};
    use crate::models::observation::StubModel;
    use crate::sensors::{OrientationMeterAverage, PedometerWalkingState};
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;

    fn open_building() -> Arc<Building> {
        let raster = Raster::from_fn(60, 60, |_, _| [255, 0, 0, 0]);
        let floor = FloorMap::new(raster, CoordinateSystem::new(1.0, 1.0, 1.0, 0.0, 0.0, 0.0));
        let mut floors = BTreeMap::new();
        floors.insert(0, floor);
        Arc::new(Building::new(floors).unwrap())
    }

    fn survey() -> Vec<Sample> {
        (0..10)
            .map(|i| Sample {
                timestamp_ms: i as u64,
                location: Location::new(5.0 + i as f64 * 5.0, 30.0, 0.0, 0.0),
                beacons: vec![],
            })
            .collect()
    }

    fn build_filter(config: FilterConfig, with_metropolis: bool) -> StreamParticleFilter {
        let building = open_building();
        let initializer = Arc::new(
            StatusInitializer::new(
                building.clone(),
                &survey(),
                PosePrior::default(),
                BiasPrior::default(),
            )
            .unwrap(),
        );
        let observation_model: Arc<dyn ObservationModel> = Arc::new(StubModel {
            center: Location::new(30.0, 30.0, 0.0, 0.0),
            scale: 0.05,
        });
        let system_model = PoseRandomWalkerInBuilding::new(
            PoseRandomWalker::new(PosePrior::default(), BiasPrior::default(), 100.0),
            building,
            MotionProperty::default(),
        );
        let metro = with_metropolis.then(|| {
            MetropolisSampler::new(
                observation_model.clone(),
                initializer.clone(),
                MetropolisParams {
                    burn_in: 200,
                    ..MetropolisParams::default()
                },
            )
        });
        StreamParticleFilter::new(
            config,
            Box::new(system_model),
            observation_model,
            Box::new(SystematicResampler),
            initializer,
            metro,
            BeaconFilterChain::standard(10),
            Box::new(OrientationMeterAverage::default()),
            Box::new(PedometerWalkingState::new(100, 0.0)),
        )
        .unwrap()
    }

    fn small_config() -> FilterConfig {
        FilterConfig {
            n_states: 200,
            seed: 7,
            ..FilterConfig::default()
        }
    }

    fn scan() -> Vec<Beacon> {
        vec![Beacon::new(1, 1, -60.0), Beacon::new(1, 2, -70.0)]
    }

    #[test]
    fn construction_seeds_a_normalized_particle_set() {
        let filter = build_filter(small_config(), false);
        assert_eq!(filter.particles().len(), 200);
        let total: f64 = filter.particles().iter().map(|s| s.weight).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn scan_updates_keep_the_invariants() {
        let mut filter = build_filter(small_config(), false);
        for k in 0..5 {
            let estimate = filter.update_beacons(1000 * k, &scan()).unwrap();
            assert_eq!(filter.particles().len(), 200);
            let total: f64 = filter.particles().iter().map(|s| s.weight).sum();
            assert_relative_eq!(total, 1.0, epsilon = 1e-9);
            assert!(filter.particles().iter().all(|s| s.weight >= 0.0));
            assert!(estimate.pose.location.x.is_finite());
        }
        // repeated likelihood updates concentrate mass near the mode
        let estimate = filter.update_beacons(6000, &scan()).unwrap();
        assert!((estimate.pose.location.x - 30.0).abs() < 6.0);
        assert_relative_eq!(estimate.pose.location.floor, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn out_of_order_scans_are_rejected_without_side_effects() {
        let mut filter = build_filter(small_config(), false);
        filter.update_beacons(2000, &scan()).unwrap();
        let before: Vec<State> = filter.particles().to_vec();
        let result = filter.update_beacons(1000, &scan());
        assert!(matches!(
            result,
            Err(LocError::OutOfOrderTimestamp { prev: 2000, now: 1000 })
        ));
        assert_eq!(filter.particles(), &before[..]);
    }

    #[test]
    fn unusable_scan_is_dropped_and_weights_untouched() {
        let mut filter = build_filter(small_config(), false);
        filter.update_beacons(1000, &scan()).unwrap();
        let before: Vec<State> = filter.particles().to_vec();
        // every reading out of range: the chain filters all of them
        let junk = vec![Beacon::new(1, 1, 0.0), Beacon::new(1, 2, -100.0)];
        let estimate = filter.update_beacons(2000, &junk).unwrap();
        assert_eq!(filter.particles(), &before[..]);
        assert_eq!(estimate.timestamp_ms, 2000);
    }

    #[test]
    fn steps_move_the_particle_cloud() {
        let mut filter = build_filter(small_config(), false);
        let mean_x_before: f64 = filter
            .particles()
            .iter()
            .map(|s| s.weight * s.location().x)
            .sum();
        // heading east, stepping once per pedometer period
        for t in 0..20u64 {
            filter
                .update_inertial(t * 100, &Attitude { yaw: 0.0 })
                .unwrap();
            filter
                .update_acceleration(
                    t * 100,
                    &Acceleration {
                        ax: 0.0,
                        ay: 0.0,
                        az: 9.81,
                    },
                )
                .unwrap();
        }
        let mean_x_after: f64 = filter
            .particles()
            .iter()
            .map(|s| s.weight * s.location().x)
            .sum();
        // orientation bias is uniform at initialization, so the cloud
        // spreads rather than translates; it must still have moved
        assert!(filter.particles().len() == 200);
        assert!((mean_x_after - mean_x_before).abs() < 30.0);
        let moved = filter
            .particles()
            .iter()
            .any(|s| s.pose.velocity > 0.0);
        assert!(moved);
    }

    #[test]
    fn mixture_recovery_replaces_particles_with_scan_conditioned_draws() {
        let config = FilterConfig {
            mixture_probability: 1.0,
            uses_observation_dependent_initializer: true,
            ..small_config()
        };
        let mut filter = build_filter(config, true);
        filter.update_beacons(1000, &scan()).unwrap();
        // with probability one every particle comes from the sampler, which
        // concentrates near the stub mode
        let near = filter
            .particles()
            .iter()
            .filter(|s| Location::distance_2d(s.location(), &Location::new(30.0, 30.0, 0.0, 0.0)) < 20.0)
            .count();
        assert!(near > 150);
    }

    #[test]
    fn missing_metropolis_with_flag_set_is_a_config_error() {
        let config = FilterConfig {
            uses_observation_dependent_initializer: true,
            ..small_config()
        };
        let building = open_building();
        let initializer = Arc::new(
            StatusInitializer::new(
                building.clone(),
                &survey(),
                PosePrior::default(),
                BiasPrior::default(),
            )
            .unwrap(),
        );
        let observation_model: Arc<dyn ObservationModel> = Arc::new(StubModel {
            center: Location::new(30.0, 30.0, 0.0, 0.0),
            scale: 0.05,
        });
        let system_model = PoseRandomWalkerInBuilding::new(
            PoseRandomWalker::new(PosePrior::default(), BiasPrior::default(), 100.0),
            building,
            MotionProperty::default(),
        );
        let result = StreamParticleFilter::new(
            config,
            Box::new(system_model),
            observation_model,
            Box::new(SystematicResampler),
            initializer,
            None,
            BeaconFilterChain::standard(10),
            Box::new(OrientationMeterAverage::default()),
            Box::new(PedometerWalkingState::default()),
        );
        assert!(matches!(result, Err(LocError::Config(_))));
    }

    #[test]
    fn cancelled_filter_surfaces_cancellation_and_keeps_state() {
        let mut filter = build_filter(small_config(), false);
        filter.update_beacons(1000, &scan()).unwrap();
        let before: Vec<State> = filter.particles().to_vec();
        filter.cancel_token().cancel();
        // the next update needs a resample, which observes the token
        let result = filter.update_beacons(2000, &scan());
        match result {
            Err(LocError::Cancelled) => {
                assert_eq!(filter.particles(), &before[..]);
            }
            Ok(_) => {
                // ESS stayed high enough to skip resampling; nothing to assert
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn reset_status_reseeds_from_the_survey() {
        let mut filter = build_filter(small_config(), false);
        filter.update_beacons(1000, &scan()).unwrap();
        filter.reset_status();
        assert_eq!(filter.particles().len(), 200);
        let total: f64 = filter.particles().iter().map(|s| s.weight).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-9);
        // all particles back on survey seed locations
        for state in filter.particles() {
            assert_relative_eq!(state.location().y, 30.0, epsilon = 1e-9);
        }
    }
}
