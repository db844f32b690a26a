use std::f64::consts::TAU;
use std::sync::Arc;

use tracing::info;

use crate::config::{BiasPrior, PosePrior};
use crate::data::{Location, Pose, Sample, State};
use crate::error::LocError;
use crate::map::Building;
use crate::utils::rng::LocRng;
use crate::utils::wrap_angle;

// Rejection budget when jittering reset states onto the walkable area.
const MAX_RESET_TRIES: usize = 1000;

/// Seeds pose hypotheses from the survey geometry.
///
/// Candidate positions are the unique training-sample locations that are
/// walkable on the map; pose and bias attributes are drawn from the
/// configured priors.
pub struct StatusInitializer {
    building: Arc<Building>,
    movable_locations: Vec<Location>,
    pose_prior: PosePrior,
    bias_prior: BiasPrior,
}

impl StatusInitializer {
    pub fn new(
        building: Arc<Building>,
        samples: &[Sample],
        pose_prior: PosePrior,
        bias_prior: BiasPrior,
    ) -> Result<Self, LocError> {
        let unique = Sample::unique_locations(samples);
        let movable_locations: Vec<Location> = unique
            .iter()
            .filter(|loc| is_movable(&building, loc))
            .copied()
            .collect();
        info!(
            candidates = movable_locations.len(),
            discarded = unique.len() - movable_locations.len(),
            "status initializer seeded"
        );
        if movable_locations.is_empty() {
            return Err(LocError::NoMovableSample);
        }
        Ok(Self {
            building,
            movable_locations,
            pose_prior,
            bias_prior,
        })
    }

    pub fn building(&self) -> &Arc<Building> {
        &self.building
    }

    /// `n` seed locations drawn from the movable candidates.
    pub fn initialize_locations(&self, n: usize, rng: &mut LocRng) -> Vec<Location> {
        rng.random_subset(self.movable_locations.len(), n)
            .into_iter()
            .map(|i| self.movable_locations[i])
            .collect()
    }

    pub fn initialize_poses(&self, n: usize, rng: &mut LocRng) -> Vec<Pose> {
        let locations = self.initialize_locations(n, rng);
        locations
            .into_iter()
            .map(|location| self.pose_from_location(location, rng))
            .collect()
    }

    pub fn initialize_states(&self, n: usize, rng: &mut LocRng) -> Vec<State> {
        let poses = self.initialize_poses(n, rng);
        self.states_from_poses(poses, rng)
    }

    pub fn initialize_states_from_locations(
        &self,
        locations: &[Location],
        rng: &mut LocRng,
    ) -> Vec<State> {
        let poses = locations
            .iter()
            .map(|loc| self.pose_from_location(*loc, rng))
            .collect();
        self.states_from_poses(poses, rng)
    }

    /// `n` states jittered around `mean_pose`, rejection-sampled until each
    /// lands on a walkable pixel, with the orientation bias locked to the
    /// measured heading.
    pub fn reset_states(
        &self,
        n: usize,
        mean_pose: &Pose,
        stdev_pose: &Pose,
        measured_orientation: f64,
        rng: &mut LocRng,
    ) -> Result<Vec<State>, LocError> {
        if !is_movable(&self.building, &mean_pose.location) {
            return Err(LocError::Data(
                "reset pose is not on a movable pixel".into(),
            ));
        }
        let mut states = self.initialize_states(n, rng);
        for state in &mut states {
            state.pose.location = mean_pose.location;
            state.pose.orientation = mean_pose.orientation;
            state.orientation_bias = measured_orientation - mean_pose.orientation;
            state.weight = 1.0 / n as f64;

            // exhausting the budget keeps the (movable) unjittered mean
            for _ in 0..MAX_RESET_TRIES {
                let mut jittered = *state;
                jittered.pose.location.x += stdev_pose.location.x * rng.gaussian(0.0, 1.0);
                jittered.pose.location.y += stdev_pose.location.y * rng.gaussian(0.0, 1.0);
                jittered.pose.location.z += stdev_pose.location.z * rng.gaussian(0.0, 1.0);
                jittered.pose.location.floor +=
                    stdev_pose.location.floor * rng.gaussian(0.0, 1.0);
                jittered.pose.orientation = wrap_angle(
                    state.pose.orientation + stdev_pose.orientation * rng.gaussian(0.0, 1.0),
                );
                if is_movable(&self.building, &jittered.pose.location) {
                    *state = jittered;
                    break;
                }
            }
        }
        Ok(states)
    }

    fn pose_from_location(&self, location: Location, rng: &mut LocRng) -> Pose {
        Pose {
            location,
            orientation: rng.uniform(0.0, TAU),
            velocity: 0.0,
            normal_velocity: rng.truncated_gaussian(
                self.pose_prior.mean_velocity,
                self.pose_prior.std_velocity,
                self.pose_prior.min_velocity,
                self.pose_prior.max_velocity,
            ),
        }
    }

    fn states_from_poses(&self, poses: Vec<Pose>, rng: &mut LocRng) -> Vec<State> {
        let n = poses.len();
        poses
            .into_iter()
            .map(|pose| {
                let mut state = State::from_pose(pose);
                state.orientation_bias = rng.uniform(0.0, TAU);
                state.rssi_bias = rng.truncated_gaussian(
                    self.bias_prior.mean_rssi_bias,
                    self.bias_prior.std_rssi_bias,
                    self.bias_prior.min_rssi_bias,
                    self.bias_prior.max_rssi_bias,
                );
                state.weight = 1.0 / n as f64;
                state
            })
            .collect()
    }
}

fn is_movable(building: &Building, location: &Location) -> bool {
    building.is_valid(location) && matches!(building.is_movable(location), Ok(true))
}
