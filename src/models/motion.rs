use std::sync::Arc;

use crate::config::{BiasPrior, MotionProperty, PosePrior};
use crate::data::State;
use crate::map::Building;
use crate::utils::rng::LocRng;
use crate::utils::{angle_diff, wrap_angle};

/// External floor-change cue from the altimeter/orientation stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FloorCue {
    #[default]
    None,
    Up,
    Down,
}

/// Inertial input of one prediction step.
#[derive(Debug, Clone, Copy)]
pub struct MotionInput {
    /// Seconds since the previous prediction.
    pub dt: f64,
    /// Whether the pedometer reported a step boundary.
    pub stepped: bool,
    /// Measured heading [rad].
    pub heading: f64,
    pub floor_cue: FloorCue,
}

/// State-transition model of the particle filter.
///
/// Implementations advance every particle in place; rejected moves are
/// expressed through the particle weight rather than by panicking.
pub trait SystemModel: Send {
    fn predict(&self, states: &mut [State], input: &MotionInput, rng: &mut LocRng);
}

/// Step-driven pose random walk without any map knowledge.
///
/// Heading follows the measured orientation corrected by the per-particle
/// orientation bias; displacement happens only on step boundaries.
#[derive(Debug, Clone)]
pub struct PoseRandomWalker {
    pub pose_prior: PosePrior,
    pub bias_prior: BiasPrior,
    pub angular_velocity_limit: f64,
}

impl PoseRandomWalker {
    pub fn new(pose_prior: PosePrior, bias_prior: BiasPrior, angular_velocity_limit: f64) -> Self {
        Self {
            pose_prior,
            bias_prior,
            angular_velocity_limit,
        }
    }

    /// One step of the walk, returning the proposed new state.
    pub fn step(&self, state: &State, input: &MotionInput, rng: &mut LocRng) -> State {
        let mut next = *state;

        // heading from the measurement, bias-corrected, rate-limited
        let measured = input.heading - state.orientation_bias
            + rng.gaussian(0.0, self.pose_prior.std_orientation);
        let mut delta = angle_diff(measured, state.pose.orientation);
        let max_delta = self.angular_velocity_limit * input.dt;
        delta = delta.clamp(-max_delta, max_delta);
        next.pose.orientation = wrap_angle(state.pose.orientation + delta);

        if input.stepped {
            let velocity = (state.pose.normal_velocity
                + rng.gaussian(0.0, self.pose_prior.diffusion_velocity))
            .clamp(self.pose_prior.min_velocity, self.pose_prior.max_velocity);
            next.pose.velocity = velocity;
            let step = velocity * input.dt;
            next.pose.location.x += step * next.pose.orientation.cos();
            next.pose.location.y += step * next.pose.orientation.sin();
        } else {
            next.pose.velocity = 0.0;
        }

        next.rssi_bias = (state.rssi_bias
            + rng.gaussian(0.0, self.bias_prior.diffusion_rssi_bias * input.dt))
        .clamp(self.bias_prior.min_rssi_bias, self.bias_prior.max_rssi_bias);
        next.orientation_bias = wrap_angle(
            state.orientation_bias
                + rng.gaussian(0.0, self.bias_prior.diffusion_orientation_bias * input.dt),
        );

        next
    }
}

impl SystemModel for PoseRandomWalker {
    fn predict(&self, states: &mut [State], input: &MotionInput, rng: &mut LocRng) {
        for state in states.iter_mut() {
            *state = self.step(state, input, rng);
        }
    }
}

/// Pose random walk constrained by the building map.
///
/// Moves that leave the map or cross a wall at a steep incidence angle are
/// not applied; the particle keeps its pose and its weight is multiplied by
/// the decay rate. Floor changes happen only on stair/elevator pixels and
/// only when the external floor cue fires.
pub struct PoseRandomWalkerInBuilding {
    pub walker: PoseRandomWalker,
    pub building: Arc<Building>,
    pub property: MotionProperty,
}

impl PoseRandomWalkerInBuilding {
    pub fn new(walker: PoseRandomWalker, building: Arc<Building>, property: MotionProperty) -> Self {
        Self {
            walker,
            building,
            property,
        }
    }

    fn advance(&self, state: &State, input: &MotionInput, rng: &mut LocRng) -> State {
        let mut proposed = self.walker.step(state, input, rng);

        // Stair/elevator-gated floor change driven by the external cue.
        if input.floor_cue != FloorCue::None {
            let here = state.location();
            let bridged = matches!(self.building.is_stair(here), Ok(true))
                || matches!(self.building.is_elevator(here), Ok(true));
            if bridged {
                let delta = if input.floor_cue == FloorCue::Up { 1.0 } else { -1.0 };
                let next_floor = (state.location().floor + delta)
                    .clamp(self.building.min_floor() as f64, self.building.max_floor() as f64);
                proposed.pose.location.floor = next_floor;
                if self.building.is_valid(proposed.location()) {
                    return proposed;
                }
                let mut rejected = *state;
                rejected.weight *= self.property.weight_decay_rate;
                return rejected;
            }
        }

        if !self.property.checks_walls {
            return proposed;
        }

        if !self.building.is_valid(proposed.location()) {
            let mut rejected = *state;
            rejected.weight *= self.property.weight_decay_rate;
            return rejected;
        }

        let crossing = self
            .building
            .check_crossing_wall(state.location(), proposed.location())
            .unwrap_or(true);
        if crossing {
            let wall_angle = self
                .building
                .estimate_wall_angle(state.location(), proposed.location())
                .ok()
                .flatten();
            let rejected_by_incidence = match wall_angle {
                Some(wall) => {
                    // angle between the motion direction and the wall run;
                    // a head-on hit is pi/2, sliding along the wall is 0
                    let mut incidence = angle_diff(proposed.pose.orientation, wall).abs();
                    if incidence > std::f64::consts::FRAC_PI_2 {
                        incidence = std::f64::consts::PI - incidence;
                    }
                    incidence > self.property.max_incidence_angle
                }
                // no identifiable wall run: treat the crossing as a block
                None => true,
            };
            if rejected_by_incidence {
                let mut rejected = *state;
                rejected.weight *= self.property.weight_decay_rate;
                return rejected;
            }
        }
        proposed
    }
}

impl SystemModel for PoseRandomWalkerInBuilding {
    fn predict(&self, states: &mut [State], input: &MotionInput, rng: &mut LocRng) {
        for state in states.iter_mut() {
            *state = self.advance(state, input, rng);
        }
    }
}
