use std::sync::Arc;

use tracing::debug;

use crate::config::MetropolisParams;
use crate::data::{Beacon, Location, State};
use crate::localization::initializer::StatusInitializer;
use crate::models::observation::ObservationModel;
use crate::utils::rng::LocRng;

/// Observation-dependent initializer: a Metropolis chain over pose space
/// whose stationary distribution follows the scan likelihood.
///
/// Proposals are uniform jumps of `radius_2d` in the floor plane with the
/// floor preserved; off-map or unwalkable proposals are rejected outright.
pub struct MetropolisSampler {
    observation_model: Arc<dyn ObservationModel>,
    initializer: Arc<StatusInitializer>,
    params: MetropolisParams,
    scan: Vec<Beacon>,
    chain: Vec<(State, f64)>,
}

impl MetropolisSampler {
    pub fn new(
        observation_model: Arc<dyn ObservationModel>,
        initializer: Arc<StatusInitializer>,
        params: MetropolisParams,
    ) -> Self {
        Self {
            observation_model,
            initializer,
            params,
            scan: Vec::new(),
            chain: Vec::new(),
        }
    }

    /// Set the conditioning scan; clears any previous chain.
    pub fn set_input(&mut self, scan: &[Beacon]) {
        self.scan = scan.to_vec();
        self.chain.clear();
    }

    pub fn states(&self) -> Vec<State> {
        self.chain.iter().map(|(s, _)| *s).collect()
    }

    pub fn log_likelihoods(&self) -> Vec<f64> {
        self.chain.iter().map(|(_, ll)| *ll).collect()
    }

    /// Run the burn-in chain with the configured length.
    pub fn burn_in(&mut self, rng: &mut LocRng) {
        self.burn_in_steps(self.params.burn_in, rng);
    }

    /// Run `n` Metropolis steps, recording every `interval`-th state.
    pub fn burn_in_steps(&mut self, n: usize, rng: &mut LocRng) {
        self.chain.clear();
        let mut current = match self.initializer.initialize_states(1, rng).pop() {
            Some(state) => state,
            None => return,
        };
        let mut current_ll = self
            .observation_model
            .log_likelihood(&current, &self.scan)
            .log_likelihood;

        let building = self.initializer.building().clone();
        let mut accepted = 0usize;
        for step in 0..n {
            let mut proposal = current;
            proposal.pose.location.x += rng.uniform(-self.params.radius_2d, self.params.radius_2d);
            proposal.pose.location.y += rng.uniform(-self.params.radius_2d, self.params.radius_2d);

            let walkable = building.is_valid(proposal.location())
                && matches!(building.is_movable(proposal.location()), Ok(true));
            if walkable {
                let proposal_ll = self
                    .observation_model
                    .log_likelihood(&proposal, &self.scan)
                    .log_likelihood;
                if rng.next_f64().ln() < proposal_ll - current_ll {
                    current = proposal;
                    current_ll = proposal_ll;
                    accepted += 1;
                }
            }
            if self.params.interval > 0 && step % self.params.interval == 0 {
                self.chain.push((current, current_ll));
            }
        }
        if self.params.with_ordering {
            self.chain
                .sort_by(|a, b| b.1.total_cmp(&a.1));
        }
        debug!(steps = n, accepted, chain = self.chain.len(), "burn-in done");
    }

    /// The `n` best states of the chain (cycling when the chain is short),
    /// each with weight `1/n`. Falls back to the status initializer when no
    /// chain exists.
    pub fn sampling(&mut self, n: usize, rng: &mut LocRng) -> Vec<State> {
        self.draw(n, rng, None)
    }

    /// Like `sampling`, restricted to chain states within `radius` of
    /// `location` on the same floor.
    pub fn sampling_near(
        &mut self,
        n: usize,
        location: &Location,
        radius: f64,
        rng: &mut LocRng,
    ) -> Vec<State> {
        self.draw(n, rng, Some((location, radius)))
    }

    fn draw(
        &mut self,
        n: usize,
        rng: &mut LocRng,
        constraint: Option<(&Location, f64)>,
    ) -> Vec<State> {
        let pool: Vec<State> = match constraint {
            Some((center, radius)) => self
                .chain
                .iter()
                .filter(|(s, _)| {
                    s.location().floor_int() == center.floor_int()
                        && Location::distance_2d(s.location(), center) <= radius
                })
                .map(|(s, _)| *s)
                .collect(),
            None => self.states(),
        };
        if pool.is_empty() {
            return self.initializer.initialize_states(n, rng);
        }
        (0..n)
            .map(|i| {
                let mut state = pool[i % pool.len()];
                state.weight = 1.0 / n as f64;
                state
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BiasPrior, MetropolisParams, PosePrior};
    use crate::data::{Pose, Sample};
    use crate::map::{Building, CoordinateSystem, FloorMap, Raster};
    use crate::models::observation::StubModel;
    use std::collections::BTreeMap;

    fn open_building() -> Arc<Building> {
        let raster = Raster::from_fn(60, 60, |_, _| [255, 0, 0, 0]);
        let floor = FloorMap::new(raster, CoordinateSystem::new(1.0, 1.0, 1.0, 0.0, 0.0, 0.0));
        let mut floors = BTreeMap::new();
        floors.insert(0, floor);
        Arc::new(Building::new(floors).unwrap())
    }

    fn sampler(center: Location) -> MetropolisSampler {
        let samples: Vec<Sample> = (0..10)
            .map(|i| Sample {
                timestamp_ms: i as u64,
                location: Location::new(5.0 + i as f64 * 5.0, 30.0, 0.0, 0.0),
                beacons: vec![],
            })
            .collect();
        let initializer = Arc::new(
            StatusInitializer::new(
                open_building(),
                &samples,
                PosePrior::default(),
                BiasPrior::default(),
            )
            .unwrap(),
        );
        let model = Arc::new(StubModel { center, scale: 0.05 });
        MetropolisSampler::new(model, initializer, MetropolisParams::default())
    }

    #[test]
    fn chain_concentrates_near_the_likelihood_mode() {
        let center = Location::new(30.0, 30.0, 0.0, 0.0);
        let mut sampler = sampler(center);
        let mut rng = LocRng::from_seed(17);
        sampler.set_input(&[]);
        sampler.burn_in_steps(500, &mut rng);
        let top = sampler.sampling(20, &mut rng);
        assert_eq!(top.len(), 20);
        for state in &top {
            assert!(Location::distance_2d(state.location(), &center) < 15.0);
        }
    }

    #[test]
    fn ordering_sorts_by_descending_log_likelihood() {
        let center = Location::new(30.0, 30.0, 0.0, 0.0);
        let mut sampler = sampler(center);
        let mut rng = LocRng::from_seed(3);
        sampler.set_input(&[]);
        sampler.burn_in_steps(300, &mut rng);
        let lls = sampler.log_likelihoods();
        for pair in lls.windows(2) {
            assert!(pair[0] >= pair[1]);
        }
    }

    #[test]
    fn sampling_without_burn_in_falls_back_to_the_initializer() {
        let mut sampler = sampler(Location::new(30.0, 30.0, 0.0, 0.0));
        let mut rng = LocRng::from_seed(5);
        let states = sampler.sampling(50, &mut rng);
        assert_eq!(states.len(), 50);
    }

    #[test]
    fn location_constraint_filters_the_pool() {
        let center = Location::new(30.0, 30.0, 0.0, 0.0);
        let mut sampler = sampler(center);
        let mut rng = LocRng::from_seed(23);
        sampler.set_input(&[]);
        sampler.burn_in_steps(500, &mut rng);
        let near = sampler.sampling_near(10, &center, 5.0, &mut rng);
        for state in &near {
            assert!(Location::distance_2d(state.location(), &center) <= 5.0);
        }
    }
}
