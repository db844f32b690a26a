//! Value types shared across the engine: locations, poses, particle states,
//! beacons and training samples.

pub mod loader;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// RSSI floor in dBm; values at or below mean "not observed".
pub const MIN_RSSI: f64 = -100.0;
/// Upper bound of plausible RSSI readings in dBm.
pub const MAX_RSSI: f64 = -1.0;

/// Stable beacon identifier derived from `(major, minor)`.
pub type BeaconId = i64;

const MINOR_RANGE: i64 = 100_000;

pub fn beacon_id(major: u32, minor: u32) -> BeaconId {
    i64::from(major) * MINOR_RANGE + i64::from(minor)
}

pub fn beacon_major_minor(id: BeaconId) -> (u32, u32) {
    ((id / MINOR_RANGE) as u32, (id % MINOR_RANGE) as u32)
}

/// A point in the building: metric coordinates plus a real-valued floor
/// whose integer truncation indexes the map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub floor: f64,
}

impl Location {
    pub fn new(x: f64, y: f64, z: f64, floor: f64) -> Self {
        Self { x, y, z, floor }
    }

    pub fn floor_int(&self) -> i32 {
        self.floor as i32
    }

    pub fn distance(a: &Location, b: &Location) -> f64 {
        let (dx, dy, dz) = (a.x - b.x, a.y - b.y, a.z - b.z);
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Euclidean distance clamped from below by `offset`.
    pub fn distance_with_offset(a: &Location, b: &Location, offset: f64) -> f64 {
        Self::distance(a, b).max(offset)
    }

    /// Horizontal distance, ignoring z and floor.
    pub fn distance_2d(a: &Location, b: &Location) -> f64 {
        let (dx, dy) = (a.x - b.x, a.y - b.y);
        (dx * dx + dy * dy).sqrt()
    }

    pub fn floor_difference(a: &Location, b: &Location) -> f64 {
        (a.floor - b.floor).abs()
    }

    /// Floor differences below one are treated as the same floor.
    pub fn is_different_floor(a: &Location, b: &Location) -> bool {
        Self::floor_difference(a, b) >= 1.0
    }

    /// `(x, y, z, floor)` feature coordinates for the residual model.
    pub fn to_vec4(&self) -> [f64; 4] {
        [self.x, self.y, self.z, self.floor]
    }
}

/// A location with heading and walking-speed attributes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub location: Location,
    /// Heading in `[0, 2π)`.
    pub orientation: f64,
    /// Instantaneous speed [m/s]; zero while standing.
    pub velocity: f64,
    /// The particle's preferred walking speed [m/s].
    pub normal_velocity: f64,
}

impl Pose {
    pub fn from_location(location: Location) -> Self {
        Self {
            location,
            orientation: 0.0,
            velocity: 0.0,
            normal_velocity: 0.0,
        }
    }
}

/// A particle: a pose hypothesis with per-device bias parameters and an
/// importance weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub pose: Pose,
    pub orientation_bias: f64,
    pub rssi_bias: f64,
    pub weight: f64,
}

impl State {
    pub fn from_pose(pose: Pose) -> Self {
        Self {
            pose,
            orientation_bias: 0.0,
            rssi_bias: 0.0,
            weight: 0.0,
        }
    }

    pub fn location(&self) -> &Location {
        &self.pose.location
    }
}

/// One RSSI reading of one transmitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Beacon {
    pub id: BeaconId,
    pub rssi: f64,
}

impl Beacon {
    pub fn new(major: u32, minor: u32, rssi: f64) -> Self {
        Self {
            id: beacon_id(major, minor),
            rssi,
        }
    }

    /// Whether the reading is a real observation rather than the floor value
    /// or a spurious non-negative report.
    pub fn in_rssi_range(&self) -> bool {
        MIN_RSSI < self.rssi && self.rssi < MAX_RSSI
    }
}

/// A registered static transmitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BleBeacon {
    pub id: BeaconId,
    pub location: Location,
}

impl BleBeacon {
    pub fn new(major: u32, minor: u32, location: Location) -> Self {
        Self {
            id: beacon_id(major, minor),
            location,
        }
    }

    /// Id -> column index map in registry order.
    pub fn index_map(beacons: &[BleBeacon]) -> FxHashMap<BeaconId, usize> {
        beacons
            .iter()
            .enumerate()
            .map(|(i, b)| (b.id, i))
            .collect()
    }
}

/// Mean and standard deviation of a predicted RSSI.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalParameter {
    pub mean: f64,
    pub stdev: f64,
}

/// A labeled training observation: a ground-truth location and the beacon
/// scan recorded there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp_ms: u64,
    pub location: Location,
    pub beacons: Vec<Beacon>,
}

impl Sample {
    /// Split into runs of consecutive samples sharing the same location.
    pub fn split_consecutive(samples: &[Sample]) -> Vec<Vec<Sample>> {
        let mut runs: Vec<Vec<Sample>> = Vec::new();
        for sample in samples {
            match runs.last_mut() {
                Some(run) if run[0].location == sample.location => run.push(sample.clone()),
                _ => runs.push(vec![sample.clone()]),
            }
        }
        runs
    }

    /// Collapse each run into one sample whose RSSI values are per-beacon
    /// means over the run.
    pub fn mean_of_runs(runs: Vec<Vec<Sample>>) -> Vec<Sample> {
        runs.into_iter()
            .filter(|run| !run.is_empty())
            .map(|run| {
                let mut sums: FxHashMap<BeaconId, (f64, usize)> = FxHashMap::default();
                let mut order: Vec<BeaconId> = Vec::new();
                for sample in &run {
                    for beacon in &sample.beacons {
                        let entry = sums.entry(beacon.id).or_insert_with(|| {
                            order.push(beacon.id);
                            (0.0, 0)
                        });
                        entry.0 += beacon.rssi;
                        entry.1 += 1;
                    }
                }
                let beacons = order
                    .iter()
                    .map(|id| {
                        let (sum, count) = sums[id];
                        Beacon {
                            id: *id,
                            rssi: sum / count as f64,
                        }
                    })
                    .collect();
                Sample {
                    timestamp_ms: run[0].timestamp_ms,
                    location: run[0].location,
                    beacons,
                }
            })
            .collect()
    }

    /// Average consecutive same-location samples.
    pub fn averaged(samples: &[Sample]) -> Vec<Sample> {
        Self::mean_of_runs(Self::split_consecutive(samples))
    }

    /// Distinct ground-truth locations in first-seen order.
    pub fn unique_locations(samples: &[Sample]) -> Vec<Location> {
        let mut locations: Vec<Location> = Vec::new();
        for sample in samples {
            if !locations.contains(&sample.location) {
                locations.push(sample.location);
            }
        }
        locations
    }

    /// Drop beacons whose id is not in the registry; returns the number of
    /// dropped readings.
    pub fn filter_unregistered_beacons(
        samples: &[Sample],
        registry: &FxHashMap<BeaconId, usize>,
    ) -> (Vec<Sample>, usize) {
        let mut dropped = 0;
        let filtered = samples
            .iter()
            .map(|sample| {
                let beacons: Vec<Beacon> = sample
                    .beacons
                    .iter()
                    .filter(|b| {
                        let known = registry.contains_key(&b.id);
                        if !known {
                            dropped += 1;
                        }
                        known
                    })
                    .copied()
                    .collect();
                Sample {
                    timestamp_ms: sample.timestamp_ms,
                    location: sample.location,
                    beacons,
                }
            })
            .collect();
        (filtered, dropped)
    }
}
