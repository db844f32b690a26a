//! Indoor localization engine.
//!
//! Estimates the pose of a pedestrian (position, floor, heading, velocity
//! and sensor-bias parameters) by fusing two streams with a sequential
//! Monte Carlo filter:
//!
//! * inertial cues (a step detector and a heading estimator),
//! * time-sampled BLE beacon RSSI scans.
//!
//! The observation model combines a log-distance path-loss mean with a
//! Gaussian-process residual trained from labeled site surveys. Motion is
//! constrained by a per-floor raster map of the building (walkable, wall,
//! stair and elevator regions).

pub mod config;
pub mod data;
pub mod error;
pub mod localization;
pub mod map;
pub mod models;
pub mod sensors;
pub mod utils;

pub use crate::config::{BiasPrior, FilterConfig, MetropolisParams, MotionProperty, PosePrior, TrainParams};
pub use crate::data::{Beacon, BeaconId, BleBeacon, Location, Pose, Sample, State};
pub use crate::error::{CancelToken, LocError};
pub use crate::localization::stream_filter::{Estimate, StreamParticleFilter};
pub use crate::map::building::Building;
pub use crate::models::observation::ObservationModel;
