use nalgebra::Vector4;
use serde::{Deserialize, Serialize};

use crate::data::{Location, MIN_RSSI};

/// Number of regression features / coefficients of the path-loss model.
pub const ITU_NDIM: usize = 4;

/// Log-distance path-loss mean with a cross-floor penalty.
///
/// Features of a receiver/transmitter pair:
/// `[-10 log10(max(d, offset)), 1, -floorDiff or 0, -1 or 0]`,
/// the last two active only when the pair is at least one floor apart.
/// The fitted coefficient vector is `(distance gain, constant, cross-floor
/// distance coefficient, cross-floor constant)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ItuModelFunction {
    pub distance_offset: f64,
}

impl Default for ItuModelFunction {
    fn default() -> Self {
        Self {
            distance_offset: 1.0,
        }
    }
}

impl ItuModelFunction {
    pub fn new(distance_offset: f64) -> Self {
        Self { distance_offset }
    }

    pub fn transform_feature(&self, receiver: &Location, transmitter: &Location) -> Vector4<f64> {
        let dist = Location::distance_with_offset(receiver, transmitter, self.distance_offset);
        let floor_diff = Location::floor_difference(receiver, transmitter);

        let mut features = Vector4::new(-10.0 * dist.log10(), 1.0, 0.0, 0.0);
        if floor_diff >= 1.0 {
            features[2] = -floor_diff;
            features[3] = -1.0;
        }
        features
    }

    /// Mean RSSI prediction, clamped from below at the observation floor.
    pub fn predict(&self, parameters: &Vector4<f64>, features: &Vector4<f64>) -> f64 {
        parameters.dot(features).max(MIN_RSSI)
    }

    pub fn predict_at(
        &self,
        parameters: &Vector4<f64>,
        receiver: &Location,
        transmitter: &Location,
    ) -> f64 {
        self.predict(parameters, &self.transform_feature(receiver, transmitter))
    }
}
