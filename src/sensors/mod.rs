//! Black-box inertial front-ends.
//!
//! The filter consumes two derived signals: a smoothed heading and step
//! boundaries. The implementations here are deliberately simple; anything
//! matching these traits (on-device step detection, a fused AHRS) can be
//! plugged in instead.

use std::collections::VecDeque;

/// One attitude sample from the device orientation stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attitude {
    /// Heading around the vertical axis [rad].
    pub yaw: f64,
}

/// One accelerometer sample [m/s^2].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Acceleration {
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
}

impl Acceleration {
    pub fn magnitude(&self) -> f64 {
        (self.ax * self.ax + self.ay * self.ay + self.az * self.az).sqrt()
    }
}

/// Smoothed heading estimator.
pub trait OrientationMeter: Send {
    fn put(&mut self, timestamp_ms: u64, attitude: &Attitude);

    /// Current heading, `None` until enough samples arrived.
    fn yaw(&self) -> Option<f64>;
}

/// Windowed circular average of the yaw stream.
#[derive(Debug, Clone)]
pub struct OrientationMeterAverage {
    window: usize,
    samples: VecDeque<f64>,
}

impl OrientationMeterAverage {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: VecDeque::new(),
        }
    }
}

impl Default for OrientationMeterAverage {
    fn default() -> Self {
        Self::new(10)
    }
}

impl OrientationMeter for OrientationMeterAverage {
    fn put(&mut self, _timestamp_ms: u64, attitude: &Attitude) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(attitude.yaw);
    }

    fn yaw(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let (s, c) = self
            .samples
            .iter()
            .fold((0.0, 0.0), |(s, c), yaw| (s + yaw.sin(), c + yaw.cos()));
        Some(crate::utils::wrap_angle(s.atan2(c)))
    }
}

/// Step detector fed by raw acceleration.
pub trait Pedometer: Send {
    /// Feed one sample; returns `true` when a step boundary is reported.
    fn put(&mut self, timestamp_ms: u64, acc: &Acceleration) -> bool;

    fn is_walking(&self) -> bool;
}

/// Walking-state pedometer: the acceleration-magnitude deviation inside a
/// sliding window is compared against a threshold once per update period.
///
/// A zero threshold makes every update period a step, which is what the
/// random-walker debug mode wants.
#[derive(Debug, Clone)]
pub struct PedometerWalkingState {
    update_period_ms: u64,
    sigma_threshold: f64,
    window: VecDeque<f64>,
    window_size: usize,
    last_emit_ms: Option<u64>,
    walking: bool,
}

impl PedometerWalkingState {
    pub fn new(update_period_ms: u64, sigma_threshold: f64) -> Self {
        Self {
            update_period_ms,
            sigma_threshold,
            window: VecDeque::new(),
            window_size: 32,
            last_emit_ms: None,
            walking: false,
        }
    }

    fn window_sigma(&self) -> f64 {
        let n = self.window.len() as f64;
        if n < 2.0 {
            return 0.0;
        }
        let mean = self.window.iter().sum::<f64>() / n;
        let var = self.window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        var.sqrt()
    }
}

impl Default for PedometerWalkingState {
    fn default() -> Self {
        Self::new(100, 0.6)
    }
}

impl Pedometer for PedometerWalkingState {
    fn put(&mut self, timestamp_ms: u64, acc: &Acceleration) -> bool {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(acc.magnitude());

        let due = match self.last_emit_ms {
            None => true,
            Some(last) => timestamp_ms.saturating_sub(last) >= self.update_period_ms,
        };
        if !due {
            return false;
        }
        self.last_emit_ms = Some(timestamp_ms);
        self.walking = self.window_sigma() >= self.sigma_threshold;
        self.walking
    }

    fn is_walking(&self) -> bool {
        self.walking
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    #[test]
    fn orientation_meter_averages_across_the_wrap() {
        let mut meter = OrientationMeterAverage::new(4);
        assert!(meter.yaw().is_none());
        meter.put(0, &Attitude { yaw: 0.1 });
        meter.put(10, &Attitude { yaw: 2.0 * PI - 0.1 });
        let yaw = meter.yaw().unwrap();
        assert!(yaw < 1e-9 || (2.0 * PI - yaw) < 1e-9);
    }

    #[test]
    fn orientation_meter_forgets_old_samples() {
        let mut meter = OrientationMeterAverage::new(2);
        meter.put(0, &Attitude { yaw: 3.0 });
        meter.put(1, &Attitude { yaw: 1.0 });
        meter.put(2, &Attitude { yaw: 1.0 });
        assert_relative_eq!(meter.yaw().unwrap(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn still_accelerometer_reports_no_steps() {
        let mut pedometer = PedometerWalkingState::new(100, 0.6);
        let gravity = Acceleration {
            ax: 0.0,
            ay: 0.0,
            az: 9.81,
        };
        let mut steps = 0;
        for t in 0..50 {
            if pedometer.put(t * 20, &gravity) {
                steps += 1;
            }
        }
        assert_eq!(steps, 0);
        assert!(!pedometer.is_walking());
    }

    #[test]
    fn oscillating_accelerometer_reports_steps_each_period() {
        let mut pedometer = PedometerWalkingState::new(100, 0.6);
        let mut steps = 0;
        for t in 0..50u64 {
            let wobble = if t % 2 == 0 { 3.0 } else { -3.0 };
            let acc = Acceleration {
                ax: 0.0,
                ay: 0.0,
                az: 9.81 + wobble,
            };
            if pedometer.put(t * 20, &acc) {
                steps += 1;
            }
        }
        assert!(steps >= 8);
        assert!(pedometer.is_walking());
    }

    #[test]
    fn zero_threshold_always_walks() {
        let mut pedometer = PedometerWalkingState::new(100, 0.0);
        let gravity = Acceleration {
            ax: 0.0,
            ay: 0.0,
            az: 9.81,
        };
        let mut steps = 0;
        for t in 0..10 {
            if pedometer.put(t * 100, &gravity) {
                steps += 1;
            }
        }
        assert_eq!(steps, 10);
    }
}
