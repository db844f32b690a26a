use serde::{Deserialize, Serialize};

use crate::data::Location;

/// Affine world <-> pixel mapping of one floor raster.
///
/// `ppm` is pixels per meter and may be negative to flip an axis (raster
/// rows usually grow downward while the world y axis grows upward).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoordinateSystem {
    pub ppm_x: f64,
    pub ppm_y: f64,
    pub ppm_z: f64,
    pub origin_x: f64,
    pub origin_y: f64,
    pub origin_z: f64,
}

impl CoordinateSystem {
    pub fn new(ppm_x: f64, ppm_y: f64, ppm_z: f64, origin_x: f64, origin_y: f64, origin_z: f64) -> Self {
        Self {
            ppm_x,
            ppm_y,
            ppm_z,
            origin_x,
            origin_y,
            origin_z,
        }
    }

    /// Pixel coordinates (u, v) of a world location.
    pub fn world_to_pixel(&self, location: &Location) -> (f64, f64) {
        (
            self.origin_x + self.ppm_x * location.x,
            self.origin_y + self.ppm_y * location.y,
        )
    }

    /// World (x, y) of a pixel coordinate.
    pub fn pixel_to_world(&self, u: f64, v: f64) -> (f64, f64) {
        ((u - self.origin_x) / self.ppm_x, (v - self.origin_y) / self.ppm_y)
    }

    /// A world-space direction corresponding to a pixel-space direction.
    pub fn pixel_dir_to_world(&self, du: f64, dv: f64) -> (f64, f64) {
        (du / self.ppm_x, dv / self.ppm_y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn pixel_mapping_round_trips() {
        let cs = CoordinateSystem::new(8.0, -8.0, 1.0, 1000.0, 1000.0, 0.0);
        let loc = Location::new(12.5, -3.25, 0.0, 0.0);
        let (u, v) = cs.world_to_pixel(&loc);
        let (x, y) = cs.pixel_to_world(u, v);
        assert_relative_eq!(x, loc.x, epsilon = 1e-12);
        assert_relative_eq!(y, loc.y, epsilon = 1e-12);
    }

    #[test]
    fn negative_ppm_flips_the_axis() {
        let cs = CoordinateSystem::new(8.0, -8.0, 1.0, 0.0, 100.0, 0.0);
        let (_, v0) = cs.world_to_pixel(&Location::new(0.0, 0.0, 0.0, 0.0));
        let (_, v1) = cs.world_to_pixel(&Location::new(0.0, 1.0, 0.0, 0.0));
        assert!(v1 < v0);
    }
}
