use crate::data::Location;
use crate::error::LocError;
use crate::map::coordinate::CoordinateSystem;

/// Region channels of a floor raster pixel.
///
/// A pixel is walkable / wall / stair / elevator when the corresponding
/// channel is non-zero.
const CH_WALKABLE: usize = 0;
const CH_WALL: usize = 1;
const CH_STAIR: usize = 2;
const CH_ELEVATOR: usize = 3;

/// In-memory four-channel raster of one floor.
///
/// Image decoding is an external concern; the raster is constructed from raw
/// interleaved channel bytes (walkable, wall, stair, elevator per pixel).
#[derive(Debug, Clone)]
pub struct Raster {
    width: u32,
    height: u32,
    pixels: Vec<[u8; 4]>,
}

impl Raster {
    pub fn new(width: u32, height: u32, channels: Vec<u8>) -> Result<Self, LocError> {
        let expected = width as usize * height as usize * 4;
        if channels.len() != expected {
            return Err(LocError::Data(format!(
                "raster byte length {} does not match {}x{}x4",
                channels.len(),
                width,
                height
            )));
        }
        let pixels = channels
            .chunks_exact(4)
            .map(|c| [c[0], c[1], c[2], c[3]])
            .collect();
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Build a raster by evaluating `f(u, v)` for every pixel. Test helper
    /// and the natural adapter for externally decoded images.
    pub fn from_fn<F: Fn(u32, u32) -> [u8; 4]>(width: u32, height: u32, f: F) -> Self {
        let mut pixels = Vec::with_capacity(width as usize * height as usize);
        for v in 0..height {
            for u in 0..width {
                pixels.push(f(u, v));
            }
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn pixel(&self, u: i64, v: i64) -> Option<[u8; 4]> {
        if u < 0 || v < 0 || u >= i64::from(self.width) || v >= i64::from(self.height) {
            return None;
        }
        Some(self.pixels[v as usize * self.width as usize + u as usize])
    }
}

/// One floor: a region raster plus its world <-> pixel mapping.
#[derive(Debug, Clone)]
pub struct FloorMap {
    raster: Raster,
    coordinate_system: CoordinateSystem,
}

impl FloorMap {
    pub fn new(raster: Raster, coordinate_system: CoordinateSystem) -> Self {
        Self {
            raster,
            coordinate_system,
        }
    }

    pub fn coordinate_system(&self) -> &CoordinateSystem {
        &self.coordinate_system
    }

    fn pixel_at(&self, location: &Location) -> Option<[u8; 4]> {
        let (u, v) = self.coordinate_system.world_to_pixel(location);
        self.raster.pixel(u.round() as i64, v.round() as i64)
    }

    /// The location projects inside the raster bounds.
    pub fn is_valid(&self, location: &Location) -> bool {
        self.pixel_at(location).is_some()
    }

    pub fn is_movable(&self, location: &Location) -> bool {
        self.pixel_at(location)
            .map(|p| p[CH_WALKABLE] != 0)
            .unwrap_or(false)
    }

    pub fn is_wall(&self, location: &Location) -> bool {
        self.pixel_at(location).map(|p| p[CH_WALL] != 0).unwrap_or(false)
    }

    pub fn is_stair(&self, location: &Location) -> bool {
        self.pixel_at(location)
            .map(|p| p[CH_STAIR] != 0)
            .unwrap_or(false)
    }

    pub fn is_elevator(&self, location: &Location) -> bool {
        self.pixel_at(location)
            .map(|p| p[CH_ELEVATOR] != 0)
            .unwrap_or(false)
    }

    /// Sample the segment at roughly one-pixel steps and report whether any
    /// sampled pixel is a wall. Samples falling outside the raster count as
    /// walls.
    pub fn check_crossing_wall(&self, start: &Location, end: &Location) -> bool {
        self.first_wall_hit(start, end).is_some()
    }

    /// Orientation (world frame, in `[0, π)`) of the wall run at the first
    /// wall pixel intersected by the segment, if any.
    pub fn estimate_wall_angle(&self, start: &Location, end: &Location) -> Option<f64> {
        let (u, v) = self.first_wall_hit(start, end)?;
        Some(self.wall_orientation_at(u, v))
    }

    fn first_wall_hit(&self, start: &Location, end: &Location) -> Option<(i64, i64)> {
        let (u0, v0) = self.coordinate_system.world_to_pixel(start);
        let (u1, v1) = self.coordinate_system.world_to_pixel(end);
        let steps = (u1 - u0).abs().max((v1 - v0).abs()).ceil() as usize;
        for k in 0..=steps {
            let t = if steps == 0 { 0.0 } else { k as f64 / steps as f64 };
            let u = (u0 + t * (u1 - u0)).round() as i64;
            let v = (v0 + t * (v1 - v0)).round() as i64;
            match self.raster.pixel(u, v) {
                Some(p) if p[CH_WALL] != 0 => return Some((u, v)),
                Some(_) => {}
                None => return Some((u, v)),
            }
        }
        None
    }

    // Principal direction of the wall pixels in a 5x5 neighbourhood.
    fn wall_orientation_at(&self, u: i64, v: i64) -> f64 {
        let mut n = 0.0;
        let (mut suu, mut svv, mut suv) = (0.0, 0.0, 0.0);
        for dv in -2i64..=2 {
            for du in -2i64..=2 {
                if let Some(p) = self.raster.pixel(u + du, v + dv) {
                    if p[CH_WALL] != 0 {
                        n += 1.0;
                        suu += (du * du) as f64;
                        svv += (dv * dv) as f64;
                        suv += (du * dv) as f64;
                    }
                }
            }
        }
        if n < 2.0 {
            return 0.0;
        }
        // orientation of the covariance principal axis, in pixel space
        let theta_px = 0.5 * (2.0 * suv).atan2(suu - svv);
        let (dx, dy) = self
            .coordinate_system
            .pixel_dir_to_world(theta_px.cos(), theta_px.sin());
        let mut theta = dy.atan2(dx);
        if theta < 0.0 {
            theta += std::f64::consts::PI;
        }
        theta % std::f64::consts::PI
    }
}
