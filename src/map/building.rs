use std::collections::BTreeMap;

use crate::data::Location;
use crate::error::LocError;
use crate::map::floor_map::FloorMap;

/// The prior map: per-floor rasters indexed by integer floor number.
///
/// Read-only after construction; share one instance across filters behind an
/// `Arc`.
#[derive(Debug, Clone)]
pub struct Building {
    floors: BTreeMap<i32, FloorMap>,
    min_floor: i32,
    max_floor: i32,
}

impl Building {
    pub fn new(floors: BTreeMap<i32, FloorMap>) -> Result<Self, LocError> {
        let min_floor = *floors
            .keys()
            .next()
            .ok_or_else(|| LocError::Config("building has no floors".into()))?;
        let max_floor = *floors.keys().last().expect("non-empty");
        Ok(Self {
            floors,
            min_floor,
            max_floor,
        })
    }

    pub fn min_floor(&self) -> i32 {
        self.min_floor
    }

    pub fn max_floor(&self) -> i32 {
        self.max_floor
    }

    pub fn n_floors(&self) -> usize {
        self.floors.len()
    }

    pub fn is_valid_floor(&self, floor: i32) -> bool {
        self.floors.contains_key(&floor)
    }

    fn floor_at(&self, location: &Location) -> Result<&FloorMap, LocError> {
        let floor = location.floor_int();
        self.floors.get(&floor).ok_or(LocError::FloorOutOfRange {
            floor,
            min: self.min_floor,
            max: self.max_floor,
        })
    }

    /// The floor exists and (x, y) projects inside its raster.
    pub fn is_valid(&self, location: &Location) -> bool {
        match self.floors.get(&location.floor_int()) {
            Some(floor) => floor.is_valid(location),
            None => false,
        }
    }

    pub fn is_movable(&self, location: &Location) -> Result<bool, LocError> {
        Ok(self.floor_at(location)?.is_movable(location))
    }

    pub fn is_wall(&self, location: &Location) -> Result<bool, LocError> {
        Ok(self.floor_at(location)?.is_wall(location))
    }

    pub fn is_stair(&self, location: &Location) -> Result<bool, LocError> {
        Ok(self.floor_at(location)?.is_stair(location))
    }

    pub fn is_elevator(&self, location: &Location) -> Result<bool, LocError> {
        Ok(self.floor_at(location)?.is_elevator(location))
    }

    /// Cross-floor movement counts as a wall crossing; same-floor segments
    /// are sampled against the floor raster.
    pub fn check_crossing_wall(&self, start: &Location, end: &Location) -> Result<bool, LocError> {
        if start.floor != end.floor {
            return Ok(true);
        }
        Ok(self.floor_at(start)?.check_crossing_wall(start, end))
    }

    /// Orientation of the wall run intersected by a same-floor segment.
    pub fn estimate_wall_angle(
        &self,
        start: &Location,
        end: &Location,
    ) -> Result<Option<f64>, LocError> {
        Ok(self.floor_at(start)?.estimate_wall_angle(start, end))
    }

    /// The end point is movable and the segment crosses no wall.
    pub fn check_movable_route(&self, start: &Location, end: &Location) -> Result<bool, LocError> {
        if !self.is_movable(end)? {
            return Ok(false);
        }
        Ok(!self.check_crossing_wall(start, end)?)
    }
}
