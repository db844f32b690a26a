pub mod building;
pub mod coordinate;
pub mod floor_map;

pub use building::Building;
pub use coordinate::CoordinateSystem;
pub use floor_map::{FloorMap, Raster};
