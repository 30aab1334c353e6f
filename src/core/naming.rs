use crate::core::measurement::MeasurementType;
use crate::types::{BoundingBox, OrbitPass, DAY_FORMAT};
use chrono::{DateTime, Utc};

/// Upper-left corner label of a tile, e.g. `W124N42`
pub fn tile_coord(bbox: &BoundingBox) -> String {
    let lon = if bbox.min_lon >= 0 { 'E' } else { 'W' };
    let lat = if bbox.max_lat >= 0 { 'N' } else { 'S' };
    format!("{}{:03}{}{:02}", lon, bbox.min_lon.abs(), lat, bbox.max_lat.abs())
}

/// `{PARTS}_{ORBIT_PASS}_{TILE_COORD}`, upper-cased
pub fn create_product_name(parts: &[&str], orbit_pass: OrbitPass, bbox: &BoundingBox) -> String {
    let pass = orbit_pass.to_string();
    let coord = tile_coord(bbox);
    let mut all: Vec<&str> = parts.to_vec();
    all.push(&pass);
    all.push(&coord);
    all.join("_").to_uppercase()
}

pub fn metadata_tile_name(orbit_pass: OrbitPass, bbox: &BoundingBox) -> String {
    format!("{}.tif", create_product_name(&["metadata"], orbit_pass, bbox))
}

pub fn measurement_tile_name(
    measurement: MeasurementType,
    begin: DateTime<Utc>,
    end: DateTime<Utc>,
    orbit_pass: OrbitPass,
    bbox: &BoundingBox,
) -> String {
    let begin = begin.format(DAY_FORMAT).to_string();
    let end = end.format(DAY_FORMAT).to_string();
    format!("{}.tif", create_product_name(&[measurement.as_str(), &begin, &end], orbit_pass, bbox))
}

/// Per-frame product name, e.g. `displacement_01234_20140101_20260101.tif`
pub fn create_geotiff_name(
    measurement: MeasurementType,
    frame_id: u32,
    begin: DateTime<Utc>,
    end: DateTime<Utc>,
) -> String {
    format!(
        "{}_{:05}_{}_{}.tif",
        measurement,
        frame_id,
        begin.format(DAY_FORMAT),
        end.format(DAY_FORMAT)
    )
}
