//! OPERA frame footprints from the frame GeoPackage

use crate::config::PipelineConfig;
use crate::types::{BoundingBox, DispError, DispResult, OrbitPass};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use gdal::vector::{Feature, FieldValue, LayerAccess, ToGdal};
use gdal::Dataset;
use geo::{Intersects, MultiPolygon, Rect};
use std::io::Write;
use std::path::{Path, PathBuf};

const FRAME_LAYER: &str = "frames";

/// One OPERA DISP frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub frame_id: u32,
    pub epsg: u32,
    pub relative_orbit_number: u32,
    pub orbit_pass: OrbitPass,
    pub is_land: bool,
    pub is_north_america: bool,
    /// Footprint in EPSG:4326 (lon, lat)
    pub geometry: MultiPolygon<f64>,
}

fn lonlat_spatial_ref() -> DispResult<SpatialRef> {
    let srs = SpatialRef::from_epsg(4326)?;
    srs.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
    Ok(srs)
}

fn utm_spatial_ref(epsg: u32) -> DispResult<SpatialRef> {
    let srs = SpatialRef::from_epsg(epsg)?;
    srs.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
    Ok(srs)
}

/// Convert any polygonal geometry into a multipolygon
pub fn to_multipolygon(geometry: geo::Geometry<f64>) -> DispResult<MultiPolygon<f64>> {
    match geometry {
        geo::Geometry::Polygon(p) => Ok(MultiPolygon(vec![p])),
        geo::Geometry::MultiPolygon(mp) => Ok(mp),
        other => Err(DispError::InvalidFormat(format!("Expected a polygonal geometry, got {:?}", other))),
    }
}

/// Grow (positive) or shrink (negative) a frame footprint by a distance in meters
///
/// The buffer is applied in the frame's UTM zone.
pub fn buffer_frame_geometry(frame: &Frame, buffer_m: f64) -> DispResult<Frame> {
    let lonlat = lonlat_spatial_ref()?;
    let utm = utm_spatial_ref(frame.epsg)?;
    let to_utm = CoordTransform::new(&lonlat, &utm)?;
    let to_lonlat = CoordTransform::new(&utm, &lonlat)?;

    let geometry = frame.geometry.to_gdal()?;
    let buffered = geometry.transform(&to_utm)?.buffer(buffer_m, 8)?.transform(&to_lonlat)?;
    let geometry = to_multipolygon(buffered.to_geo()?)?;

    Ok(Frame { geometry, ..frame.clone() })
}

/// Download the frame database unless it is already cached
pub fn download_frame_db(config: &PipelineConfig) -> DispResult<PathBuf> {
    let db_path = config.frame_db_path();
    if db_path.exists() {
        return Ok(db_path);
    }

    let url = config.frame_db_url();
    log::info!("Downloading frame database from {}", url);
    std::fs::create_dir_all(&config.cache_dir)?;

    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(600))
        .user_agent(concat!("opera_disp_tms/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let content = client.get(&url).send()?.error_for_status()?.bytes()?;
    log::debug!("Downloaded {} bytes", content.len());

    let mut tmp = tempfile::NamedTempFile::new_in(&config.cache_dir)?;
    tmp.write_all(&content)?;
    tmp.persist(&db_path).map_err(|e| DispError::Io(e.error))?;
    Ok(db_path)
}

fn int_field(feature: &Feature, name: &str) -> DispResult<i64> {
    match feature.field(name)? {
        Some(FieldValue::IntegerValue(v)) => Ok(v as i64),
        Some(FieldValue::Integer64Value(v)) => Ok(v),
        Some(other) => Err(DispError::InvalidFormat(format!("Field {} is not an integer: {:?}", name, other))),
        None => Err(DispError::InvalidFormat(format!("Field {} is missing", name))),
    }
}

fn string_field(feature: &Feature, name: &str) -> DispResult<String> {
    feature
        .field(name)?
        .and_then(FieldValue::into_string)
        .ok_or_else(|| DispError::InvalidFormat(format!("Field {} is missing", name)))
}

fn frame_from_feature(feature: &Feature) -> DispResult<Frame> {
    let frame_id = feature
        .fid()
        .ok_or_else(|| DispError::InvalidFormat("Frame feature has no id".to_string()))?;
    let geometry = feature
        .geometry()
        .ok_or_else(|| DispError::InvalidFormat(format!("Frame {} has no geometry", frame_id)))?;

    Ok(Frame {
        frame_id: frame_id as u32,
        epsg: int_field(feature, "epsg")? as u32,
        relative_orbit_number: int_field(feature, "relative_orbit_number")? as u32,
        orbit_pass: string_field(feature, "orbit_pass")?.parse()?,
        is_land: int_field(feature, "is_land")? != 0,
        is_north_america: int_field(feature, "is_north_america")? != 0,
        geometry: to_multipolygon(geometry.to_geo()?)?,
    })
}

/// Optional attribute filters for a frame query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFilter {
    pub orbit_pass: Option<OrbitPass>,
    pub is_north_america: Option<bool>,
    pub is_land: Option<bool>,
}

impl FrameFilter {
    /// OGR SQL attribute filter, or `None` when nothing is filtered
    pub fn to_sql(&self) -> Option<String> {
        let mut clauses = Vec::new();
        if let Some(pass) = self.orbit_pass {
            clauses.push(format!("orbit_pass = '{}'", pass));
        }
        if let Some(na) = self.is_north_america {
            clauses.push(format!("is_north_america = {}", na as i32));
        }
        if let Some(land) = self.is_land {
            clauses.push(format!("is_land = {}", land as i32));
        }
        if clauses.is_empty() {
            None
        } else {
            Some(clauses.join(" AND "))
        }
    }
}

/// Read-only view of the frame GeoPackage
pub struct FrameIndex {
    path: PathBuf,
}

impl FrameIndex {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    /// Open the cached frame database, downloading it on first use
    pub fn open(config: &PipelineConfig) -> DispResult<Self> {
        Ok(Self::new(download_frame_db(config)?))
    }

    /// Frames whose footprint intersects a bounding box
    pub fn intersect(&self, bbox: &BoundingBox, filter: &FrameFilter) -> DispResult<Vec<Frame>> {
        let dataset = Dataset::open(&self.path)?;
        let mut layer = dataset.layer_by_name(FRAME_LAYER)?;

        let [min_lon, min_lat, max_lon, max_lat] = bbox.as_f64();
        layer.set_spatial_filter_rect(min_lon, min_lat, max_lon, max_lat);
        if let Some(sql) = filter.to_sql() {
            layer.set_attribute_filter(&sql)?;
        }

        let query = Rect::new((min_lon, min_lat), (max_lon, max_lat)).to_polygon();
        let mut frames = Vec::new();
        for feature in layer.features() {
            let frame = frame_from_feature(&feature)?;
            if frame.geometry.intersects(&query) {
                frames.push(frame);
            }
        }

        log::debug!("Found {} frames intersecting {:?}", frames.len(), bbox);
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_sql() {
        assert_eq!(FrameFilter::default().to_sql(), None);
        let filter = FrameFilter {
            orbit_pass: Some(OrbitPass::Ascending),
            is_north_america: Some(true),
            is_land: Some(false),
        };
        assert_eq!(
            filter.to_sql().unwrap(),
            "orbit_pass = 'ASCENDING' AND is_north_america = 1 AND is_land = 0"
        );
    }

    #[test]
    fn test_to_multipolygon() {
        let polygon = Rect::new((0.0, 0.0), (1.0, 1.0)).to_polygon();
        let mp = to_multipolygon(geo::Geometry::Polygon(polygon)).unwrap();
        assert_eq!(mp.0.len(), 1);
        assert!(to_multipolygon(geo::Geometry::Point(geo::Point::new(0.0, 0.0))).is_err());
    }
}
