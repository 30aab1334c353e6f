//! Frame mosaicking on a shared web mercator grid
//!
//! Frames are burned into a `u16` ownership raster in a fixed order (later
//! burns win), then each frame's data is copied into the mosaic wherever the
//! finished ownership raster names that frame.

use crate::io::catalog::GranuleSource;
use crate::io::frames::Frame;
use crate::io::raster::{read_metadata, write_ownership_geotiff, GranuleLoader};
use crate::types::{BoundingBox, DispError, DispResult, DisplacementImage, GeoTransform, OrbitPass, DATE_FORMAT};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use gdal::raster::{rasterize, Buffer};
use gdal::vector::ToGdal;
use gdal::DriverManager;
use geo::{BoundingRect, Coord, MapCoords, MultiPolygon};
use ndarray::Array2;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// EPSG code of the tile grid
pub const WEB_MERCATOR_EPSG: u32 = 3857;

const EARTH_RADIUS_M: f64 = 6_378_137.0;

pub const OPERA_FRAMES_KEY: &str = "OPERA_FRAMES";

pub fn ref_time_key(frame_id: u32) -> String {
    format!("FRAME_{}_REF_TIME", frame_id)
}

pub fn sec_time_key(frame_id: u32) -> String {
    format!("FRAME_{}_SEC_TIME", frame_id)
}

pub fn ref_point_key(frame_id: u32) -> String {
    format!("FRAME_{}_REF_POINT_EASTINGNORTHING", frame_id)
}

pub fn epsg_key(frame_id: u32) -> String {
    format!("FRAME_{}_EPSG", frame_id)
}

/// Spherical web mercator forward projection
pub fn lonlat_to_web_mercator(lon: f64, lat: f64) -> (f64, f64) {
    let x = EARTH_RADIUS_M * lon.to_radians();
    let y = EARTH_RADIUS_M * (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln();
    (x, y)
}

/// Project a lon/lat geometry into web mercator
pub fn geometry_to_web_mercator(geometry: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    geometry.map_coords(|c| {
        let (x, y) = lonlat_to_web_mercator(c.x, c.y);
        Coord { x, y }
    })
}

/// Which relative orbit strip is burned first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorderStrategy {
    MinFrameNumber,
    EastMost,
    WestMost,
}

impl ReorderStrategy {
    /// Ascending tiles put east strips on top, descending tiles west strips
    pub fn for_orbit_pass(pass: OrbitPass) -> Self {
        match pass {
            OrbitPass::Ascending => ReorderStrategy::EastMost,
            OrbitPass::Descending => ReorderStrategy::WestMost,
        }
    }
}

/// Western edge of a lon/lat footprint
///
/// Footprints wider than 180 degrees straddle the antimeridian; their west
/// edge is the smallest positive longitude shifted by -360.
pub fn west_bound(geometry: &MultiPolygon<f64>) -> Option<f64> {
    let rect = geometry.bounding_rect()?;
    if rect.width() <= 180.0 {
        return Some(rect.min().x);
    }
    geometry
        .0
        .iter()
        .flat_map(|p| p.exterior().coords())
        .map(|c| c.x)
        .filter(|x| *x > 0.0)
        .min_by(|a, b| a.total_cmp(b))
        .map(|x| x - 360.0)
}

/// Order frames so they overlap correctly when burned
///
/// Within a relative orbit higher frame numbers come first; orbit groups are
/// ordered by `strategy`.
pub fn reorder_frames(frames: &[Frame], strategy: ReorderStrategy) -> DispResult<Vec<Frame>> {
    let passes: BTreeSet<_> = frames.iter().map(|f| f.orbit_pass).collect();
    if passes.len() > 1 {
        return Err(DispError::InvalidInput("Cannot reorder frames with different orbit passes".to_string()));
    }

    let mut groups: BTreeMap<u32, Vec<Frame>> = BTreeMap::new();
    for frame in frames {
        groups.entry(frame.relative_orbit_number).or_default().push(frame.clone());
    }

    let mut keyed: Vec<(f64, u32, Vec<Frame>)> = Vec::with_capacity(groups.len());
    for (orbit, mut group) in groups {
        group.sort_by(|a, b| b.frame_id.cmp(&a.frame_id));
        let key = match strategy {
            ReorderStrategy::MinFrameNumber => group.iter().map(|f| f.frame_id).max().unwrap_or(0) as f64,
            ReorderStrategy::EastMost | ReorderStrategy::WestMost => group
                .iter()
                .map(|f| {
                    west_bound(&f.geometry).ok_or_else(|| {
                        DispError::InvalidFormat(format!("Frame {} has an empty footprint", f.frame_id))
                    })
                })
                .collect::<DispResult<Vec<f64>>>()?
                .into_iter()
                .fold(f64::INFINITY, f64::min),
        };
        keyed.push((key, orbit, group));
    }

    let descending = matches!(strategy, ReorderStrategy::EastMost | ReorderStrategy::MinFrameNumber);
    keyed.sort_by(|a, b| {
        let by_key = if descending { b.0.total_cmp(&a.0) } else { a.0.total_cmp(&b.0) };
        by_key.then(a.1.cmp(&b.1))
    });

    Ok(keyed.into_iter().flat_map(|(_, _, group)| group).collect())
}

/// Per-pixel frame ownership over a tile (0 = unowned)
#[derive(Debug, Clone, PartialEq)]
pub struct OwnershipMap {
    pub data: Array2<u16>,
    pub geo_transform: GeoTransform,
}

impl OwnershipMap {
    /// Empty web mercator grid covering an integer-degree bounding box
    pub fn empty_for_bbox(bbox: &BoundingBox, resolution: f64) -> DispResult<Self> {
        bbox.validate()?;
        if resolution <= 0.0 {
            return Err(DispError::InvalidInput(format!("Resolution must be positive, got {}", resolution)));
        }
        let [min_lon, min_lat, max_lon, max_lat] = bbox.as_f64();
        let (min_x, min_y) = lonlat_to_web_mercator(min_lon, min_lat);
        let (max_x, max_y) = lonlat_to_web_mercator(max_lon, max_lat);

        let x_size = ((max_x - min_x) / resolution) as usize + 1;
        let y_size = ((max_y - min_y) / resolution) as usize + 1;
        let geo_transform = GeoTransform::from_gdal([min_x, resolution, 0.0, max_y, 0.0, -resolution]);

        log::debug!("Ownership grid for {:?}: {}x{} at {} m", bbox, x_size, y_size, resolution);
        Ok(Self { data: Array2::zeros((y_size, x_size)), geo_transform })
    }

    pub fn from_parts(data: Array2<u16>, geo_transform: GeoTransform) -> Self {
        Self { data, geo_transform }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Burn a web mercator footprint, claiming every pixel whose centre is inside
    pub fn burn(&mut self, frame_id: u32, geometry: &MultiPolygon<f64>) -> DispResult<()> {
        self.burn_all(&[(frame_id, geometry.clone())])
    }

    /// Burn web mercator footprints in order; later footprints win shared pixels
    pub fn burn_all(&mut self, footprints: &[(u32, MultiPolygon<f64>)]) -> DispResult<()> {
        let mut values = Vec::with_capacity(footprints.len());
        let mut geometries = Vec::with_capacity(footprints.len());
        for (frame_id, geometry) in footprints {
            let value = u16::try_from(*frame_id).map_err(|_| {
                DispError::InvalidInput(format!("Frame id {} does not fit the ownership raster", frame_id))
            })?;
            values.push(value as f64);
            geometries.push(geometry.to_gdal()?);
        }

        let (height, width) = self.data.dim();
        if geometries.is_empty() || height == 0 || width == 0 {
            return Ok(());
        }

        let driver = DriverManager::get_driver_by_name("MEM")?;
        let mut dataset = driver.create_with_band_type::<u16, _>("", width as isize, height as isize, 1)?;
        dataset.set_geo_transform(&self.geo_transform.to_gdal())?;
        {
            let mut band = dataset.rasterband(1)?;
            let buffer = Buffer::new((width, height), self.data.iter().copied().collect::<Vec<u16>>());
            band.write((0, 0), (width, height), &buffer)?;
        }

        rasterize(&mut dataset, &[1], &geometries, &values, None)?;

        let burned = dataset.rasterband(1)?.read_as::<u16>((0, 0), (width, height), (width, height), None)?;
        self.data = Array2::from_shape_vec((height, width), burned.data)
            .map_err(|e| DispError::Processing(format!("Failed to reshape ownership raster: {}", e)))?;
        log::debug!("Burned {} footprints into {}x{} ownership grid", footprints.len(), width, height);
        Ok(())
    }

    /// Sorted distinct frame ids that own at least one pixel
    pub fn included_frames(&self) -> Vec<u32> {
        let ids: BTreeSet<u32> = self.data.iter().filter(|v| **v != 0).map(|v| *v as u32).collect();
        ids.into_iter().collect()
    }
}

/// Mosaic frame images (already on the ownership grid) through the final ownership
pub fn composite(ownership: &OwnershipMap, frames: &[(u32, DisplacementImage)]) -> DispResult<DisplacementImage> {
    let shape = ownership.dim();
    let mut mosaic = Array2::from_elem(shape, f64::NAN);
    for (frame_id, image) in frames {
        if image.dim() != shape {
            return Err(DispError::Processing(format!(
                "Frame {} image shape {:?} does not match tile shape {:?}",
                frame_id,
                image.dim(),
                shape
            )));
        }
        ndarray::Zip::from(&mut mosaic)
            .and(&ownership.data)
            .and(image)
            .for_each(|out, &owner, &value| {
                if owner as u32 == *frame_id {
                    *out = value;
                }
            });
    }
    Ok(mosaic)
}

/// Per-frame tags stored in a metadata tile
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMeta {
    pub frame_id: u32,
    pub reference_date: DateTime<Utc>,
    pub reference_point_eastingnorthing: Option<(i64, i64)>,
    pub epsg: Option<u32>,
}

impl FrameMeta {
    /// Metadata items describing this frame
    pub fn to_metadata(&self) -> BTreeMap<String, String> {
        let mut items = BTreeMap::new();
        if let Some((e, n)) = self.reference_point_eastingnorthing {
            items.insert(ref_point_key(self.frame_id), format!("{}, {}", e, n));
        }
        if let Some(epsg) = self.epsg {
            items.insert(epsg_key(self.frame_id), epsg.to_string());
        }
        items.insert(ref_time_key(self.frame_id), self.reference_date.format(DATE_FORMAT).to_string());
        items
    }
}

/// Parse a `%Y%m%dT%H%M%SZ` timestamp
pub fn parse_metadata_time(value: &str) -> DispResult<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, DATE_FORMAT)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|e| DispError::InvalidFormat(format!("Bad timestamp \"{}\": {}", value, e)))
}

fn parse_eastingnorthing(value: &str) -> DispResult<(i64, i64)> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    match parts.as_slice() {
        [e, n] => {
            let parse = |s: &str| {
                s.parse::<i64>()
                    .map_err(|e| DispError::InvalidFormat(format!("Bad reference point \"{}\": {}", value, e)))
            };
            Ok((parse(e)?, parse(n)?))
        }
        _ => Err(DispError::InvalidFormat(format!("Bad reference point \"{}\"", value))),
    }
}

/// Recover per-frame tags from metadata tile items
pub fn frames_from_metadata(metadata: &BTreeMap<String, String>) -> DispResult<BTreeMap<u32, FrameMeta>> {
    let listed = metadata
        .get(OPERA_FRAMES_KEY)
        .ok_or_else(|| DispError::InvalidFormat(format!("Metadata has no {}", OPERA_FRAMES_KEY)))?;

    let mut frames = BTreeMap::new();
    for id in listed.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let frame_id = id
            .parse::<u32>()
            .map_err(|e| DispError::InvalidFormat(format!("Bad frame id \"{}\": {}", id, e)))?;
        let reference_time = metadata
            .get(&ref_time_key(frame_id))
            .ok_or_else(|| DispError::InvalidFormat(format!("Metadata has no reference time for frame {}", frame_id)))?;
        let reference_point = metadata.get(&ref_point_key(frame_id)).map(|v| parse_eastingnorthing(v)).transpose()?;
        let epsg = metadata
            .get(&epsg_key(frame_id))
            .map(|v| {
                v.parse::<u32>()
                    .map_err(|e| DispError::InvalidFormat(format!("Bad EPSG \"{}\": {}", v, e)))
            })
            .transpose()?;

        frames.insert(
            frame_id,
            FrameMeta {
                frame_id,
                reference_date: parse_metadata_time(reference_time)?,
                reference_point_eastingnorthing: reference_point,
                epsg,
            },
        );
    }
    Ok(frames)
}

/// Read per-frame tags from a metadata tile on disk
pub fn frames_from_metadata_tile<P: AsRef<Path>>(path: P) -> DispResult<BTreeMap<u32, FrameMeta>> {
    frames_from_metadata(&read_metadata(path)?)
}

/// Tags from the granule with the earliest reference date, if the frame has any
fn first_granule_metadata(
    frame: &Frame,
    source: &dyn GranuleSource,
    loader: &dyn GranuleLoader,
) -> DispResult<Option<FrameMeta>> {
    let granules = source.find_granules_for_frame(frame.frame_id)?;
    let Some(first) = granules.iter().min_by_key(|g| g.reference_date) else {
        return Ok(None);
    };
    Ok(Some(FrameMeta {
        frame_id: frame.frame_id,
        reference_date: first.reference_date,
        reference_point_eastingnorthing: loader.reference_point(first)?,
        epsg: Some(frame.epsg),
    }))
}

/// Build the frame ownership tile for a bounding box
///
/// Frames without granules are skipped. Returns `None`, writing nothing, when
/// no frame ends up owning a pixel.
pub fn create_metadata_tile(
    bbox: &BoundingBox,
    frames: &[Frame],
    source: &dyn GranuleSource,
    loader: &dyn GranuleLoader,
    resolution: f64,
    out_path: &Path,
) -> DispResult<Option<PathBuf>> {
    let mut ownership = OwnershipMap::empty_for_bbox(bbox, resolution)?;
    let mut frame_metadata: HashMap<u32, FrameMeta> = HashMap::new();
    let mut footprints = Vec::new();

    for frame in frames {
        match first_granule_metadata(frame, source, loader) {
            Ok(Some(meta)) => {
                frame_metadata.insert(frame.frame_id, meta);
                footprints.push((frame.frame_id, geometry_to_web_mercator(&frame.geometry)));
            }
            Ok(None) => {
                log::warn!("No granules found for frame {}, this frame will not be added to the tile", frame.frame_id);
            }
            Err(e) if e.is_frame_local() => {
                log::warn!("Skipping frame {}: {}", frame.frame_id, e);
            }
            Err(e) => return Err(e),
        }
    }

    ownership.burn_all(&footprints)?;

    let included = ownership.included_frames();
    if included.is_empty() {
        log::warn!("No granules are available for {:?}, the tile will not be created", bbox);
        return Ok(None);
    }

    let mut metadata = BTreeMap::new();
    metadata.insert(
        OPERA_FRAMES_KEY.to_string(),
        included.iter().map(u32::to_string).collect::<Vec<_>>().join(", "),
    );
    for frame_id in &included {
        if let Some(meta) = frame_metadata.get(frame_id) {
            metadata.extend(meta.to_metadata());
        }
    }

    write_ownership_geotiff(out_path, &ownership.data, &ownership.geo_transform, WEB_MERCATOR_EPSG, &metadata)?;
    log::info!("Wrote metadata tile {} with frames {:?}", out_path.display(), included);
    Ok(Some(out_path.to_path_buf()))
}
