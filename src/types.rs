use chrono::{DateTime, Duration, Timelike, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Timestamp format used in OPERA file names and tile metadata
pub const DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Day-only format used in product names and on the command line
pub const DAY_FORMAT: &str = "%Y%m%d";

/// 2D displacement grid (rows x cols)
pub type DisplacementImage = Array2<f64>;

/// Satellite pass direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrbitPass {
    Ascending,
    Descending,
}

impl std::fmt::Display for OrbitPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrbitPass::Ascending => write!(f, "ASCENDING"),
            OrbitPass::Descending => write!(f, "DESCENDING"),
        }
    }
}

impl FromStr for OrbitPass {
    type Err = DispError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ASCENDING" => Ok(OrbitPass::Ascending),
            "DESCENDING" => Ok(OrbitPass::Descending),
            _ => Err(DispError::InvalidInput(format!(
                "Orbit pass must be either \"ASCENDING\" or \"DESCENDING\", got \"{}\"",
                s
            ))),
        }
    }
}

/// Integer-degree bounding box in EPSG:4326
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: i32,
    pub min_lat: i32,
    pub max_lon: i32,
    pub max_lat: i32,
}

impl BoundingBox {
    /// Create a validated bounding box
    pub fn new(min_lon: i32, min_lat: i32, max_lon: i32, max_lat: i32) -> DispResult<Self> {
        let bbox = Self { min_lon, min_lat, max_lon, max_lat };
        bbox.validate()?;
        Ok(bbox)
    }

    /// Build a bounding box from a `[min_lon, min_lat, max_lon, max_lat]` slice
    pub fn from_slice(values: &[i32]) -> DispResult<Self> {
        match values {
            [min_lon, min_lat, max_lon, max_lat] => Self::new(*min_lon, *min_lat, *max_lon, *max_lat),
            _ => Err(DispError::InvalidInput(format!(
                "Bounding box must have exactly 4 values [min lon, min lat, max lon, max lat], got {}",
                values.len()
            ))),
        }
    }

    /// The 1x1 degree tile whose upper left corner is (`min_lon`, `max_lat`)
    pub fn from_upper_left(min_lon: i32, max_lat: i32) -> DispResult<Self> {
        Self::new(min_lon, max_lat - 1, min_lon + 1, max_lat)
    }

    pub fn validate(&self) -> DispResult<()> {
        if self.min_lon > self.max_lon {
            return Err(DispError::InvalidInput(format!(
                "Bounding box minimum longitude ({}) is greater than maximum longitude ({})",
                self.min_lon, self.max_lon
            )));
        }
        if self.min_lat > self.max_lat {
            return Err(DispError::InvalidInput(format!(
                "Bounding box minimum latitude ({}) is greater than maximum latitude ({})",
                self.min_lat, self.max_lat
            )));
        }
        if !(-180..=180).contains(&self.min_lon) || !(-180..=180).contains(&self.max_lon) {
            return Err(DispError::InvalidInput("Bounding box longitudes must be within [-180, 180]".to_string()));
        }
        if !(-90..=90).contains(&self.min_lat) || !(-90..=90).contains(&self.max_lat) {
            return Err(DispError::InvalidInput("Bounding box latitudes must be within [-90, 90]".to_string()));
        }
        Ok(())
    }

    pub fn as_f64(&self) -> [f64; 4] {
        [self.min_lon as f64, self.min_lat as f64, self.max_lon as f64, self.max_lat as f64]
    }
}

/// GDAL-style affine geotransform
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Georeferenced coordinate of a (fractional) pixel position
    pub fn pixel_to_geo(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.top_left_x + col * self.pixel_width + row * self.rotation_x,
            self.top_left_y + col * self.rotation_y + row * self.pixel_height,
        )
    }

    /// Fractional pixel position of a coordinate (north-up grids only)
    pub fn geo_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        ((x - self.top_left_x) / self.pixel_width, (y - self.top_left_y) / self.pixel_height)
    }
}

/// Cumulative displacement for one granule, with its temporal tags
#[derive(Debug, Clone, PartialEq)]
pub struct DisplacementRaster {
    pub data: DisplacementImage,
    pub frame_id: u32,
    pub reference_date: DateTime<Utc>,
    pub secondary_date: DateTime<Utc>,
    pub geo_transform: GeoTransform,
    /// Spatial reference as WKT
    pub spatial_ref: String,
    /// Reference point as integer (easting, northing)
    pub reference_point: Option<(i64, i64)>,
}

impl DisplacementRaster {
    /// Same tags and grid, new pixel values
    pub fn with_data(&self, data: DisplacementImage) -> Self {
        Self { data, ..self.clone() }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn valid_pixel_count(&self) -> usize {
        self.data.iter().filter(|v| !v.is_nan()).count()
    }
}

impl DatePair for DisplacementRaster {
    fn reference_date(&self) -> DateTime<Utc> {
        self.reference_date
    }

    fn secondary_date(&self) -> DateTime<Utc> {
        self.secondary_date
    }
}

/// Anything observed between a reference and a secondary acquisition
pub trait DatePair {
    fn reference_date(&self) -> DateTime<Utc>;
    fn secondary_date(&self) -> DateTime<Utc>;
}

/// Error types for displacement tile processing
#[derive(Debug, thiserror::Error)]
pub enum DispError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Insufficient data: {0}")]
    DataAvailability(String),

    #[error("Disconnected granule network: {0}")]
    DisconnectedNetwork(String),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Credential error: {0}")]
    Credentials(String),
}

impl DispError {
    /// Errors that only invalidate one frame of a multi-frame tile
    pub fn is_frame_local(&self) -> bool {
        !matches!(self, DispError::InvalidInput(_))
    }
}

/// Result type for displacement tile operations
pub type DispResult<T> = Result<T, DispError>;

/// True when two timestamps are less than one day apart
pub fn within_one_day(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (a - b).num_seconds().abs() < Duration::days(1).num_seconds()
}

/// Round a timestamp to the nearest midnight
pub fn round_to_day(dt: DateTime<Utc>) -> DateTime<Utc> {
    let shifted = dt + Duration::hours(12);
    shifted
        .with_hour(0)
        .and_then(|d| d.with_minute(0))
        .and_then(|d| d.with_second(0))
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(shifted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_round_to_day() {
        let late = Utc.with_ymd_and_hms(2021, 1, 1, 12, 1, 1).unwrap();
        let early = Utc.with_ymd_and_hms(2021, 1, 1, 11, 1, 1).unwrap();
        assert_eq!(round_to_day(late), Utc.with_ymd_and_hms(2021, 1, 2, 0, 0, 0).unwrap());
        assert_eq!(round_to_day(early), Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_within_one_day() {
        let a = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        assert!(within_one_day(a, a + Duration::hours(23)));
        assert!(within_one_day(a + Duration::hours(23), a));
        assert!(!within_one_day(a, a + Duration::days(1)));
    }

    #[test]
    fn test_bbox_validation() {
        assert!(BoundingBox::new(-125, 41, -124, 42).is_ok());
        assert!(BoundingBox::new(-124, 41, -125, 42).is_err());
        assert!(BoundingBox::new(-125, 42, -124, 41).is_err());
        assert!(BoundingBox::from_slice(&[1, 2, 3]).is_err());

        let tile = BoundingBox::from_upper_left(-125, 42).unwrap();
        assert_eq!(tile, BoundingBox { min_lon: -125, min_lat: 41, max_lon: -124, max_lat: 42 });
    }

    #[test]
    fn test_orbit_pass_parsing() {
        assert_eq!("ascending".parse::<OrbitPass>().unwrap(), OrbitPass::Ascending);
        assert_eq!("DESCENDING".parse::<OrbitPass>().unwrap(), OrbitPass::Descending);
        assert!("sideways".parse::<OrbitPass>().is_err());
        assert_eq!(OrbitPass::Ascending.to_string(), "ASCENDING");
    }

    #[test]
    fn test_geotransform_round_trip() {
        let gt = GeoTransform::from_gdal([100.0, 30.0, 0.0, 500.0, 0.0, -30.0]);
        let (x, y) = gt.pixel_to_geo(2.5, 3.5);
        assert_eq!((x, y), (175.0, 395.0));
        assert_eq!(gt.geo_to_pixel(x, y), (2.5, 3.5));
    }
}
