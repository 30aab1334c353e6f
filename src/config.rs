//! Pipeline configuration

use crate::core::measurement::{MeasurementType, ScaleBand};
use crate::types::{DispError, DispResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CMR_ENDPOINT: &str = "https://cmr.earthdata.nasa.gov/search/granules.umm_json";
pub const DEFAULT_CREDENTIALS_ENDPOINT: &str = "https://cumulus.asf.alaska.edu/s3credentials";
pub const DEFAULT_FRAME_DB_NAME: &str = "opera-s1-disp-0.5.0.post1.dev20-2d.gpkg";
pub const FRAME_DB_BASE_URL: &str = "https://opera-disp-tms-dev.s3.us-west-2.amazonaws.com";

/// Settings shared by every stage of a tile build
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// CMR granule search endpoint (UMM JSON)
    pub cmr_endpoint: String,
    /// Collection short name of the displacement product
    pub short_name: String,
    /// Product version used to filter granules
    pub product_version: f64,
    /// Endpoint issuing temporary S3 credentials
    pub credentials_endpoint: String,
    /// Seconds temporary credentials stay cached
    pub credentials_ttl_secs: i64,
    /// File name of the frame GeoPackage
    pub frame_db_name: String,
    /// Directory the frame GeoPackage is cached in
    pub cache_dir: PathBuf,
    /// Inward buffer applied to frame footprints, meters (negative shrinks)
    pub frame_buffer_m: f64,
    /// Margin around a tile, meters, that granule reads are clipped to
    pub read_margin_m: f64,
    /// Ownership tile pixel size in EPSG:3857 meters
    pub tile_resolution: f64,
    /// Zero-fill NaNs in rasters whose valid fraction exceeds this threshold
    pub gap_fill_threshold: Option<f64>,
    pub displacement_scale: ScaleBand,
    pub secant_velocity_scale: ScaleBand,
    pub velocity_scale: ScaleBand,
    /// Clamp output values to the scale band before writing
    pub clip_to_scale: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cmr_endpoint: DEFAULT_CMR_ENDPOINT.to_string(),
            short_name: "OPERA_L3_DISP-S1_V1".to_string(),
            product_version: 1.0,
            credentials_endpoint: DEFAULT_CREDENTIALS_ENDPOINT.to_string(),
            credentials_ttl_secs: 50 * 60,
            frame_db_name: DEFAULT_FRAME_DB_NAME.to_string(),
            cache_dir: default_cache_dir(),
            frame_buffer_m: -3500.0,
            read_margin_m: 120.0,
            tile_resolution: 30.0,
            gap_fill_threshold: None,
            displacement_scale: ScaleBand::new(-0.25, 0.25),
            secant_velocity_scale: ScaleBand::new(-0.03, 0.03),
            velocity_scale: ScaleBand::new(-0.03, 0.03),
            clip_to_scale: false,
        }
    }
}

impl PipelineConfig {
    /// Load a configuration from a JSON file; missing keys take defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> DispResult<Self> {
        log::info!("Loading pipeline configuration from {}", path.as_ref().display());
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DispResult<()> {
        if self.tile_resolution <= 0.0 {
            return Err(DispError::InvalidInput(format!(
                "Tile resolution must be positive, got {}",
                self.tile_resolution
            )));
        }
        if !(self.read_margin_m >= 0.0) {
            return Err(DispError::InvalidInput(format!(
                "Read margin must be non-negative, got {}",
                self.read_margin_m
            )));
        }
        if let Some(threshold) = self.gap_fill_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(DispError::InvalidInput(format!(
                    "Gap fill threshold must be within [0, 1], got {}",
                    threshold
                )));
            }
        }
        for band in [self.displacement_scale, self.secant_velocity_scale, self.velocity_scale] {
            band.validate()?;
        }
        Ok(())
    }

    pub fn frame_db_path(&self) -> PathBuf {
        self.cache_dir.join(&self.frame_db_name)
    }

    pub fn frame_db_url(&self) -> String {
        format!("{}/{}", FRAME_DB_BASE_URL, self.frame_db_name)
    }

    pub fn scale_for(&self, measurement: MeasurementType) -> ScaleBand {
        match measurement {
            MeasurementType::Displacement => self.displacement_scale,
            MeasurementType::SecantVelocity => self.secant_velocity_scale,
            MeasurementType::Velocity => self.velocity_scale,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("opera_disp_tms")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"tile_resolution": 90.0, "gap_fill_threshold": 0.7}}"#).unwrap();

        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.tile_resolution, 90.0);
        assert_eq!(config.gap_fill_threshold, Some(0.7));
        assert_eq!(config.frame_buffer_m, -3500.0);
        assert_eq!(config.read_margin_m, 120.0);
        assert_eq!(config.scale_for(MeasurementType::Displacement), ScaleBand::new(-0.25, 0.25));
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let config = PipelineConfig { gap_fill_threshold: Some(1.5), ..Default::default() };
        assert!(config.validate().is_err());

        let config = PipelineConfig { read_margin_m: -1.0, ..Default::default() };
        assert!(config.validate().is_err());
    }
}
