//! Per-frame and per-tile product generation
//!
//! Failures that only concern one frame (missing granules, a disconnected
//! network, an unreadable granule) are logged and that frame is left out;
//! invalid requests abort the whole product.

use crate::config::PipelineConfig;
use crate::core::alignment::load_sw_disp_stack;
use crate::core::measurement::{compute_measurement, MeasurementType};
use crate::core::mosaic::{
    composite, create_metadata_tile, frames_from_metadata_tile, reorder_frames, ref_point_key, ref_time_key,
    sec_time_key, OwnershipMap, ReorderStrategy, OPERA_FRAMES_KEY, WEB_MERCATOR_EPSG,
};
use crate::core::naming::{create_geotiff_name, measurement_tile_name, metadata_tile_name};
use crate::core::spanning_set::SelectionStrategy;
use crate::io::catalog::GranuleSource;
use crate::io::frames::{buffer_frame_geometry, FrameFilter, FrameIndex};
use crate::io::raster::{
    native_grid, read_metadata, read_ownership_raster, reproject_to_grid, write_float_geotiff, GranuleLoader,
    ReadWindow,
};
use crate::types::{BoundingBox, DispError, DispResult, DisplacementRaster, OrbitPass, DATE_FORMAT};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Split a bounding box into 1x1 degree tiles, longitude outermost
pub fn divide_bbox_into_tiles(bbox: &BoundingBox) -> DispResult<Vec<BoundingBox>> {
    bbox.validate()?;
    let mut tiles = Vec::new();
    for lon in bbox.min_lon..bbox.max_lon {
        for lat in bbox.min_lat..bbox.max_lat {
            tiles.push(BoundingBox::new(lon, lat, lon + 1, lat + 1)?);
        }
    }
    Ok(tiles)
}

fn validate_window(begin: DateTime<Utc>, end: DateTime<Utc>) -> DispResult<()> {
    if begin > end {
        return Err(DispError::InvalidInput(format!("Begin date {} is after end date {}", begin, end)));
    }
    Ok(())
}

/// Product generation against one catalog and one granule reader
pub struct Pipeline<'a> {
    config: &'a PipelineConfig,
    source: &'a dyn GranuleSource,
    loader: &'a dyn GranuleLoader,
    strategy: SelectionStrategy,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a PipelineConfig, source: &'a dyn GranuleSource, loader: &'a dyn GranuleLoader) -> Self {
        Self { config, source, loader, strategy: SelectionStrategy::Spanning }
    }

    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Measurement raster of one frame in its native grid, optionally clipped to `read_window`
    pub fn frame_measurement(
        &self,
        frame_id: u32,
        measurement: MeasurementType,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        read_window: Option<&ReadWindow>,
    ) -> DispResult<DisplacementRaster> {
        let stack = load_sw_disp_stack(
            self.source,
            self.loader,
            frame_id,
            begin,
            end,
            self.strategy,
            self.config.gap_fill_threshold,
            read_window,
        )?;
        let mut result = compute_measurement(&stack.rasters, measurement)?;
        if self.config.clip_to_scale {
            self.config.scale_for(measurement).clip(&mut result.data);
        }
        Ok(result)
    }

    /// Per-frame measurement GeoTIFF in web mercator at native resolution
    pub fn create_measurement_geotiff(
        &self,
        frame_id: u32,
        measurement: MeasurementType,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        out_dir: &Path,
    ) -> DispResult<PathBuf> {
        validate_window(begin, end)?;
        let raster = self.frame_measurement(frame_id, measurement, begin, end, None)?;

        let (geo_transform, shape) = native_grid(&raster, WEB_MERCATOR_EPSG)?;
        let data = reproject_to_grid(&raster, &geo_transform, shape, WEB_MERCATOR_EPSG)?;

        let mut metadata = BTreeMap::new();
        metadata.insert(ref_time_key(frame_id), raster.reference_date.format(DATE_FORMAT).to_string());
        metadata.insert(sec_time_key(frame_id), raster.secondary_date.format(DATE_FORMAT).to_string());
        if let Some((e, n)) = raster.reference_point {
            metadata.insert(ref_point_key(frame_id), format!("{}, {}", e, n));
        }

        let path = out_dir.join(create_geotiff_name(measurement, frame_id, begin, end));
        write_float_geotiff(&path, &data, &geo_transform, WEB_MERCATOR_EPSG, &metadata)?;
        log::info!("Wrote {}", path.display());
        Ok(path)
    }

    /// Frame ownership tile for a bounding box
    pub fn create_metadata_tile_for_bbox(
        &self,
        bbox: &BoundingBox,
        orbit_pass: OrbitPass,
        frame_index: &FrameIndex,
        out_dir: &Path,
    ) -> DispResult<Option<PathBuf>> {
        let filter = FrameFilter {
            orbit_pass: Some(orbit_pass),
            is_north_america: Some(true),
            is_land: Some(true),
        };
        let frames = frame_index
            .intersect(bbox, &filter)?
            .iter()
            .map(|f| buffer_frame_geometry(f, self.config.frame_buffer_m))
            .collect::<DispResult<Vec<_>>>()?;
        let ordered = reorder_frames(&frames, ReorderStrategy::for_orbit_pass(orbit_pass))?;
        log::debug!(
            "Burn order for {:?}: {:?}",
            bbox,
            ordered.iter().map(|f| f.frame_id).collect::<Vec<_>>()
        );

        let out_path = out_dir.join(metadata_tile_name(orbit_pass, bbox));
        create_metadata_tile(bbox, &ordered, self.source, self.loader, self.config.tile_resolution, &out_path)
    }

    /// Composite each frame's measurement through a metadata tile's ownership raster
    ///
    /// Returns `None`, writing nothing, when no frame produced data.
    pub fn create_measurement_tile(
        &self,
        metadata_path: &Path,
        measurement: MeasurementType,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        out_path: &Path,
    ) -> DispResult<Option<PathBuf>> {
        validate_window(begin, end)?;
        if !metadata_path.exists() {
            return Err(DispError::InvalidInput(format!("{} does not exist", metadata_path.display())));
        }

        let frames = frames_from_metadata_tile(metadata_path)?;
        let (data, geo_transform) = read_ownership_raster(metadata_path)?;
        let ownership = OwnershipMap::from_parts(data, geo_transform);
        let mut metadata = read_metadata(metadata_path)?;
        let read_window = ReadWindow::around_grid(
            &ownership.geo_transform,
            ownership.dim(),
            WEB_MERCATOR_EPSG,
            self.config.read_margin_m,
        );

        let mut frame_images = Vec::new();
        for frame_id in frames.keys() {
            let result = self
                .frame_measurement(*frame_id, measurement, begin, end, Some(&read_window))
                .and_then(|raster| {
                    let image = reproject_to_grid(&raster, &ownership.geo_transform, ownership.dim(), WEB_MERCATOR_EPSG)?;
                    Ok((raster.secondary_date, image))
                });
            match result {
                Ok((secondary_date, image)) => {
                    metadata.insert(sec_time_key(*frame_id), secondary_date.format(DATE_FORMAT).to_string());
                    frame_images.push((*frame_id, image));
                }
                Err(e) if e.is_frame_local() => {
                    log::warn!("Leaving frame {} out of {}: {}", frame_id, out_path.display(), e);
                    let prefix = format!("FRAME_{}_", frame_id);
                    metadata.retain(|key, _| !key.starts_with(&prefix));
                }
                Err(e) => return Err(e),
            }
        }

        if frame_images.is_empty() {
            log::warn!("No frames produced data for {}", out_path.display());
            return Ok(None);
        }

        metadata.insert(
            OPERA_FRAMES_KEY.to_string(),
            frame_images.iter().map(|(id, _)| id.to_string()).collect::<Vec<_>>().join(", "),
        );
        let mosaic = composite(&ownership, &frame_images)?;
        write_float_geotiff(out_path, &mosaic, &ownership.geo_transform, WEB_MERCATOR_EPSG, &metadata)?;
        log::info!("Wrote {} from {} frames", out_path.display(), frame_images.len());
        Ok(Some(out_path.to_path_buf()))
    }

    /// Metadata tile plus measurement tile for the 1x1 degree tile at (`min_lon`, `max_lat`)
    #[allow(clippy::too_many_arguments)]
    pub fn generate_tile(
        &self,
        measurement: MeasurementType,
        min_lon: i32,
        max_lat: i32,
        orbit_pass: OrbitPass,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        frame_index: &FrameIndex,
        out_dir: &Path,
    ) -> DispResult<Option<PathBuf>> {
        let bbox = BoundingBox::from_upper_left(min_lon, max_lat)?;
        self.generate_tile_for_bbox(measurement, &bbox, orbit_pass, begin, end, frame_index, out_dir)
    }

    #[allow(clippy::too_many_arguments)]
    fn generate_tile_for_bbox(
        &self,
        measurement: MeasurementType,
        bbox: &BoundingBox,
        orbit_pass: OrbitPass,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        frame_index: &FrameIndex,
        out_dir: &Path,
    ) -> DispResult<Option<PathBuf>> {
        validate_window(begin, end)?;
        let Some(metadata_path) = self.create_metadata_tile_for_bbox(bbox, orbit_pass, frame_index, out_dir)? else {
            return Ok(None);
        };
        let out_path = out_dir.join(measurement_tile_name(measurement, begin, end, orbit_pass, bbox));
        self.create_measurement_tile(&metadata_path, measurement, begin, end, &out_path)
    }

    /// Measurement tiles for every 1x1 degree tile in a bounding box
    #[allow(clippy::too_many_arguments)]
    pub fn generate_tiles(
        &self,
        measurement: MeasurementType,
        bbox: &BoundingBox,
        orbit_pass: OrbitPass,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        frame_index: &FrameIndex,
        out_dir: &Path,
    ) -> DispResult<Vec<PathBuf>> {
        let tiles = divide_bbox_into_tiles(bbox)?;
        log::info!("Generating {} tiles for {:?}", tiles.len(), bbox);

        let mut products = Vec::new();
        for tile in &tiles {
            match self.generate_tile_for_bbox(measurement, tile, orbit_pass, begin, end, frame_index, out_dir) {
                Ok(Some(path)) => products.push(path),
                Ok(None) => log::warn!("No product for tile {:?}", tile),
                Err(e) if e.is_frame_local() => log::warn!("Skipping tile {:?}: {}", tile, e),
                Err(e) => return Err(e),
            }
        }
        Ok(products)
    }
}
