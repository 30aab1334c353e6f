//! Web tile pyramid packaging through the GDAL command line utilities

use crate::core::measurement::ScaleBand;
use crate::types::{DispError, DispResult, GeoTransform};
use gdal::Dataset;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;

pub const ZOOM_LEVELS: &str = "2-11";

/// Contents of `extent.json` next to a tile map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileMapExtent {
    pub extent: [f64; 4],
    #[serde(rename = "EPSG")]
    pub epsg: u32,
    pub scale_range: ScaleRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleRange {
    pub range: [f64; 2],
    pub units: String,
}

/// `[minx, miny, maxx, maxy]` of a north-up raster
pub fn extent_from_geotransform(geo_transform: &GeoTransform, size: (usize, usize)) -> [f64; 4] {
    let (width, height) = size;
    let (ulx, uly) = geo_transform.pixel_to_geo(0.0, 0.0);
    let (lrx, lry) = geo_transform.pixel_to_geo(width as f64, height as f64);
    [ulx.min(lrx), uly.min(lry), ulx.max(lrx), uly.max(lry)]
}

pub fn gdalbuildvrt_args(mosaic_vrt: &Path, inputs: &[PathBuf]) -> Vec<String> {
    let mut args = vec!["-r".to_string(), "nearest".to_string(), mosaic_vrt.display().to_string()];
    args.extend(inputs.iter().map(|p| p.display().to_string()));
    args
}

pub fn gdal_translate_args(mosaic_vrt: &Path, byte_vrt: &Path, scale: &ScaleBand) -> Vec<String> {
    vec![
        "-of".to_string(),
        "VRT".to_string(),
        "-ot".to_string(),
        "Byte".to_string(),
        "-scale".to_string(),
        scale.min.to_string(),
        scale.max.to_string(),
        "-r".to_string(),
        "nearest".to_string(),
        mosaic_vrt.display().to_string(),
        byte_vrt.display().to_string(),
    ]
}

pub fn gdal2tiles_args(byte_vrt: &Path, output_folder: &Path, processes: usize) -> Vec<String> {
    vec![
        "--xyz".to_string(),
        format!("--zoom={}", ZOOM_LEVELS),
        format!("--processes={}", processes),
        "--webviewer=openlayers".to_string(),
        "--resampling=near".to_string(),
        byte_vrt.display().to_string(),
        output_folder.display().to_string(),
    ]
}

fn run(program: &str, args: &[String]) -> DispResult<()> {
    log::debug!("Running {} {}", program, args.join(" "));
    let status = Command::new(program).args(args).status()?;
    if !status.success() {
        return Err(DispError::Processing(format!("{} exited with {}", program, status)));
    }
    Ok(())
}

/// Write `extent.json` into `output_folder`
pub fn create_bounds_file(extent: &TileMapExtent, output_folder: &Path) -> DispResult<PathBuf> {
    std::fs::create_dir_all(output_folder)?;
    let path = output_folder.join("extent.json");
    std::fs::write(&path, serde_json::to_string(extent)?)?;
    Ok(path)
}

/// Mosaic rasters, scale them to bytes and cut an XYZ tile pyramid
pub fn create_tile_map(
    output_folder: &Path,
    input_rasters: &[PathBuf],
    scale: &ScaleBand,
    units: &str,
) -> DispResult<TileMapExtent> {
    if input_rasters.is_empty() {
        return Err(DispError::InvalidInput("A tile map needs at least one input raster".to_string()));
    }
    scale.validate()?;

    let workdir = tempfile::tempdir()?;
    let mosaic_vrt = workdir.path().join("mosaic.vrt");
    let byte_vrt = workdir.path().join("byte.vrt");

    log::info!("Building tile map from {} rasters into {}", input_rasters.len(), output_folder.display());
    run("gdalbuildvrt", &gdalbuildvrt_args(&mosaic_vrt, input_rasters))?;
    run("gdal_translate", &gdal_translate_args(&mosaic_vrt, &byte_vrt, scale))?;

    let processes = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    run("gdal2tiles", &gdal2tiles_args(&byte_vrt, output_folder, processes))?;

    let dataset = Dataset::open(&mosaic_vrt)?;
    let geo_transform = GeoTransform::from_gdal(dataset.geo_transform()?);
    let epsg = dataset.spatial_ref()?.auth_code()?;
    let extent = TileMapExtent {
        extent: extent_from_geotransform(&geo_transform, dataset.raster_size()),
        epsg: epsg as u32,
        scale_range: ScaleRange { range: [scale.min, scale.max], units: units.to_string() },
    };
    create_bounds_file(&extent, output_folder)?;
    Ok(extent)
}
