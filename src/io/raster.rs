use crate::io::catalog::Granule;
use crate::io::credentials::CredentialProvider;
use crate::types::{DispError, DispResult, DisplacementImage, DisplacementRaster, GeoTransform};
use gdal::raster::{Buffer, RasterCreationOption};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use gdal::{Dataset, DriverManager, Metadata};
use ndarray::Array2;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// NetCDF variable holding short wavelength cumulative displacement
pub const DISPLACEMENT_VARIABLE: &str = "short_wavelength_displacement";

/// NetCDF variable flagging trustworthy pixels with 1
pub const MASK_VARIABLE: &str = "recommended_mask";

/// Band 1 of a raster as `f64`, with its geotransform and WKT
pub fn read_raster<P: AsRef<Path>>(path: P) -> DispResult<(DisplacementImage, GeoTransform, String)> {
    log::debug!("Reading raster {}", path.as_ref().display());
    let dataset = Dataset::open(path.as_ref())?;
    let data = read_band::<f64>(&dataset)?;
    let geo_transform = GeoTransform::from_gdal(dataset.geo_transform()?);
    let wkt = dataset.spatial_ref()?.to_wkt()?;
    Ok((data, geo_transform, wkt))
}

/// Band 1 of an ownership tile
pub fn read_ownership_raster<P: AsRef<Path>>(path: P) -> DispResult<(Array2<u16>, GeoTransform)> {
    let dataset = Dataset::open(path.as_ref())?;
    let data = read_band::<u16>(&dataset)?;
    Ok((data, GeoTransform::from_gdal(dataset.geo_transform()?)))
}

fn read_band<T: gdal::raster::GdalType + Copy>(dataset: &Dataset) -> DispResult<Array2<T>> {
    read_band_window(dataset, PixelWindow::full(dataset.raster_size()))
}

fn read_band_window<T: gdal::raster::GdalType + Copy>(dataset: &Dataset, window: PixelWindow) -> DispResult<Array2<T>> {
    let (col, row) = window.offset;
    let (width, height) = window.size;
    let band = dataset.rasterband(1)?;
    let buffer = band.read_as::<T>((col as isize, row as isize), (width, height), (width, height), None)?;
    Array2::from_shape_vec((height, width), buffer.data)
        .map_err(|e| DispError::Processing(format!("Failed to reshape raster data: {}", e)))
}

/// Projected rectangle that granule reads are clipped to
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadWindow {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
    pub epsg: u32,
}

impl ReadWindow {
    /// Extent of a grid grown by `margin` (CRS units) on every side
    pub fn around_grid(geo_transform: &GeoTransform, shape: (usize, usize), epsg: u32, margin: f64) -> Self {
        let (height, width) = shape;
        let (x0, y0) = geo_transform.pixel_to_geo(0.0, 0.0);
        let (x1, y1) = geo_transform.pixel_to_geo(width as f64, height as f64);
        Self {
            min_x: x0.min(x1) - margin,
            min_y: y0.min(y1) - margin,
            max_x: x0.max(x1) + margin,
            max_y: y0.max(y1) + margin,
            epsg,
        }
    }

    /// Bounds of this window in another spatial reference
    fn bounds_in(&self, target: &SpatialRef) -> DispResult<[f64; 4]> {
        let transform = CoordTransform::new(&epsg_spatial_ref(self.epsg)?, target)?;
        let mid_x = (self.min_x + self.max_x) / 2.0;
        let mid_y = (self.min_y + self.max_y) / 2.0;
        let mut xs = vec![self.min_x, mid_x, self.max_x, self.min_x, self.max_x, self.min_x, mid_x, self.max_x];
        let mut ys = vec![self.max_y, self.max_y, self.max_y, mid_y, mid_y, self.min_y, self.min_y, self.min_y];
        let mut zs = vec![0.0; xs.len()];
        transform.transform_coords(&mut xs, &mut ys, &mut zs)?;
        Ok([
            xs.iter().copied().fold(f64::INFINITY, f64::min),
            ys.iter().copied().fold(f64::INFINITY, f64::min),
            xs.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            ys.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        ])
    }
}

/// Pixel offset (col, row) and size (width, height) of a band read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWindow {
    pub offset: (usize, usize),
    pub size: (usize, usize),
}

impl PixelWindow {
    pub fn full(raster_size: (usize, usize)) -> Self {
        Self { offset: (0, 0), size: raster_size }
    }

    /// Pixels of a north-up raster touching `[min_x, min_y, max_x, max_y]`
    ///
    /// `None` when the bounds miss the raster.
    pub fn covering(geo_transform: &GeoTransform, raster_size: (usize, usize), bounds: [f64; 4]) -> Option<Self> {
        let (width, height) = raster_size;
        let [min_x, min_y, max_x, max_y] = bounds;
        let (c0, r0) = geo_transform.geo_to_pixel(min_x, max_y);
        let (c1, r1) = geo_transform.geo_to_pixel(max_x, min_y);
        if ![c0, r0, c1, r1].iter().all(|v| v.is_finite()) {
            return None;
        }

        let clamp = |v: f64, limit: usize| v.max(0.0).min(limit as f64) as usize;
        let col_start = clamp(c0.min(c1).floor(), width);
        let col_end = clamp(c0.max(c1).ceil(), width);
        let row_start = clamp(r0.min(r1).floor(), height);
        let row_end = clamp(r0.max(r1).ceil(), height);
        if col_start >= col_end || row_start >= row_end {
            return None;
        }
        Some(Self {
            offset: (col_start, row_start),
            size: (col_end - col_start, row_end - row_start),
        })
    }

    /// Geotransform of the window's top-left pixel
    pub fn geo_transform(&self, full: &GeoTransform) -> GeoTransform {
        let (col, row) = self.offset;
        let (x, y) = full.pixel_to_geo(col as f64, row as f64);
        GeoTransform { top_left_x: x, top_left_y: y, ..*full }
    }
}

/// Default-domain metadata of a raster
pub fn read_metadata<P: AsRef<Path>>(path: P) -> DispResult<BTreeMap<String, String>> {
    let dataset = Dataset::open(path.as_ref())?;
    let items = dataset.metadata_domain("").unwrap_or_default();
    Ok(items
        .iter()
        .filter_map(|item| item.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect())
}

fn epsg_spatial_ref(epsg: u32) -> DispResult<SpatialRef> {
    let srs = SpatialRef::from_epsg(epsg)?;
    srs.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
    Ok(srs)
}

/// Single-band `f32` GeoTIFF with NaN NoData and string metadata
pub fn write_float_geotiff<P: AsRef<Path>>(
    path: P,
    data: &DisplacementImage,
    geo_transform: &GeoTransform,
    epsg: u32,
    metadata: &BTreeMap<String, String>,
) -> DispResult<()> {
    let (height, width) = data.dim();
    log::debug!("Writing {}x{} float raster to {}", width, height, path.as_ref().display());

    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let options = [
        RasterCreationOption { key: "COMPRESS", value: "LZW" },
        RasterCreationOption { key: "TILED", value: "YES" },
    ];
    let mut dataset = driver.create_with_band_type_with_options::<f32, _>(
        path.as_ref(),
        width as isize,
        height as isize,
        1,
        &options,
    )?;
    dataset.set_geo_transform(&geo_transform.to_gdal())?;
    dataset.set_spatial_ref(&epsg_spatial_ref(epsg)?)?;
    for (key, value) in metadata {
        dataset.set_metadata_item(key, value, "")?;
    }

    let mut band = dataset.rasterband(1)?;
    let flat: Vec<f32> = data.iter().map(|v| *v as f32).collect();
    let buffer = Buffer::new((width, height), flat);
    band.write((0, 0), (width, height), &buffer)?;
    band.set_no_data_value(Some(f64::NAN))?;
    Ok(())
}

/// Single-band `u16` frame ownership GeoTIFF (LZW, tiled, NoData 0)
pub fn write_ownership_geotiff<P: AsRef<Path>>(
    path: P,
    data: &Array2<u16>,
    geo_transform: &GeoTransform,
    epsg: u32,
    metadata: &BTreeMap<String, String>,
) -> DispResult<()> {
    let (height, width) = data.dim();
    log::debug!("Writing {}x{} ownership raster to {}", width, height, path.as_ref().display());

    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let options = [
        RasterCreationOption { key: "TILED", value: "YES" },
        RasterCreationOption { key: "COMPRESS", value: "LZW" },
        RasterCreationOption { key: "NUM_THREADS", value: "ALL_CPUS" },
    ];
    let mut dataset = driver.create_with_band_type_with_options::<u16, _>(
        path.as_ref(),
        width as isize,
        height as isize,
        1,
        &options,
    )?;
    dataset.set_geo_transform(&geo_transform.to_gdal())?;
    dataset.set_spatial_ref(&epsg_spatial_ref(epsg)?)?;
    for (key, value) in metadata {
        dataset.set_metadata_item(key, value, "")?;
    }

    let mut band = dataset.rasterband(1)?;
    let buffer = Buffer::new((width, height), data.iter().copied().collect::<Vec<u16>>());
    band.write((0, 0), (width, height), &buffer)?;
    band.set_no_data_value(Some(0.0))?;
    Ok(())
}

/// Loads the displacement raster behind a catalog entry
pub trait GranuleLoader {
    fn load_granule(&self, granule: &Granule) -> DispResult<DisplacementRaster>;

    /// Load only the part of a granule covering `window`
    fn load_granule_window(&self, granule: &Granule, _window: &ReadWindow) -> DispResult<DisplacementRaster> {
        self.load_granule(granule)
    }

    /// Reference point easting/northing of a granule
    fn reference_point(&self, granule: &Granule) -> DispResult<Option<(i64, i64)>> {
        Ok(self.load_granule(granule)?.reference_point)
    }
}

/// GDAL path of a NetCDF variable inside an S3 object
pub fn netcdf_subdataset_path(s3_uri: &str, variable: &str) -> DispResult<String> {
    let key = s3_uri
        .strip_prefix("s3://")
        .ok_or_else(|| DispError::InvalidFormat(format!("Not an S3 URI: {}", s3_uri)))?;
    Ok(format!("NETCDF:\"/vsis3/{}\":{}", key, variable))
}

/// Reference point row and column from NetCDF attribute metadata
fn reference_point_index(metadata: &[String]) -> Option<(usize, usize)> {
    let lookup = |suffix: &str| {
        metadata
            .iter()
            .filter_map(|item| item.split_once('='))
            .find(|(k, _)| k.ends_with(suffix))
            .and_then(|(_, v)| v.trim().trim_matches(|c| c == '{' || c == '}').parse::<f64>().ok())
            .map(|v| v as usize)
    };
    Some((lookup("reference_point#rows")?, lookup("reference_point#cols")?))
}

/// Easting/northing of a pixel centre, rounded to whole meters
pub fn pixel_center_eastingnorthing(geo_transform: &GeoTransform, row: usize, col: usize) -> (i64, i64) {
    let (x, y) = geo_transform.pixel_to_geo(col as f64 + 0.5, row as f64 + 0.5);
    (x.round() as i64, y.round() as i64)
}

/// Reads OPERA DISP granules straight from S3 through GDAL's NetCDF driver
pub struct NetcdfGranuleLoader {
    credentials: Arc<dyn CredentialProvider>,
}

impl NetcdfGranuleLoader {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        Self { credentials }
    }
}

impl NetcdfGranuleLoader {
    fn open_displacement(&self, granule: &Granule) -> DispResult<Dataset> {
        self.credentials.credentials()?.apply_to_gdal()?;
        let displacement_path = netcdf_subdataset_path(&granule.s3_uri, DISPLACEMENT_VARIABLE)?;
        log::debug!("Opening {}", displacement_path);
        Ok(Dataset::open(Path::new(&displacement_path))?)
    }

    fn read(&self, granule: &Granule, window: Option<&ReadWindow>) -> DispResult<DisplacementRaster> {
        let dataset = self.open_displacement(granule)?;
        let full_transform = GeoTransform::from_gdal(dataset.geo_transform()?);
        let srs = dataset.spatial_ref()?;
        srs.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
        let spatial_ref = srs.to_wkt()?;
        let metadata = dataset.metadata_domain("").unwrap_or_default();

        let pixels = match window {
            Some(window) => PixelWindow::covering(&full_transform, dataset.raster_size(), window.bounds_in(&srs)?)
                .ok_or_else(|| {
                    DispError::DataAvailability(format!("{} does not overlap the read window", granule.scene_name))
                })?,
            None => PixelWindow::full(dataset.raster_size()),
        };
        let mut data = read_band_window::<f64>(&dataset, pixels)?;

        let mask_path = netcdf_subdataset_path(&granule.s3_uri, MASK_VARIABLE)?;
        let mask_dataset = Dataset::open(Path::new(&mask_path))?;
        if mask_dataset.raster_size() != dataset.raster_size() {
            return Err(DispError::InvalidFormat(format!(
                "Mask size {:?} does not match displacement size {:?} in {}",
                mask_dataset.raster_size(),
                dataset.raster_size(),
                granule.scene_name
            )));
        }
        let mask = read_band_window::<u8>(&mask_dataset, pixels)?;
        ndarray::Zip::from(&mut data).and(&mask).for_each(|value, &flag| {
            if flag != 1 {
                *value = f64::NAN;
            }
        });

        let reference_point = reference_point_index(&metadata)
            .map(|(row, col)| pixel_center_eastingnorthing(&full_transform, row, col));
        if reference_point.is_none() {
            log::warn!("No reference point metadata in {}", granule.scene_name);
        }

        Ok(DisplacementRaster {
            data,
            frame_id: granule.frame_id,
            reference_date: granule.reference_date,
            secondary_date: granule.secondary_date,
            geo_transform: pixels.geo_transform(&full_transform),
            spatial_ref,
            reference_point,
        })
    }
}

impl GranuleLoader for NetcdfGranuleLoader {
    fn load_granule(&self, granule: &Granule) -> DispResult<DisplacementRaster> {
        self.read(granule, None)
    }

    fn load_granule_window(&self, granule: &Granule, window: &ReadWindow) -> DispResult<DisplacementRaster> {
        self.read(granule, Some(window))
    }

    fn reference_point(&self, granule: &Granule) -> DispResult<Option<(i64, i64)>> {
        let dataset = self.open_displacement(granule)?;
        let geo_transform = GeoTransform::from_gdal(dataset.geo_transform()?);
        let metadata = dataset.metadata_domain("").unwrap_or_default();
        Ok(reference_point_index(&metadata).map(|(row, col)| pixel_center_eastingnorthing(&geo_transform, row, col)))
    }
}

/// Value of the source pixel containing a point in the source's coordinates
///
/// Points outside the raster (or non-finite) sample as NaN.
pub fn sample_nearest(source: &DisplacementRaster, x: f64, y: f64) -> f64 {
    let (src_height, src_width) = source.dim();
    let (pc, pr) = source.geo_transform.geo_to_pixel(x, y);
    if pc < 0.0 || pr < 0.0 || !pc.is_finite() || !pr.is_finite() {
        return f64::NAN;
    }
    let (c, r) = (pc.floor() as usize, pr.floor() as usize);
    if c < src_width && r < src_height {
        source.data[[r, c]]
    } else {
        f64::NAN
    }
}

/// North-up grid in `target_epsg` covering a raster at its native pixel size
pub fn native_grid(source: &DisplacementRaster, target_epsg: u32) -> DispResult<(GeoTransform, (usize, usize))> {
    let source_srs = SpatialRef::from_wkt(&source.spatial_ref)?;
    source_srs.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
    let target_srs = epsg_spatial_ref(target_epsg)?;
    let transform = CoordTransform::new(&source_srs, &target_srs)?;

    let (height, width) = source.dim();
    let (w, h) = (width as f64, height as f64);
    let samples = [(0.0, 0.0), (w / 2.0, 0.0), (w, 0.0), (0.0, h / 2.0), (w, h / 2.0), (0.0, h), (w / 2.0, h), (w, h)];
    let mut xs = Vec::with_capacity(samples.len());
    let mut ys = Vec::with_capacity(samples.len());
    for (col, row) in samples {
        let (x, y) = source.geo_transform.pixel_to_geo(col, row);
        xs.push(x);
        ys.push(y);
    }
    let mut zs = vec![0.0; xs.len()];
    transform.transform_coords(&mut xs, &mut ys, &mut zs)?;

    let min_x = xs.iter().copied().fold(f64::INFINITY, f64::min);
    let max_x = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min_y = ys.iter().copied().fold(f64::INFINITY, f64::min);
    let max_y = ys.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let resolution = source.geo_transform.pixel_width.abs();
    if resolution == 0.0 {
        return Err(DispError::InvalidFormat("Source raster has zero pixel width".to_string()));
    }
    let out_width = ((max_x - min_x) / resolution).ceil() as usize;
    let out_height = ((max_y - min_y) / resolution).ceil() as usize;
    let geo_transform = GeoTransform::from_gdal([min_x, resolution, 0.0, max_y, 0.0, -resolution]);
    Ok((geo_transform, (out_height, out_width)))
}

/// Reproject a raster onto an EPSG-coded target grid with nearest-neighbour sampling
pub fn reproject_to_grid(
    source: &DisplacementRaster,
    target: &GeoTransform,
    shape: (usize, usize),
    target_epsg: u32,
) -> DispResult<DisplacementImage> {
    let target_srs = epsg_spatial_ref(target_epsg)?;
    let source_srs = SpatialRef::from_wkt(&source.spatial_ref)?;
    source_srs.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
    let transform = CoordTransform::new(&target_srs, &source_srs)?;

    let (height, width) = shape;
    let mut xs = Vec::with_capacity(height * width);
    let mut ys = Vec::with_capacity(height * width);
    for row in 0..height {
        for col in 0..width {
            let (x, y) = target.pixel_to_geo(col as f64 + 0.5, row as f64 + 0.5);
            xs.push(x);
            ys.push(y);
        }
    }
    let mut zs = vec![0.0; xs.len()];
    transform.transform_coords(&mut xs, &mut ys, &mut zs)?;

    Ok(Array2::from_shape_fn(shape, |(row, col)| {
        let i = row * width + col;
        sample_nearest(source, xs[i], ys[i])
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ndarray::array;

    #[test]
    fn test_netcdf_subdataset_path() {
        let path = netcdf_subdataset_path("s3://bucket/dir/granule.nc", DISPLACEMENT_VARIABLE).unwrap();
        assert_eq!(path, "NETCDF:\"/vsis3/bucket/dir/granule.nc\":short_wavelength_displacement");
        assert!(netcdf_subdataset_path("https://host/granule.nc", MASK_VARIABLE).is_err());
    }

    #[test]
    fn test_reference_point_index() {
        let metadata = vec![
            "corrections_reference_point#rows=12".to_string(),
            "corrections_reference_point#cols=34".to_string(),
            "NC_GLOBAL#product_version=1.0".to_string(),
        ];
        assert_eq!(reference_point_index(&metadata), Some((12, 34)));
        assert_eq!(reference_point_index(&metadata[2..]), None);
    }

    #[test]
    fn test_read_window_around_grid() {
        let gt = GeoTransform::from_gdal([1000.0, 30.0, 0.0, 5000.0, 0.0, -30.0]);
        let window = ReadWindow::around_grid(&gt, (10, 20), 3857, 120.0);
        assert_eq!(window.min_x, 880.0);
        assert_eq!(window.max_x, 1720.0);
        assert_eq!(window.min_y, 4580.0);
        assert_eq!(window.max_y, 5120.0);
    }

    #[test]
    fn test_pixel_window_covering() {
        let gt = GeoTransform::from_gdal([0.0, 10.0, 0.0, 100.0, 0.0, -10.0]);

        let window = PixelWindow::covering(&gt, (10, 10), [15.0, 42.0, 38.0, 75.0]).unwrap();
        assert_eq!(window.offset, (1, 2));
        assert_eq!(window.size, (3, 4));
        let shifted = window.geo_transform(&gt);
        assert_eq!((shifted.top_left_x, shifted.top_left_y), (10.0, 80.0));
        assert_eq!(shifted.pixel_width, 10.0);

        let clipped = PixelWindow::covering(&gt, (10, 10), [-50.0, -50.0, 25.0, 500.0]).unwrap();
        assert_eq!(clipped, PixelWindow { offset: (0, 0), size: (3, 10) });

        assert!(PixelWindow::covering(&gt, (10, 10), [200.0, 0.0, 300.0, 100.0]).is_none());
        assert!(PixelWindow::covering(&gt, (10, 10), [0.0, f64::NAN, 10.0, 10.0]).is_none());
    }

    #[test]
    fn test_sample_nearest() {
        let day = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let source = DisplacementRaster {
            data: array![[1.0, 2.0], [3.0, 4.0]],
            frame_id: 1,
            reference_date: day,
            secondary_date: day,
            geo_transform: GeoTransform::from_gdal([0.0, 10.0, 0.0, 20.0, 0.0, -10.0]),
            spatial_ref: String::new(),
            reference_point: None,
        };

        assert_eq!(sample_nearest(&source, 5.0, 15.0), 1.0);
        assert_eq!(sample_nearest(&source, 15.0, 15.0), 2.0);
        assert_eq!(sample_nearest(&source, 19.9, 0.1), 4.0);
        assert!(sample_nearest(&source, 25.0, 15.0).is_nan());
        assert!(sample_nearest(&source, -0.1, 15.0).is_nan());
        assert!(sample_nearest(&source, f64::INFINITY, 15.0).is_nan());
    }
}
