use chrono::{TimeZone, Utc};
use ndarray::{array, Array2};
use opera_disp_tms::core::mosaic::{frames_from_metadata_tile, FrameMeta, OPERA_FRAMES_KEY, WEB_MERCATOR_EPSG};
use opera_disp_tms::io::raster::{read_metadata, read_ownership_raster, read_raster, write_float_geotiff, write_ownership_geotiff};
use opera_disp_tms::GeoTransform;
use std::collections::BTreeMap;

fn grid() -> GeoTransform {
    GeoTransform::from_gdal([-13_803_616.0, 30.0, 0.0, 5_160_979.0, 0.0, -30.0])
}

#[test]
fn test_ownership_tile_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("METADATA_ASCENDING_W124N42.tif");

    let frames = [
        FrameMeta {
            frame_id: 8882,
            reference_date: Utc.with_ymd_and_hms(2016, 7, 8, 14, 6, 46).unwrap(),
            reference_point_eastingnorthing: Some((520095, 4615215)),
            epsg: Some(32610),
        },
        FrameMeta {
            frame_id: 8883,
            reference_date: Utc.with_ymd_and_hms(2016, 7, 20, 14, 6, 47).unwrap(),
            reference_point_eastingnorthing: None,
            epsg: Some(32610),
        },
    ];
    let mut metadata = BTreeMap::new();
    metadata.insert(OPERA_FRAMES_KEY.to_string(), "8882, 8883".to_string());
    for frame in &frames {
        metadata.extend(frame.to_metadata());
    }

    let ownership: Array2<u16> = array![[8882, 8882, 0], [8883, 8883, 8882]];
    write_ownership_geotiff(&path, &ownership, &grid(), WEB_MERCATOR_EPSG, &metadata).expect("write tile");

    let (data, geo_transform) = read_ownership_raster(&path).expect("read tile");
    assert_eq!(data, ownership);
    assert_eq!(geo_transform, grid());

    let restored = frames_from_metadata_tile(&path).expect("read frames");
    assert_eq!(restored.len(), 2);
    assert_eq!(restored[&8882], frames[0]);
    assert_eq!(restored[&8883], frames[1]);
    assert_eq!(read_metadata(&path).expect("metadata")["FRAME_8882_EPSG"], "32610");
}

#[test]
fn test_float_geotiff_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("velocity_08882_20160101_20190101.tif");

    let image = array![[0.125, -0.5], [f64::NAN, 2.0]];
    let mut metadata = BTreeMap::new();
    metadata.insert("FRAME_8882_SEC_TIME".to_string(), "20190101T000000Z".to_string());
    write_float_geotiff(&path, &image, &grid(), WEB_MERCATOR_EPSG, &metadata).expect("write raster");

    let (data, geo_transform, wkt) = read_raster(&path).expect("read raster");
    assert_eq!(geo_transform, grid());
    assert!(wkt.contains("3857"));
    assert_eq!(data[[0, 0]], 0.125);
    assert_eq!(data[[0, 1]], -0.5);
    assert!(data[[1, 0]].is_nan());
    assert_eq!(data[[1, 1]], 2.0);
    assert_eq!(read_metadata(&path).expect("metadata")["FRAME_8882_SEC_TIME"], "20190101T000000Z");
}
