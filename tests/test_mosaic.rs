use geo::{MultiPolygon, Rect};
use ndarray::Array2;
use opera_disp_tms::core::mosaic::{
    composite, create_metadata_tile, reorder_frames, west_bound, OwnershipMap, ReorderStrategy,
};
use opera_disp_tms::io::catalog::StaticGranules;
use opera_disp_tms::io::frames::Frame;
use opera_disp_tms::io::raster::GranuleLoader;
use opera_disp_tms::{BoundingBox, DispError, DispResult, DisplacementRaster, GeoTransform, Granule, OrbitPass};

fn rect(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> MultiPolygon<f64> {
    MultiPolygon(vec![Rect::new((min_x, min_y), (max_x, max_y)).to_polygon()])
}

fn frame(relative_orbit_number: u32, frame_id: u32, geometry: MultiPolygon<f64>, orbit_pass: OrbitPass) -> Frame {
    Frame {
        frame_id,
        epsg: 32611,
        relative_orbit_number,
        orbit_pass,
        is_land: true,
        is_north_america: true,
        geometry,
    }
}

fn ids(frames: &[Frame]) -> Vec<u32> {
    frames.iter().map(|f| f.frame_id).collect()
}

fn four_frames() -> Vec<Frame> {
    let frame_1_1 = frame(1, 1, rect(1.0, 1.0, 2.0, 2.0), OrbitPass::Ascending);
    let frame_1_2 = frame(1, 2, rect(3.0, 3.0, 4.0, 4.0), OrbitPass::Ascending);
    let frame_2_3 = frame(2, 3, rect(0.0, 0.0, 2.0, 2.0), OrbitPass::Ascending);
    let frame_2_4 = frame(2, 4, rect(2.0, 2.0, 3.0, 3.0), OrbitPass::Ascending);
    vec![frame_2_4, frame_1_2, frame_2_3, frame_1_1]
}

#[test]
fn test_reorder_mixed_passes_rejected() {
    let frames = vec![
        frame(1, 1, rect(0.0, 0.0, 1.0, 1.0), OrbitPass::Ascending),
        frame(1, 1, rect(0.0, 0.0, 1.0, 1.0), OrbitPass::Descending),
    ];
    let result = reorder_frames(&frames, ReorderStrategy::WestMost);
    assert!(matches!(result, Err(DispError::InvalidInput(_))));
}

#[test]
fn test_reorder_by_frame_number() {
    let ordered = reorder_frames(&four_frames(), ReorderStrategy::MinFrameNumber).expect("single pass");
    assert_eq!(ids(&ordered), vec![4, 3, 2, 1]);
}

#[test]
fn test_reorder_west_and_east_most() {
    let west = reorder_frames(&four_frames(), ReorderStrategy::WestMost).expect("single pass");
    assert_eq!(ids(&west), vec![4, 3, 2, 1]);

    let east = reorder_frames(&four_frames(), ReorderStrategy::EastMost).expect("single pass");
    assert_eq!(ids(&east), vec![2, 1, 4, 3]);
}

#[test]
fn test_reorder_is_input_order_independent() {
    let mut reversed = four_frames();
    reversed.reverse();
    for strategy in [ReorderStrategy::MinFrameNumber, ReorderStrategy::WestMost, ReorderStrategy::EastMost] {
        let a = reorder_frames(&four_frames(), strategy).expect("single pass");
        let b = reorder_frames(&reversed, strategy).expect("single pass");
        assert_eq!(ids(&a), ids(&b));
    }
}

#[test]
fn test_reorder_across_antimeridian() {
    let crossing = MultiPolygon(vec![
        Rect::new((179.5, 50.0), (180.0, 51.0)).to_polygon(),
        Rect::new((-180.0, 50.0), (-179.5, 51.0)).to_polygon(),
    ]);
    assert_eq!(west_bound(&crossing), Some(179.5 - 360.0));

    for pass in [OrbitPass::Ascending, OrbitPass::Descending] {
        let frames = vec![
            frame(7, 20, rect(-179.8, 50.0, -179.0, 51.0), pass),
            frame(3, 10, crossing.clone(), pass),
        ];
        let west = reorder_frames(&frames, ReorderStrategy::WestMost).expect("single pass");
        assert_eq!(ids(&west), vec![10, 20]);

        let east = reorder_frames(&frames, ReorderStrategy::EastMost).expect("single pass");
        assert_eq!(ids(&east), vec![20, 10]);
    }
}

#[test]
fn test_orbit_pass_strategy() {
    assert_eq!(ReorderStrategy::for_orbit_pass(OrbitPass::Ascending), ReorderStrategy::EastMost);
    assert_eq!(ReorderStrategy::for_orbit_pass(OrbitPass::Descending), ReorderStrategy::WestMost);
}

fn unit_grid() -> OwnershipMap {
    let gt = GeoTransform::from_gdal([0.0, 1.0, 0.0, 10.0, 0.0, -1.0]);
    OwnershipMap::from_parts(Array2::zeros((10, 10)), gt)
}

#[test]
fn test_burn_last_write_wins() {
    let mut ownership = unit_grid();
    ownership.burn(1, &rect(0.0, 0.0, 6.0, 10.0)).expect("burn");
    ownership.burn(2, &rect(4.0, 0.0, 10.0, 10.0)).expect("burn");

    assert_eq!(ownership.data[[5, 3]], 1);
    assert_eq!(ownership.data[[5, 4]], 2);
    assert_eq!(ownership.data[[5, 5]], 2);
    assert_eq!(ownership.data[[5, 9]], 2);
    assert_eq!(ownership.included_frames(), vec![1, 2]);

    ownership.burn(3, &rect(0.0, 0.0, 10.0, 10.0)).expect("burn");
    assert_eq!(ownership.included_frames(), vec![3]);
}

#[test]
fn test_burn_rejects_oversized_frame_id() {
    let mut ownership = unit_grid();
    let result = ownership.burn(70_000, &rect(0.0, 0.0, 1.0, 1.0));
    assert!(matches!(result, Err(DispError::InvalidInput(_))));
}

#[test]
fn test_composite_uses_final_ownership() {
    let mut ownership = unit_grid();
    ownership.burn(1, &rect(0.0, 0.0, 6.0, 10.0)).expect("burn");
    ownership.burn(2, &rect(4.0, 0.0, 8.0, 10.0)).expect("burn");

    // Data order differs from burn order
    let frames = vec![(2, Array2::from_elem((10, 10), 2.0)), (1, Array2::from_elem((10, 10), 1.0))];
    let mosaic = composite(&ownership, &frames).expect("composite");

    assert_eq!(mosaic[[0, 0]], 1.0);
    assert_eq!(mosaic[[0, 3]], 1.0);
    assert_eq!(mosaic[[0, 4]], 2.0);
    assert_eq!(mosaic[[0, 7]], 2.0);
    assert!(mosaic[[0, 8]].is_nan());
    assert!(mosaic[[9, 9]].is_nan());
}

#[test]
fn test_composite_shape_mismatch() {
    let ownership = unit_grid();
    let frames = vec![(1, Array2::from_elem((5, 5), 1.0))];
    assert!(matches!(composite(&ownership, &frames), Err(DispError::Processing(_))));
}

struct UnreachableLoader;

impl GranuleLoader for UnreachableLoader {
    fn load_granule(&self, granule: &Granule) -> DispResult<DisplacementRaster> {
        Err(DispError::Processing(format!("{} should not be read", granule.scene_name)))
    }
}

#[test]
fn test_metadata_tile_without_granules() {
    let dir = tempfile::tempdir().expect("tempdir");
    let out_path = dir.path().join("METADATA_ASCENDING_E000N04.tif");
    let bbox = BoundingBox::new(0, 0, 4, 4).expect("bbox");
    let source = StaticGranules::new(Vec::new());

    let result = create_metadata_tile(&bbox, &four_frames(), &source, &UnreachableLoader, 50_000.0, &out_path)
        .expect("frames without granules are skipped");
    assert!(result.is_none());
    assert!(!out_path.exists());
}
