use approx::assert_abs_diff_eq;
use chrono::{DateTime, TimeZone, Utc};
use ndarray::{array, Array2};
use opera_disp_tms::core::measurement::{
    compute_measurement, linear_regression_leastsquares, parallel_linear_regression, MeasurementType, ScaleBand,
};
use opera_disp_tms::{DispError, DisplacementRaster, GeoTransform};

fn raster(data: Array2<f64>, secondary: DateTime<Utc>) -> DisplacementRaster {
    DisplacementRaster {
        data,
        frame_id: 8882,
        reference_date: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
        secondary_date: secondary,
        geo_transform: GeoTransform::from_gdal([0.0, 30.0, 0.0, 0.0, 0.0, -30.0]),
        spatial_ref: String::new(),
        reference_point: None,
    }
}

#[test]
fn test_linear_regression_leastsquares() {
    let x: Vec<f64> = (0..10).map(|v| v as f64).collect();
    let y = x.clone();

    let (slope, intercept) = linear_regression_leastsquares(&x, &y);
    assert_abs_diff_eq!(slope, 1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(intercept, 0.0, epsilon = 1e-6);

    let flipped: Vec<f64> = x.iter().map(|v| -v).collect();
    let shifted: Vec<f64> = y.iter().map(|v| v + 2.0).collect();
    let (slope, intercept) = linear_regression_leastsquares(&flipped, &shifted);
    assert_abs_diff_eq!(slope, -1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(intercept, 2.0, epsilon = 1e-6);

    let (slope, intercept) = linear_regression_leastsquares(&[0.0, 1e-6], &[0.0, 1e-6]);
    assert_abs_diff_eq!(slope, 1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(intercept, 0.0, epsilon = 1e-6);
}

#[test]
fn test_linear_regression_degenerate() {
    let y: Vec<f64> = (0..10).map(|v| v as f64).collect();
    let (slope, intercept) = linear_regression_leastsquares(&[1.0; 10], &y);
    assert!(slope.is_nan());
    assert!(intercept.is_nan());

    let (slope, intercept) = linear_regression_leastsquares(&[3.0], &[1.0]);
    assert!(slope.is_nan() && intercept.is_nan());

    let mut x = y.clone();
    x[4] = f64::NAN;
    let (slope, intercept) = linear_regression_leastsquares(&x, &y);
    assert_abs_diff_eq!(slope, 1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(intercept, 0.0, epsilon = 1e-6);
}

#[test]
fn test_parallel_linear_regression() {
    let x = [0.0, 1.0, 2.0];
    let images: Vec<Array2<f64>> = x.iter().map(|v| Array2::from_elem((5, 5), *v)).collect();
    let refs: Vec<&Array2<f64>> = images.iter().collect();

    let (slope, intercept) = parallel_linear_regression(&x, &refs).expect("regression");
    assert_eq!(slope.dim(), (5, 5));
    for (s, b) in slope.iter().zip(intercept.iter()) {
        assert_abs_diff_eq!(*s, 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(*b, 0.0, epsilon = 1e-6);
    }
}

#[test]
fn test_parallel_linear_regression_mismatched_input() {
    let a = Array2::<f64>::zeros((2, 2));
    let b = Array2::<f64>::zeros((3, 2));
    assert!(matches!(
        parallel_linear_regression(&[0.0, 1.0], &[&a, &b]),
        Err(DispError::InvalidInput(_))
    ));
    assert!(matches!(parallel_linear_regression(&[0.0], &[&a, &a]), Err(DispError::InvalidInput(_))));
}

#[test]
fn test_secant_velocity_round_trip() {
    let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    let middle = Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
    let stack = vec![
        raster(array![[0.0, 0.5, 1.0]], start),
        raster(array![[9.0, 9.0, 9.0]], middle),
        raster(array![[0.1, -0.5, f64::NAN]], end),
    ];

    let result = compute_measurement(&stack, MeasurementType::SecantVelocity).expect("secant velocity");
    let years = (end - start).num_days() as f64 / 365.25;
    assert_abs_diff_eq!(result.data[[0, 0]], 0.1 / years, epsilon = 1e-9);
    assert_abs_diff_eq!(result.data[[0, 1]], -1.0 / years, epsilon = 1e-9);
    assert!(result.data[[0, 2]].is_nan());
    assert_eq!(result.secondary_date, end);
    assert_eq!(result.frame_id, 8882);
}

#[test]
fn test_displacement_and_velocity() {
    let d = |m| Utc.with_ymd_and_hms(2020, m, 1, 0, 0, 0).unwrap();
    let years = |m| (d(m) - d(1)).num_days() as f64 / 365.25;
    let nan = f64::NAN;
    // Second pixel misses the middle date; third pixel only has the first date
    let stack = vec![
        raster(array![[0.0, 0.0, 0.3]], d(1)),
        raster(array![[0.5 * years(5), nan, nan]], d(5)),
        raster(array![[0.5 * years(9), 0.5 * years(9), nan]], d(9)),
    ];

    let displacement = compute_measurement(&stack, MeasurementType::Displacement).expect("displacement");
    assert_abs_diff_eq!(displacement.data[[0, 0]], 0.5 * years(9), epsilon = 1e-12);
    assert!(displacement.data[[0, 2]].is_nan());

    let velocity = compute_measurement(&stack, MeasurementType::Velocity).expect("velocity");
    assert_abs_diff_eq!(velocity.data[[0, 0]], 0.5, epsilon = 1e-9);
    assert_abs_diff_eq!(velocity.data[[0, 1]], 0.5, epsilon = 1e-9);
    assert!(velocity.data[[0, 2]].is_nan());
    assert_eq!(velocity.secondary_date, d(9));

    let secant = compute_measurement(&stack, MeasurementType::SecantVelocity).expect("secant velocity");
    assert_abs_diff_eq!(secant.data[[0, 0]], 0.5, epsilon = 1e-9);
    assert_abs_diff_eq!(secant.data[[0, 1]], 0.5, epsilon = 1e-9);
    assert!(secant.data[[0, 2]].is_nan());

    assert!(matches!(
        compute_measurement(&[], MeasurementType::Velocity),
        Err(DispError::DataAvailability(_))
    ));
}

#[test]
fn test_scale_clipping() {
    let band = ScaleBand::new(-0.25, 0.25);
    let mut image = array![[-1.0, -0.25, 0.1], [0.25, 3.0, f64::NAN]];
    band.clip(&mut image);
    assert_eq!(image[[0, 0]], -0.25);
    assert_eq!(image[[0, 1]], -0.25);
    assert_eq!(image[[0, 2]], 0.1);
    assert_eq!(image[[1, 0]], 0.25);
    assert_eq!(image[[1, 1]], 0.25);
    assert!(image[[1, 2]].is_nan());
}
