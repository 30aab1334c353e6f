use crate::types::{DispError, DispResult, DisplacementImage, DisplacementRaster};
use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const DAYS_PER_YEAR: f64 = 365.25;

/// Quantity derived from an aligned displacement stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasurementType {
    /// Cumulative displacement at the last date
    Displacement,
    /// Slope between the first and last dates
    SecantVelocity,
    /// Least-squares slope over every date
    Velocity,
}

impl MeasurementType {
    pub const ALL: [MeasurementType; 3] =
        [MeasurementType::Displacement, MeasurementType::SecantVelocity, MeasurementType::Velocity];

    pub fn as_str(&self) -> &'static str {
        match self {
            MeasurementType::Displacement => "displacement",
            MeasurementType::SecantVelocity => "secant_velocity",
            MeasurementType::Velocity => "velocity",
        }
    }

    pub fn units(&self) -> &'static str {
        match self {
            MeasurementType::Displacement => "m",
            MeasurementType::SecantVelocity | MeasurementType::Velocity => "m/yr",
        }
    }
}

impl std::fmt::Display for MeasurementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MeasurementType {
    type Err = DispError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MeasurementType::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| {
                DispError::InvalidInput(format!(
                    "Measurement type must be one of displacement, secant_velocity, velocity; got \"{}\"",
                    s
                ))
            })
    }
}

/// Display range for a measurement, in its units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleBand {
    pub min: f64,
    pub max: f64,
}

impl ScaleBand {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn validate(&self) -> DispResult<()> {
        if !(self.min < self.max) {
            return Err(DispError::InvalidInput(format!(
                "Scale band minimum ({}) must be below maximum ({})",
                self.min, self.max
            )));
        }
        Ok(())
    }

    /// Clamp a value to the band; NaN stays NaN
    pub fn clip_value(&self, value: f64) -> f64 {
        if value.is_nan() {
            value
        } else {
            value.clamp(self.min, self.max)
        }
    }

    pub fn clip(&self, image: &mut DisplacementImage) {
        image.mapv_inplace(|v| self.clip_value(v));
    }
}

/// Years elapsed since the earliest date, in input order
pub fn get_years_since_start(dates: &[DateTime<Utc>]) -> Vec<f64> {
    let Some(start) = dates.iter().min().copied() else {
        return Vec::new();
    };
    dates
        .iter()
        .map(|d| (*d - start).num_days() as f64 / DAYS_PER_YEAR)
        .collect()
}

/// Ordinary least-squares fit of `y = slope * x + intercept`
///
/// Points where either coordinate is NaN are dropped. Fewer than two points,
/// or no spread in `x`, yields `(NaN, NaN)`.
pub fn linear_regression_leastsquares(x: &[f64], y: &[f64]) -> (f64, f64) {
    let points: Vec<(f64, f64)> = x
        .iter()
        .zip(y.iter())
        .filter(|(xi, yi)| !xi.is_nan() && !yi.is_nan())
        .map(|(xi, yi)| (*xi, *yi))
        .collect();

    if points.len() < 2 {
        return (f64::NAN, f64::NAN);
    }

    let n = points.len() as f64;
    let x_mean = points.iter().map(|p| p.0).sum::<f64>() / n;
    let y_mean = points.iter().map(|p| p.1).sum::<f64>() / n;

    let mut covariance = 0.0;
    let mut variance = 0.0;
    for (xi, yi) in &points {
        covariance += (xi - x_mean) * (yi - y_mean);
        variance += (xi - x_mean) * (xi - x_mean);
    }
    covariance /= n;
    variance /= n;

    if variance == 0.0 {
        return (f64::NAN, f64::NAN);
    }

    let slope = covariance / variance;
    (slope, y_mean - slope * x_mean)
}

/// Per-pixel regression of a stack of equally shaped images against `x`
///
/// Returns `(slope, intercept)` images.
pub fn parallel_linear_regression(
    x: &[f64],
    images: &[&DisplacementImage],
) -> DispResult<(Array2<f64>, Array2<f64>)> {
    if x.len() != images.len() {
        return Err(DispError::InvalidInput(format!(
            "Regression needs one x value per image, got {} values for {} images",
            x.len(),
            images.len()
        )));
    }
    let Some(first) = images.first() else {
        return Err(DispError::DataAvailability("Regression needs at least one image".to_string()));
    };
    let (height, width) = first.dim();
    if images.iter().any(|img| img.dim() != (height, width)) {
        return Err(DispError::InvalidInput("All images in a regression must share one shape".to_string()));
    }

    let fit_row = |i: usize| -> Vec<(f64, f64)> {
        let mut y = vec![0.0; images.len()];
        (0..width)
            .map(|j| {
                for (k, img) in images.iter().enumerate() {
                    y[k] = img[[i, j]];
                }
                linear_regression_leastsquares(x, &y)
            })
            .collect()
    };

    #[cfg(feature = "parallel")]
    let rows: Vec<Vec<(f64, f64)>> = {
        use rayon::prelude::*;
        (0..height).into_par_iter().map(fit_row).collect()
    };
    #[cfg(not(feature = "parallel"))]
    let rows: Vec<Vec<(f64, f64)>> = (0..height).map(fit_row).collect();

    let mut slope = Array2::from_elem((height, width), f64::NAN);
    let mut intercept = Array2::from_elem((height, width), f64::NAN);
    for (i, row) in rows.into_iter().enumerate() {
        for (j, (s, b)) in row.into_iter().enumerate() {
            slope[[i, j]] = s;
            intercept[[i, j]] = b;
        }
    }

    Ok((slope, intercept))
}

/// Velocity image from regression over the given rasters' secondary dates
fn regression_velocity(rasters: &[&DisplacementRaster]) -> DispResult<DisplacementImage> {
    let dates: Vec<DateTime<Utc>> = rasters.iter().map(|r| r.secondary_date).collect();
    let years = get_years_since_start(&dates);
    let images: Vec<&DisplacementImage> = rasters.iter().map(|r| &r.data).collect();
    let (slope, _) = parallel_linear_regression(&years, &images)?;
    Ok(slope)
}

/// Derive a measurement from an aligned stack sorted by secondary date
///
/// The result keeps the tags and grid of the last raster.
pub fn compute_measurement(
    stack: &[DisplacementRaster],
    measurement: MeasurementType,
) -> DispResult<DisplacementRaster> {
    let Some(last) = stack.last() else {
        return Err(DispError::DataAvailability(format!("Cannot compute {} from an empty stack", measurement)));
    };

    log::debug!("Computing {} from {} rasters for frame {}", measurement, stack.len(), last.frame_id);

    let data = match measurement {
        MeasurementType::Displacement => last.data.clone(),
        MeasurementType::SecantVelocity => {
            let first = &stack[0];
            regression_velocity(&[first, last])?
        }
        MeasurementType::Velocity => {
            let all: Vec<&DisplacementRaster> = stack.iter().collect();
            regression_velocity(&all)?
        }
    };

    Ok(last.with_data(data))
}
