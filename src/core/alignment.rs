use crate::core::spanning_set::{find_needed_granules, SelectionStrategy};
use crate::io::catalog::GranuleSource;
use crate::io::raster::{GranuleLoader, ReadWindow};
use crate::types::{within_one_day, DatePair, DispError, DispResult, DisplacementRaster};
use chrono::{DateTime, Utc};
use ndarray::Array2;

/// Rasters of one frame sharing a single reference date, ordered by secondary date
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedStack {
    pub reference_date: DateTime<Utc>,
    pub rasters: Vec<DisplacementRaster>,
}

impl AlignedStack {
    pub fn len(&self) -> usize {
        self.rasters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rasters.is_empty()
    }

    pub fn first(&self) -> Option<&DisplacementRaster> {
        self.rasters.first()
    }

    pub fn last(&self) -> Option<&DisplacementRaster> {
        self.rasters.last()
    }
}

/// Fail unless every reference date after the earliest is also some secondary date
pub fn check_connected_network<T: DatePair>(items: &[T]) -> DispResult<()> {
    let mut reference_dates: Vec<DateTime<Utc>> = items.iter().map(|i| i.reference_date()).collect();
    reference_dates.sort();
    reference_dates.dedup();
    let secondary_dates: Vec<DateTime<Utc>> = items.iter().map(|i| i.secondary_date()).collect();

    for reference_date in reference_dates.iter().skip(1) {
        if !secondary_dates.iter().any(|s| within_one_day(*reference_date, *s)) {
            return Err(DispError::DisconnectedNetwork(format!(
                "No granule ends at reference date {}",
                reference_date
            )));
        }
    }
    Ok(())
}

/// Zero-fill NaN pixels in rasters that are nearly as complete as the best one
///
/// A raster is filled when its valid pixel count divided by the highest valid
/// count in the stack exceeds `minimum_valid_fraction`.
pub fn replace_nans_with_zeros(stack: &mut [DisplacementRaster], minimum_valid_fraction: f64) {
    let counts: Vec<usize> = stack.iter().map(DisplacementRaster::valid_pixel_count).collect();
    let best = counts.iter().copied().max().unwrap_or(0);
    if best == 0 {
        return;
    }

    for (raster, count) in stack.iter_mut().zip(counts) {
        let fraction = count as f64 / best as f64;
        if fraction > minimum_valid_fraction {
            raster.data.mapv_inplace(|v| if v.is_nan() { 0.0 } else { v });
        } else {
            log::debug!(
                "Leaving NaNs in raster ending {} ({:.2} of best valid count)",
                raster.secondary_date,
                fraction
            );
        }
    }
}

/// Re-reference a connected stack to a single epoch
///
/// When `start_date` is not after the earliest reference date a zero raster at
/// that date is prepended, so the output starts at the true epoch.
pub fn align_to_common_reference_date(
    mut stack: Vec<DisplacementRaster>,
    start_date: DateTime<Utc>,
) -> DispResult<AlignedStack> {
    if stack.is_empty() {
        return Err(DispError::DataAvailability("Cannot align an empty stack".to_string()));
    }
    stack.sort_by_key(|r| r.secondary_date);
    check_connected_network(&stack)?;

    let shape = stack[0].dim();
    if let Some(odd) = stack.iter().find(|r| r.dim() != shape) {
        return Err(DispError::InvalidFormat(format!(
            "Raster ending {} has shape {:?}, expected {:?} for frame {}",
            odd.secondary_date,
            odd.dim(),
            shape,
            odd.frame_id
        )));
    }

    let earliest = &stack[0];
    if start_date <= earliest.reference_date {
        let zero = DisplacementRaster {
            data: Array2::zeros(earliest.dim()),
            secondary_date: earliest.reference_date,
            ..earliest.clone()
        };
        stack.insert(0, zero);
    }

    // State: outputs so far, running correction, previous input's reference date
    let initial = stack[0].data.mapv(|v| -v);
    let initial_reference = stack[0].reference_date;
    let (aligned, _, _) = stack.into_iter().fold(
        (Vec::<DisplacementRaster>::new(), initial, initial_reference),
        |(mut out, mut correction, previous_reference), raster| {
            if !within_one_day(raster.reference_date, previous_reference) {
                if let Some(previous) = out.last() {
                    correction = previous.data.clone();
                }
            }
            let reference = raster.reference_date;
            let corrected = &raster.data + &correction;
            out.push(DisplacementRaster { data: corrected, ..raster });
            (out, correction, reference)
        },
    );

    let reference_date = aligned[0].secondary_date;
    let rasters = aligned
        .into_iter()
        .map(|r| DisplacementRaster { reference_date, ..r })
        .collect();

    Ok(AlignedStack { reference_date, rasters })
}

/// Load a frame's displacement stack for a date window and align it to its earliest reference
///
/// With a `read_window` each granule is only read where it covers that area.
#[allow(clippy::too_many_arguments)]
pub fn load_sw_disp_stack(
    source: &dyn GranuleSource,
    loader: &dyn GranuleLoader,
    frame_id: u32,
    begin: DateTime<Utc>,
    end: DateTime<Utc>,
    strategy: SelectionStrategy,
    gap_fill_threshold: Option<f64>,
    read_window: Option<&ReadWindow>,
) -> DispResult<AlignedStack> {
    let granules = find_needed_granules(source, frame_id, begin, end, strategy)?;
    if granules.is_empty() {
        return Err(DispError::DataAvailability(format!(
            "No granules for frame {} between {} and {}",
            frame_id, begin, end
        )));
    }

    let mut rasters = granules
        .iter()
        .map(|g| {
            log::debug!("Loading granule {}", g.scene_name);
            match read_window {
                Some(window) => loader.load_granule_window(g, window),
                None => loader.load_granule(g),
            }
        })
        .collect::<DispResult<Vec<_>>>()?;

    if let Some(threshold) = gap_fill_threshold {
        replace_nans_with_zeros(&mut rasters, threshold);
    }

    let start_date = rasters
        .iter()
        .map(|r| r.reference_date)
        .min()
        .ok_or_else(|| DispError::DataAvailability(format!("No rasters loaded for frame {}", frame_id)))?;
    align_to_common_reference_date(rasters, start_date)
}
