//! Granule selection for a secondary-date window
//!
//! A frame's catalog holds many overlapping products; reconstructing displacement
//! over a window only needs a chain whose reference dates link back to the
//! earliest reference in the window.

use crate::io::catalog::{eliminate_duplicates, Granule, GranuleSource};
use crate::types::{within_one_day, DispError, DispResult};
use chrono::{DateTime, Utc};
use std::str::FromStr;

/// Chooses a connected subset of one frame's granules
pub trait SpanningStrategy {
    fn select(&self, granules: &[Granule]) -> DispResult<Vec<Granule>>;
}

/// Walk backwards from the newest granule, always jumping to the earliest reachable reference
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyBackwardWalk;

impl SpanningStrategy for GreedyBackwardWalk {
    fn select(&self, granules: &[Granule]) -> DispResult<Vec<Granule>> {
        restrict_to_spanning_set(granules)
    }
}

/// Minimum chain of granules needed to reconstruct displacement
pub fn restrict_to_spanning_set(granules: &[Granule]) -> DispResult<Vec<Granule>> {
    let Some(first) = granules.first() else {
        return Ok(Vec::new());
    };
    if granules.iter().any(|g| g.frame_id != first.frame_id) {
        return Err(DispError::InvalidInput("Spanning set granules must be from the same frame".to_string()));
    }

    let mut sorted = granules.to_vec();
    sorted.sort_by_key(|g| g.secondary_date);

    let first_reference_date = sorted[0].reference_date;
    let newest = sorted[sorted.len() - 1].clone();
    let mut reference_date = newest.reference_date;
    let mut spanning = vec![newest];

    while !within_one_day(reference_date, first_reference_date) {
        let next = sorted
            .iter()
            .filter(|g| within_one_day(g.secondary_date, reference_date))
            .min_by_key(|g| g.reference_date)
            .ok_or_else(|| {
                DispError::DisconnectedNetwork(format!(
                    "Granules do not form a spanning set: nothing ends at {}",
                    reference_date
                ))
            })?;
        if within_one_day(next.reference_date, reference_date) {
            return Err(DispError::DisconnectedNetwork(format!(
                "Granules do not form a spanning set: no earlier reference reaches {}",
                reference_date
            )));
        }
        reference_date = next.reference_date;
        spanning.push(next.clone());
    }

    spanning.sort_by_key(|g| g.secondary_date);
    Ok(spanning)
}

/// How granules inside the date window are picked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    #[default]
    Spanning,
    All,
}

impl FromStr for SelectionStrategy {
    type Err = DispError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spanning" => Ok(SelectionStrategy::Spanning),
            "all" => Ok(SelectionStrategy::All),
            _ => Err(DispError::InvalidInput(format!(
                "Invalid strategy: {}. Must be \"spanning\" or \"all\"",
                s
            ))),
        }
    }
}

/// Granules of a frame with secondary dates inside `[begin, end]`, sorted by secondary date
pub fn find_needed_granules(
    source: &dyn GranuleSource,
    frame_id: u32,
    begin: DateTime<Utc>,
    end: DateTime<Utc>,
    strategy: SelectionStrategy,
) -> DispResult<Vec<Granule>> {
    let full_stack = source.find_granules_for_frame(frame_id)?;
    let in_window: Vec<Granule> = full_stack
        .into_iter()
        .filter(|g| begin <= g.secondary_date && g.secondary_date <= end)
        .collect();
    let granules = eliminate_duplicates(&in_window);

    let mut needed = match strategy {
        SelectionStrategy::Spanning => GreedyBackwardWalk.select(&granules)?,
        SelectionStrategy::All => granules,
    };
    needed.sort_by_key(|g| g.secondary_date);

    log::info!(
        "Found {} granules for frame {} between {} and {}",
        needed.len(),
        frame_id,
        begin,
        end
    );
    Ok(needed)
}
