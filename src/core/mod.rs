//! Core displacement stack processing modules

pub mod alignment;
pub mod measurement;
pub mod mosaic;
pub mod naming;
pub mod pipeline;
pub mod spanning_set;
pub mod tile_map;

// Re-export main types
pub use alignment::{align_to_common_reference_date, AlignedStack};
pub use measurement::{compute_measurement, MeasurementType, ScaleBand};
pub use mosaic::{reorder_frames, FrameMeta, OwnershipMap, ReorderStrategy};
pub use pipeline::{divide_bbox_into_tiles, Pipeline};
pub use spanning_set::{GreedyBackwardWalk, SelectionStrategy, SpanningStrategy};
