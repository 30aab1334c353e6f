//! opera_disp_tms: displacement and velocity tiles from OPERA DISP granule stacks
//!
//! Granules of each frame are selected from the CMR catalog, re-referenced to a
//! common epoch, reduced to a measurement and mosaicked onto web mercator tiles
//! through a frame ownership raster.

pub mod config;
pub mod core;
pub mod io;
pub mod types;

// Re-export main types and functions for easier access
pub use config::PipelineConfig;
pub use types::{BoundingBox, DispError, DispResult, DisplacementRaster, GeoTransform, OrbitPass};

pub use crate::core::{MeasurementType, Pipeline, ScaleBand};
pub use io::{CmrClient, FrameIndex, Granule, GranuleSource, NetcdfGranuleLoader};
