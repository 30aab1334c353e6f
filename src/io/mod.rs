//! I/O modules for granule catalogs, frame footprints, rasters and credentials

pub mod catalog;
pub mod credentials;
pub mod frames;
pub mod raster;

pub use catalog::{CmrClient, Granule, GranuleSource, StaticGranules};
pub use credentials::{CredentialProvider, StaticCredentialProvider, TemporaryCredentialProvider};
pub use frames::{Frame, FrameFilter, FrameIndex};
pub use raster::{GranuleLoader, NetcdfGranuleLoader};
