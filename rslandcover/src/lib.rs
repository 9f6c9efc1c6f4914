pub mod classification;
pub mod collect;
pub mod commons;
pub mod config;
pub mod error;
pub mod geo_core;
pub mod raster;
pub mod synthetic;

pub use classification::pipeline::{Pipeline, PipelineReport};
pub use config::PipelineConfig;
pub use error::{ClassificationError, Result};
