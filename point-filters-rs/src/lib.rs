//! Point cloud filter stages with a shared bulk/streaming execution contract.
//!
//! This crate provides:
//! - A columnar point buffer with a cached KD-tree index
//! - A stage lifecycle (configure, prepare, ready, execute) with bulk and
//!   point-at-a-time streaming execution
//! - Decimation, MAD outlier, plane-fit and expression filters
//! - A sequential pipeline driver configured from YAML
//!
//! # Example
//!
//! ```no_run
//! use point_filters::{core::loaders::load_points_csv, Pipeline, PipelineConfig};
//!
//! let config = PipelineConfig::from_yaml("pipeline.yaml").unwrap();
//! let mut pipeline = Pipeline::from_config(&config).unwrap();
//! let buffer = load_points_csv("points.csv").unwrap();
//! let filtered = pipeline.run(buffer, config.stream).unwrap();
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod expression;
pub mod filters;
pub mod pipeline;
pub mod stage;

pub use config::{PipelineConfig, StageOptions};
pub use core::buffer::{PointBuffer, PointLayout};
pub use pipeline::Pipeline;
pub use stage::{Filter, Stage, StageError, StageState, Streamable};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
