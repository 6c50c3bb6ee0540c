//! Configuration types for filter pipelines.
//!
//! A pipeline file lists stages in execution order, each tagged with its
//! registry name:
//!
//! ```yaml
//! stream: false
//! stages:
//!   - type: filters.expression
//!     expression: '{"Z": {"$gt": 0}}'
//!   - type: filters.planefit
//!     knn: 8
//!     threads: 4
//!   - type: filters.mad
//!     dimension: PlaneFit
//!     multiplier: 3.0
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::filters::decimation::DecimationOptions;
use crate::filters::expression::ExpressionOptions;
use crate::filters::mad::MadOptions;
use crate::filters::planefit::PlaneFitOptions;

/// Options for one stage, tagged by filter name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StageOptions {
    #[serde(rename = "filters.decimation")]
    Decimation(DecimationOptions),

    #[serde(rename = "filters.mad")]
    Mad(MadOptions),

    #[serde(rename = "filters.planefit")]
    PlaneFit(PlaneFitOptions),

    #[serde(rename = "filters.expression")]
    Expression(ExpressionOptions),
}

/// Main pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Stages in execution order.
    #[serde(default)]
    pub stages: Vec<StageOptions>,

    /// Push points through the stages one at a time instead of in bulk.
    #[serde(default)]
    pub stream: bool,
}

impl PipelineConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
