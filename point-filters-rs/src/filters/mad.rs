//! Median absolute deviation outlier rejection.
//!
//! Over one buffer, with `m` the exact median of the chosen dimension and
//! `mad` its raw median absolute deviation, a point is an outlier iff
//!
//! ```text
//! |x - m| > multiplier * mad_multiplier * mad
//! ```
//!
//! `mad_multiplier` defaults to 1.4826, which makes the scaled MAD a
//! consistent estimator of the standard deviation for normal data.
//! The filter needs the whole distribution, so it has no streaming mode.

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::core::buffer::{DimId, PointBuffer, PointBufferSet, PointLayout};
use crate::core::stats::{median_absolute_deviation, NORMAL_CONSISTENCY};
use crate::stage::{Filter, Result, StageError};

use super::{flag_value, register_flag, resolve_flag};

/// Registry name of the MAD filter.
pub const NAME: &str = "filters.mad";

/// Options recognized by the MAD filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MadOptions {
    /// Dimension whose values are tested. Required.
    #[serde(default)]
    pub dimension: Option<String>,

    /// Fence width in units of the scaled MAD.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Consistency constant applied to the raw MAD.
    #[serde(default = "default_mad_multiplier")]
    pub mad_multiplier: f64,

    /// Write 1 to this dimension for outliers instead of removing them.
    #[serde(default)]
    pub flag: Option<String>,
}

fn default_multiplier() -> f64 {
    3.0
}

fn default_mad_multiplier() -> f64 {
    NORMAL_CONSISTENCY
}

impl Default for MadOptions {
    fn default() -> Self {
        Self {
            dimension: None,
            multiplier: default_multiplier(),
            mad_multiplier: default_mad_multiplier(),
            flag: None,
        }
    }
}

/// Removes or flags points far from the median of one dimension.
#[derive(Debug)]
pub struct MadFilter {
    dimension: String,
    multiplier: f64,
    mad_multiplier: f64,
    flag: Option<String>,
    dim: Option<DimId>,
}

impl MadFilter {
    /// Validate options.
    ///
    /// # Errors
    ///
    /// Fails if `dimension` is missing or either multiplier is negative or
    /// not finite.
    pub fn configure(options: MadOptions) -> Result<Self> {
        let dimension = match options.dimension {
            Some(name) if !name.is_empty() => name,
            _ => {
                return Err(StageError::MissingOption {
                    stage: NAME,
                    option: "dimension",
                })
            }
        };

        for (option, value) in [
            ("multiplier", options.multiplier),
            ("mad_multiplier", options.mad_multiplier),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(StageError::InvalidOption {
                    stage: NAME,
                    option,
                    reason: format!("must be a non-negative number, got {}", value),
                });
            }
        }

        if options.flag.as_deref().is_some_and(str::is_empty) {
            return Err(StageError::InvalidOption {
                stage: NAME,
                option: "flag",
                reason: "dimension name is empty".to_string(),
            });
        }

        Ok(Self {
            dimension,
            multiplier: options.multiplier,
            mad_multiplier: options.mad_multiplier,
            flag: options.flag,
            dim: None,
        })
    }

    /// Outlier threshold for a set of values, with its median.
    fn fence(&self, values: &[f64]) -> Option<(f64, f64)> {
        let est = median_absolute_deviation(values)?;
        let threshold = self.multiplier * est.scaled(self.mad_multiplier);

        if est.mad == 0.0 {
            let deviating = values.iter().filter(|&&v| v != est.median).count();
            if deviating > 0 {
                warn!(
                    "{}: MAD of '{}' is zero; {} points differ from the median {} and are outliers",
                    NAME, self.dimension, deviating, est.median
                );
            }
        }

        info!(
            "{}: '{}' median {} MAD {} threshold {}",
            NAME, self.dimension, est.median, est.mad, threshold
        );
        Some((est.median, threshold))
    }
}

impl Filter for MadFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn prepare(&mut self, layout: &mut PointLayout) -> Result<()> {
        let dim = layout
            .find(&self.dimension)
            .ok_or_else(|| StageError::MissingDimension {
                stage: NAME,
                dimension: self.dimension.clone(),
            })?;
        self.dim = Some(dim);
        register_flag(layout, self.flag.as_deref());
        Ok(())
    }

    fn run(&mut self, mut buffer: PointBuffer) -> Result<PointBufferSet> {
        let dim = self
            .dim
            .filter(|&dim| buffer.layout().find(&self.dimension) == Some(dim))
            .ok_or_else(|| StageError::MissingDimension {
                stage: NAME,
                dimension: self.dimension.clone(),
            })?;
        let flag = resolve_flag(NAME, self.flag.as_deref(), buffer.layout())?;

        let Some((median, threshold)) = self.fence(buffer.column(dim)) else {
            return Ok(vec![buffer]);
        };

        let keep: Vec<bool> = buffer
            .column(dim)
            .iter()
            .map(|&v| (v - median).abs() <= threshold)
            .collect();
        let outliers = keep.iter().filter(|&&k| !k).count();

        if let Some(flag) = flag {
            let values = keep.iter().map(|&k| flag_value(k)).collect();
            buffer
                .replace_column(flag, values)
                .map_err(|source| StageError::Buffer { stage: NAME, source })?;
            info!("{}: flagged {} of {} points", NAME, outliers, buffer.len());
            return Ok(vec![buffer]);
        }

        let kept: Vec<usize> = keep
            .iter()
            .enumerate()
            .filter_map(|(id, &k)| k.then_some(id))
            .collect();
        info!("{}: removed {} of {} points", NAME, outliers, buffer.len());
        Ok(vec![buffer.select(&kept)])
    }
}
