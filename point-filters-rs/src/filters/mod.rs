//! Built-in filter stages.
//!
//! - [`decimation`]: keep every n-th point
//! - [`mad`]: reject outliers by median absolute deviation
//! - [`planefit`]: score local planarity from k nearest neighbors
//! - [`expression`]: keep points matching a predicate

pub mod decimation;
pub mod expression;
pub mod mad;
pub mod planefit;

pub use decimation::DecimationFilter;
pub use expression::ExpressionFilter;
pub use mad::MadFilter;
pub use planefit::PlaneFitFilter;

use crate::core::buffer::{DimId, PointLayout};
use crate::stage::{Result, StageError};

/// Registers the optional flag dimension a filter writes instead of removing points.
fn register_flag(layout: &mut PointLayout, flag: Option<&str>) {
    if let Some(name) = flag {
        layout.register_dimension(name);
    }
}

/// Resolves the flag dimension in the layout being processed.
///
/// `Ok(None)` means the filter removes points. An error means a flag was
/// configured but the buffer never received the column from `prepare`.
fn resolve_flag(
    stage: &'static str,
    flag: Option<&str>,
    layout: &PointLayout,
) -> Result<Option<DimId>> {
    match flag {
        None => Ok(None),
        Some(name) => layout
            .find(name)
            .map(Some)
            .ok_or_else(|| StageError::MissingDimension {
                stage,
                dimension: name.to_string(),
            }),
    }
}

/// Flag value for a point: 0 when kept, 1 when it would have been removed.
#[inline]
fn flag_value(keep: bool) -> f64 {
    if keep {
        0.0
    } else {
        1.0
    }
}

/// Checks that every dimension of the prepared layout has the same id in `layout`.
fn check_layout(stage: &'static str, prepared: &PointLayout, layout: &PointLayout) -> Result<()> {
    match prepared.dims().find(|&(dim, name)| layout.find(name) != Some(dim)) {
        None => Ok(()),
        Some((_, name)) => Err(StageError::MissingDimension {
            stage,
            dimension: name.to_string(),
        }),
    }
}
