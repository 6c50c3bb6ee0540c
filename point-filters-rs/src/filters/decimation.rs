//! Deterministic decimation: keep roughly one point in every `step`.
//!
//! The n-th kept point (n = 0, 1, 2, ...) is the first eligible point at
//! local position `floor(n * step)`, counted from `offset`. Fractional
//! steps are allowed, so `step = 2.5` keeps local positions 0, 2, 5, 7,
//! 10, ... Once `limit` points have been kept nothing else is.
//!
//! Bulk and streaming execution share one decision routine and therefore
//! agree point for point.

use log::info;
use serde::{Deserialize, Serialize};

use crate::core::buffer::{PointBuffer, PointBufferSet, PointLayout, PointRef};
use crate::stage::{Filter, Result, StageError, Streamable};

use super::{flag_value, register_flag, resolve_flag};

/// Registry name of the decimation filter.
pub const NAME: &str = "filters.decimation";

/// Options recognized by the decimation filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecimationOptions {
    /// Keep one point every `step` points. Must be positive; may be fractional.
    #[serde(default = "default_step")]
    pub step: f64,

    /// Number of leading points skipped before sampling starts.
    #[serde(default)]
    pub offset: usize,

    /// Maximum number of points kept.
    #[serde(default)]
    pub limit: Option<usize>,

    /// Write 1 to this dimension for dropped points instead of removing them.
    #[serde(default)]
    pub flag: Option<String>,
}

fn default_step() -> f64 {
    1.0
}

impl Default for DecimationOptions {
    fn default() -> Self {
        Self {
            step: default_step(),
            offset: 0,
            limit: None,
            flag: None,
        }
    }
}

/// Keeps a regular subset of the point sequence.
#[derive(Debug)]
pub struct DecimationFilter {
    step: f64,
    offset: usize,
    limit: Option<usize>,
    flag: Option<String>,
    // Per-run state, cleared by `ready`.
    index: usize,
    kept: usize,
}

impl DecimationFilter {
    /// Validate options.
    ///
    /// # Errors
    ///
    /// Fails if `step` is not a positive finite number or `flag` is empty.
    pub fn configure(options: DecimationOptions) -> Result<Self> {
        if !options.step.is_finite() || options.step <= 0.0 {
            return Err(StageError::InvalidOption {
                stage: NAME,
                option: "step",
                reason: format!("must be a positive number, got {}", options.step),
            });
        }
        if options.flag.as_deref().is_some_and(str::is_empty) {
            return Err(StageError::InvalidOption {
                stage: NAME,
                option: "flag",
                reason: "dimension name is empty".to_string(),
            });
        }

        Ok(Self {
            step: options.step,
            offset: options.offset,
            limit: options.limit,
            flag: options.flag,
            index: 0,
            kept: 0,
        })
    }

    /// Decide the next point in sequence and advance the counters.
    fn decide(&mut self) -> bool {
        let position = self.index;
        self.index += 1;

        if position < self.offset {
            return false;
        }
        if self.limit.is_some_and(|limit| self.kept >= limit) {
            return false;
        }

        let local = (position - self.offset) as f64;
        let target = (self.kept as f64 * self.step).floor();
        // For step >= 1 targets advance by at least one per kept point, so
        // `<=` only ever fires on equality; for step < 1 every point is kept.
        if target <= local {
            self.kept += 1;
            true
        } else {
            false
        }
    }
}

impl Filter for DecimationFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn prepare(&mut self, layout: &mut PointLayout) -> Result<()> {
        register_flag(layout, self.flag.as_deref());
        Ok(())
    }

    fn ready(&mut self) {
        self.index = 0;
        self.kept = 0;
    }

    fn run(&mut self, mut buffer: PointBuffer) -> Result<PointBufferSet> {
        let n = buffer.len();

        if let Some(dim) = resolve_flag(NAME, self.flag.as_deref(), buffer.layout())? {
            let mut flagged = 0;
            for id in 0..n {
                let keep = self.decide();
                flagged += usize::from(!keep);
                buffer.set_field(dim, id, flag_value(keep));
            }
            info!("{}: flagged {} of {} points", NAME, flagged, n);
            return Ok(vec![buffer]);
        }

        let kept: Vec<usize> = (0..n).filter(|_| self.decide()).collect();
        info!("{}: kept {} of {} points", NAME, kept.len(), n);
        Ok(vec![buffer.select(&kept)])
    }
}

impl Streamable for DecimationFilter {
    fn process_one(&mut self, point: &mut PointRef<'_>) -> Result<bool> {
        let flag = resolve_flag(NAME, self.flag.as_deref(), point.layout())?;
        let keep = self.decide();
        match flag {
            Some(dim) => {
                point.set_field(dim, flag_value(keep));
                Ok(true)
            }
            None => Ok(keep),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffer::dims;

    fn numbered(n: usize) -> PointBuffer {
        let points: Vec<[f64; 3]> = (0..n).map(|i| [i as f64, 0.0, 0.0]).collect();
        PointBuffer::from_xyz(&points)
    }

    fn prepared(options: DecimationOptions) -> (DecimationFilter, PointLayout) {
        let mut filter = DecimationFilter::configure(options).unwrap();
        let mut layout = PointLayout::xyz();
        filter.prepare(&mut layout).unwrap();
        filter.ready();
        (filter, layout)
    }

    fn bulk_ids(options: DecimationOptions, n: usize) -> Vec<usize> {
        let (mut filter, _) = prepared(options);
        let out = filter.run(numbered(n)).unwrap();
        let x = out[0].layout().require(dims::X).unwrap();
        out[0].column(x).iter().map(|&v| v as usize).collect()
    }

    fn streamed_ids(options: DecimationOptions, n: usize) -> Vec<usize> {
        let (mut filter, _) = prepared(options);
        let mut buffer = numbered(n);
        (0..n)
            .filter(|&id| filter.process_one(&mut buffer.point(id)).unwrap())
            .collect()
    }

    #[test]
    fn test_step_100_keeps_every_hundredth() {
        let options = DecimationOptions {
            step: 100.0,
            ..Default::default()
        };
        let expected: Vec<usize> = (0..10).map(|i| i * 100).collect();

        assert_eq!(bulk_ids(options.clone(), 1000), expected);
        assert_eq!(streamed_ids(options, 1000), expected);
    }

    #[test]
    fn test_offset_and_limit_window() {
        let options = DecimationOptions {
            step: 1.0,
            offset: 50,
            limit: Some(3),
            flag: None,
        };
        assert_eq!(bulk_ids(options.clone(), 60), vec![50, 51, 52]);
        assert_eq!(streamed_ids(options, 60), vec![50, 51, 52]);
    }

    #[test]
    fn test_limit_caps_kept_points() {
        // limit counts kept points, not positions after the offset.
        let options = DecimationOptions {
            step: 2.0,
            limit: Some(3),
            ..Default::default()
        };
        assert_eq!(bulk_ids(options.clone(), 20), vec![0, 2, 4]);
        assert_eq!(streamed_ids(options, 20), vec![0, 2, 4]);
    }

    #[test]
    fn test_fractional_step_uses_floor() {
        let options = DecimationOptions {
            step: 2.5,
            ..Default::default()
        };
        assert_eq!(bulk_ids(options.clone(), 12), vec![0, 2, 5, 7, 10]);
        assert_eq!(streamed_ids(options, 12), vec![0, 2, 5, 7, 10]);
    }

    #[test]
    fn test_step_below_one_keeps_everything() {
        let options = DecimationOptions {
            step: 0.5,
            ..Default::default()
        };
        assert_eq!(bulk_ids(options, 5), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_offset_past_end_keeps_nothing() {
        let options = DecimationOptions {
            offset: 20,
            ..Default::default()
        };
        assert!(bulk_ids(options, 10).is_empty());
    }

    #[test]
    fn test_bulk_does_not_touch_input_layout() {
        let (mut filter, _) = prepared(DecimationOptions {
            step: 2.0,
            ..Default::default()
        });
        let out = filter.run(numbered(5)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 3);
        assert_eq!(out[0].layout(), &PointLayout::xyz());
    }

    #[test]
    fn test_ready_resets_counters() {
        let options = DecimationOptions {
            step: 3.0,
            ..Default::default()
        };
        let (mut filter, _) = prepared(options);
        let first = filter.run(numbered(7)).unwrap();
        filter.ready();
        let second = filter.run(numbered(7)).unwrap();
        assert_eq!(first[0].len(), 3);
        assert_eq!(second[0].len(), 3);
    }

    #[test]
    fn test_flag_mode_keeps_all_points() {
        let options = DecimationOptions {
            step: 2.0,
            flag: Some("Dropped".to_string()),
            ..Default::default()
        };
        let (mut filter, layout) = prepared(options.clone());
        let flag = layout.require("Dropped").unwrap();

        let mut input = numbered(5);
        input.adopt_layout(&layout).unwrap();
        let out = filter.run(input).unwrap();
        assert_eq!(out[0].len(), 5);
        assert_eq!(out[0].column(flag), &[0.0, 1.0, 0.0, 1.0, 0.0]);

        let (mut filter, layout) = prepared(options);
        let mut input = numbered(5);
        input.adopt_layout(&layout).unwrap();
        let kept: Vec<bool> = (0..5)
            .map(|id| filter.process_one(&mut input.point(id)).unwrap())
            .collect();
        assert!(kept.iter().all(|&k| k));
        assert_eq!(input.column(flag), &[0.0, 1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_invalid_step_is_configuration_error() {
        for step in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = DecimationFilter::configure(DecimationOptions {
                step,
                ..Default::default()
            })
            .unwrap_err();
            assert!(err.is_configuration(), "step {} accepted", step);
        }
    }
}
