//! Stage lifecycle and execution contract.
//!
//! Every filter implements [`Filter`] (bulk execution) and, when it can
//! decide one point at a time, [`Streamable`]. The [`Stage`] wrapper owns
//! one filter as a tagged [`FilterKind`] and enforces the lifecycle:
//!
//! ```text
//! Unconfigured -> Configured -> Prepared -> Ready -> Executing -> Finished
//! ```
//!
//! `prepare` may be repeated while Prepared, `ready` may be repeated while
//! Ready, and `ready` after Finished starts a new execution cycle with all
//! per-run state cleared.

use std::fmt;

use thiserror::Error;

use crate::config::StageOptions;
use crate::core::buffer::{BufferError, PointBuffer, PointBufferSet, PointId, PointLayout, PointRef};
use crate::expression::ExpressionError;
use crate::filters::{DecimationFilter, ExpressionFilter, MadFilter, PlaneFitFilter};

/// Errors raised while configuring, preparing or executing a stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{stage}: missing required option '{option}'")]
    MissingOption {
        stage: &'static str,
        option: &'static str,
    },

    #[error("{stage}: invalid option '{option}': {reason}")]
    InvalidOption {
        stage: &'static str,
        option: &'static str,
        reason: String,
    },

    #[error("{stage}: required dimension '{dimension}' is not in the layout")]
    MissingDimension {
        stage: &'static str,
        dimension: String,
    },

    #[error("{stage}: invalid expression: {source}")]
    Expression {
        stage: &'static str,
        #[source]
        source: ExpressionError,
    },

    #[error("{stage}: point {point}: {reason}")]
    Computation {
        stage: &'static str,
        point: PointId,
        reason: String,
    },

    #[error("{stage}: {source}")]
    Buffer {
        stage: &'static str,
        #[source]
        source: BufferError,
    },

    #[error("{stage}: failed to start worker threads: {source}")]
    ThreadPool {
        stage: &'static str,
        #[source]
        source: rayon::ThreadPoolBuildError,
    },

    #[error("{stage}: cannot {operation} while {state}")]
    Lifecycle {
        stage: &'static str,
        operation: &'static str,
        state: StageState,
    },

    #[error("{stage} does not support streaming")]
    NotStreamable { stage: &'static str },
}

impl StageError {
    /// Bad or missing options, unparsable expressions, missing dimensions.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingOption { .. }
                | Self::InvalidOption { .. }
                | Self::MissingDimension { .. }
                | Self::Expression { .. }
        )
    }

    /// Fatal failures during execution.
    pub fn is_computation(&self) -> bool {
        matches!(self, Self::Computation { .. } | Self::ThreadPool { .. })
    }

    /// Name of the stage that raised the error.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::MissingOption { stage, .. }
            | Self::InvalidOption { stage, .. }
            | Self::MissingDimension { stage, .. }
            | Self::Expression { stage, .. }
            | Self::Computation { stage, .. }
            | Self::Buffer { stage, .. }
            | Self::ThreadPool { stage, .. }
            | Self::Lifecycle { stage, .. }
            | Self::NotStreamable { stage } => *stage,
        }
    }
}

/// Result type for stage operations.
pub type Result<T> = std::result::Result<T, StageError>;

/// Position of a stage in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Unconfigured,
    Configured,
    Prepared,
    Ready,
    Executing,
    Finished,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unconfigured => "unconfigured",
            Self::Configured => "configured",
            Self::Prepared => "prepared",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// Bulk execution capability, implemented by every filter.
pub trait Filter {
    /// Registry name, e.g. `filters.decimation`.
    fn name(&self) -> &'static str;

    /// Resolves input dimensions and registers output dimensions.
    fn prepare(&mut self, layout: &mut PointLayout) -> Result<()>;

    /// Clears per-run state.
    fn ready(&mut self) {}

    /// Processes a whole buffer.
    fn run(&mut self, buffer: PointBuffer) -> Result<PointBufferSet>;
}

/// Point-at-a-time execution capability.
pub trait Streamable: Filter {
    /// Processes one point, returning whether it is kept.
    fn process_one(&mut self, point: &mut PointRef<'_>) -> Result<bool>;
}

/// One configured filter of any supported kind.
#[derive(Debug)]
pub enum FilterKind {
    Decimation(DecimationFilter),
    Mad(MadFilter),
    PlaneFit(PlaneFitFilter),
    Expression(ExpressionFilter),
}

impl FilterKind {
    /// Validates options and builds the matching filter.
    pub fn configure(options: StageOptions) -> Result<Self> {
        Ok(match options {
            StageOptions::Decimation(o) => Self::Decimation(DecimationFilter::configure(o)?),
            StageOptions::Mad(o) => Self::Mad(MadFilter::configure(o)?),
            StageOptions::PlaneFit(o) => Self::PlaneFit(PlaneFitFilter::configure(o)?),
            StageOptions::Expression(o) => Self::Expression(ExpressionFilter::configure(o)?),
        })
    }

    pub fn as_filter_mut(&mut self) -> &mut dyn Filter {
        match self {
            Self::Decimation(f) => f,
            Self::Mad(f) => f,
            Self::PlaneFit(f) => f,
            Self::Expression(f) => f,
        }
    }

    /// The streaming capability, for kinds that declare it.
    pub fn as_streamable_mut(&mut self) -> Option<&mut dyn Streamable> {
        match self {
            Self::Decimation(f) => Some(f as &mut dyn Streamable),
            Self::Expression(f) => Some(f as &mut dyn Streamable),
            Self::Mad(_) | Self::PlaneFit(_) => None,
        }
    }

    pub fn supports_streaming(&self) -> bool {
        matches!(self, Self::Decimation(_) | Self::Expression(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Decimation(f) => f.name(),
            Self::Mad(f) => f.name(),
            Self::PlaneFit(f) => f.name(),
            Self::Expression(f) => f.name(),
        }
    }
}

/// A filter together with its lifecycle state.
#[derive(Debug)]
pub struct Stage {
    state: StageState,
    filter: Option<FilterKind>,
}

impl Default for Stage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage {
    /// Creates an unconfigured stage.
    pub fn new() -> Self {
        Self {
            state: StageState::Unconfigured,
            filter: None,
        }
    }

    /// Creates and configures a stage in one step.
    pub fn from_options(options: StageOptions) -> Result<Self> {
        let mut stage = Self::new();
        stage.configure(options)?;
        Ok(stage)
    }

    #[inline]
    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn name(&self) -> &'static str {
        self.filter.as_ref().map_or("unconfigured", FilterKind::name)
    }

    pub fn supports_streaming(&self) -> bool {
        self.filter
            .as_ref()
            .is_some_and(FilterKind::supports_streaming)
    }

    pub fn configure(&mut self, options: StageOptions) -> Result<()> {
        self.check_state("configure", &[StageState::Unconfigured])?;
        self.filter = Some(FilterKind::configure(options)?);
        self.state = StageState::Configured;
        Ok(())
    }

    pub fn prepare(&mut self, layout: &mut PointLayout) -> Result<()> {
        self.check_state("prepare", &[StageState::Configured, StageState::Prepared])?;
        self.filter_mut()?.as_filter_mut().prepare(layout)?;
        self.state = StageState::Prepared;
        Ok(())
    }

    pub fn ready(&mut self) -> Result<()> {
        self.check_state(
            "ready",
            &[StageState::Prepared, StageState::Ready, StageState::Finished],
        )?;
        self.filter_mut()?.as_filter_mut().ready();
        self.state = StageState::Ready;
        Ok(())
    }

    /// Runs the filter over a whole buffer.
    ///
    /// May be called once per buffer of a set; call [`Stage::finish`]
    /// after the last one.
    pub fn run(&mut self, buffer: PointBuffer) -> Result<PointBufferSet> {
        self.check_state("run", &[StageState::Ready, StageState::Executing])?;
        self.state = StageState::Executing;
        self.filter_mut()?.as_filter_mut().run(buffer)
    }

    /// Streams one point through the filter.
    pub fn process_one(&mut self, point: &mut PointRef<'_>) -> Result<bool> {
        self.check_state("process a point", &[StageState::Ready, StageState::Executing])?;
        let stage = self.name();
        if !self.supports_streaming() {
            return Err(StageError::NotStreamable { stage });
        }
        self.state = StageState::Executing;
        self.filter_mut()?
            .as_streamable_mut()
            .ok_or(StageError::NotStreamable { stage })?
            .process_one(point)
    }

    pub fn finish(&mut self) -> Result<()> {
        self.check_state("finish", &[StageState::Ready, StageState::Executing])?;
        self.state = StageState::Finished;
        Ok(())
    }

    fn check_state(&self, operation: &'static str, allowed: &[StageState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(StageError::Lifecycle {
                stage: self.name(),
                operation,
                state: self.state,
            })
        }
    }

    fn filter_mut(&mut self) -> Result<&mut FilterKind> {
        let state = self.state;
        self.filter.as_mut().ok_or(StageError::Lifecycle {
            stage: "unconfigured",
            operation: "execute",
            state,
        })
    }
}
