//! Sequential pipeline driver.
//!
//! Stages run one after another over the same data:
//!
//! 1. **Prepare**: each stage sees the layout produced by the stages before
//!    it and registers its own output dimensions. The input buffer then
//!    adopts the final layout so every column exists before execution.
//! 2. **Execute**, either
//!    - in bulk, where each stage consumes the buffer set produced by the
//!      previous one, or
//!    - streaming, where each point passes through every stage in turn and
//!      the first stage that drops it ends its journey.

use anyhow::{bail, Context, Result};
use log::{debug, info};

use crate::config::PipelineConfig;
use crate::core::buffer::{PointBuffer, PointBufferSet, PointLayout};
use crate::stage::Stage;

/// An ordered list of stages.
#[derive(Debug, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and configure every stage listed in a configuration.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let mut pipeline = Self::new();
        for (position, options) in config.stages.iter().enumerate() {
            let stage = Stage::from_options(options.clone())
                .with_context(|| format!("Failed to configure stage {}", position + 1))?;
            pipeline.push(stage);
        }
        Ok(pipeline)
    }

    /// Append a configured stage.
    pub fn push(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Whether every stage can process points one at a time.
    pub fn supports_streaming(&self) -> bool {
        self.stages.iter().all(Stage::supports_streaming)
    }

    /// Prepare every stage against `layout`, returning the final layout.
    pub fn prepare(&mut self, layout: &PointLayout) -> Result<PointLayout> {
        let mut layout = layout.clone();
        for (position, stage) in self.stages.iter_mut().enumerate() {
            let before = layout.len();
            stage
                .prepare(&mut layout)
                .with_context(|| format!("Failed to prepare stage {} ({})", position + 1, stage.name()))?;
            debug!(
                "Prepared {} ({} new dimensions)",
                stage.name(),
                layout.len() - before
            );
        }
        Ok(layout)
    }

    /// Prepare for the buffer's layout and execute in the requested mode.
    pub fn run(&mut self, mut buffer: PointBuffer, stream: bool) -> Result<PointBufferSet> {
        let layout = self.prepare(buffer.layout())?;
        buffer
            .adopt_layout(&layout)
            .context("Failed to extend input buffer with stage dimensions")?;

        if stream {
            Ok(vec![self.stream(buffer)?])
        } else {
            self.execute(buffer)
        }
    }

    /// Run every stage in bulk. Stages must already be prepared.
    pub fn execute(&mut self, buffer: PointBuffer) -> Result<PointBufferSet> {
        let mut buffers: PointBufferSet = vec![buffer];

        for stage in &mut self.stages {
            stage.ready()?;

            let points_in: usize = buffers.iter().map(PointBuffer::len).sum();
            let mut next = PointBufferSet::with_capacity(buffers.len());
            for buffer in buffers {
                let out = stage
                    .run(buffer)
                    .with_context(|| format!("Stage {} failed", stage.name()))?;
                next.extend(out);
            }
            stage.finish()?;

            let points_out: usize = next.iter().map(PointBuffer::len).sum();
            info!("{}: {} points in, {} points out", stage.name(), points_in, points_out);
            buffers = next;
        }

        Ok(buffers)
    }

    /// Push each point through every stage. Stages must already be prepared.
    ///
    /// Returns the surviving points, in input order.
    pub fn stream(&mut self, mut buffer: PointBuffer) -> Result<PointBuffer> {
        if let Some(stage) = self.stages.iter().find(|s| !s.supports_streaming()) {
            bail!("Stage {} cannot run in streaming mode", stage.name());
        }

        for stage in &mut self.stages {
            stage.ready()?;
        }

        let mut kept = Vec::with_capacity(buffer.len());
        'points: for id in 0..buffer.len() {
            let mut point = buffer.point(id);
            for stage in &mut self.stages {
                let keep = stage
                    .process_one(&mut point)
                    .with_context(|| format!("Stage {} failed at point {}", stage.name(), id))?;
                if !keep {
                    continue 'points;
                }
            }
            kept.push(id);
        }

        for stage in &mut self.stages {
            stage.finish()?;
        }

        info!("Streamed {} points, kept {}", buffer.len(), kept.len());
        Ok(buffer.select(&kept))
    }
}
