//! Keep points that satisfy a compiled predicate.

use std::fmt;

use log::info;
use serde::{Deserialize, Serialize};

use crate::core::buffer::{PointBuffer, PointBufferSet, PointLayout, PointRef};
use crate::expression::{MongoCompiler, Predicate, PredicateCompiler};
use crate::stage::{Filter, Result, StageError, StageState, Streamable};

use super::check_layout;

/// Registry name of the expression filter.
pub const NAME: &str = "filters.expression";

/// Options recognized by the expression filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpressionOptions {
    /// Predicate text, e.g. `{"Z": {"$gt": 10}}`. Required.
    #[serde(default)]
    pub expression: Option<String>,
}

/// Drops every point for which the predicate is false.
///
/// The expression is compiled against the layout in `prepare`, so unknown
/// dimensions are reported before any point is read.
pub struct ExpressionFilter {
    expression: String,
    compiler: Box<dyn PredicateCompiler>,
    predicate: Option<Box<dyn Predicate>>,
    layout: PointLayout,
}

impl ExpressionFilter {
    /// Validate options, using the built-in [`MongoCompiler`].
    pub fn configure(options: ExpressionOptions) -> Result<Self> {
        Self::with_compiler(options, Box::new(MongoCompiler))
    }

    /// Validate options with a caller-supplied expression compiler.
    ///
    /// # Errors
    ///
    /// Fails if `expression` is missing or blank.
    pub fn with_compiler(
        options: ExpressionOptions,
        compiler: Box<dyn PredicateCompiler>,
    ) -> Result<Self> {
        let expression = match options.expression {
            Some(text) if !text.trim().is_empty() => text,
            _ => {
                return Err(StageError::MissingOption {
                    stage: NAME,
                    option: "expression",
                })
            }
        };

        Ok(Self {
            expression,
            compiler,
            predicate: None,
            layout: PointLayout::new(),
        })
    }

    /// The compiled predicate, if `layout` still places its dimensions where
    /// `prepare` saw them.
    fn predicate(&self, layout: &PointLayout) -> Result<&dyn Predicate> {
        let predicate = self
            .predicate
            .as_deref()
            .ok_or_else(|| StageError::Lifecycle {
                stage: NAME,
                operation: "evaluate",
                state: StageState::Configured,
            })?;
        check_layout(NAME, &self.layout, layout)?;
        Ok(predicate)
    }
}

impl fmt::Debug for ExpressionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpressionFilter")
            .field("expression", &self.expression)
            .field("compiled", &self.predicate.is_some())
            .finish()
    }
}

impl Filter for ExpressionFilter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn prepare(&mut self, layout: &mut PointLayout) -> Result<()> {
        let predicate = self
            .compiler
            .compile(&self.expression, layout)
            .map_err(|source| StageError::Expression { stage: NAME, source })?;
        self.predicate = Some(predicate);
        self.layout = layout.clone();
        Ok(())
    }

    fn run(&mut self, mut buffer: PointBuffer) -> Result<PointBufferSet> {
        let predicate = self.predicate(buffer.layout())?;
        let n = buffer.len();

        let kept: Vec<usize> = (0..n)
            .filter(|&id| predicate.evaluate(&buffer.point(id)))
            .collect();

        info!("{}: kept {} of {} points", NAME, kept.len(), n);
        Ok(vec![buffer.select(&kept)])
    }
}

impl Streamable for ExpressionFilter {
    fn process_one(&mut self, point: &mut PointRef<'_>) -> Result<bool> {
        Ok(self.predicate(point.layout())?.evaluate(point))
    }
}
