//! Boolean predicates over point fields.
//!
//! The expression filter only depends on the [`PredicateCompiler`] and
//! [`Predicate`] traits. The built-in compiler, [`MongoCompiler`], accepts
//! a JSON document in the style of MongoDB query filters:
//!
//! ```text
//! {"Z": {"$gt": 10}}
//! {"$or": [{"Classification": 2}, {"Intensity": {"$gte": 100, "$lt": 200}}]}
//! {"Z": {"$gt": "HeightAboveGround"}}
//! ```
//!
//! Keys are dimension names or logical operators (`$and`, `$or`, `$nor`).
//! A bare value means equality. Field operators are `$eq`, `$ne`, `$gt`,
//! `$gte`, `$lt`, `$lte`, `$in`, `$nin` and `$not`. A string operand names
//! another dimension of the same point. Sibling keys are combined with AND,
//! and an empty document matches every point.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::buffer::{DimId, PointLayout, PointRef};

/// Errors produced while compiling an expression.
#[derive(Debug, Error)]
pub enum ExpressionError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a JSON object, found {0}")]
    NotAnObject(String),

    #[error("unknown dimension '{0}'")]
    UnknownDimension(String),

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("operator '{operator}' expects {expected}")]
    InvalidOperand {
        operator: String,
        expected: &'static str,
    },
}

/// Result type for expression compilation.
pub type Result<T> = std::result::Result<T, ExpressionError>;

/// A compiled test over one point's fields.
pub trait Predicate: Send + Sync {
    fn evaluate(&self, point: &PointRef<'_>) -> bool;
}

/// Turns expression text into a [`Predicate`] bound to a layout.
pub trait PredicateCompiler: Send + Sync {
    fn compile(&self, text: &str, layout: &PointLayout) -> Result<Box<dyn Predicate>>;
}

/// Compiler for MongoDB-style JSON filter documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct MongoCompiler;

impl PredicateCompiler for MongoCompiler {
    fn compile(&self, text: &str, layout: &PointLayout) -> Result<Box<dyn Predicate>> {
        let value: Value = serde_json::from_str(text)?;
        let root = Parser { layout }.document(&value)?;
        Ok(Box::new(root))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparison {
    fn from_operator(op: &str) -> Option<Self> {
        match op {
            "$eq" => Some(Self::Eq),
            "$ne" => Some(Self::Ne),
            "$gt" => Some(Self::Gt),
            "$gte" => Some(Self::Gte),
            "$lt" => Some(Self::Lt),
            "$lte" => Some(Self::Lte),
            _ => None,
        }
    }

    #[inline]
    fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
            Self::Gt => lhs > rhs,
            Self::Gte => lhs >= rhs,
            Self::Lt => lhs < rhs,
            Self::Lte => lhs <= rhs,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Operand {
    Value(f64),
    Dimension(DimId),
}

impl Operand {
    #[inline]
    fn resolve(self, point: &PointRef<'_>) -> f64 {
        match self {
            Self::Value(v) => v,
            Self::Dimension(dim) => point.get_field(dim),
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    And(Vec<Node>),
    Or(Vec<Node>),
    Nor(Vec<Node>),
    Not(Box<Node>),
    Compare {
        dim: DimId,
        op: Comparison,
        operand: Operand,
    },
    In {
        dim: DimId,
        set: Vec<Operand>,
    },
}

impl Node {
    fn matches(&self, point: &PointRef<'_>) -> bool {
        match self {
            Node::And(nodes) => nodes.iter().all(|n| n.matches(point)),
            Node::Or(nodes) => nodes.iter().any(|n| n.matches(point)),
            Node::Nor(nodes) => !nodes.iter().any(|n| n.matches(point)),
            Node::Not(node) => !node.matches(point),
            Node::Compare { dim, op, operand } => {
                op.apply(point.get_field(*dim), operand.resolve(point))
            }
            Node::In { dim, set } => {
                let value = point.get_field(*dim);
                set.iter().any(|o| o.resolve(point) == value)
            }
        }
    }
}

impl Predicate for Node {
    fn evaluate(&self, point: &PointRef<'_>) -> bool {
        self.matches(point)
    }
}

struct Parser<'a> {
    layout: &'a PointLayout,
}

impl Parser<'_> {
    fn document(&self, value: &Value) -> Result<Node> {
        let object = as_object(value)?;
        let mut clauses = Vec::with_capacity(object.len());

        for (key, value) in object {
            let clause = match key.as_str() {
                "$and" => Node::And(self.documents(key, value)?),
                "$or" => Node::Or(self.documents(key, value)?),
                "$nor" => Node::Nor(self.documents(key, value)?),
                op if op.starts_with('$') => {
                    return Err(ExpressionError::UnknownOperator(op.to_string()))
                }
                name => self.field(self.dimension(name)?, value)?,
            };
            clauses.push(clause);
        }

        Ok(collapse(clauses))
    }

    fn documents(&self, operator: &str, value: &Value) -> Result<Vec<Node>> {
        match value {
            Value::Array(items) if !items.is_empty() => {
                items.iter().map(|item| self.document(item)).collect()
            }
            _ => Err(ExpressionError::InvalidOperand {
                operator: operator.to_string(),
                expected: "a non-empty array of documents",
            }),
        }
    }

    fn field(&self, dim: DimId, value: &Value) -> Result<Node> {
        let operators = match value {
            Value::Object(map) if map.keys().any(|k| k.starts_with('$')) => map,
            other => {
                return Ok(Node::Compare {
                    dim,
                    op: Comparison::Eq,
                    operand: self.operand("$eq", other)?,
                })
            }
        };

        let mut clauses = Vec::with_capacity(operators.len());
        for (op, operand) in operators {
            let clause = if let Some(cmp) = Comparison::from_operator(op) {
                Node::Compare {
                    dim,
                    op: cmp,
                    operand: self.operand(op, operand)?,
                }
            } else {
                match op.as_str() {
                    "$in" => Node::In {
                        dim,
                        set: self.operand_list(op, operand)?,
                    },
                    "$nin" => Node::Not(Box::new(Node::In {
                        dim,
                        set: self.operand_list(op, operand)?,
                    })),
                    "$not" => match operand {
                        Value::Object(_) => Node::Not(Box::new(self.field(dim, operand)?)),
                        _ => {
                            return Err(ExpressionError::InvalidOperand {
                                operator: op.clone(),
                                expected: "an operator document",
                            })
                        }
                    },
                    _ => return Err(ExpressionError::UnknownOperator(op.clone())),
                }
            };
            clauses.push(clause);
        }

        Ok(collapse(clauses))
    }

    fn operand(&self, operator: &str, value: &Value) -> Result<Operand> {
        match value {
            Value::Number(n) => n.as_f64().map(Operand::Value).ok_or_else(|| {
                ExpressionError::InvalidOperand {
                    operator: operator.to_string(),
                    expected: "a finite number",
                }
            }),
            Value::String(name) => Ok(Operand::Dimension(self.dimension(name)?)),
            _ => Err(ExpressionError::InvalidOperand {
                operator: operator.to_string(),
                expected: "a number or a dimension name",
            }),
        }
    }

    fn operand_list(&self, operator: &str, value: &Value) -> Result<Vec<Operand>> {
        match value {
            Value::Array(items) => items.iter().map(|v| self.operand(operator, v)).collect(),
            _ => Err(ExpressionError::InvalidOperand {
                operator: operator.to_string(),
                expected: "an array",
            }),
        }
    }

    fn dimension(&self, name: &str) -> Result<DimId> {
        self.layout
            .find(name)
            .ok_or_else(|| ExpressionError::UnknownDimension(name.to_string()))
    }
}

fn as_object(value: &Value) -> Result<&Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| ExpressionError::NotAnObject(value.to_string()))
}

fn collapse(mut clauses: Vec<Node>) -> Node {
    if clauses.len() == 1 {
        clauses.remove(0)
    } else {
        Node::And(clauses)
    }
}
