//! Tabsight Intermediate Representation (IR)
//!
//! Canonical JSON form of the transformation code the analyst generates.
//! A program reads named tables from an in-memory store, applies its operators
//! in order and binds the final relation to [`OUTPUT_NAME`].
//! All types are deterministically serializable for caching and provenance.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

mod types;
pub use types::*;

/// Name the final pipeline of every program is bound to
pub const OUTPUT_NAME: &str = "result";

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Invalid program JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Top-level program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lets: Vec<LetBinding>,

    pub pipeline: Pipeline,
}

impl Program {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            lets: Vec::new(),
            pipeline,
        }
    }

    /// Parse a program from model output.
    ///
    /// Accepts the `{"pipeline": ...}` wrapper (optionally with `lets`) or a
    /// bare pipeline object.
    pub fn from_json(text: &str) -> Result<Self, ParseError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if value.get("pipeline").is_some() {
            Ok(serde_json::from_value(value)?)
        } else {
            Ok(Program::new(serde_json::from_value(value)?))
        }
    }

    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).expect("IR should always serialize")
    }

    /// Hex SHA-256 of the compact JSON form; equal programs share it
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_string(self).expect("IR should always serialize");
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Number of join operators anywhere in the program, sub-pipelines included
    pub fn join_count(&self) -> usize {
        self.lets
            .iter()
            .map(|binding| binding.pipeline.join_count())
            .sum::<usize>()
            + self.pipeline.join_count()
    }

    /// Visit the join type slot of every join operator in the program
    pub fn for_each_join_type_mut(&mut self, f: &mut dyn FnMut(&mut Option<JoinType>)) {
        for binding in &mut self.lets {
            binding.pipeline.for_each_join_type_mut(f);
        }
        self.pipeline.for_each_join_type_mut(f);
    }
}

/// Named intermediate relation, usable as a source by later pipelines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LetBinding {
    pub name: String,
    pub pipeline: Pipeline,
}

/// Pipeline - source + operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub source: Source,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ops: Vec<Operator>,
}

impl Pipeline {
    pub fn from_table(name: impl Into<String>) -> Self {
        Self {
            source: Source::table(name),
            ops: Vec::new(),
        }
    }

    pub fn then(mut self, op: Operator) -> Self {
        self.ops.push(op);
        self
    }

    fn join_count(&self) -> usize {
        let nested = match &self.source {
            Source::SubPipeline { pipeline, .. } => pipeline.join_count(),
            Source::Table { .. } => 0,
        };
        nested
            + self
                .ops
                .iter()
                .map(|op| match op {
                    Operator::Join { source, .. } => {
                        1 + match source {
                            Source::SubPipeline { pipeline, .. } => pipeline.join_count(),
                            Source::Table { .. } => 0,
                        }
                    }
                    _ => 0,
                })
                .sum::<usize>()
    }

    fn for_each_join_type_mut(&mut self, f: &mut dyn FnMut(&mut Option<JoinType>)) {
        if let Source::SubPipeline { pipeline, .. } = &mut self.source {
            pipeline.for_each_join_type_mut(f);
        }
        for op in &mut self.ops {
            if let Operator::Join {
                source, join_type, ..
            } = op
            {
                if let Source::SubPipeline { pipeline, .. } = source {
                    pipeline.for_each_join_type_mut(f);
                }
                f(join_type);
            }
        }
    }
}

/// Data source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Source {
    Table {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
    },
    SubPipeline {
        pipeline: Box<Pipeline>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
    },
}

impl Source {
    pub fn table(name: impl Into<String>) -> Self {
        Source::Table {
            name: name.into(),
            alias: None,
        }
    }

    pub fn aliased(name: impl Into<String>, alias: impl Into<String>) -> Self {
        Source::Table {
            name: name.into(),
            alias: Some(alias.into()),
        }
    }

    /// Qualifier that column references use to address this source
    pub fn qualifier(&self) -> Option<&str> {
        match self {
            Source::Table { name, alias } => Some(alias.as_deref().unwrap_or(name)),
            Source::SubPipeline { alias, .. } => alias.as_deref(),
        }
    }
}

/// Pipeline operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Operator {
    Select {
        projections: Vec<Projection>,
    },
    Filter {
        condition: Expr,
    },
    /// Add or replace columns, keeping every existing one
    Map {
        mappings: BTreeMap<String, Expr>,
    },
    Join {
        source: Source,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on: Option<Expr>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        join_type: Option<JoinType>,
    },
    GroupBy {
        #[serde(default)]
        keys: Vec<ColumnRef>,
        #[serde(default)]
        aggs: BTreeMap<String, AggCall>,
    },
    Sort {
        keys: Vec<SortKey>,
    },
    Take {
        limit: i64,
    },
    Distinct,
}

impl Operator {
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Select { .. } => "Select",
            Operator::Filter { .. } => "Filter",
            Operator::Map { .. } => "Map",
            Operator::Join { .. } => "Join",
            Operator::GroupBy { .. } => "GroupBy",
            Operator::Sort { .. } => "Sort",
            Operator::Take { .. } => "Take",
            Operator::Distinct => "Distinct",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Semi,
    Anti,
    Cross,
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JoinType::Inner => "inner",
            JoinType::Left => "left",
            JoinType::Right => "right",
            JoinType::Full => "full",
            JoinType::Semi => "semi",
            JoinType::Anti => "anti",
            JoinType::Cross => "cross",
        };
        f.write_str(name)
    }
}

/// Aliased comes first: an object carrying both `expr` and `alias` must not be
/// swallowed by the bare expression variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Projection {
    Aliased { expr: Expr, alias: String },
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub expr: Expr,
    #[serde(default)]
    pub desc: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggCall {
    pub func: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub column: String,
}

impl ColumnRef {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            table: None,
            column: column.into(),
        }
    }

    pub fn qualified(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            column: column.into(),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(table) => write!(f, "{}.{}", table, self.column),
            None => f.write_str(&self.column),
        }
    }
}

/// Expression types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Expr {
    Literal { value: Value },
    Column { col: ColumnRef },
    BinaryOp { op: BinOp, left: Box<Expr>, right: Box<Expr> },
    UnaryOp { op: UnOp, expr: Box<Expr> },
    FuncCall { func: String, args: Vec<Expr> },
    InSet { expr: Box<Expr>, set: Vec<Expr> },
}

impl Expr {
    pub fn col(column: impl Into<String>) -> Self {
        Expr::Column {
            col: ColumnRef::new(column),
        }
    }

    pub fn qcol(table: impl Into<String>, column: impl Into<String>) -> Self {
        Expr::Column {
            col: ColumnRef::qualified(table, column),
        }
    }

    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal {
            value: value.into(),
        }
    }

    pub fn binary(op: BinOp, left: Expr, right: Expr) -> Self {
        Expr::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn eq(left: Expr, right: Expr) -> Self {
        Expr::binary(BinOp::Eq, left, right)
    }

    pub fn call(func: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::FuncCall {
            func: func.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    // Arithmetic
    Add, Sub, Mul, Div, Mod,
    // Comparison
    Eq, Ne, Lt, Le, Gt, Ge,
    // Logical
    And, Or,
    // String
    Like, ILike,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
}
