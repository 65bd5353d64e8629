//! Lowering of IR expressions to DuckDB SQL
//!
//! Column references are resolved against the logical fields of a relation
//! before any SQL is produced, so a missing column fails with the list of
//! available columns even when the relation is empty. Generated SQL only
//! names physical columns (`c0`, `c1`, ...) and escaped literals.

use tabsight_ir::{AggCall, BinOp, ColumnRef, Expr, UnOp, Value};

use crate::ExecutionError;

/// Column of an intermediate relation
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Field {
    pub qualifier: Option<String>,
    pub name: String,
}

impl Field {
    pub fn new(qualifier: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            qualifier: qualifier.map(str::to_string),
            name: name.into(),
        }
    }
}

/// Physical name of the column at `index`
pub(crate) fn column_name(index: usize) -> String {
    format!("c{}", index)
}

/// Resolve a column reference to its position.
///
/// A qualified reference whose qualifier matches nothing falls back to a
/// unique match on the bare name.
pub(crate) fn resolve(fields: &[Field], col: &ColumnRef) -> Result<usize, ExecutionError> {
    let by_name: Vec<usize> = fields
        .iter()
        .enumerate()
        .filter(|(_, f)| f.name == col.column)
        .map(|(i, _)| i)
        .collect();

    let candidates = match &col.table {
        Some(table) => {
            let qualified: Vec<usize> = by_name
                .iter()
                .copied()
                .filter(|&i| fields[i].qualifier.as_deref() == Some(table.as_str()))
                .collect();
            if qualified.is_empty() {
                by_name
            } else {
                qualified
            }
        }
        None => by_name,
    };

    match candidates.as_slice() {
        [index] => Ok(*index),
        [] => Err(ExecutionError::UnknownColumn {
            column: col.to_string(),
            available: describe_fields(fields),
        }),
        _ => Err(ExecutionError::AmbiguousColumn(col.to_string())),
    }
}

pub(crate) fn describe_fields(fields: &[Field]) -> String {
    fields
        .iter()
        .map(|f| match &f.qualifier {
            Some(q) => format!("{}.{}", q, f.name),
            None => f.name.clone(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Fields visible to an expression, with the SQL text addressing each one
pub(crate) struct Scope {
    fields: Vec<Field>,
    refs: Vec<String>,
}

impl Scope {
    /// Columns of a single relation read as `s`
    pub fn single(fields: &[Field]) -> Self {
        Self {
            fields: fields.to_vec(),
            refs: (0..fields.len()).map(|i| format!("s.{}", column_name(i))).collect(),
        }
    }

    /// Columns of a join: left relation aliased `l`, right aliased `r`
    pub fn joined(left: &[Field], right: &[Field]) -> Self {
        let mut refs: Vec<String> = (0..left.len()).map(|i| format!("l.{}", column_name(i))).collect();
        refs.extend((0..right.len()).map(|i| format!("r.{}", column_name(i))));
        let mut fields = left.to_vec();
        fields.extend(right.iter().cloned());
        Self { fields, refs }
    }

    pub fn column(&self, col: &ColumnRef) -> Result<(usize, &str), ExecutionError> {
        let index = resolve(&self.fields, col)?;
        Ok((index, self.refs[index].as_str()))
    }

    pub fn expr(&self, expr: &Expr) -> Result<String, ExecutionError> {
        match expr {
            Expr::Literal { value } => Ok(literal(value)),
            Expr::Column { col } => self.column(col).map(|(_, sql)| sql.to_string()),
            Expr::BinaryOp { op, left, right } => {
                let l = self.expr(left)?;
                let r = self.expr(right)?;
                Ok(binary(*op, &l, &r))
            }
            Expr::UnaryOp { op, expr } => {
                let inner = self.expr(expr)?;
                Ok(match op {
                    UnOp::Neg => format!("(-{})", inner),
                    UnOp::Not => format!("(NOT {})", inner),
                })
            }
            Expr::FuncCall { func, args } => self.call(func, args),
            Expr::InSet { expr, set } => {
                let needle = self.expr(expr)?;
                if set.is_empty() {
                    return Ok("FALSE".to_string());
                }
                let items = set
                    .iter()
                    .map(|item| self.expr(item))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(format!("({} IN ({}))", needle, items.join(", ")))
            }
        }
    }

    fn call(&self, func: &str, args: &[Expr]) -> Result<String, ExecutionError> {
        let name = func.to_ascii_lowercase();
        let arity_ok = match name.as_str() {
            "lower" | "upper" | "length" | "len" | "abs" | "is_null" | "isnull" => args.len() == 1,
            "round" => args.len() == 1 || args.len() == 2,
            "coalesce" | "concat" => !args.is_empty(),
            _ => return Err(ExecutionError::UnknownFunction(func.to_string())),
        };
        if !arity_ok {
            return Err(ExecutionError::InvalidProgram(format!(
                "function '{}' does not take {} argument(s)",
                func,
                args.len()
            )));
        }

        let sql = args
            .iter()
            .map(|arg| self.expr(arg))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(match (name.as_str(), sql.as_slice()) {
            ("is_null" | "isnull", [arg]) => format!("({} IS NULL)", arg),
            ("length" | "len", [arg]) => format!("length({})", arg),
            ("round", [arg, digits]) => format!("round({}, CAST({} AS INTEGER))", arg, digits),
            _ => format!("{}({})", name, sql.join(", ")),
        })
    }

    /// Lower one aggregate call of a GroupBy
    pub fn aggregate(&self, name: &str, call: &AggCall) -> Result<String, ExecutionError> {
        let func = call.func.to_ascii_lowercase();
        match (func.as_str(), call.args.as_slice()) {
            ("count", []) => return Ok("count(*)".to_string()),
            ("count" | "count_distinct" | "nunique" | "sum" | "avg" | "mean" | "min" | "max", [_]) => {}
            ("count" | "count_distinct" | "nunique" | "sum" | "avg" | "mean" | "min" | "max", args) => {
                return Err(ExecutionError::InvalidProgram(format!(
                    "aggregate '{}' ({}) does not take {} argument(s). Columns: {}",
                    name,
                    call.func,
                    args.len(),
                    describe_fields(&self.fields)
                )))
            }
            _ => return Err(ExecutionError::UnknownFunction(call.func.clone())),
        }

        let arg = self.expr(&call.args[0])?;
        Ok(match func.as_str() {
            "count_distinct" | "nunique" => format!("count(DISTINCT {})", arg),
            "avg" | "mean" => format!("avg({})", arg),
            other => format!("{}({})", other, arg),
        })
    }
}

pub(crate) fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Int(i) => format!("CAST({} AS BIGINT)", i),
        // Quoted so DuckDB reads a DOUBLE rather than a DECIMAL
        Value::Float(f) => format!("CAST('{:?}' AS DOUBLE)", f),
        Value::String(s) => quote(s),
    }
}

pub(crate) fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn binary(op: BinOp, l: &str, r: &str) -> String {
    let symbol = match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        // Division is always fractional and yields null on a zero divisor
        BinOp::Div => {
            return format!(
                "(CAST({} AS DOUBLE) / NULLIF(CAST({} AS DOUBLE), 0))",
                l, r
            )
        }
        BinOp::Mod => return format!("({} % NULLIF({}, 0))", l, r),
        BinOp::Eq => "=",
        BinOp::Ne => "<>",
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Gt => ">",
        BinOp::Ge => ">=",
        BinOp::And => "AND",
        BinOp::Or => "OR",
        BinOp::Like => "LIKE",
        BinOp::ILike => "ILIKE",
    };
    format!("({} {} {})", l, symbol, r)
}
