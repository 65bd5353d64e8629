//! Pipeline execution on DuckDB
//!
//! Every operator becomes one `CREATE TABLE .. AS SELECT` over the table of
//! the previous step and records a [`StepTrace`]. Joins additionally record
//! [`JoinStats`], counted with `SELECT count(*)` on the join inputs.
//!
//! Physical tables carry positional columns `c0..cN`; the logical names and
//! qualifiers live on the Rust side in [`Field`]s. Row order is kept by
//! ordering on `rowid` wherever an operator does not define its own order.

use duckdb::types::{ToSql, ToSqlOutput, Value as DuckValue, ValueRef};
use duckdb::{params_from_iter, Connection};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use tabsight_ir::{
    AggCall, ColumnRef, ColumnType, Expr, JoinType, Operator, Pipeline, Program, Projection,
    SortKey, Source, Value, OUTPUT_NAME,
};

use crate::compile::{column_name, Field, Scope};
use crate::table::{Table, TableStore};
use crate::{ExecutionBudget, ExecutionError};

/// Result of a successful run
#[derive(Debug, Clone)]
pub struct Execution {
    pub result: Table,
    pub trace: ExecutionTrace,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionTrace {
    pub steps: Vec<StepTrace>,
}

impl ExecutionTrace {
    pub fn joins(&self) -> impl Iterator<Item = &JoinStats> + '_ {
        self.steps.iter().filter_map(|step| step.join.as_ref())
    }
}

/// Row counts around one operator
#[derive(Debug, Clone, Serialize)]
pub struct StepTrace {
    /// Pipeline the operator belongs to: `result`, `let:<name>` or a nested path
    pub scope: String,
    pub index: usize,
    pub op: &'static str,
    pub input_rows: usize,
    pub output_rows: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join: Option<JoinStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinStats {
    pub join_type: JoinType,
    pub right_source: String,
    pub left_rows: usize,
    pub right_rows: usize,
    pub output_rows: usize,
    /// Left rows with at least one matching right row
    pub matched_left_rows: usize,
    /// Right rows with at least one matching left row
    pub matched_right_rows: usize,
}

/// Intermediate relation held in a DuckDB table
#[derive(Debug, Clone)]
struct Relation {
    table: String,
    fields: Vec<Field>,
    rows: usize,
    /// Dropped once the next step has read it
    owned: bool,
}

impl Relation {
    fn requalify(mut self, qualifier: Option<&str>) -> Self {
        if let Some(q) = qualifier {
            for field in &mut self.fields {
                field.qualifier = Some(q.to_string());
            }
        }
        self
    }

    fn columns(&self) -> String {
        (0..self.fields.len()).map(column_name).collect::<Vec<_>>().join(", ")
    }
}

/// Unique output names; clashes become `{qualifier}_{name}`
fn unique_names(fields: &[Field]) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for field in fields {
        *counts.entry(field.name.as_str()).or_default() += 1;
    }

    let mut taken = HashSet::new();
    let mut columns = Vec::with_capacity(fields.len());
    for field in fields {
        let base = match (&field.qualifier, counts[field.name.as_str()] > 1) {
            (Some(q), true) => format!("{}_{}", q, field.name),
            _ => field.name.clone(),
        };
        let mut candidate = base.clone();
        let mut suffix = 2;
        while !taken.insert(candidate.clone()) {
            candidate = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        columns.push(candidate);
    }
    columns
}

/// Cooperative deadline and row budget
struct Guard {
    started: Instant,
    limit: Option<Duration>,
    max_rows: Option<u64>,
    ticks: u32,
}

impl Guard {
    fn new(budget: &ExecutionBudget) -> Self {
        Self {
            started: Instant::now(),
            limit: budget.max_time_ms.map(Duration::from_millis),
            max_rows: budget.max_rows,
            ticks: 0,
        }
    }

    fn tick(&mut self) -> Result<(), ExecutionError> {
        self.ticks = self.ticks.wrapping_add(1);
        if self.ticks % 1024 == 0 {
            self.check_deadline()?;
        }
        Ok(())
    }

    fn check_deadline(&self) -> Result<(), ExecutionError> {
        match self.limit {
            Some(limit) if self.started.elapsed() >= limit => {
                Err(ExecutionError::Timeout(limit.as_millis() as u64))
            }
            _ => Ok(()),
        }
    }

    fn check_rows(&self, rows: usize, context: &str) -> Result<(), ExecutionError> {
        match self.max_rows {
            Some(max) if rows as u64 > max => Err(ExecutionError::BudgetExceeded(format!(
                "{} produced more than {} rows",
                context, max
            ))),
            _ => Ok(()),
        }
    }

    /// `LIMIT` clause that lets a statement overshoot the budget by one row
    fn cap(&self) -> String {
        match self.max_rows {
            Some(max) => format!(" LIMIT {}", max.saturating_add(1)),
            None => String::new(),
        }
    }
}

/// Cell bound into an `INSERT` with the SQL type of its column
struct Cell<'a> {
    value: &'a Value,
    column_type: ColumnType,
}

impl ToSql for Cell<'_> {
    fn to_sql(&self) -> duckdb::Result<ToSqlOutput<'_>> {
        let value = match (self.column_type, self.value) {
            (_, Value::Null) => DuckValue::Null,
            (ColumnType::Boolean, Value::Bool(b)) => DuckValue::Boolean(*b),
            (ColumnType::Integer, Value::Int(i)) => DuckValue::BigInt(*i),
            (ColumnType::Float, Value::Int(i)) => DuckValue::Double(*i as f64),
            (ColumnType::Float, Value::Float(f)) => DuckValue::Double(*f),
            (_, other) => DuckValue::Text(other.to_string()),
        };
        Ok(ToSqlOutput::Owned(value))
    }
}

fn sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Integer => "BIGINT",
        ColumnType::Float => "DOUBLE",
        ColumnType::Boolean => "BOOLEAN",
        // Mixed columns compare as text
        ColumnType::String | ColumnType::Mixed | ColumnType::Empty => "VARCHAR",
    }
}

fn from_duck(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(i) => Value::Int(i64::from(i)),
        ValueRef::SmallInt(i) => Value::Int(i64::from(i)),
        ValueRef::Int(i) => Value::Int(i64::from(i)),
        ValueRef::BigInt(i) => Value::Int(i),
        // sum() over BIGINT widens to HUGEINT
        ValueRef::HugeInt(i) => match i64::try_from(i) {
            Ok(i) => Value::Int(i),
            Err(_) => Value::Float(i as f64),
        },
        ValueRef::UTinyInt(i) => Value::Int(i64::from(i)),
        ValueRef::USmallInt(i) => Value::Int(i64::from(i)),
        ValueRef::UInt(i) => Value::Int(i64::from(i)),
        ValueRef::UBigInt(i) => match i64::try_from(i) {
            Ok(i) => Value::Int(i),
            Err(_) => Value::Float(i as f64),
        },
        ValueRef::Float(f) => Value::Float(f64::from(f)),
        ValueRef::Double(f) => Value::Float(f),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<blob {} bytes>", bytes.len())),
        _ => Value::Null,
    }
}

pub(crate) struct Run<'a> {
    conn: &'a Connection,
    store: &'a TableStore,
    registered: HashMap<String, Relation>,
    bindings: HashMap<String, Relation>,
    guard: Guard,
    next_table: usize,
    trace: ExecutionTrace,
}

impl<'a> Run<'a> {
    pub fn new(conn: &'a Connection, store: &'a TableStore, budget: &ExecutionBudget) -> Self {
        Self {
            conn,
            store,
            registered: HashMap::new(),
            bindings: HashMap::new(),
            guard: Guard::new(budget),
            next_table: 0,
            trace: ExecutionTrace::default(),
        }
    }

    pub fn run(mut self, program: &Program) -> Result<Execution, ExecutionError> {
        for binding in &program.lets {
            if self.bindings.contains_key(&binding.name) {
                return Err(ExecutionError::InvalidProgram(format!(
                    "'{}' is bound more than once",
                    binding.name
                )));
            }
            let scope = format!("let:{}", binding.name);
            let relation = self.pipeline(&binding.pipeline, &scope)?;
            let fields = unique_names(&relation.fields)
                .into_iter()
                .map(|name| Field::new(None, name))
                .collect();
            self.bindings.insert(
                binding.name.clone(),
                Relation {
                    fields,
                    owned: false,
                    ..relation
                },
            );
        }

        let relation = self.pipeline(&program.pipeline, OUTPUT_NAME)?;
        let result = self.fetch(&relation)?;

        Ok(Execution {
            result,
            trace: self.trace,
        })
    }

    fn pipeline(&mut self, pipeline: &Pipeline, scope: &str) -> Result<Relation, ExecutionError> {
        let mut relation = self.source(&pipeline.source, scope)?;

        for (index, op) in pipeline.ops.iter().enumerate() {
            self.guard.check_deadline()?;
            let input_rows = relation.rows;
            let context = format!("{} step {} ({})", scope, index, op.name());
            let mut join = None;

            let next = match op {
                Operator::Select { projections } => self.select(&relation, projections)?,
                Operator::Filter { condition } => self.filter(&relation, condition)?,
                Operator::Map { mappings } => self.map(&relation, mappings)?,
                Operator::Join {
                    source,
                    on,
                    join_type,
                } => {
                    let nested = format!("{}/{}", scope, index);
                    let right = self.source(source, &nested)?;
                    let join_type = join_type.unwrap_or(JoinType::Left);
                    let (joined, stats) = self.join(
                        &relation,
                        &right,
                        on.as_ref(),
                        join_type,
                        describe_source(source),
                        &context,
                    )?;
                    self.release(&right)?;
                    join = Some(stats);
                    joined
                }
                Operator::GroupBy { keys, aggs } => self.group_by(&relation, keys, aggs)?,
                Operator::Sort { keys } => self.sort(&relation, keys)?,
                Operator::Take { limit } => self.take(&relation, *limit)?,
                Operator::Distinct => self.distinct(&relation)?,
            };
            self.release(&relation)?;
            relation = next;

            self.guard.check_rows(relation.rows, &context)?;
            self.trace.steps.push(StepTrace {
                scope: scope.to_string(),
                index,
                op: op.name(),
                input_rows,
                output_rows: relation.rows,
                join,
            });
        }

        Ok(relation)
    }

    fn source(&mut self, source: &Source, scope: &str) -> Result<Relation, ExecutionError> {
        match source {
            Source::Table { name, .. } => {
                let qualifier = source.qualifier();
                if let Some(bound) = self.bindings.get(name) {
                    return Ok(bound.clone().requalify(qualifier));
                }
                if let Some(registered) = self.registered.get(name) {
                    return Ok(registered.clone().requalify(qualifier));
                }
                let Some(table) = self.store.get(name) else {
                    let mut available: Vec<&str> = self.store.names().collect();
                    available.extend(self.bindings.keys().map(String::as_str));
                    return Err(ExecutionError::UnknownTable {
                        name: name.clone(),
                        available: available.join(", "),
                    });
                };
                let table = table.clone();
                let relation = self.register(&table)?;
                self.registered.insert(name.clone(), relation.clone());
                Ok(relation.requalify(qualifier))
            }
            Source::SubPipeline { pipeline, alias } => {
                let nested = format!("{}>{}", scope, alias.as_deref().unwrap_or("sub"));
                let relation = self.pipeline(pipeline, &nested)?;
                Ok(relation.requalify(alias.as_deref()))
            }
        }
    }

    fn fresh(&mut self, prefix: &str) -> String {
        self.next_table += 1;
        format!("{}{}", prefix, self.next_table)
    }

    /// Load a store table with one typed column per source column
    fn register(&mut self, table: &Table) -> Result<Relation, ExecutionError> {
        if table.column_count() == 0 {
            return Err(ExecutionError::InvalidProgram(format!(
                "table '{}' has no columns",
                table.name
            )));
        }

        let types: Vec<ColumnType> = (0..table.column_count())
            .map(|i| {
                table
                    .column(i)
                    .filter_map(Value::column_type)
                    .fold(ColumnType::Empty, ColumnType::merge)
            })
            .collect();

        let physical = self.fresh("t");
        let definition = types
            .iter()
            .enumerate()
            .map(|(i, t)| format!("{} {}", column_name(i), sql_type(*t)))
            .collect::<Vec<_>>()
            .join(", ");
        self.conn
            .execute_batch(&format!("CREATE TABLE {} ({})", physical, definition))?;

        let placeholders = vec!["?"; types.len()].join(", ");
        self.conn.execute_batch("BEGIN TRANSACTION")?;
        {
            let mut insert = self
                .conn
                .prepare(&format!("INSERT INTO {} VALUES ({})", physical, placeholders))?;
            for row in &table.rows {
                self.guard.tick()?;
                insert.execute(params_from_iter(row.iter().zip(&types).map(|(value, t)| Cell {
                    value,
                    column_type: *t,
                })))?;
            }
        }
        self.conn.execute_batch("COMMIT")?;

        tracing::trace!(table = %table.name, physical = %physical, rows = table.row_count(), "Table registered");

        Ok(Relation {
            table: physical,
            fields: table.columns.iter().map(|c| Field::new(None, c.as_str())).collect(),
            rows: table.row_count(),
            owned: false,
        })
    }

    fn count(&self, sql: &str) -> Result<usize, ExecutionError> {
        let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or_default())
    }

    /// Materialize `select` as a new intermediate relation
    fn create(&mut self, select: &str, fields: Vec<Field>) -> Result<Relation, ExecutionError> {
        let table = self.fresh("r");
        self.conn
            .execute_batch(&format!("CREATE TABLE {} AS {}", table, select))?;
        let rows = self.count(&format!("SELECT count(*) FROM {}", table))?;
        Ok(Relation {
            table,
            fields,
            rows,
            owned: true,
        })
    }

    fn release(&self, relation: &Relation) -> Result<(), ExecutionError> {
        if relation.owned {
            self.conn
                .execute_batch(&format!("DROP TABLE IF EXISTS {}", relation.table))?;
        }
        Ok(())
    }

    fn select(&mut self, input: &Relation, projections: &[Projection]) -> Result<Relation, ExecutionError> {
        if projections.is_empty() {
            return Err(ExecutionError::InvalidProgram(
                "Select needs at least one projection".to_string(),
            ));
        }

        let scope = Scope::single(&input.fields);
        let mut fields = Vec::with_capacity(projections.len());
        let mut items = Vec::with_capacity(projections.len());

        for projection in projections {
            let sql = match projection {
                Projection::Aliased { expr, alias } => {
                    fields.push(Field::new(None, alias.as_str()));
                    scope.expr(expr)?
                }
                Projection::Expr(Expr::Column { col }) => {
                    let (index, sql) = scope.column(col)?;
                    fields.push(input.fields[index].clone());
                    sql.to_string()
                }
                Projection::Expr(_) => {
                    return Err(ExecutionError::InvalidProgram(
                        "computed projections need an alias".to_string(),
                    ))
                }
            };
            items.push(format!("{} AS {}", sql, column_name(items.len())));
        }

        let select = format!(
            "SELECT {} FROM {} AS s ORDER BY s.rowid{}",
            items.join(", "),
            input.table,
            self.guard.cap()
        );
        self.create(&select, fields)
    }

    fn filter(&mut self, input: &Relation, condition: &Expr) -> Result<Relation, ExecutionError> {
        let predicate = Scope::single(&input.fields).expr(condition)?;
        let select = format!(
            "SELECT {} FROM {} AS s WHERE {} ORDER BY s.rowid{}",
            input.columns(),
            input.table,
            predicate,
            self.guard.cap()
        );
        self.create(&select, input.fields.clone())
    }

    fn map(&mut self, input: &Relation, mappings: &BTreeMap<String, Expr>) -> Result<Relation, ExecutionError> {
        let scope = Scope::single(&input.fields);
        let mut fields = input.fields.clone();
        let mut items: Vec<String> = (0..fields.len()).map(column_name).collect();

        // All mappings read the input row, never each other's output
        for (name, expr) in mappings {
            let sql = scope.expr(expr)?;
            match fields.iter().position(|f| &f.name == name) {
                Some(slot) => items[slot] = sql,
                None => {
                    fields.push(Field::new(None, name.as_str()));
                    items.push(sql);
                }
            }
        }

        let items: Vec<String> = items
            .into_iter()
            .enumerate()
            .map(|(i, sql)| format!("{} AS {}", sql, column_name(i)))
            .collect();
        let select = format!(
            "SELECT {} FROM {} AS s ORDER BY s.rowid{}",
            items.join(", "),
            input.table,
            self.guard.cap()
        );
        self.create(&select, fields)
    }

    fn join(
        &mut self,
        left: &Relation,
        right: &Relation,
        on: Option<&Expr>,
        join_type: JoinType,
        right_source: String,
        context: &str,
    ) -> Result<(Relation, JoinStats), ExecutionError> {
        let scope = Scope::joined(&left.fields, &right.fields);
        let condition = match (on, join_type) {
            (Some(expr), _) => Some(scope.expr(expr)?),
            (None, JoinType::Cross) => None,
            (None, other) => {
                return Err(ExecutionError::InvalidProgram(format!(
                    "{} join requires an 'on' condition",
                    other
                )))
            }
        };

        let from = format!("{} AS l", left.table);
        let (matched_left_rows, matched_right_rows) = match &condition {
            Some(on) => (
                self.count(&format!(
                    "SELECT count(*) FROM {} WHERE EXISTS (SELECT 1 FROM {} AS r WHERE {})",
                    from, right.table, on
                ))?,
                self.count(&format!(
                    "SELECT count(*) FROM {} AS r WHERE EXISTS (SELECT 1 FROM {} WHERE {})",
                    right.table, from, on
                ))?,
            ),
            None => {
                self.guard
                    .check_rows(left.rows.saturating_mul(right.rows), context)?;
                let matched = |own: usize, other: usize| if other > 0 { own } else { 0 };
                (matched(left.rows, right.rows), matched(right.rows, left.rows))
            }
        };

        let left_columns: Vec<String> = (0..left.fields.len())
            .map(|i| format!("l.{} AS {}", column_name(i), column_name(i)))
            .collect();

        let relation = match join_type {
            JoinType::Semi | JoinType::Anti => {
                let negate = if join_type == JoinType::Anti { "NOT " } else { "" };
                let on = condition.as_deref().unwrap_or("TRUE");
                let select = format!(
                    "SELECT {} FROM {} WHERE {}EXISTS (SELECT 1 FROM {} AS r WHERE {}) ORDER BY l.rowid{}",
                    left_columns.join(", "),
                    from,
                    negate,
                    right.table,
                    on,
                    self.guard.cap()
                );
                self.create(&select, left.fields.clone())?
            }
            _ => {
                let mut items = left_columns;
                let width = left.fields.len();
                items.extend(
                    (0..right.fields.len())
                        .map(|i| format!("r.{} AS {}", column_name(i), column_name(width + i))),
                );
                let clause = match (join_type, &condition) {
                    (JoinType::Left, Some(on)) => format!("LEFT JOIN {} AS r ON {}", right.table, on),
                    (JoinType::Right, Some(on)) => format!("RIGHT JOIN {} AS r ON {}", right.table, on),
                    (JoinType::Full, Some(on)) => format!("FULL JOIN {} AS r ON {}", right.table, on),
                    (_, Some(on)) => format!("INNER JOIN {} AS r ON {}", right.table, on),
                    (_, None) => format!("CROSS JOIN {} AS r", right.table),
                };

                // Unordered and capped first so an exploding join stops early
                let raw = format!(
                    "SELECT {}, l.rowid AS lo, r.rowid AS ro FROM {} {}{}",
                    items.join(", "),
                    from,
                    clause,
                    self.guard.cap()
                );
                let mut fields = left.fields.clone();
                fields.extend(right.fields.iter().cloned());
                let unordered = self.create(&raw, fields.clone())?;
                self.guard.check_rows(unordered.rows, context)?;
                self.guard.check_deadline()?;

                let ordered = format!(
                    "SELECT {} FROM {} ORDER BY lo NULLS LAST, ro NULLS LAST",
                    (0..fields.len()).map(column_name).collect::<Vec<_>>().join(", "),
                    unordered.table
                );
                let relation = self.create(&ordered, fields)?;
                self.release(&unordered)?;
                relation
            }
        };

        let stats = JoinStats {
            join_type,
            right_source,
            left_rows: left.rows,
            right_rows: right.rows,
            output_rows: relation.rows,
            matched_left_rows,
            matched_right_rows,
        };

        tracing::trace!(
            join_type = %stats.join_type,
            left = stats.left_rows,
            right = stats.right_rows,
            output = stats.output_rows,
            "Join evaluated"
        );

        Ok((relation, stats))
    }

    fn group_by(
        &mut self,
        input: &Relation,
        keys: &[ColumnRef],
        aggs: &BTreeMap<String, AggCall>,
    ) -> Result<Relation, ExecutionError> {
        if keys.is_empty() && aggs.is_empty() {
            return Err(ExecutionError::InvalidProgram(
                "GroupBy needs at least one key or aggregate".to_string(),
            ));
        }

        let scope = Scope::single(&input.fields);
        let mut fields = Vec::with_capacity(keys.len() + aggs.len());
        let mut key_sql = Vec::with_capacity(keys.len());
        for key in keys {
            let (index, sql) = scope.column(key)?;
            fields.push(input.fields[index].clone());
            key_sql.push(sql.to_string());
        }

        let mut items: Vec<String> = key_sql.clone();
        for (name, call) in aggs {
            items.push(scope.aggregate(name, call)?);
            fields.push(Field::new(None, name.as_str()));
        }
        let items: Vec<String> = items
            .into_iter()
            .enumerate()
            .map(|(i, sql)| format!("{} AS {}", sql, column_name(i)))
            .collect();

        // A global aggregate over no rows still yields one row
        let select = if key_sql.is_empty() {
            format!("SELECT {} FROM {} AS s", items.join(", "), input.table)
        } else {
            format!(
                "SELECT {} FROM {} AS s GROUP BY {} ORDER BY min(s.rowid){}",
                items.join(", "),
                input.table,
                key_sql.join(", "),
                self.guard.cap()
            )
        };
        self.create(&select, fields)
    }

    fn sort(&mut self, input: &Relation, keys: &[SortKey]) -> Result<Relation, ExecutionError> {
        let scope = Scope::single(&input.fields);
        let mut order = Vec::with_capacity(keys.len() + 1);
        for key in keys {
            let direction = if key.desc { "DESC" } else { "ASC" };
            order.push(format!("{} {} NULLS LAST", scope.expr(&key.expr)?, direction));
        }
        order.push("s.rowid".to_string());

        let select = format!(
            "SELECT {} FROM {} AS s ORDER BY {}{}",
            input.columns(),
            input.table,
            order.join(", "),
            self.guard.cap()
        );
        self.create(&select, input.fields.clone())
    }

    fn take(&mut self, input: &Relation, limit: i64) -> Result<Relation, ExecutionError> {
        if limit < 0 {
            return Err(ExecutionError::InvalidProgram(format!(
                "Take limit must be non-negative, got {}",
                limit
            )));
        }
        let select = format!(
            "SELECT {} FROM {} ORDER BY rowid LIMIT {}",
            input.columns(),
            input.table,
            limit
        );
        self.create(&select, input.fields.clone())
    }

    fn distinct(&mut self, input: &Relation) -> Result<Relation, ExecutionError> {
        let columns = input.columns();
        let select = format!(
            "SELECT {} FROM {} GROUP BY {} ORDER BY min(rowid){}",
            columns,
            input.table,
            columns,
            self.guard.cap()
        );
        self.create(&select, input.fields.clone())
    }

    /// Read a relation back as the program's result table
    fn fetch(&mut self, relation: &Relation) -> Result<Table, ExecutionError> {
        let width = relation.fields.len();
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM {} ORDER BY rowid",
            relation.columns(),
            relation.table
        ))?;
        let mut rows = stmt.query([])?;

        let mut out = Vec::with_capacity(relation.rows);
        while let Some(row) = rows.next()? {
            self.guard.tick()?;
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(from_duck(row.get_ref(i)?));
            }
            out.push(values);
        }

        Table::new(OUTPUT_NAME, unique_names(&relation.fields), out)
            .map_err(|e| ExecutionError::InvalidProgram(e.to_string()))
    }
}

fn describe_source(source: &Source) -> String {
    match source {
        Source::Table { name, .. } => name.clone(),
        Source::SubPipeline { alias, .. } => alias.clone().unwrap_or_else(|| "subpipeline".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_names_prefix_qualifier_on_clash() {
        let fields = vec![
            Field::new(Some("o"), "id"),
            Field::new(Some("c"), "id"),
            Field::new(Some("c"), "region"),
            Field::new(None, "o_id"),
        ];
        assert_eq!(unique_names(&fields), vec!["o_id", "c_id", "region", "o_id_2"]);
    }

    #[test]
    fn test_wide_integers_fit_values() {
        assert_eq!(from_duck(ValueRef::HugeInt(12)), Value::Int(12));
        assert_eq!(
            from_duck(ValueRef::HugeInt(i128::from(i64::MAX) + 1)),
            Value::Float(9_223_372_036_854_775_808.0)
        );
        assert_eq!(from_duck(ValueRef::Text(b"North")), Value::from("North"));
    }

    #[test]
    fn test_guard_cap_allows_one_row_over_budget() {
        let guard = Guard::new(&ExecutionBudget {
            max_rows: Some(10),
            ..Default::default()
        });
        assert_eq!(guard.cap(), " LIMIT 11");
        assert!(guard.check_rows(10, "step").is_ok());
        assert!(matches!(
            guard.check_rows(11, "step"),
            Err(ExecutionError::BudgetExceeded(_))
        ));
    }
}
