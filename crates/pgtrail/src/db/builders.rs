//! Mutation and query builders
//!
//! The typed surface callers chain mutations on. Builders collect a plan
//! (table, values, predicates, requested RETURNING projection); the terminal
//! `execute` hands the plan to the audited execution path. SQL is emitted as
//! parameterized statements with `$n` placeholders, PostgreSQL dialect only.

use serde_json::Value as JsonValue;

use crate::config::AuditConfig;
use crate::db::AuditedDb;
use crate::error::{AuditError, AuditResult};
use crate::record::JsonMap;
use crate::writer::quote_ident;

/// Requested row-returning projection of a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Returning {
    /// Caller did not chain `returning`.
    None,
    /// `RETURNING *`
    All,
    /// Explicit column selection.
    Columns(Vec<String>),
}

/// One conjunct of a WHERE clause.
#[derive(Debug, Clone)]
pub(crate) struct Predicate {
    pub column: String,
    pub op: PredicateOp,
}

#[derive(Debug, Clone)]
pub(crate) enum PredicateOp {
    Eq(JsonValue),
    In(Vec<JsonValue>),
}

/// Result of a mutation executed through the audited handle.
///
/// `rows` carries exactly what the caller's `returning` selection asked for;
/// it stays empty when no `returning` was chained, even though the audited
/// path collects rows internally.
#[derive(Debug, Clone, Default)]
pub struct MutationResult {
    pub rows_affected: u64,
    pub rows: Vec<JsonMap>,
}

// ============================================================================
// Plans
// ============================================================================

#[derive(Debug, Clone)]
pub(crate) struct InsertPlan {
    pub table: String,
    pub rows: Vec<JsonValue>,
    pub returning: Returning,
}

#[derive(Debug, Clone)]
pub(crate) struct UpdatePlan {
    pub table: String,
    pub set: Option<JsonValue>,
    pub predicates: Vec<Predicate>,
    pub returning: Returning,
}

#[derive(Debug, Clone)]
pub(crate) struct DeletePlan {
    pub table: String,
    pub predicates: Vec<Predicate>,
    pub returning: Returning,
}

#[derive(Debug, Clone)]
pub(crate) struct SelectPlan {
    pub table: String,
    pub columns: Option<Vec<String>>,
    pub predicates: Vec<Predicate>,
}

impl InsertPlan {
    /// Validate and normalize the staged rows into ordered maps.
    pub fn normalized_rows(&self) -> AuditResult<Vec<JsonMap>> {
        if self.rows.is_empty() {
            return Err(AuditError::capture(format!(
                "insert into {} has no values",
                self.table
            )));
        }

        self.rows
            .iter()
            .map(|row| match row {
                JsonValue::Object(map) => Ok(map.clone()),
                other => Err(AuditError::capture(format!(
                    "insert values for {} must be JSON objects, got {other}",
                    self.table
                ))),
            })
            .collect()
    }
}

impl UpdatePlan {
    pub fn normalized_set(&self) -> AuditResult<JsonMap> {
        match &self.set {
            Some(JsonValue::Object(map)) if !map.is_empty() => Ok(map.clone()),
            Some(other) => Err(AuditError::capture(format!(
                "update set for {} must be a JSON object, got {other}",
                self.table
            ))),
            _ => Err(AuditError::capture(format!(
                "update on {} has no set clause",
                self.table
            ))),
        }
    }
}

// ============================================================================
// SQL assembly
// ============================================================================

/// Ordered union of column names across all staged rows.
pub(crate) fn insert_columns(rows: &[JsonMap]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

pub(crate) fn insert_sql(
    table: &str,
    columns: &[String],
    rows: &[JsonMap],
    returning: &Returning,
) -> (String, Vec<JsonValue>) {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut sql = format!("INSERT INTO {} ({}) VALUES ", quote_ident(table), column_list);
    let mut binds = Vec::with_capacity(columns.len() * rows.len());

    for (i, row) in rows.iter().enumerate() {
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for (j, column) in columns.iter().enumerate() {
            if j > 0 {
                sql.push_str(", ");
            }
            binds.push(row.get(column.as_str()).cloned().unwrap_or(JsonValue::Null));
            sql.push_str(&format!("${}", binds.len()));
        }
        sql.push(')');
    }

    push_returning(&mut sql, returning);
    (sql, binds)
}

pub(crate) fn update_sql(
    table: &str,
    set: &JsonMap,
    predicates: &[Predicate],
    returning: &Returning,
) -> (String, Vec<JsonValue>) {
    let mut sql = format!("UPDATE {} SET ", quote_ident(table));
    let mut binds = Vec::with_capacity(set.len() + predicates.len());

    for (i, (column, value)) in set.iter().enumerate() {
        if i > 0 {
            sql.push_str(", ");
        }
        binds.push(value.clone());
        sql.push_str(&format!("{} = ${}", quote_ident(column), binds.len()));
    }

    push_predicates(&mut sql, &mut binds, predicates);
    push_returning(&mut sql, returning);
    (sql, binds)
}

pub(crate) fn delete_sql(
    table: &str,
    predicates: &[Predicate],
    returning: &Returning,
) -> (String, Vec<JsonValue>) {
    let mut sql = format!("DELETE FROM {}", quote_ident(table));
    let mut binds = Vec::with_capacity(predicates.len());

    push_predicates(&mut sql, &mut binds, predicates);
    push_returning(&mut sql, returning);
    (sql, binds)
}

pub(crate) fn select_sql(
    table: &str,
    columns: Option<&[String]>,
    predicates: &[Predicate],
) -> (String, Vec<JsonValue>) {
    let projection = match columns {
        Some(cols) if !cols.is_empty() => cols
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", "),
        _ => "*".to_string(),
    };

    let mut sql = format!("SELECT {} FROM {}", projection, quote_ident(table));
    let mut binds = Vec::with_capacity(predicates.len());

    push_predicates(&mut sql, &mut binds, predicates);
    (sql, binds)
}

fn push_predicates(sql: &mut String, binds: &mut Vec<JsonValue>, predicates: &[Predicate]) {
    for (i, predicate) in predicates.iter().enumerate() {
        sql.push_str(if i == 0 { " WHERE " } else { " AND " });

        match &predicate.op {
            PredicateOp::Eq(JsonValue::Null) => {
                sql.push_str(&format!("{} IS NULL", quote_ident(&predicate.column)));
            }
            PredicateOp::Eq(value) => {
                binds.push(value.clone());
                sql.push_str(&format!(
                    "{} = ${}",
                    quote_ident(&predicate.column),
                    binds.len()
                ));
            }
            PredicateOp::In(values) => {
                sql.push_str(&format!("{} IN (", quote_ident(&predicate.column)));
                for (j, value) in values.iter().enumerate() {
                    if j > 0 {
                        sql.push_str(", ");
                    }
                    binds.push(value.clone());
                    sql.push_str(&format!("${}", binds.len()));
                }
                sql.push(')');
            }
        }
    }
}

fn push_returning(sql: &mut String, returning: &Returning) {
    match returning {
        Returning::None => {}
        Returning::All => sql.push_str(" RETURNING *"),
        Returning::Columns(columns) => {
            sql.push_str(" RETURNING ");
            sql.push_str(
                &columns
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", "),
            );
        }
    }
}

/// Bind a dynamic JSON value with the closest PostgreSQL type.
pub(crate) fn bind_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    value: &JsonValue,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    match value {
        JsonValue::Null => query.bind(Option::<String>::None),
        JsonValue::Bool(b) => query.bind(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        JsonValue::String(s) => query.bind(s.clone()),
        // Objects and arrays persist as jsonb.
        other => query.bind(other.clone()),
    }
}

// ============================================================================
// Audit projection
// ============================================================================

/// Columns the audit pipeline needs for `table`: the primary key plus every
/// permitted captured field. `None` means the whole row is needed.
pub(crate) fn audit_columns(table: &str, config: &AuditConfig) -> Option<Vec<String>> {
    let fields = config.fields.get(table)?;

    let mut columns: Vec<String> = config
        .primary_key(table)
        .map(|pk| pk.columns().to_vec())
        .unwrap_or_default();

    for field in fields {
        if config.exclude_fields.iter().any(|f| f == field) {
            continue;
        }
        if !columns.iter().any(|c| c == field) {
            columns.push(field.clone());
        }
    }

    Some(columns)
}

/// RETURNING projection actually sent to the database for an audited
/// mutation: the caller's selection widened to cover the audit columns.
pub(crate) fn widened_returning(user: &Returning, table: &str, config: &AuditConfig) -> Returning {
    match (user, audit_columns(table, config)) {
        (Returning::Columns(user_cols), Some(needed)) => {
            let mut columns = user_cols.clone();
            for column in needed {
                if !columns.iter().any(|c| c == &column) {
                    columns.push(column);
                }
            }
            Returning::Columns(columns)
        }
        // Caller wants everything, or the audit pipeline does.
        _ => Returning::All,
    }
}

/// Project captured rows back down to the caller's selection.
pub(crate) fn project_rows(rows: &[JsonMap], returning: &Returning) -> Vec<JsonMap> {
    match returning {
        Returning::None => Vec::new(),
        Returning::All => rows.to_vec(),
        Returning::Columns(columns) => rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .filter_map(|c| row.get(c.as_str()).map(|v| (c.clone(), v.clone())))
                    .collect()
            })
            .collect(),
    }
}

// ============================================================================
// Builders
// ============================================================================

/// Builder for an INSERT through the audited handle.
#[must_use = "call execute() to run the statement"]
pub struct InsertBuilder {
    db: AuditedDb,
    plan: InsertPlan,
}

impl InsertBuilder {
    pub(crate) fn new(db: AuditedDb, table: impl Into<String>) -> Self {
        Self {
            db,
            plan: InsertPlan {
                table: table.into(),
                rows: Vec::new(),
                returning: Returning::None,
            },
        }
    }

    /// Stage a row (or, when given an array, several rows) to insert.
    pub fn values(mut self, values: JsonValue) -> Self {
        match values {
            JsonValue::Array(rows) => self.plan.rows.extend(rows),
            row => self.plan.rows.push(row),
        }
        self
    }

    /// Request specific columns back from the statement.
    pub fn returning<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plan.returning = Returning::Columns(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Request the full rows back from the statement.
    pub fn returning_all(mut self) -> Self {
        self.plan.returning = Returning::All;
        self
    }

    pub async fn execute(self) -> AuditResult<MutationResult> {
        self.db.execute_insert(self.plan).await
    }
}

/// Builder for an UPDATE through the audited handle.
#[must_use = "call execute() to run the statement"]
pub struct UpdateBuilder {
    db: AuditedDb,
    plan: UpdatePlan,
}

impl UpdateBuilder {
    pub(crate) fn new(db: AuditedDb, table: impl Into<String>) -> Self {
        Self {
            db,
            plan: UpdatePlan {
                table: table.into(),
                set: None,
                predicates: Vec::new(),
                returning: Returning::None,
            },
        }
    }

    /// Columns to assign.
    pub fn set(mut self, values: JsonValue) -> Self {
        self.plan.set = Some(values);
        self
    }

    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.plan.predicates.push(Predicate {
            column: column.into(),
            op: PredicateOp::Eq(value.into()),
        });
        self
    }

    pub fn where_in<I, V>(mut self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<JsonValue>,
    {
        self.plan.predicates.push(Predicate {
            column: column.into(),
            op: PredicateOp::In(values.into_iter().map(Into::into).collect()),
        });
        self
    }

    pub fn returning<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plan.returning = Returning::Columns(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn returning_all(mut self) -> Self {
        self.plan.returning = Returning::All;
        self
    }

    pub async fn execute(self) -> AuditResult<MutationResult> {
        self.db.execute_update(self.plan).await
    }
}

/// Builder for a DELETE through the audited handle.
#[must_use = "call execute() to run the statement"]
pub struct DeleteBuilder {
    db: AuditedDb,
    plan: DeletePlan,
}

impl DeleteBuilder {
    pub(crate) fn new(db: AuditedDb, table: impl Into<String>) -> Self {
        Self {
            db,
            plan: DeletePlan {
                table: table.into(),
                predicates: Vec::new(),
                returning: Returning::None,
            },
        }
    }

    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.plan.predicates.push(Predicate {
            column: column.into(),
            op: PredicateOp::Eq(value.into()),
        });
        self
    }

    pub fn where_in<I, V>(mut self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<JsonValue>,
    {
        self.plan.predicates.push(Predicate {
            column: column.into(),
            op: PredicateOp::In(values.into_iter().map(Into::into).collect()),
        });
        self
    }

    pub fn returning<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plan.returning = Returning::Columns(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn returning_all(mut self) -> Self {
        self.plan.returning = Returning::All;
        self
    }

    pub async fn execute(self) -> AuditResult<MutationResult> {
        self.db.execute_delete(self.plan).await
    }
}

/// Builder for a pass-through SELECT. Reads are never audited.
#[must_use = "call fetch_all() to run the query"]
pub struct SelectBuilder {
    db: AuditedDb,
    plan: SelectPlan,
}

impl SelectBuilder {
    pub(crate) fn new(db: AuditedDb, table: impl Into<String>) -> Self {
        Self {
            db,
            plan: SelectPlan {
                table: table.into(),
                columns: None,
                predicates: Vec::new(),
            },
        }
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plan.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.plan.predicates.push(Predicate {
            column: column.into(),
            op: PredicateOp::Eq(value.into()),
        });
        self
    }

    pub async fn fetch_all(self) -> AuditResult<Vec<JsonMap>> {
        self.db.execute_select(self.plan).await
    }
}
