//! Audited database handle
//!
//! [`AuditedDb`] is the wrapped handle applications run their mutations
//! through. Mutations on audited tables are materialized with a
//! row-returning clause (injected when the caller did not ask for one,
//! widened when the caller's selection misses audit-required columns), the
//! returned rows feed the capture pipeline, and the caller receives exactly
//! the shape their own chain asked for.
//!
//! Reads pass through untouched. Mutations on tables outside the audit
//! configuration execute exactly as written.

mod builders;
mod row;
mod transaction;

use std::sync::Arc;

use serde_json::Value as JsonValue;
use sqlx::{PgConnection, PgPool};
use tracing::debug;

use crate::capture::{delete_records, insert_records, update_records};
use crate::config::UpdateValuesMode;
use crate::error::AuditResult;
use crate::logger::LoggerCore;
use crate::record::{AuditRecord, JsonMap};

use builders::{
    audit_columns, bind_value, delete_sql, insert_columns, insert_sql, project_rows, select_sql,
    update_sql, widened_returning, DeletePlan, InsertPlan, Returning, SelectPlan, UpdatePlan,
};
pub use builders::{DeleteBuilder, InsertBuilder, MutationResult, SelectBuilder, UpdateBuilder};
pub use row::row_to_map;
pub use transaction::{AuditedTx, TxDeleteBuilder, TxInsertBuilder, TxUpdateBuilder};

/// Database handle with transparent mutation auditing.
///
/// Cheap to clone; clones share the pool and the audit pipeline.
#[derive(Clone)]
pub struct AuditedDb {
    pool: PgPool,
    core: Arc<LoggerCore>,
}

impl AuditedDb {
    pub(crate) fn new(pool: PgPool, core: Arc<LoggerCore>) -> Self {
        Self { pool, core }
    }

    /// Start an INSERT into `table`.
    pub fn insert(&self, table: impl Into<String>) -> InsertBuilder {
        InsertBuilder::new(self.clone(), table)
    }

    /// Start an UPDATE of `table`.
    pub fn update(&self, table: impl Into<String>) -> UpdateBuilder {
        UpdateBuilder::new(self.clone(), table)
    }

    /// Start a DELETE from `table`.
    pub fn delete(&self, table: impl Into<String>) -> DeleteBuilder {
        DeleteBuilder::new(self.clone(), table)
    }

    /// Start a pass-through SELECT from `table`.
    pub fn select(&self, table: impl Into<String>) -> SelectBuilder {
        SelectBuilder::new(self.clone(), table)
    }

    /// Open a transaction whose mutations are audited after commit.
    pub async fn begin(&self) -> AuditResult<AuditedTx> {
        let tx = self.pool.begin().await?;
        Ok(AuditedTx::new(tx, Arc::clone(&self.core)))
    }

    /// The underlying pool, for reads and statements outside the builders.
    /// Mutations issued directly on it bypass auditing.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) async fn execute_insert(&self, plan: InsertPlan) -> AuditResult<MutationResult> {
        let mut conn = self.pool.acquire().await?;
        let (result, records) = run_insert(&mut conn, &self.core, plan).await?;
        drop(conn);
        self.core.emit(records).await?;
        Ok(result)
    }

    pub(crate) async fn execute_update(&self, plan: UpdatePlan) -> AuditResult<MutationResult> {
        let mut conn = self.pool.acquire().await?;
        let (result, records) = run_update(&mut conn, &self.core, plan).await?;
        drop(conn);
        self.core.emit(records).await?;
        Ok(result)
    }

    pub(crate) async fn execute_delete(&self, plan: DeletePlan) -> AuditResult<MutationResult> {
        let mut conn = self.pool.acquire().await?;
        let (result, records) = run_delete(&mut conn, &self.core, plan).await?;
        drop(conn);
        self.core.emit(records).await?;
        Ok(result)
    }

    pub(crate) async fn execute_select(&self, plan: SelectPlan) -> AuditResult<Vec<JsonMap>> {
        let (sql, binds) = select_sql(&plan.table, plan.columns.as_deref(), &plan.predicates);
        let mut conn = self.pool.acquire().await?;
        Ok(fetch_rows(&mut conn, &sql, binds).await?)
    }
}

/// Execute an INSERT plan on `conn`, returning the caller-facing result and
/// the audit records it produced (empty for non-audited tables).
pub(crate) async fn run_insert(
    conn: &mut PgConnection,
    core: &LoggerCore,
    plan: InsertPlan,
) -> AuditResult<(MutationResult, Vec<AuditRecord>)> {
    let config = &core.config;
    let rows = plan.normalized_rows()?;
    let columns = insert_columns(&rows);

    if !config.should_audit(&plan.table) {
        let (sql, binds) = insert_sql(&plan.table, &columns, &rows, &plan.returning);
        return Ok((passthrough(conn, &sql, binds, &plan.returning).await?, Vec::new()));
    }

    let effective = widened_returning(&plan.returning, &plan.table, config);
    let (sql, binds) = insert_sql(&plan.table, &columns, &rows, &effective);
    let captured = fetch_rows(conn, &sql, binds).await?;

    debug!(
        table = %plan.table,
        rows = captured.len(),
        "Captured inserted rows"
    );

    let records = insert_records(&plan.table, &captured, config)?;
    let result = MutationResult {
        rows_affected: captured.len() as u64,
        rows: project_rows(&captured, &plan.returning),
    };

    Ok((result, records))
}

/// Execute an UPDATE plan on `conn`.
///
/// In changed mode the before-state is read first, on the same connection
/// and under the same predicate, so the read sees the pre-update snapshot.
pub(crate) async fn run_update(
    conn: &mut PgConnection,
    core: &LoggerCore,
    plan: UpdatePlan,
) -> AuditResult<(MutationResult, Vec<AuditRecord>)> {
    let config = &core.config;
    let set = plan.normalized_set()?;

    if !config.should_audit(&plan.table) {
        let (sql, binds) = update_sql(&plan.table, &set, &plan.predicates, &plan.returning);
        return Ok((passthrough(conn, &sql, binds, &plan.returning).await?, Vec::new()));
    }

    let before = if config.update_values_mode == UpdateValuesMode::Changed {
        let projection = audit_columns(&plan.table, config);
        let (sql, binds) = select_sql(&plan.table, projection.as_deref(), &plan.predicates);
        fetch_rows(conn, &sql, binds).await?
    } else {
        Vec::new()
    };

    let effective = widened_returning(&plan.returning, &plan.table, config);
    let (sql, binds) = update_sql(&plan.table, &set, &plan.predicates, &effective);
    let captured = fetch_rows(conn, &sql, binds).await?;

    debug!(
        table = %plan.table,
        before = before.len(),
        after = captured.len(),
        "Captured updated rows"
    );

    let records = update_records(&plan.table, &before, &captured, config)?;
    let result = MutationResult {
        rows_affected: captured.len() as u64,
        rows: project_rows(&captured, &plan.returning),
    };

    Ok((result, records))
}

/// Execute a DELETE plan on `conn`, capturing the rows' final state.
pub(crate) async fn run_delete(
    conn: &mut PgConnection,
    core: &LoggerCore,
    plan: DeletePlan,
) -> AuditResult<(MutationResult, Vec<AuditRecord>)> {
    let config = &core.config;

    if !config.should_audit(&plan.table) {
        let (sql, binds) = delete_sql(&plan.table, &plan.predicates, &plan.returning);
        return Ok((passthrough(conn, &sql, binds, &plan.returning).await?, Vec::new()));
    }

    let effective = widened_returning(&plan.returning, &plan.table, config);
    let (sql, binds) = delete_sql(&plan.table, &plan.predicates, &effective);
    let captured = fetch_rows(conn, &sql, binds).await?;

    debug!(
        table = %plan.table,
        rows = captured.len(),
        "Captured deleted rows"
    );

    let records = delete_records(&plan.table, &captured, config)?;
    let result = MutationResult {
        rows_affected: captured.len() as u64,
        rows: project_rows(&captured, &plan.returning),
    };

    Ok((result, records))
}

/// Run a non-audited statement exactly as the caller wrote it.
async fn passthrough(
    conn: &mut PgConnection,
    sql: &str,
    binds: Vec<JsonValue>,
    returning: &Returning,
) -> Result<MutationResult, sqlx::Error> {
    match returning {
        Returning::None => {
            let rows_affected = execute_count(conn, sql, binds).await?;
            Ok(MutationResult {
                rows_affected,
                rows: Vec::new(),
            })
        }
        _ => {
            let rows = fetch_rows(conn, sql, binds).await?;
            Ok(MutationResult {
                rows_affected: rows.len() as u64,
                rows,
            })
        }
    }
}

pub(crate) async fn fetch_rows(
    conn: &mut PgConnection,
    sql: &str,
    binds: Vec<JsonValue>,
) -> Result<Vec<JsonMap>, sqlx::Error> {
    let mut query = sqlx::query(sql);
    for value in &binds {
        query = bind_value(query, value);
    }

    let rows = query.fetch_all(&mut *conn).await?;
    rows.iter().map(row_to_map).collect()
}

async fn execute_count(
    conn: &mut PgConnection,
    sql: &str,
    binds: Vec<JsonValue>,
) -> Result<u64, sqlx::Error> {
    let mut query = sqlx::query(sql);
    for value in &binds {
        query = bind_value(query, value);
    }

    Ok(query.execute(&mut *conn).await?.rows_affected())
}
