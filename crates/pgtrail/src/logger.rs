//! Audit logger facade
//!
//! [`create_audit_logger`] wires the pipeline together: validate the
//! configuration, stand up the batching writer over a Postgres store, and
//! hand back an [`AuditLogger`] owning the wrapped database handle, the
//! manual logging operations, and the context controls.

use std::future::Future;
use std::sync::{Arc, RwLock};

use serde_json::Value as JsonValue;
use sqlx::PgPool;
use tracing::debug;

use crate::capture::{delete_records, insert_records, update_records};
use crate::config::AuditConfig;
use crate::context;
use crate::db::AuditedDb;
use crate::error::{AuditError, AuditResult, SanitizedError};
use crate::record::{AuditAction, AuditContext, AuditRecord, JsonMap};
use crate::writer::{BatchWriter, PgAuditStore};

/// Shared state behind the facade and the wrapped handle.
pub(crate) struct LoggerCore {
    pub(crate) config: Arc<AuditConfig>,
    pub(crate) writer: BatchWriter,
    /// Context layer applied under any task-scoped context.
    defaults: RwLock<AuditContext>,
}

impl LoggerCore {
    /// Effective ambient context: logger defaults with the task-scoped
    /// binding merged on top.
    pub(crate) fn effective_context(&self) -> AuditContext {
        let mut ctx = self
            .defaults
            .read()
            .expect("context defaults lock poisoned")
            .clone();

        if let Some(scoped) = context::current() {
            ctx.merge(&scoped);
        }

        ctx
    }

    /// Enqueue records under the effective context.
    ///
    /// Strict mode propagates queueing failures to the caller; lenient mode
    /// reports them to the error sink and keeps the caller's result intact.
    /// Enqueueing after shutdown fails the call in either mode.
    pub(crate) async fn emit(&self, records: Vec<AuditRecord>) -> AuditResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let scope = self.effective_context();
        match self.writer.enqueue(records, &scope).await {
            Ok(()) => Ok(()),
            Err(err @ AuditError::Closed) => Err(err),
            Err(err) if self.config.strict_mode => Err(err),
            Err(err) => {
                (self.config.error_sink)(
                    "[AUDIT] failed to queue audit records",
                    &SanitizedError::from_audit(&err),
                );
                Ok(())
            }
        }
    }
}

/// Front door of the audit pipeline.
///
/// Owns the wrapped handle, the manual logging operations, the context
/// controls, and shutdown.
pub struct AuditLogger {
    core: Arc<LoggerCore>,
    db: AuditedDb,
}

/// Create an audit logger over `pool` with the given configuration.
///
/// Fails fast with a configuration error when the settings are
/// inconsistent; the batch writer and its periodic flusher start
/// immediately. Must be called from within a tokio runtime.
pub fn create_audit_logger(pool: PgPool, config: AuditConfig) -> AuditResult<AuditLogger> {
    config
        .validate()
        .map_err(|err| AuditError::configuration(err.to_string()))?;

    let config = Arc::new(config);
    let store = Arc::new(PgAuditStore::new(
        pool.clone(),
        config.audit_table.clone(),
        config.column_map.clone(),
    ));
    let writer = BatchWriter::new(store, Arc::clone(&config));

    let core = Arc::new(LoggerCore {
        config,
        writer,
        defaults: RwLock::new(AuditContext::default()),
    });

    debug!(
        audit_table = %core.config.audit_table,
        batch_size = core.config.batch_size,
        strict = core.config.strict_mode,
        "Audit logger created"
    );

    let db = AuditedDb::new(pool, Arc::clone(&core));
    Ok(AuditLogger { core, db })
}

impl AuditLogger {
    /// The wrapped database handle.
    pub fn db(&self) -> &AuditedDb {
        &self.db
    }

    /// Whether mutations to `table` are audited. Always false for the audit
    /// table itself.
    pub fn should_audit(&self, table: &str) -> bool {
        self.core.config.should_audit(table)
    }

    /// Manually record inserted rows. Accepts a single JSON object or an
    /// array of objects.
    pub async fn log_insert(&self, table: &str, rows: JsonValue) -> AuditResult<()> {
        self.log_action(AuditAction::Insert, table, rows).await
    }

    /// Manually record deleted rows.
    pub async fn log_delete(&self, table: &str, rows: JsonValue) -> AuditResult<()> {
        self.log_action(AuditAction::Delete, table, rows).await
    }

    /// Manually record updated rows, diffing against `before` when provided
    /// and the configuration asks for changed values.
    pub async fn log_update(
        &self,
        table: &str,
        rows: JsonValue,
        before: Option<JsonValue>,
    ) -> AuditResult<()> {
        if !self.core.config.should_audit(table) {
            return Ok(());
        }

        let after = rows_from(rows, table)?;
        let before = match before {
            Some(value) => rows_from(value, table)?,
            None => Vec::new(),
        };

        let records = update_records(table, &before, &after, &self.core.config)?;
        self.core.emit(records).await
    }

    /// Manually record rows under an arbitrary action, including
    /// [`AuditAction::Read`] and custom labels.
    pub async fn log_action(
        &self,
        action: AuditAction,
        table: &str,
        rows: JsonValue,
    ) -> AuditResult<()> {
        if !self.core.config.should_audit(table) {
            return Ok(());
        }

        let rows = rows_from(rows, table)?;
        let records = match action {
            AuditAction::Insert => insert_records(table, &rows, &self.core.config)?,
            AuditAction::Delete => delete_records(table, &rows, &self.core.config)?,
            other => insert_records(table, &rows, &self.core.config)?
                .into_iter()
                .map(|mut record| {
                    record.action = other.clone();
                    record
                })
                .collect(),
        };

        self.core.emit(records).await
    }

    /// Merge `partial` into the ambient context: into the task-scoped
    /// binding when one is active, otherwise into the logger defaults that
    /// underlie every scope.
    pub fn set_context(&self, partial: &AuditContext) {
        if !context::merge(partial) {
            self.core
                .defaults
                .write()
                .expect("context defaults lock poisoned")
                .merge(partial);
        }
    }

    /// Run `fut` with `ctx` bound as the task-scoped audit context.
    pub async fn with_context<F, T>(&self, ctx: AuditContext, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        context::scope(ctx, fut).await
    }

    /// The effective ambient context (logger defaults plus any task-scoped
    /// binding).
    pub fn context(&self) -> AuditContext {
        self.core.effective_context()
    }

    /// Records currently queued for persistence.
    pub fn queue_size(&self) -> usize {
        self.core.writer.queue_size()
    }

    /// Whether a flush is writing right now.
    pub fn is_flushing(&self) -> bool {
        self.core.writer.is_flushing()
    }

    /// Flush queued records now, returning how many were persisted.
    pub async fn flush(&self) -> AuditResult<usize> {
        self.core.writer.flush().await
    }

    /// Drain the queue and close the writer. Idempotent; further mutations
    /// still execute but their audit records are rejected.
    pub async fn shutdown(&self) -> AuditResult<()> {
        self.core.writer.shutdown().await
    }
}

/// Normalize a caller-supplied JSON payload into rows.
fn rows_from(value: JsonValue, table: &str) -> AuditResult<Vec<JsonMap>> {
    match value {
        JsonValue::Object(map) => Ok(vec![map]),
        JsonValue::Array(items) => items
            .into_iter()
            .map(|item| match item {
                JsonValue::Object(map) => Ok(map),
                other => Err(AuditError::capture(format!(
                    "rows for {table} must be JSON objects, got {other}"
                ))),
            })
            .collect(),
        other => Err(AuditError::capture(format!(
            "rows for {table} must be JSON objects, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rows_from_single_object() {
        let rows = rows_from(json!({"id": 1}), "users").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(1));
    }

    #[test]
    fn test_rows_from_array() {
        let rows = rows_from(json!([{"id": 1}, {"id": 2}]), "users").unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_rows_from_rejects_scalars() {
        assert!(rows_from(json!(42), "users").is_err());
        assert!(rows_from(json!([{"id": 1}, 2]), "users").is_err());
    }
}
