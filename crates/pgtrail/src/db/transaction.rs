//! Audited transactions
//!
//! A transaction opened through the wrapped handle stages its audit records
//! in memory and enqueues them only after the database commit succeeds, so
//! rolled-back work never leaves phantom audit rows. The audit INSERT itself
//! always runs on the writer's own connection, never inside the caller's
//! transaction.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use sqlx::{Postgres, Transaction};
use tracing::debug;

use crate::db::builders::{
    DeletePlan, InsertPlan, MutationResult, Predicate, PredicateOp, Returning, UpdatePlan,
};
use crate::db::{run_delete, run_insert, run_update};
use crate::error::AuditResult;
use crate::logger::LoggerCore;
use crate::record::AuditRecord;

/// In-progress transaction over the audited handle.
pub struct AuditedTx {
    tx: Transaction<'static, Postgres>,
    core: Arc<LoggerCore>,
    staged: Vec<AuditRecord>,
}

impl AuditedTx {
    pub(crate) fn new(tx: Transaction<'static, Postgres>, core: Arc<LoggerCore>) -> Self {
        Self {
            tx,
            core,
            staged: Vec::new(),
        }
    }

    /// Start an INSERT into `table` on this transaction.
    pub fn insert(&mut self, table: impl Into<String>) -> TxInsertBuilder<'_> {
        TxInsertBuilder {
            tx: self,
            plan: InsertPlan {
                table: table.into(),
                rows: Vec::new(),
                returning: Returning::None,
            },
        }
    }

    /// Start an UPDATE of `table` on this transaction.
    pub fn update(&mut self, table: impl Into<String>) -> TxUpdateBuilder<'_> {
        TxUpdateBuilder {
            tx: self,
            plan: UpdatePlan {
                table: table.into(),
                set: None,
                predicates: Vec::new(),
                returning: Returning::None,
            },
        }
    }

    /// Start a DELETE from `table` on this transaction.
    pub fn delete(&mut self, table: impl Into<String>) -> TxDeleteBuilder<'_> {
        TxDeleteBuilder {
            tx: self,
            plan: DeletePlan {
                table: table.into(),
                predicates: Vec::new(),
                returning: Returning::None,
            },
        }
    }

    /// Number of audit records staged for emission at commit.
    pub fn staged_records(&self) -> usize {
        self.staged.len()
    }

    /// Commit the transaction, then enqueue the staged audit records.
    pub async fn commit(self) -> AuditResult<()> {
        let staged = self.staged;
        self.tx.commit().await?;

        debug!(records = staged.len(), "Transaction committed, emitting staged audit records");
        self.core.emit(staged).await
    }

    /// Roll back the transaction, discarding the staged audit records.
    pub async fn rollback(self) -> AuditResult<()> {
        let discarded = self.staged.len();
        self.tx.rollback().await?;

        if discarded > 0 {
            debug!(records = discarded, "Transaction rolled back, staged audit records discarded");
        }
        Ok(())
    }
}

/// Builder for an INSERT inside a transaction.
#[must_use = "call execute() to run the statement"]
pub struct TxInsertBuilder<'a> {
    tx: &'a mut AuditedTx,
    plan: InsertPlan,
}

impl TxInsertBuilder<'_> {
    pub fn values(mut self, values: JsonValue) -> Self {
        match values {
            JsonValue::Array(rows) => self.plan.rows.extend(rows),
            row => self.plan.rows.push(row),
        }
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
        let core = Arc::clone(&self.tx.core);
        let (result, records) = run_insert(&mut self.tx.tx, &core, self.plan).await?;
        self.tx.staged.extend(records);
        Ok(result)
    }
}

/// Builder for an UPDATE inside a transaction.
#[must_use = "call execute() to run the statement"]
pub struct TxUpdateBuilder<'a> {
    tx: &'a mut AuditedTx,
    plan: UpdatePlan,
}

impl TxUpdateBuilder<'_> {
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
        let core = Arc::clone(&self.tx.core);
        let (result, records) = run_update(&mut self.tx.tx, &core, self.plan).await?;
        self.tx.staged.extend(records);
        Ok(result)
    }
}

/// Builder for a DELETE inside a transaction.
#[must_use = "call execute() to run the statement"]
pub struct TxDeleteBuilder<'a> {
    tx: &'a mut AuditedTx,
    plan: DeletePlan,
}

impl TxDeleteBuilder<'_> {
    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.plan.predicates.push(Predicate {
            column: column.into(),
            op: PredicateOp::Eq(value.into()),
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
        let core = Arc::clone(&self.tx.core);
        let (result, records) = run_delete(&mut self.tx.tx, &core, self.plan).await?;
        self.tx.staged.extend(records);
        Ok(result)
    }
}
