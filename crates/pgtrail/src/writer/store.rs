//! Audit persistence
//!
//! The writer talks to storage through [`AuditStore`] so tests can inject a
//! double; production uses [`PgAuditStore`], which persists a batch as one
//! multi-row parameterized INSERT into the configured audit table.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use crate::record::{AuditAction, AuditContext, AuditRecord, ColumnMap, JsonMap};

/// An audit record with its context snapshot resolved at enqueue time.
#[derive(Debug, Clone)]
pub struct PendingRecord {
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub action: AuditAction,
    pub table_name: String,
    pub record_id: String,
    pub values: Option<JsonMap>,
    pub metadata: Option<JsonMap>,
    pub transaction_id: Option<String>,
}

impl PendingRecord {
    /// Snapshot `record` under an already-merged context.
    pub fn new(record: AuditRecord, context: &AuditContext, metadata: Option<JsonMap>) -> Self {
        Self {
            user_id: context.user_id.clone(),
            ip_address: context.ip_address.clone(),
            user_agent: context.user_agent.clone(),
            action: record.action,
            table_name: record.table_name,
            record_id: record.record_id,
            values: record.values,
            metadata,
            transaction_id: context.transaction_id.clone(),
        }
    }
}

/// Storage backend for flushed audit batches.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persist `records` atomically, in order.
    async fn insert_batch(&self, records: &[PendingRecord]) -> Result<(), sqlx::Error>;
}

/// PostgreSQL-backed audit store.
pub struct PgAuditStore {
    pool: PgPool,
    audit_table: String,
    column_map: ColumnMap,
}

/// Number of bound parameters per audit row.
const BINDS_PER_RECORD: usize = 9;

impl PgAuditStore {
    pub fn new(pool: PgPool, audit_table: impl Into<String>, column_map: ColumnMap) -> Self {
        Self {
            pool,
            audit_table: audit_table.into(),
            column_map,
        }
    }

    /// Build the multi-row INSERT statement for `count` records.
    fn insert_sql(&self, count: usize) -> String {
        let columns = self
            .column_map
            .insert_columns()
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ",
            quote_ident(&self.audit_table),
            columns
        );

        for row in 0..count {
            if row > 0 {
                sql.push_str(", ");
            }
            sql.push('(');
            for slot in 0..BINDS_PER_RECORD {
                if slot > 0 {
                    sql.push_str(", ");
                }
                sql.push_str(&format!("${}", row * BINDS_PER_RECORD + slot + 1));
            }
            sql.push(')');
        }

        sql
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn insert_batch(&self, records: &[PendingRecord]) -> Result<(), sqlx::Error> {
        if records.is_empty() {
            return Ok(());
        }

        let sql = self.insert_sql(records.len());
        let mut query = sqlx::query(&sql);

        for record in records {
            query = query
                .bind(record.user_id.clone())
                .bind(record.ip_address.clone())
                .bind(record.user_agent.clone())
                .bind(record.action.as_str().to_string())
                .bind(record.table_name.clone())
                .bind(record.record_id.clone())
                .bind(record.values.clone().map(serde_json::Value::Object))
                .bind(record.metadata.clone().map(serde_json::Value::Object))
                .bind(record.transaction_id.clone());
        }

        let result = query.execute(&self.pool).await?;

        debug!(
            table = %self.audit_table,
            count = records.len(),
            rows_affected = result.rows_affected(),
            "Persisted audit batch"
        );

        Ok(())
    }
}

/// Double-quote an identifier, escaping embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("values"), "\"values\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[tokio::test]
    async fn test_insert_sql_single_row() {
        let store = PgAuditStore::new_for_sql_tests();
        let sql = store.insert_sql(1);

        assert!(sql.starts_with("INSERT INTO \"audit_logs\" (\"user_id\", \"ip_address\""));
        assert!(sql.contains("\"values\""));
        assert!(sql.ends_with("($1, $2, $3, $4, $5, $6, $7, $8, $9)"));
    }

    #[tokio::test]
    async fn test_insert_sql_numbers_parameters_across_rows() {
        let store = PgAuditStore::new_for_sql_tests();
        let sql = store.insert_sql(3);

        assert!(sql.contains("($10, $11, $12, $13, $14, $15, $16, $17, $18)"));
        assert!(sql.ends_with("($19, $20, $21, $22, $23, $24, $25, $26, $27)"));
    }

    impl PgAuditStore {
        fn new_for_sql_tests() -> Self {
            Self {
                pool: PgPool::connect_lazy("postgresql://localhost/unused")
                    .expect("lazy pool"),
                audit_table: "audit_logs".to_string(),
                column_map: ColumnMap::default(),
            }
        }
    }
}
