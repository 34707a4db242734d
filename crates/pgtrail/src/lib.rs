//! pgtrail
//!
//! Transparent audit logging for PostgreSQL mutations.
//!
//! # Overview
//!
//! Wrap a [`sqlx::PgPool`] once; every INSERT, UPDATE and DELETE executed
//! through the wrapped handle is captured and persisted to an audit table
//! with the operation, affected table, per-row primary key, the relevant
//! column values, and ambient context (acting principal, network
//! identifiers, transaction id, free-form metadata).
//!
//! - **Interception**: mutations are materialized with a row-returning
//!   clause (injected or widened as needed), captured rows feed the audit
//!   pipeline, and callers receive exactly what their own chain asked for.
//! - **Capture**: per-operation transforms compute record ids, filter
//!   permitted columns, and diff before/after states for UPDATEs.
//! - **Persistence**: a bounded queue with size- and time-triggered batch
//!   flushes, strict/lenient failure policy, and graceful shutdown.
//! - **Context**: task-scoped ambient context merged into every record at
//!   persistence time.
//!
//! # Example
//!
//! ```no_run
//! use pgtrail::{create_audit_logger, AuditConfig, AuditContext};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgresql://localhost/app").await?;
//!
//!     let config = AuditConfig::builder()
//!         .tables(["users"])
//!         .table("users", "id")
//!         .build();
//!     let logger = create_audit_logger(pool, config)?;
//!
//!     let ctx = AuditContext::new().with_user_id("admin-7");
//!     logger
//!         .with_context(ctx, async {
//!             logger
//!                 .db()
//!                 .insert("users")
//!                 .values(json!({"email": "a@example.com", "name": "A"}))
//!                 .execute()
//!                 .await
//!         })
//!         .await?;
//!
//!     logger.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod logger;
pub mod record;
pub mod writer;

// Re-export commonly used types
pub use config::{
    AuditConfig, AuditConfigBuilder, PrimaryKey, TableConfig, TableFilter, UpdateValuesMode,
};
pub use db::{AuditedDb, AuditedTx, MutationResult};
pub use error::{AuditError, AuditResult, SanitizedError};
pub use logger::{create_audit_logger, AuditLogger};
pub use record::{AuditAction, AuditContext, AuditRecord, ColumnMap, JsonMap};
pub use writer::{AuditStore, BatchWriter, PendingRecord};
