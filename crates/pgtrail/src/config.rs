//! Configuration management
//!
//! All configuration is programmatic: build an [`AuditConfig`] through the
//! fluent builder and hand it to [`crate::create_audit_logger`]. Validation
//! runs once at construction and fails fast on inconsistent settings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{default_error_sink, ErrorSink};
use crate::record::{ColumnMap, JsonMap};

// ============================================================================
// Defaults
// ============================================================================

/// Default audit table name.
pub const DEFAULT_AUDIT_TABLE: &str = "audit_logs";

/// Default number of records per flush batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default interval between timer-driven flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Default bound on queued records before backpressure applies.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 10_000;

/// Column names filtered out of captured values regardless of table.
pub const DEFAULT_EXCLUDE_FIELDS: [&str; 4] = ["password", "token", "secret", "apiKey"];

/// Extractor for the ambient acting principal.
pub type UserIdExtractor = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Extractor for ambient metadata attached to every record.
pub type MetadataExtractor = Arc<dyn Fn() -> Option<JsonMap> + Send + Sync>;

/// Which tables are audited
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TableFilter {
    /// Audit every table except the audit table itself.
    #[default]
    All,
    /// Audit only the listed tables.
    Only(Vec<String>),
}

impl TableFilter {
    pub fn contains(&self, table: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(tables) => tables.iter().any(|t| t == table),
        }
    }
}

/// Policy for what an UPDATE record carries in `values`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdateValuesMode {
    /// Snapshot of the (filtered) post-update row.
    Full,
    /// Only the columns whose value actually changed.
    #[default]
    Changed,
}

/// Primary key specification for one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimaryKey {
    Single(String),
    Composite(Vec<String>),
}

impl PrimaryKey {
    /// The key columns as an ordered slice.
    pub fn columns(&self) -> &[String] {
        match self {
            Self::Single(col) => std::slice::from_ref(col),
            Self::Composite(cols) => cols,
        }
    }
}

impl From<&str> for PrimaryKey {
    fn from(col: &str) -> Self {
        Self::Single(col.to_string())
    }
}

impl From<Vec<&str>> for PrimaryKey {
    fn from(cols: Vec<&str>) -> Self {
        Self::Composite(cols.into_iter().map(String::from).collect())
    }
}

/// Per-table audit settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableConfig {
    pub primary_key: PrimaryKey,
}

impl TableConfig {
    pub fn new(primary_key: impl Into<PrimaryKey>) -> Self {
        Self {
            primary_key: primary_key.into(),
        }
    }
}

/// Normalized audit configuration
#[derive(Clone)]
pub struct AuditConfig {
    /// Which tables to audit.
    pub tables: TableFilter,
    /// Per-table column allowlist; absent means every column.
    pub fields: HashMap<String, Vec<String>>,
    /// Columns filtered out of captured values globally.
    pub exclude_fields: Vec<String>,
    /// Target table for audit rows.
    pub audit_table: String,
    /// Propagate failures to callers instead of logging them.
    pub strict_mode: bool,
    /// Callers await persistence of their records.
    pub wait_for_write: bool,
    /// Records per flush batch.
    pub batch_size: usize,
    /// Interval between timer-driven flushes.
    pub flush_interval: Duration,
    /// Queue bound before backpressure applies.
    pub max_queue_size: usize,
    /// Snapshot vs. diff recording for UPDATEs.
    pub update_values_mode: UpdateValuesMode,
    /// Per-table settings, keyed by table name.
    pub table_configs: HashMap<String, TableConfig>,
    /// Column remapping for the audit table.
    pub column_map: ColumnMap,
    /// Ambient principal extractor.
    pub get_user_id: Option<UserIdExtractor>,
    /// Ambient metadata extractor.
    pub get_metadata: Option<MetadataExtractor>,
    /// Sink for non-fatal errors in lenient mode.
    pub error_sink: ErrorSink,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            tables: TableFilter::All,
            fields: HashMap::new(),
            exclude_fields: DEFAULT_EXCLUDE_FIELDS.iter().map(|s| s.to_string()).collect(),
            audit_table: DEFAULT_AUDIT_TABLE.to_string(),
            strict_mode: false,
            wait_for_write: false,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            update_values_mode: UpdateValuesMode::default(),
            table_configs: HashMap::new(),
            column_map: ColumnMap::default(),
            get_user_id: None,
            get_metadata: None,
            error_sink: default_error_sink(),
        }
    }
}

impl std::fmt::Debug for AuditConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditConfig")
            .field("tables", &self.tables)
            .field("fields", &self.fields)
            .field("exclude_fields", &self.exclude_fields)
            .field("audit_table", &self.audit_table)
            .field("strict_mode", &self.strict_mode)
            .field("wait_for_write", &self.wait_for_write)
            .field("batch_size", &self.batch_size)
            .field("flush_interval", &self.flush_interval)
            .field("max_queue_size", &self.max_queue_size)
            .field("update_values_mode", &self.update_values_mode)
            .field("table_configs", &self.table_configs)
            .field("column_map", &self.column_map)
            .field("get_user_id", &self.get_user_id.as_ref().map(|_| "<fn>"))
            .field("get_metadata", &self.get_metadata.as_ref().map(|_| "<fn>"))
            .finish_non_exhaustive()
    }
}

impl AuditConfig {
    /// Create a builder for fluent configuration
    pub fn builder() -> AuditConfigBuilder {
        AuditConfigBuilder::default()
    }

    /// Whether mutations to `table` should be audited.
    pub fn should_audit(&self, table: &str) -> bool {
        table != self.audit_table && self.tables.contains(table)
    }

    /// Primary key columns configured for `table`, if any.
    pub fn primary_key(&self, table: &str) -> Option<&PrimaryKey> {
        self.table_configs.get(table).map(|tc| &tc.primary_key)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be greater than 0");
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("max_queue_size must be greater than 0");
        }

        if self.batch_size > self.max_queue_size {
            anyhow::bail!(
                "batch_size ({}) cannot be greater than max_queue_size ({})",
                self.batch_size,
                self.max_queue_size
            );
        }

        if self.flush_interval.is_zero() {
            anyhow::bail!("flush_interval must be greater than zero");
        }

        if self.audit_table.trim().is_empty() {
            anyhow::bail!("audit_table cannot be empty");
        }

        if let TableFilter::Only(tables) = &self.tables {
            if tables.is_empty() {
                anyhow::bail!("tables list cannot be empty; use the wildcard filter instead");
            }
            if tables.iter().any(|t| t == &self.audit_table) {
                anyhow::bail!(
                    "audit table '{}' cannot itself be audited",
                    self.audit_table
                );
            }
        }

        Ok(())
    }
}

/// Builder for [`AuditConfig`]
#[derive(Default)]
pub struct AuditConfigBuilder {
    config: AuditConfig,
}

impl AuditConfigBuilder {
    /// Audit only the listed tables.
    pub fn tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.tables = TableFilter::Only(tables.into_iter().map(Into::into).collect());
        self
    }

    /// Audit every table (the default).
    pub fn all_tables(mut self) -> Self {
        self.config.tables = TableFilter::All;
        self
    }

    /// Capture only the listed columns of `table`.
    pub fn fields<I, S>(mut self, table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config
            .fields
            .insert(table.into(), columns.into_iter().map(Into::into).collect());
        self
    }

    /// Replace the globally redacted column set.
    pub fn exclude_fields<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.exclude_fields = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn audit_table(mut self, table: impl Into<String>) -> Self {
        self.config.audit_table = table.into();
        self
    }

    pub fn strict_mode(mut self, strict: bool) -> Self {
        self.config.strict_mode = strict;
        self
    }

    pub fn wait_for_write(mut self, wait: bool) -> Self {
        self.config.wait_for_write = wait;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.config.max_queue_size = size;
        self
    }

    pub fn update_values_mode(mut self, mode: UpdateValuesMode) -> Self {
        self.config.update_values_mode = mode;
        self
    }

    /// Configure the primary key for `table`. Required for every audited
    /// table that sees mutations.
    pub fn table(mut self, table: impl Into<String>, primary_key: impl Into<PrimaryKey>) -> Self {
        self.config
            .table_configs
            .insert(table.into(), TableConfig::new(primary_key));
        self
    }

    pub fn column_map(mut self, map: ColumnMap) -> Self {
        self.config.column_map = map;
        self
    }

    pub fn get_user_id<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        self.config.get_user_id = Some(Arc::new(f));
        self
    }

    pub fn get_metadata<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Option<JsonMap> + Send + Sync + 'static,
    {
        self.config.get_metadata = Some(Arc::new(f));
        self
    }

    pub fn error_sink<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &crate::error::SanitizedError) + Send + Sync + 'static,
    {
        self.config.error_sink = Arc::new(f);
        self
    }

    pub fn build(self) -> AuditConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AuditConfig::default();
        assert_eq!(config.audit_table, DEFAULT_AUDIT_TABLE);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.max_queue_size, DEFAULT_MAX_QUEUE_SIZE);
        assert_eq!(config.update_values_mode, UpdateValuesMode::Changed);
        assert!(config.exclude_fields.iter().any(|f| f == "password"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = AuditConfig::builder()
            .tables(["users", "orders"])
            .table("users", "id")
            .table("orders", vec!["org_id", "order_id"])
            .fields("users", ["email", "name"])
            .batch_size(5)
            .strict_mode(true)
            .build();

        assert!(config.should_audit("users"));
        assert!(!config.should_audit("payments"));
        assert_eq!(
            config.primary_key("users"),
            Some(&PrimaryKey::Single("id".to_string()))
        );
        assert_eq!(
            config.primary_key("orders").map(PrimaryKey::columns),
            Some(&["org_id".to_string(), "order_id".to_string()][..])
        );
        assert!(config.strict_mode);
    }

    #[test]
    fn test_audit_table_never_audited() {
        let config = AuditConfig::default();
        assert!(config.should_audit("users"));
        assert!(!config.should_audit(DEFAULT_AUDIT_TABLE));
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = AuditConfig::builder().batch_size(0).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_batch_above_queue_bound() {
        let config = AuditConfig::builder().batch_size(64).max_queue_size(8).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_audited_audit_table() {
        let config = AuditConfig::builder()
            .tables(["users", DEFAULT_AUDIT_TABLE])
            .build();
        assert!(config.validate().is_err());
    }
}
