//! Audit data models
//!
//! In-memory record and context types flowing from capture to persistence,
//! plus the column remapping applied when records are written out.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Row payloads and metadata travel as ordered JSON objects.
pub type JsonMap = serde_json::Map<String, JsonValue>;

/// Metadata keys that are never allowed through a merge.
pub const FORBIDDEN_METADATA_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

/// Kind of mutation an audit record describes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditAction {
    Insert,
    Update,
    Delete,
    Read,
    /// Caller-supplied action label for manual log calls.
    #[serde(untagged)]
    Custom(String),
}

impl AuditAction {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Read => "READ",
            Self::Custom(s) => s,
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single row-level mutation waiting to be persisted
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    /// Operation performed
    pub action: AuditAction,
    /// Table the row belongs to
    pub table_name: String,
    /// Stringified primary key of the affected row
    pub record_id: String,
    /// Captured column values (filtered, possibly diffed)
    pub values: Option<JsonMap>,
    /// Record-level metadata, merged under the context metadata at enqueue
    pub metadata: Option<JsonMap>,
}

impl AuditRecord {
    pub fn new(action: AuditAction, table_name: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            action,
            table_name: table_name.into(),
            record_id: record_id.into(),
            values: None,
            metadata: None,
        }
    }

    pub fn with_values(mut self, values: JsonMap) -> Self {
        self.values = Some(values);
        self
    }

    pub fn with_metadata(mut self, metadata: JsonMap) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Ambient context attached to records at persist time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditContext {
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub transaction_id: Option<String>,
    pub metadata: Option<JsonMap>,
}

impl AuditContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    pub fn with_transaction_id(mut self, txn: impl Into<String>) -> Self {
        self.transaction_id = Some(txn.into());
        self
    }

    pub fn with_metadata(mut self, metadata: JsonMap) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Right-biased merge: fields set on `other` win, unset fields never
    /// overwrite. Metadata maps merge key-by-key under the same bias.
    pub fn merge(&mut self, other: &AuditContext) {
        if other.user_id.is_some() {
            self.user_id = other.user_id.clone();
        }
        if other.ip_address.is_some() {
            self.ip_address = other.ip_address.clone();
        }
        if other.user_agent.is_some() {
            self.user_agent = other.user_agent.clone();
        }
        if other.transaction_id.is_some() {
            self.transaction_id = other.transaction_id.clone();
        }
        if other.metadata.is_some() {
            self.metadata = merge_metadata(&[self.metadata.as_ref(), other.metadata.as_ref()]);
        }
    }

    /// Merged copy, `self` as the base layer.
    pub fn merged(&self, other: &AuditContext) -> AuditContext {
        let mut out = self.clone();
        out.merge(other);
        out
    }
}

/// Merge metadata layers left to right; later layers override earlier ones.
///
/// Null values do not overwrite, forbidden keys are always dropped, and an
/// effectively empty result collapses to `None` so it persists as SQL NULL
/// rather than `{}`.
pub fn merge_metadata(layers: &[Option<&JsonMap>]) -> Option<JsonMap> {
    let mut merged = JsonMap::new();

    for layer in layers.iter().flatten() {
        for (key, value) in layer.iter() {
            if FORBIDDEN_METADATA_KEYS.contains(&key.as_str()) {
                continue;
            }
            if value.is_null() {
                continue;
            }
            merged.insert(key.clone(), value.clone());
        }
    }

    if merged.is_empty() {
        None
    } else {
        Some(merged)
    }
}

/// Column names used when writing audit rows.
///
/// Defaults match the shipped migration; remap when the target table uses a
/// different naming scheme.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMap {
    pub user_id: String,
    pub ip_address: String,
    pub user_agent: String,
    pub action: String,
    pub table_name: String,
    pub record_id: String,
    pub values: String,
    pub metadata: String,
    pub transaction_id: String,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            user_id: "user_id".to_string(),
            ip_address: "ip_address".to_string(),
            user_agent: "user_agent".to_string(),
            action: "action".to_string(),
            table_name: "table_name".to_string(),
            record_id: "record_id".to_string(),
            values: "values".to_string(),
            metadata: "metadata".to_string(),
            transaction_id: "transaction_id".to_string(),
        }
    }
}

impl ColumnMap {
    /// Insert column list in bind order.
    pub fn insert_columns(&self) -> [&str; 9] {
        [
            &self.user_id,
            &self.ip_address,
            &self.user_agent,
            &self.action,
            &self.table_name,
            &self.record_id,
            &self.values,
            &self.metadata,
            &self.transaction_id,
        ]
    }
}
