//! Capture transforms
//!
//! Build audit records from raw captured rows, one transform per mutation
//! kind. Rows that cannot yield a record id follow the strict/lenient
//! policy: strict propagates, lenient reports to the error sink and drops
//! the row.

use std::collections::HashMap;

use tracing::debug;

use crate::capture::fields::{changed_values, filter_fields};
use crate::capture::primary_key::extract_record_id;
use crate::config::{AuditConfig, UpdateValuesMode};
use crate::error::{AuditError, AuditResult, SanitizedError};
use crate::record::{AuditAction, AuditRecord, JsonMap};

/// Audit records for freshly inserted rows.
pub fn insert_records(
    table: &str,
    rows: &[JsonMap],
    config: &AuditConfig,
) -> AuditResult<Vec<AuditRecord>> {
    snapshot_records(AuditAction::Insert, table, rows, config)
}

/// Audit records for deleted rows, capturing their final state.
pub fn delete_records(
    table: &str,
    rows: &[JsonMap],
    config: &AuditConfig,
) -> AuditResult<Vec<AuditRecord>> {
    snapshot_records(AuditAction::Delete, table, rows, config)
}

/// Audit records for updated rows.
///
/// In full mode, or whenever the before-state is unavailable, each record
/// snapshots the filtered after-row. In changed mode, rows pair with their
/// before-state by record id and carry only the differing columns; an
/// update that changes no permitted column emits nothing.
pub fn update_records(
    table: &str,
    before: &[JsonMap],
    after: &[JsonMap],
    config: &AuditConfig,
) -> AuditResult<Vec<AuditRecord>> {
    if config.update_values_mode == UpdateValuesMode::Full || before.is_empty() {
        return snapshot_records(AuditAction::Update, table, after, config);
    }

    let mut before_by_id: HashMap<String, &JsonMap> = HashMap::with_capacity(before.len());
    for row in before {
        match resolve_record_id(row, table, config)? {
            Some(id) => {
                before_by_id.insert(id, row);
            }
            None => continue,
        }
    }

    let mut records = Vec::with_capacity(after.len());

    for row in after {
        let Some(record_id) = resolve_record_id(row, table, config)? else {
            continue;
        };

        let record = match before_by_id.get(&record_id) {
            Some(previous) => {
                let changed = changed_values(
                    &filter_fields(previous, table, config),
                    &filter_fields(row, table, config),
                );
                if changed.is_empty() {
                    debug!(
                        table = %table,
                        record_id = %record_id,
                        "Update changed no permitted column, skipping"
                    );
                    continue;
                }
                AuditRecord::new(AuditAction::Update, table, record_id).with_values(changed)
            }
            // No paired before-row: fall back to a full snapshot.
            None => AuditRecord::new(AuditAction::Update, table, record_id)
                .with_values(filter_fields(row, table, config)),
        };

        records.push(record);
    }

    Ok(records)
}

/// One snapshot record per row with the given action.
fn snapshot_records(
    action: AuditAction,
    table: &str,
    rows: &[JsonMap],
    config: &AuditConfig,
) -> AuditResult<Vec<AuditRecord>> {
    let mut records = Vec::with_capacity(rows.len());

    for row in rows {
        let Some(record_id) = resolve_record_id(row, table, config)? else {
            continue;
        };

        records.push(
            AuditRecord::new(action.clone(), table, record_id)
                .with_values(filter_fields(row, table, config)),
        );
    }

    Ok(records)
}

/// Apply the strict/lenient policy to record-id extraction.
fn resolve_record_id(
    row: &JsonMap,
    table: &str,
    config: &AuditConfig,
) -> AuditResult<Option<String>> {
    match extract_record_id(row, table, config) {
        Ok(id) => Ok(Some(id)),
        // Missing primary-key configuration is fatal regardless of mode.
        Err(err @ AuditError::Configuration(_)) => Err(err),
        Err(err) if config.strict_mode => Err(err),
        Err(err) => {
            (config.error_sink)(
                "[AUDIT] dropping record that cannot be identified",
                &SanitizedError::from_audit(&err),
            );
            Ok(None)
        }
    }
}
