//! Capture pipeline
//!
//! Pure transforms from raw captured rows to audit records: primary-key
//! extraction, field filtering and diffing, and the per-operation record
//! builders. Persistence is the writer's job; nothing here touches the
//! database.

mod fields;
mod primary_key;
mod transforms;

pub use fields::{changed_values, filter_fields, values_equal};
pub use primary_key::{encode_composite_key, extract_record_id, fallback_composite_key};
pub use transforms::{delete_records, insert_records, update_records};
