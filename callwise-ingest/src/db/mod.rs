//! Database queries for callwise-ingest
//!
//! The schema itself is created by `callwise_common::db::init_database`.

pub mod alerts;
pub mod calls;
pub mod flags;
pub mod plans;
pub mod prompts;
pub mod recordings;
pub mod stages;
pub mod tasks;
pub mod tenants;
pub mod usage;

use callwise_common::time::from_db_timestamp;
use callwise_common::{Error, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub(crate) fn parse_uuid(column: &str, value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| Error::Internal(format!("Invalid UUID in {}: {} ({})", column, value, e)))
}

pub(crate) fn parse_optional_uuid(column: &str, value: Option<String>) -> Result<Option<Uuid>> {
    value.map(|v| parse_uuid(column, &v)).transpose()
}

pub(crate) fn parse_optional_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| from_db_timestamp(&v)).transpose()
}
