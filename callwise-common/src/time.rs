//! Timestamp and billing period helpers
//!
//! Usage counters are bucketed by calendar month in UTC. The period key is the
//! `YYYY-MM` string of the instant being charged, so a new month naturally
//! starts from an empty counter row.

use chrono::{DateTime, Datelike, Utc};

/// Billing period key (`YYYY-MM`, UTC) for the given instant
///
/// # Examples
///
/// ```
/// use callwise_common::time::billing_period;
/// use chrono::{TimeZone, Utc};
///
/// let instant = Utc.with_ymd_and_hms(2026, 3, 31, 23, 59, 59).unwrap();
/// assert_eq!(billing_period(instant), "2026-03");
/// ```
pub fn billing_period(instant: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", instant.year(), instant.month())
}

/// Current billing period key
pub fn current_billing_period() -> String {
    billing_period(Utc::now())
}

/// RFC 3339 string for database storage
pub fn to_db_timestamp(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339()
}

/// Parse an RFC 3339 database timestamp
pub fn from_db_timestamp(value: &str) -> crate::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| crate::Error::Internal(format!("Invalid timestamp '{}': {}", value, e)))
}
