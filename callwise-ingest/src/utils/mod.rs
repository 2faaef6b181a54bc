//! Utility modules for callwise-ingest

pub mod backoff;
pub mod db_retry;

pub use backoff::{retry_with_backoff, RetryPolicy, Retryable, RetryOutcome};
pub use db_retry::retry_on_lock;
