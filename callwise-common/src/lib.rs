//! # Callwise Common Library
//!
//! Shared code for the Callwise services including:
//! - Database initialization (schema, seed plans, default prompts)
//! - Event types (CallwiseEvent enum) and the EventBus
//! - Webhook credential primitives
//! - Configuration loading
//! - Billing period helpers

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
