//! API module for shared HTTP API functionality
//!
//! Provides the webhook credential primitives used by the ingestion gateway.
//!
//! # Design Principle
//!
//! This module contains ONLY:
//! - Pure functions (no HTTP framework dependencies)
//! - Shared types
//!
//! The ingest service wraps these with framework-specific extractors (Axum).

pub mod auth;

pub use auth::{
    credentials_match, generate_webhook_secret, parse_basic_authorization, WebhookAuthError,
    WebhookCredentials,
};
