//! Test Helper Utilities
//!
//! Shared utilities for testing callwise-ingest

#![allow(dead_code)]

pub mod mocks;
pub mod test_env;

// Re-export commonly used items
pub use mocks::{EngineReply, MockPbx, PbxReply, ScriptedEngine};
pub use test_env::{basic_auth, freepbx_cdr, TestEnv, PBX_USERNAME, WEBHOOK_SECRET};
