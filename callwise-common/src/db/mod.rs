//! Shared database access
//!
//! All Callwise services (and the external dashboard collaborators) read the
//! same SQLite database; the schema lives here so that every reader agrees
//! on it.

pub mod init;

pub use init::{create_schema, init_database, SCHEMA_VERSION};
