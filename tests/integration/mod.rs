//! Integration test helpers and utilities
//!
//! - Mock MySQL, PostgreSQL and SQL Server backends that check the injected
//!   credentials and echo afterwards, in plaintext or over TLS
//! - Per-run CA and server certificates for the TLS backends
//! - Proxy helpers for spinning up a service in front of a mock

pub mod helpers;

// Re-export commonly used helpers
pub use helpers::{
    mock_backend::{Expected, MockBackend},
    mock_mssql, mock_mysql, mock_pg,
    proxy::{self, WipeRecorder},
    tls::TestPki,
};
