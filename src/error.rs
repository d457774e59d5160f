//! Error types for the security-server gateway
//!
//! These are *operational* errors: configuration, I/O, TLS setup. An
//! authentication rejection is never an `Error`; it is a
//! [`crate::engine::AuthenticationVerdict::Rejected`] and travels through the
//! fault model instead.

use std::io;

use thiserror::Error;

use crate::trust::SnapshotError;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Trust configuration rejected before publication
    #[error("Trust configuration rejected: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Certificate could not be loaded or generated
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// TLS setup error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Backend dispatch error
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
