//! This module defines the errors that can be returned by bucket-guard.
//!
//! Ownership mismatches and unresolvable owners are NOT errors: they are data level outcomes
//! (an aborted reply or a boolean predicate result). The variants below only cover malformed input,
//! configuration problems and runtime plumbing.

use std::fmt::Display;

use serde::Serialize;

pub type Result<T> = std::result::Result<T, Error>;

/// Error enum with all possible variants
#[derive(Debug, Serialize)]
pub enum Error {
    /// A textual cluster state could not be parsed
    InvalidClusterState { reason: String },
    /// Configuration could not be parsed or is inconsistent
    InvalidConfig { reason: String },
    Io { reason: String },
    /// The sequential executor could not be started or is already shut down
    ExecutorUnavailable { reason: String },
    Logic { reason: String },
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidConfig {
            reason: err.to_string(),
        }
    }
}
