//! Probe error taxonomy.
//!
//! Every variant is handled inside the executor and converted into a
//! boolean failure plus a structured log entry; nothing here is expected
//! to cross the probe entry point as a panic.

use std::time::Duration;

use thiserror::Error;

use sql_probe_configuration::ConfigError;

/// The probe phase a deadline expired in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Query,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Connect => write!(f, "connection open"),
            Phase::Query => write!(f, "query execution"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("error opening connection to database: {0}")]
    Connection(#[source] sqlx::Error),

    #[error("error executing query: {0}")]
    Query(#[source] sqlx::Error),

    #[error("query returned {actual} columns, expected {expected}")]
    RowShape { expected: usize, actual: usize },

    #[error("error decoding row {row}: {source}")]
    RowDecode {
        row: u64,
        #[source]
        source: sqlx::Error,
    },

    #[error("no query named {0:?} in the target's catalog")]
    UnknownQuery(String),

    #[error("open for {key:?} failed recently, next attempt in {retry_in:?}")]
    Backoff { key: String, retry_in: Duration },

    #[error("{phase} did not complete before the probe deadline")]
    Timeout { phase: Phase },
}
