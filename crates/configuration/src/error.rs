//! Configuration interpretation errors.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating probe configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading DSN file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("error parsing DSN file {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
    #[error("no connection string configured for DSN name {0:?}")]
    UnknownDsn(String),
    #[error("query {name:?} is not a safe single SELECT statement: {reason}")]
    UnsafeQuery { name: String, reason: String },
}
