//! SQL probe for a multi-protocol monitoring agent.
//!
//! One probe invocation opens (or reuses) a pooled connection to the
//! target database, runs a read-only query from the target's catalog,
//! times the whole operation, and turns the returned `(label, value)`
//! rows into gauge samples on the registry supplied by the dispatcher.

pub mod error;
pub mod executor;
pub mod metrics;
pub mod registry;

pub use error::{Phase, ProbeError};
pub use executor::{probe_sql, SqlProber};
pub use metrics::ProbeMetrics;
pub use registry::{AcquireError, ConnectionRegistry};
