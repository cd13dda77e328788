pub mod dsn;
pub mod error;
pub mod target;

pub use dsn::{load_dsn_file, DsnFile};
pub use error::ConfigError;
pub use target::{ensure_safe_query, Dsn, PoolSettings, QueryCatalog, TargetConfig};
