//! Probe target descriptors.
//!
//! A target names a database to probe, how large its connection pool may
//! grow, and the closed set of queries the probe is allowed to run against
//! it. Query text never arrives with a probe request; requests carry a
//! query name resolved against the target's catalog.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// A single probe target. Immutable after load.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub dsn: Dsn,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub queries: QueryCatalog,
}

impl TargetConfig {
    /// The identifier under which this target's connection handle is
    /// cached. Named targets share a handle per DSN name; direct targets
    /// per connection string.
    pub fn key(&self) -> &str {
        match &self.dsn {
            Dsn::Url { url } => url,
            Dsn::Named { dsn_name, .. } => dsn_name,
        }
    }

    /// Check every query in the catalog. Call once at configuration load;
    /// the executor re-checks the single statement it runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queries.validate()
    }
}

/// How to reach the database: a connection string inline, or a DSN name
/// resolved through a DSN file at open time.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Dsn {
    Url { url: String },
    Named { dsn_file: PathBuf, dsn_name: String },
}

/// Settings for the connection pool backing one target.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolSettings {
    /// maximum number of pool connections
    #[serde(default = "max_connections_default")]
    pub max_connections: u32,
    /// timeout for acquiring a connection from the pool (seconds)
    #[serde(default = "connect_timeout_default")]
    pub connect_timeout: u64,
}

impl PoolSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

impl Default for PoolSettings {
    fn default() -> PoolSettings {
        PoolSettings {
            max_connections: 2,
            connect_timeout: 10,
        }
    }
}

// for serde default //
fn max_connections_default() -> u32 {
    PoolSettings::default().max_connections
}
fn connect_timeout_default() -> u64 {
    PoolSettings::default().connect_timeout
}

/// Named, read-only query statements a target allows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct QueryCatalog(BTreeMap<String, String>);

impl QueryCatalog {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, sql) in &self.0 {
            ensure_safe_query(name, sql)?;
        }
        Ok(())
    }
}

impl<const N: usize> From<[(&str, &str); N]> for QueryCatalog {
    fn from(entries: [(&str, &str); N]) -> Self {
        QueryCatalog(
            entries
                .into_iter()
                .map(|(name, sql)| (name.to_string(), sql.to_string()))
                .collect(),
        )
    }
}

/// Require a statement to be a single SELECT, free of separator and
/// comment tokens that could smuggle further statements past the driver.
pub fn ensure_safe_query(name: &str, sql: &str) -> Result<(), ConfigError> {
    let unsafe_query = |reason: &str| ConfigError::UnsafeQuery {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = sql.trim_start();
    let is_select = matches!(
        trimmed.get(..6),
        Some(keyword) if keyword.eq_ignore_ascii_case("select")
    ) && trimmed[6..].starts_with(char::is_whitespace);
    if !is_select {
        return Err(unsafe_query("statement must begin with SELECT"));
    }

    if sql.contains(';') {
        return Err(unsafe_query("statement separator ';' is not allowed"));
    }
    if sql.contains("--") || sql.contains("/*") {
        return Err(unsafe_query("comment tokens are not allowed"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_target_with_defaults() {
        let target: TargetConfig = serde_yaml::from_str(
            r"
dsn:
  dsn_file: /etc/sql-probe/conns.yml
  dsn_name: orders
queries:
  row_counts: SELECT relname, n_live_tup FROM pg_stat_user_tables
",
        )
        .expect("from_str");

        assert_eq!(target.key(), "orders");
        assert_eq!(target.pool, PoolSettings::default());
        assert_eq!(target.pool.max_connections, 2);
        assert!(target.queries.get("row_counts").is_some());
        assert!(target.queries.get("missing").is_none());
        target.validate().expect("validate");
    }

    #[test]
    fn parses_direct_target_with_pool_settings() {
        let target: TargetConfig = serde_yaml::from_str(
            r"
dsn:
  url: postgresql://probe@localhost:5432/app
pool:
  max_connections: 8
  connect_timeout: 3
",
        )
        .expect("from_str");

        assert_eq!(target.key(), "postgresql://probe@localhost:5432/app");
        assert_eq!(target.pool.max_connections, 8);
        assert_eq!(target.pool.connect_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn rejects_unknown_target_fields() {
        let result: Result<TargetConfig, _> = serde_yaml::from_str(
            r"
dsn:
  url: postgresql://probe@localhost:5432/app
quries:
  typo: SELECT 1
",
        );
        assert!(result.is_err());
    }

    #[test]
    fn accepts_plain_selects_case_insensitively() {
        ensure_safe_query("q", "SELECT tag, value FROM metrics").expect("upper");
        ensure_safe_query("q", "select tag, value from metrics").expect("lower");
        ensure_safe_query("q", "  Select tag, value From metrics").expect("mixed");
    }

    #[test]
    fn rejects_non_select_statements() {
        for sql in [
            "DELETE FROM metrics",
            "UPDATE metrics SET value = 0",
            "selector, value FROM metrics",
            "select",
            "",
        ] {
            let err = ensure_safe_query("q", sql).expect_err(sql);
            assert!(matches!(err, ConfigError::UnsafeQuery { .. }), "got {err:?}");
        }
    }

    #[test]
    fn rejects_separator_and_comment_tokens() {
        for sql in [
            "SELECT tag, value FROM metrics; DROP TABLE metrics",
            "SELECT tag, value FROM metrics -- sneaky",
            "SELECT tag, value /* sneaky */ FROM metrics",
        ] {
            let err = ensure_safe_query("q", sql).expect_err(sql);
            assert!(matches!(err, ConfigError::UnsafeQuery { .. }), "got {err:?}");
        }
    }

    #[test]
    fn catalog_validation_reports_the_offending_query() {
        let catalog = QueryCatalog::from([
            ("good", "SELECT tag, value FROM metrics"),
            ("bad", "DROP TABLE metrics"),
        ]);

        let err = catalog.validate().expect_err("validate should fail");
        assert!(matches!(err, ConfigError::UnsafeQuery { name, .. } if name == "bad"));
    }
}
