//! Probe execution.
//!
//! One invocation: register the per-invocation gauges, acquire the pooled
//! connection for the target (opening it on first use), run the named
//! catalog query, and stream `(label, value)` rows into samples. The
//! duration gauge is recorded on every exit path, and every failure is
//! converted into a `false` result plus a log entry.

use std::future::Future;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use futures_util::{StreamExt, TryStreamExt};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Executor as _, PgPool, Row as _};
use tracing::{debug, error, info_span, Instrument};

use sql_probe_configuration::{ensure_safe_query, load_dsn_file, Dsn, TargetConfig};

use crate::error::{Phase, ProbeError};
use crate::metrics::ProbeMetrics;
use crate::registry::{AcquireError, ConnectionRegistry};

/// Recycling bound for pooled connections, to tolerate server-side idle
/// timeouts and topology changes.
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(3600);

/// Probe a target with the process-wide connection registry.
///
/// This is the entry point the dispatch framework calls once per scrape,
/// with a fresh `registry` that it harvests after the probe returns.
pub async fn probe_sql(
    target: &TargetConfig,
    query_name: &str,
    registry: &prometheus::Registry,
    deadline: Option<Duration>,
) -> bool {
    static PROBER: OnceLock<SqlProber> = OnceLock::new();
    PROBER
        .get_or_init(SqlProber::new)
        .probe(target, query_name, registry, deadline)
        .await
}

/// A probe executor with its own connection registry.
#[derive(Debug, Default)]
pub struct SqlProber {
    pools: ConnectionRegistry<PgPool>,
}

impl SqlProber {
    pub fn new() -> SqlProber {
        SqlProber {
            pools: ConnectionRegistry::new(),
        }
    }

    /// Run one probe. Never panics and never hangs past the deadline;
    /// any failure is logged and reported as `false`.
    pub async fn probe(
        &self,
        target: &TargetConfig,
        query_name: &str,
        registry: &prometheus::Registry,
        deadline: Option<Duration>,
    ) -> bool {
        let metrics = match ProbeMetrics::register(registry) {
            Ok(metrics) => metrics,
            Err(err) => {
                error!(error = %err, "failed to register probe metrics");
                return false;
            }
        };
        let _duration = metrics.duration_guard();

        let outcome = self
            .run(target, query_name, &metrics, Budget::new(deadline))
            .instrument(info_span!("sql_probe", probe_target = target.key(), query = query_name))
            .await;

        match outcome {
            Ok(rows) => {
                debug!(probe_target = target.key(), query = query_name, rows, "probe succeeded");
                true
            }
            Err(err) => {
                error!(probe_target = target.key(), query = query_name, error = %err, "probe failed");
                false
            }
        }
    }

    async fn run(
        &self,
        target: &TargetConfig,
        query_name: &str,
        metrics: &ProbeMetrics,
        budget: Budget,
    ) -> Result<u64, ProbeError> {
        let sql = target
            .queries
            .get(query_name)
            .ok_or_else(|| ProbeError::UnknownQuery(query_name.to_string()))?;
        // The catalog is validated at load time; re-check the one
        // statement we are about to run so the read-only invariant does
        // not depend on the caller.
        ensure_safe_query(query_name, sql)?;

        let pool = budget
            .limit(Phase::Connect, self.acquire_pool(target))
            .await?;
        budget.limit(Phase::Query, execute(&pool, sql, metrics)).await
    }

    async fn acquire_pool(&self, target: &TargetConfig) -> Result<PgPool, ProbeError> {
        let key = target.key();
        self.pools
            .acquire(key, || open_target(target))
            .await
            .map_err(|err| match err {
                AcquireError::Open(inner) => inner,
                AcquireError::Backoff { retry_in } => ProbeError::Backoff {
                    key: key.to_string(),
                    retry_in,
                },
            })
    }
}

/// Resolve the target's connection string and open its pool. Runs at most
/// once per registry key at a time; the DSN file is re-read here so edits
/// apply on the next open attempt.
async fn open_target(target: &TargetConfig) -> Result<PgPool, ProbeError> {
    let url = match &target.dsn {
        Dsn::Url { url } => url.clone(),
        Dsn::Named { dsn_file, dsn_name } => {
            let dsns = load_dsn_file(dsn_file).await?;
            dsns.resolve(dsn_name)?.to_string()
        }
    };

    PgPoolOptions::new()
        .max_connections(target.pool.max_connections)
        .acquire_timeout(target.pool.connect_timeout())
        .max_lifetime(POOL_MAX_LIFETIME)
        .connect(&url)
        .await
        .map_err(ProbeError::Connection)
}

async fn execute(pool: &PgPool, sql: &str, metrics: &ProbeMetrics) -> Result<u64, ProbeError> {
    // Prepare first: a shape mismatch is detected before any row is
    // applied, and execution errors surface as query errors.
    let statement = pool.describe(sql).await.map_err(ProbeError::Query)?;
    let shape = RowShape::default();
    shape.check(statement.columns().len())?;

    let rows = sqlx::query(sql)
        .fetch(pool)
        .enumerate()
        .map(move |(index, row)| match row {
            Ok(row) => shape.decode(&row, index as u64 + 1),
            Err(err) => Err(ProbeError::Query(err)),
        });
    futures_util::pin_mut!(rows);
    apply_samples(rows, metrics).await
}

/// Apply decoded rows to the emitter as they arrive. The first error
/// aborts iteration; samples already applied stay in the registry.
async fn apply_samples<S>(mut rows: S, metrics: &ProbeMetrics) -> Result<u64, ProbeError>
where
    S: futures_util::Stream<Item = Result<RowSample, ProbeError>> + Unpin,
{
    let mut applied = 0;
    while let Some(sample) = rows.try_next().await? {
        debug!(tag = %sample.label, value = sample.value, "row sample");
        metrics.apply(&sample.label, sample.value);
        applied += 1;
    }
    Ok(applied)
}

/// One `(label, value)` pair extracted from a result row.
#[derive(Debug, Clone, PartialEq)]
struct RowSample {
    label: String,
    value: f64,
}

/// Declared result shape: a text label and a numeric value.
#[derive(Debug, Clone, Copy)]
struct RowShape {
    columns: usize,
    label: usize,
    value: usize,
}

impl Default for RowShape {
    fn default() -> RowShape {
        RowShape {
            columns: 2,
            label: 0,
            value: 1,
        }
    }
}

impl RowShape {
    fn check(&self, actual: usize) -> Result<(), ProbeError> {
        if actual == self.columns {
            Ok(())
        } else {
            Err(ProbeError::RowShape {
                expected: self.columns,
                actual,
            })
        }
    }

    fn decode(&self, row: &PgRow, index: u64) -> Result<RowSample, ProbeError> {
        let label: String = row.try_get(self.label).map_err(|source| ProbeError::RowDecode {
            row: index,
            source,
        })?;
        let value: f64 = row.try_get(self.value).map_err(|source| ProbeError::RowDecode {
            row: index,
            source,
        })?;
        Ok(RowSample { label, value })
    }
}

/// Remaining time for the invocation, threaded into both the connection
/// open and query execution so a hung database cannot block a probe
/// past its deadline.
#[derive(Debug, Clone, Copy)]
struct Budget {
    deadline: Option<Instant>,
}

impl Budget {
    fn new(limit: Option<Duration>) -> Budget {
        Budget {
            deadline: limit.map(|limit| Instant::now() + limit),
        }
    }

    async fn limit<T, F>(&self, phase: Phase, fut: F) -> Result<T, ProbeError>
    where
        F: Future<Output = Result<T, ProbeError>>,
    {
        let Some(deadline) = self.deadline else {
            return fut.await;
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProbeError::Timeout { phase });
        }
        match tokio::time::timeout(remaining, fut).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout { phase }),
        }
    }
}
