//! Metrics setup and update for one probe invocation.

use std::time::Instant;

use prometheus::{Gauge, GaugeVec, Opts};

/// Gauges registered against the per-invocation registry.
///
/// The dispatcher hands each probe a fresh registry and harvests it after
/// the probe returns, so every gauge starts at zero and `add` on the
/// sample vector only accumulates within a single invocation.
#[derive(Debug, Clone)]
pub struct ProbeMetrics {
    duration: Gauge,
    samples: GaugeVec,
}

impl ProbeMetrics {
    /// Create the probe gauges and register them with the provided
    /// Prometheus Registry.
    pub fn register(registry: &prometheus::Registry) -> Result<ProbeMetrics, prometheus::Error> {
        let duration = Gauge::with_opts(Opts::new(
            "probe_sql_duration_seconds",
            "Duration of the SQL probe, including connection acquisition.",
        ))?;
        registry.register(Box::new(duration.clone()))?;

        let samples = GaugeVec::new(
            Opts::new(
                "probe_sql_metrics",
                "Samples returned by the probe query, keyed by tag.",
            ),
            &["tag"],
        )?;
        registry.register(Box::new(samples.clone()))?;

        Ok(ProbeMetrics { duration, samples })
    }

    /// Apply one row as a sample. Rows sharing a tag accumulate.
    pub fn apply(&self, label: &str, value: f64) {
        self.samples.with_label_values(&[label]).add(value);
    }

    pub fn observe_duration(&self, seconds: f64) {
        self.duration.set(seconds);
    }

    /// Start the scoped duration measurement. The gauge is set when the
    /// guard drops, on every exit path.
    pub fn duration_guard(&self) -> DurationGuard {
        DurationGuard {
            gauge: self.duration.clone(),
            started: Instant::now(),
        }
    }
}

pub struct DurationGuard {
    gauge: Gauge,
    started: Instant,
}

impl Drop for DurationGuard {
    fn drop(&mut self) {
        self.gauge.set(self.started.elapsed().as_secs_f64());
    }
}
