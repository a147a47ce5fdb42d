mod metrics;

pub use metrics::{HistogramSummary, MetricSample, MetricType, MetricsRecorder};

use std::str::FromStr;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. `RUST_LOG` takes precedence when set.
    pub log_level: Level,
    /// Per-module level overrides (e.g. `chainloom_engine` => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
        }
    }
}

impl TelemetryConfig {
    /// Parse a level name such as `"debug"`, keeping the default on
    /// anything unrecognized.
    pub fn with_level_name(mut self, level: &str) -> Self {
        if let Ok(level) = Level::from_str(level) {
            self.log_level = level;
        }
        self
    }

    /// `level,module=level,...` as understood by [`EnvFilter`].
    pub fn filter_directive(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Holds the shared metrics recorder for the life of the process.
pub struct TelemetryGuard {
    metrics: Arc<MetricsRecorder>,
    installed: bool,
}

impl TelemetryGuard {
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        self.metrics.clone()
    }

    /// False when another global subscriber was already installed.
    pub fn subscriber_installed(&self) -> bool {
        self.installed
    }
}

/// Install the global tracing subscriber. Call once at startup; later
/// calls leave the existing subscriber in place.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed()
    };

    let installed = tracing_subscriber::registry().with(fmt_layer).try_init().is_ok();

    TelemetryGuard {
        metrics: Arc::new(MetricsRecorder::new()),
        installed,
    }
}
