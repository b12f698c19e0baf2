mod counters;

pub use counters::{CounterName, Counters, CountersSnapshot};

use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "demorelay_engine" => DEBUG).
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
    /// Filter directive string built from the configured levels.
    pub fn filter_directives(&self) -> String {
        let mut filter_str = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter_str
    }
}

/// Handle to process-wide telemetry state. Cheap to clone.
#[derive(Clone)]
pub struct TelemetryGuard {
    counters: Arc<Counters>,
    module_levels: Arc<[(String, Level)]>,
}

impl TelemetryGuard {
    /// A guard that records counters without installing a subscriber.
    pub fn detached() -> Self {
        Self {
            counters: Arc::new(Counters::new()),
            module_levels: Arc::from(Vec::new()),
        }
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    /// Per-module log level overrides in effect at startup.
    pub fn module_levels(&self) -> &[(String, Level)] {
        &self.module_levels
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
///
/// A second call keeps the first subscriber and only returns a fresh guard.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    if let Err(e) = tracing_subscriber::registry().with(fmt_layer).try_init() {
        eprintln!("demorelay-telemetry: subscriber already installed: {e}");
    }

    TelemetryGuard {
        counters: Arc::new(Counters::new()),
        module_levels: Arc::from(config.module_levels),
    }
}
