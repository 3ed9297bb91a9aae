mod logging;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default level. `RUST_LOG` wins when set.
    pub log_level: Level,
    /// Per-target overrides, e.g. `("herald_server::registry", DEBUG)`.
    pub module_levels: Vec<(String, Level)>,
    /// Where warn+ logs are persisted. `None` disables the SQLite layer.
    pub log_db_path: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            log_db_path: None,
        }
    }
}

impl TelemetryConfig {
    /// Filter directive string built from the level and overrides.
    pub fn directives(&self) -> String {
        let mut out = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            out.push_str(&format!(",{module}={}", level.to_string().to_lowercase()));
        }
        out
    }
}

/// Keeps the persisted-log sink reachable for the life of the process.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
}

impl TelemetryGuard {
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

/// Install the global subscriber: JSON lines on stdout plus, optionally, the
/// SQLite warn+ layer. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.directives()));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_current_span(true)
        .with_filter(env_filter);

    let log_sink = config.log_db_path.as_deref().and_then(|path| {
        match SqliteLogSink::open(path) {
            Ok(sink) => Some(Arc::new(sink)),
            Err(e) => {
                eprintln!("herald-telemetry: failed to open log DB {}: {e}", path.display());
                None
            }
        }
    });
    let sqlite_layer = log_sink.clone().map(SqliteLogLayer::new);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .init();

    TelemetryGuard { log_sink }
}

/// Parse a level name as accepted in configuration (`"warn"`, `"DEBUG"`, ...).
pub fn parse_level(raw: &str) -> Option<Level> {
    raw.trim().parse().ok()
}
