//! Logging setup for scan applications.
//!
//! The engine itself only emits `tracing` events inside `scan` and `line`
//! spans; binaries decide where they go. At `debug` and below the close of
//! every span is logged too, which gives the duration of each scan and line.
//!
//! # Example
//! ```no_run
//! use daq_scan::{config::ScanConfig, telemetry::{self, OutputFormat}};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ScanConfig::load()?;
//! telemetry::init_from_config(&config, OutputFormat::Compact)?;
//! info!(points = 25, "Scan queued");
//! # Ok(())
//! # }
//! ```

use crate::config::ScanConfig;
use crate::error::{ScanError, ScanResult};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, coloured output for interactive use
    Pretty,
    /// Single-line output without colours
    Compact,
    /// One JSON object per event, for log collectors
    Json,
}

/// Initialize logging with the level from `[application]`.
pub fn init_from_config(config: &ScanConfig, format: OutputFormat) -> ScanResult<()> {
    init(parse_log_level(&config.application.log_level)?, format)
}

/// Install the global subscriber. `RUST_LOG` overrides `level`.
///
/// Idempotent: if a global subscriber is already installed (tests, embedding
/// applications) this returns `Ok(())` and leaves the existing one in place.
pub fn init(level: Level, format: OutputFormat) -> ScanResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let base = fmt::layer().with_span_events(span_events(level));
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match format {
        OutputFormat::Pretty => base.pretty().with_filter(env_filter).boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).with_filter(env_filter).boxed(),
        OutputFormat::Json => base.json().with_filter(env_filter).boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(ScanError::Config(format!("Failed to initialize logging: {e}"))),
    }
}

fn span_events(level: Level) -> FmtSpan {
    if level >= Level::DEBUG {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Parse a level name (case-insensitive)
pub fn parse_log_level(level: &str) -> ScanResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(ScanError::Config(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))),
    }
}
