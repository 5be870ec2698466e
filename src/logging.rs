// ============================================================================
// LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging through `tracing`:
// - stdout layer in pretty, compact or json format
// - optional non-blocking file layer
// - a `log(level, message)` entry point for callers that pick the level at
//   runtime
// ============================================================================

use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::error::{error_chain, MonitorError, MonitorResult};

// ----------------------------------------------------------------------------
// Log Levels
// ----------------------------------------------------------------------------

/// Levels accepted by `emit`. `Critical` is logged at error level with a
/// `critical` marker field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warning => Level::WARN,
            LogLevel::Error | LogLevel::Critical => Level::ERROR,
        }
    }

    /// Parse from string, defaulting to `Info`.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warning,
            "error" => LogLevel::Error,
            "critical" | "fatal" => LogLevel::Critical,
            _ => LogLevel::Info,
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Logger Initialization
// ----------------------------------------------------------------------------

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn env_filter(config: &LoggingConfig) -> EnvFilter {
    let directive = match LogLevel::parse(&config.level).to_tracing_level() {
        Level::TRACE => tracing::level_filters::LevelFilter::TRACE,
        Level::DEBUG => tracing::level_filters::LevelFilter::DEBUG,
        Level::INFO => tracing::level_filters::LevelFilter::INFO,
        Level::WARN => tracing::level_filters::LevelFilter::WARN,
        _ => tracing::level_filters::LevelFilter::ERROR,
    };
    EnvFilter::builder()
        .with_default_directive(directive.into())
        .from_env_lossy()
}

fn stdout_layer(config: &LoggingConfig) -> BoxedLayer {
    match config.format.as_str() {
        "json" => tracing_fmt::layer()
            .json()
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .with_thread_names(true)
            .with_filter(env_filter(config))
            .boxed(),
        "compact" => tracing_fmt::layer()
            .compact()
            .with_ansi(config.colors)
            .with_target(true)
            .with_filter(env_filter(config))
            .boxed(),
        _ => tracing_fmt::layer()
            .pretty()
            .with_ansi(config.colors)
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .with_thread_names(true)
            .with_filter(env_filter(config))
            .boxed(),
    }
}

/// Install the global subscriber. Keep the returned guard alive for as long
/// as the file layer should flush.
pub fn init_logging(config: &LoggingConfig) -> MonitorResult<Option<WorkerGuard>> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;

    if config.stdout {
        layers.push(stdout_layer(config));
    }

    if let Some(file) = config.file.as_deref() {
        let path = Path::new(file);
        let directory = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = path
            .file_name()
            .ok_or_else(|| MonitorError::Internal(format!("Invalid log file path: {file}")))?;

        let appender = tracing_appender::rolling::never(directory, file_name);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        layers.push(
            tracing_fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_names(true)
                .with_filter(env_filter(config))
                .boxed(),
        );
        guard = Some(file_guard);
    }

    let subscriber = tracing_subscriber::registry().with(layers);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| MonitorError::Internal(format!("Failed to set logger: {e}")))?;

    info!(
        target: "sqlgraphite::init",
        level = %config.level,
        format = %config.format,
        file = config.file.as_deref().unwrap_or("-"),
        "Logging initialized"
    );

    Ok(guard)
}

// ----------------------------------------------------------------------------
// Runtime-level Logging
// ----------------------------------------------------------------------------

/// Log `message` at a level chosen at runtime.
pub fn emit(level: LogLevel, component: &str, message: &str) {
    match level {
        LogLevel::Trace => trace!(target: "sqlgraphite", component, "{message}"),
        LogLevel::Debug => debug!(target: "sqlgraphite", component, "{message}"),
        LogLevel::Info => info!(target: "sqlgraphite", component, "{message}"),
        LogLevel::Warning => warn!(target: "sqlgraphite", component, "{message}"),
        LogLevel::Error => error!(target: "sqlgraphite", component, "{message}"),
        LogLevel::Critical => error!(target: "sqlgraphite", component, critical = true, "{message}"),
    }
}

/// Log an error together with every cause beneath it.
pub fn report_error(level: LogLevel, component: &str, context: &str, err: &(dyn StdError + 'static)) {
    let chain = error_chain(err);
    let mut message = format!("{context}: {}", chain[0]);
    for (depth, cause) in chain.iter().enumerate().skip(1) {
        message.push_str(&format!("\n  {depth}: caused by: {cause}"));
    }
    emit(level, component, &message);
}

// ----------------------------------------------------------------------------
// Performance Timer
// ----------------------------------------------------------------------------

/// Measures one operation and warns when it exceeds a threshold.
#[derive(Debug)]
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold_ms: Option<u64>,
    stopped: bool,
}

impl PerfTimer {
    pub fn with_threshold(name: &'static str, threshold_ms: u64) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: Some(threshold_ms),
            stopped: false,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop the timer and log if above threshold
    pub fn stop(mut self) -> u64 {
        self.stopped = true;
        let elapsed = self.elapsed_ms();

        if let Some(threshold) = self.threshold_ms {
            if elapsed > threshold {
                warn!(
                    target: "sqlgraphite::perf",
                    operation = self.name,
                    elapsed_ms = elapsed,
                    threshold_ms = threshold,
                    "Operation exceeded threshold"
                );
            }
        }

        trace!(target: "sqlgraphite::perf", operation = self.name, elapsed_ms = elapsed,
            "Operation completed");
        elapsed
    }
}

impl Drop for PerfTimer {
    fn drop(&mut self) {
        if !self.stopped {
            trace!(target: "sqlgraphite::perf", operation = self.name,
                elapsed_ms = self.elapsed_ms(), "Timer dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MetricError, TargetError};

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("WARNING"), LogLevel::Warning);
        assert_eq!(LogLevel::parse("warn"), LogLevel::Warning);
        assert_eq!(LogLevel::parse("critical"), LogLevel::Critical);
        assert_eq!(LogLevel::parse("bogus"), LogLevel::Info);
        assert_eq!(LogLevel::Critical.to_tracing_level(), Level::ERROR);
    }

    #[test]
    fn test_report_error_without_subscriber() {
        let err = TargetError::Execution {
            target: "sql01".into(),
            metric: "io".into(),
            source: MetricError::InvalidInterval { interval: 7 },
        };
        report_error(LogLevel::Critical, "target", "Target loop stopped", &err);
    }

    #[test]
    fn test_perf_timer_measures() {
        let timer = PerfTimer::with_threshold("test", 10_000);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.stop() >= 5);
    }
}
