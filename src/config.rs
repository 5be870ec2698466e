// ============================================================================
// CONFIGURATION SYSTEM
// ============================================================================
// Configuration management with:
// - TOML file parsing
// - Environment variable overrides (SQLGRAPHITE_ prefix, `__` nesting)
// - Field validation through `validator` plus cross-field checks
// - Sensible defaults
// ============================================================================

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::{ConfigError, MetricResult};
use crate::formula::{Formula, MetricReference};
use crate::metric::{MetricDefinition, MetricInterval};
use crate::persist::PersistenceOptions;
use crate::types::canonical_target_name;
use crate::{
    DEFAULT_GRAPHITE_PORT, DEFAULT_HISTORY_SCHEMA, DEFAULT_INSERT_BATCH_SIZE,
    DEFAULT_PERSIST_DURATION_SECS, DEFAULT_PERSIST_TICK_MS, DEFAULT_SEND_INTERVAL_MS,
    DEFAULT_TARGET_TICK_MS,
};

/// Dot-separated Graphite node names.
static GRAPHITE_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_\-]+(\.[A-Za-z0-9_\-]+)*$").expect("valid regex"));

fn validate_nonzero_duration(value: &Duration) -> Result<(), ValidationError> {
    if value.is_zero() {
        return Err(ValidationError::new("zero_duration"));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Root Configuration
// ----------------------------------------------------------------------------

/// Root configuration for a monitoring session
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct MonitorConfig {
    /// Collector endpoint and console behavior
    #[serde(default)]
    #[validate]
    pub graphite: GraphiteConfig,

    /// Target scheduler timing
    #[serde(default)]
    #[validate]
    pub scheduler: SchedulerConfig,

    /// Monitored targets
    #[serde(default)]
    #[validate]
    pub targets: Vec<TargetConfig>,

    /// Site-specific metric definitions, merged over the built-in catalog
    #[serde(default)]
    #[validate]
    pub metric_definitions: Vec<MetricDefinitionConfig>,

    /// Optional history persistence session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate]
    pub persistence: Option<PersistenceConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl MonitorConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("SQLGRAPHITE_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML string
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Field rules plus checks spanning several sections.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Validate::validate(self).map_err(|e| ConfigError::ValidationFailed {
            message: e.to_string(),
        })?;

        let mut seen = HashSet::new();
        for target in &self.targets {
            let name = canonical_target_name(&target.instance);
            if !seen.insert(name.clone()) {
                return Err(ConfigError::invalid_value(
                    "targets",
                    format!("Target '{name}' is configured more than once"),
                ));
            }
            for metric in &target.metrics {
                if let Some(interval) = metric.interval {
                    MetricInterval::new(interval).map_err(|e| {
                        ConfigError::invalid_value(format!("targets.{name}.metrics.{}", metric.name), e.to_string())
                    })?;
                }
            }
        }

        for definition in &self.metric_definitions {
            MetricInterval::new(definition.interval).map_err(|e| {
                ConfigError::invalid_value(format!("metric_definitions.{}", definition.function), e.to_string())
            })?;
        }

        if let Some(persistence) = &self.persistence {
            for formula in &persistence.formulas {
                for series in &formula.series {
                    let server = canonical_target_name(&series.server);
                    if !seen.contains(&server) {
                        return Err(ConfigError::invalid_value(
                            format!("persistence.formulas.{}", formula.name),
                            format!("Series references unknown target '{}'", series.server),
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// A commented-out-free sample showing every section.
    pub fn example() -> Self {
        Self {
            targets: vec![TargetConfig {
                instance: "db01\\reporting".into(),
                graphite_root: Some("db".into()),
                connection: "host=db01 user=monitor dbname=dba".into(),
                metrics: ["wait_stats", "database_statistics", "memory", "io"]
                    .into_iter()
                    .map(|name| MetricSelection {
                        name: name.into(),
                        interval: None,
                    })
                    .collect(),
            }],
            persistence: Some(PersistenceConfig {
                formulas: vec![FormulaConfig {
                    name: "db01 log flushes per second".into(),
                    series: vec![SeriesConfig {
                        server: "db01\\reporting".into(),
                        metric: "database_statistics".into(),
                        measurement: "log_flush_per_sec".into(),
                        keys: BTreeMap::from([("database_name".to_string(), "reporting".to_string())]),
                        derivative: true,
                        divide: false,
                    }],
                }],
                ..PersistenceConfig::default()
            }),
            ..Self::default()
        }
    }

    /// Render the sample configuration as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::example()).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// Graphite
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GraphiteConfig {
    /// Collector host for plaintext UDP
    #[serde(default = "default_graphite_host")]
    #[validate(length(min = 1))]
    pub host: String,

    #[serde(default = "default_graphite_port")]
    #[validate(range(min = 1))]
    pub port: u16,

    /// Host (and optional port) of the render API, defaults to `host`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_host: Option<String>,

    /// Print every sent line
    #[serde(default)]
    pub echo: bool,

    /// Suppress all console output
    #[serde(default)]
    pub silent: bool,

    #[serde(with = "humantime_serde", default = "default_send_interval")]
    #[validate(custom = "validate_nonzero_duration")]
    pub send_interval: Duration,
}

impl Default for GraphiteConfig {
    fn default() -> Self {
        Self {
            host: default_graphite_host(),
            port: default_graphite_port(),
            render_host: None,
            echo: false,
            silent: false,
            send_interval: default_send_interval(),
        }
    }
}

impl GraphiteConfig {
    pub fn effective_render_host(&self) -> &str {
        self.render_host.as_deref().unwrap_or(&self.host)
    }
}

fn default_graphite_host() -> String {
    "localhost".into()
}

fn default_graphite_port() -> u16 {
    DEFAULT_GRAPHITE_PORT
}

fn default_send_interval() -> Duration {
    Duration::from_millis(DEFAULT_SEND_INTERVAL_MS)
}

// ----------------------------------------------------------------------------
// Scheduler
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SchedulerConfig {
    /// How often each target looks for due metrics
    #[serde(with = "humantime_serde", default = "default_target_tick")]
    #[validate(custom = "validate_nonzero_duration")]
    pub tick: Duration,

    /// Delay before a target's first look
    #[serde(with = "humantime_serde", default = "default_target_tick")]
    pub start_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: default_target_tick(),
            start_delay: default_target_tick(),
        }
    }
}

fn default_target_tick() -> Duration {
    Duration::from_millis(DEFAULT_TARGET_TICK_MS)
}

// ----------------------------------------------------------------------------
// Targets
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TargetConfig {
    /// `server` or `server\instance`
    #[validate(length(min = 1))]
    pub instance: String,

    /// Lowest node of every path sent for this target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(regex = "GRAPHITE_PATH")]
    pub graphite_root: Option<String>,

    /// libpq-style connection string
    #[validate(length(min = 1))]
    pub connection: String,

    #[serde(default)]
    pub metrics: Vec<MetricSelection>,
}

/// A catalog metric attached to a target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSelection {
    pub name: String,

    /// Interval override in seconds (-1, 5, 15 or 60)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<i64>,
}

/// A metric definition declared in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MetricDefinitionConfig {
    /// Table-valued function, schema-qualified or not
    #[validate(length(min = 1))]
    pub function: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_descriptor: Option<String>,

    #[serde(default)]
    pub key_columns: Vec<String>,

    #[serde(default = "default_metric_interval")]
    pub interval: i64,
}

impl MetricDefinitionConfig {
    pub fn to_definition(&self) -> MetricResult<MetricDefinition> {
        let mut definition = MetricDefinition::new(&self.function)
            .with_key_columns(self.key_columns.iter().cloned())
            .with_interval(self.interval)?;
        if let Some(descriptor) = &self.path_descriptor {
            definition = definition.with_path_descriptor(descriptor.clone());
        }
        if let Some(name) = &self.name {
            definition = definition.with_name(name.clone());
        }
        Ok(definition)
    }
}

fn default_metric_interval() -> i64 {
    60
}

// ----------------------------------------------------------------------------
// Persistence
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PersistenceConfig {
    /// Batch name recorded in the batch table
    #[serde(default = "default_persistence_name")]
    #[validate(length(min = 1))]
    pub name: String,

    /// libpq-style connection string of the history store
    #[serde(default)]
    pub connection: String,

    #[serde(default = "default_history_schema")]
    #[validate(length(min = 1))]
    pub schema: String,

    #[serde(default = "default_history_table")]
    #[validate(length(min = 1))]
    pub history_table: String,

    #[serde(default = "default_formula_table")]
    #[validate(length(min = 1))]
    pub formula_table: String,

    #[serde(default = "default_batch_table")]
    #[validate(length(min = 1))]
    pub batch_table: String,

    /// Session length, zero means the default of one minute
    #[serde(with = "humantime_serde", default = "default_persist_duration")]
    pub duration: Duration,

    /// Time between export passes
    #[serde(with = "humantime_serde", default)]
    pub export_interval: Duration,

    /// How often the session checks whether an export is due
    #[serde(with = "humantime_serde", default = "default_persist_tick")]
    #[validate(custom = "validate_nonzero_duration")]
    pub tick: Duration,

    #[serde(default = "default_insert_batch_size")]
    #[validate(range(min = 1))]
    pub insert_batch_size: usize,

    #[serde(default)]
    #[validate]
    pub formulas: Vec<FormulaConfig>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            name: default_persistence_name(),
            connection: String::new(),
            schema: default_history_schema(),
            history_table: default_history_table(),
            formula_table: default_formula_table(),
            batch_table: default_batch_table(),
            duration: default_persist_duration(),
            export_interval: Duration::ZERO,
            tick: default_persist_tick(),
            insert_batch_size: default_insert_batch_size(),
            formulas: Vec::new(),
        }
    }
}

impl PersistenceConfig {
    pub fn options(&self) -> PersistenceOptions {
        PersistenceOptions {
            schema: self.schema.clone(),
            history_table: self.history_table.clone(),
            formula_table: self.formula_table.clone(),
            batch_table: self.batch_table.clone(),
            duration: self.duration,
            export_interval: self.export_interval,
            tick: self.tick,
            insert_batch_size: self.insert_batch_size,
        }
    }
}

fn default_persistence_name() -> String {
    "sqlgraphite persistence".into()
}

fn default_history_schema() -> String {
    DEFAULT_HISTORY_SCHEMA.into()
}

fn default_history_table() -> String {
    "History".into()
}

fn default_formula_table() -> String {
    "Formulas".into()
}

fn default_batch_table() -> String {
    "BatchRuns".into()
}

fn default_persist_duration() -> Duration {
    Duration::from_secs(DEFAULT_PERSIST_DURATION_SECS)
}

fn default_persist_tick() -> Duration {
    Duration::from_millis(DEFAULT_PERSIST_TICK_MS)
}

fn default_insert_batch_size() -> usize {
    DEFAULT_INSERT_BATCH_SIZE
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct FormulaConfig {
    #[validate(length(min = 1))]
    pub name: String,

    #[validate(length(min = 1))]
    #[validate]
    pub series: Vec<SeriesConfig>,
}

impl FormulaConfig {
    pub fn to_formula(&self) -> Formula {
        self.series.iter().fold(Formula::new(&self.name), |formula, series| {
            let reference = series.reference();
            if series.divide {
                formula.divide_series(reference, series.derivative)
            } else {
                formula.add_series(reference, series.derivative)
            }
        })
    }
}

/// One metric measurement used in a formula.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SeriesConfig {
    #[validate(length(min = 1))]
    pub server: String,

    #[validate(length(min = 1))]
    pub metric: String,

    #[validate(length(min = 1))]
    pub measurement: String,

    /// Key column values selecting one row of the metric
    #[serde(default)]
    pub keys: BTreeMap<String, String>,

    /// Apply `derivative()` to this series
    #[serde(default)]
    pub derivative: bool,

    /// Combine with the preceding series through `divideSeries()`
    #[serde(default)]
    pub divide: bool,
}

impl SeriesConfig {
    pub fn reference(&self) -> MetricReference {
        self.keys.iter().fold(
            MetricReference::new(&self.server, &self.metric, &self.measurement),
            |reference, (column, value)| reference.with_key(column, value),
        )
    }
}

// ----------------------------------------------------------------------------
// Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Also log to this file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Log to stdout
    #[serde(default = "default_true")]
    pub stdout: bool,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            stdout: true,
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}
