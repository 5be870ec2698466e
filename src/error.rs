// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// One error enum per subsystem, all convertible into `MonitorError`.
// Every enum knows whether it is recoverable so loops can decide between
// "log and retry next window" and "stop this loop".
// ============================================================================

use std::error::Error as StdError;
use std::path::PathBuf;

use thiserror::Error;

// ----------------------------------------------------------------------------
// Top-level Error
// ----------------------------------------------------------------------------

/// The main error type. All subsystem errors convert into it.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Metric error: {0}")]
    Metric(#[from] MetricError),

    #[error("Target error: {0}")]
    Target(#[from] TargetError),

    #[error("Sender error: {0}")]
    Sender(#[from] SenderError),

    #[error("Formula error: {0}")]
    Formula(#[from] FormulaError),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MonitorError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            MonitorError::Config(_) => false,
            MonitorError::Query(e) => e.is_recoverable(),
            MonitorError::Metric(e) => e.is_recoverable(),
            MonitorError::Target(e) => e.is_recoverable(),
            MonitorError::Sender(e) => e.is_recoverable(),
            MonitorError::Formula(_) => false,
            MonitorError::Persist(e) => e.is_recoverable(),
            MonitorError::Io(_) => true,
            MonitorError::Internal(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            MonitorError::Config(_) => "config",
            MonitorError::Query(_) => "query",
            MonitorError::Metric(_) => "metric",
            MonitorError::Target(_) => "target",
            MonitorError::Sender(_) => "sender",
            MonitorError::Formula(_) => "formula",
            MonitorError::Persist(_) => "persist",
            MonitorError::Io(_) => "io",
            MonitorError::Internal(_) => "internal",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            MonitorError::Config(_) => RecoveryHint::FixConfiguration,
            MonitorError::Query(e) => e.recovery_hint(),
            MonitorError::Metric(e) => e.recovery_hint(),
            MonitorError::Formula(_) => RecoveryHint::FixConfiguration,
            MonitorError::Sender(_) => RecoveryHint::RestartComponent,
            _ => RecoveryHint::AlertOperator,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// Retry on the next scheduled window
    RetryNextWindow,
    /// Reconnect to the service
    Reconnect,
    /// Restart the component
    RestartComponent,
    /// Fix configuration and restart
    FixConfiguration,
    /// Alert operator for manual intervention
    AlertOperator,
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Query Errors
// ----------------------------------------------------------------------------

/// Errors reported by the query collaborator.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The target reported an exception for a statement. The connection is
    /// still usable and the caller may retry on its next window.
    #[error("Target '{target}' raised an exception: {message}")]
    Target { target: String, message: String },

    /// The statement itself is broken (syntax, permissions, undefined objects
    /// referenced from inside the statement).
    #[error("Statement failed on '{target}': {message} [{statement}]")]
    Execution {
        target: String,
        statement: String,
        message: String,
    },

    /// The connection to the target is gone.
    #[error("Connection to '{target}' failed: {message}")]
    Connection { target: String, message: String },
}

impl QueryError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, QueryError::Target { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            QueryError::Target { .. } => RecoveryHint::RetryNextWindow,
            QueryError::Execution { .. } => RecoveryHint::FixConfiguration,
            QueryError::Connection { .. } => RecoveryHint::Reconnect,
        }
    }
}

/// Result alias for query operations
pub type QueryResult<T> = Result<T, QueryError>;

// ----------------------------------------------------------------------------
// Metric Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum MetricError {
    #[error("A metric can only poll at -1 (disabled), 5, 15 or 60 seconds, got {interval}")]
    InvalidInterval { interval: i64 },

    #[error("Key columns {missing:?} of metric '{metric}' were not found in the columns of {object}")]
    SchemaMismatch {
        metric: String,
        object: String,
        missing: Vec<String>,
    },

    #[error(transparent)]
    Query(#[from] QueryError),
}

impl MetricError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            MetricError::Query(e) => e.is_recoverable(),
            _ => false,
        }
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            MetricError::Query(e) => e.recovery_hint(),
            _ => RecoveryHint::FixConfiguration,
        }
    }
}

/// Result alias for metric operations
pub type MetricResult<T> = Result<T, MetricError>;

// ----------------------------------------------------------------------------
// Target Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum TargetError {
    #[error("Metric '{metric}' is not attached to target '{target}'")]
    MetricNotFound { target: String, metric: String },

    #[error("Metric '{metric}' failed on target '{target}': {source}")]
    Execution {
        target: String,
        metric: String,
        #[source]
        source: MetricError,
    },
}

impl TargetError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            TargetError::Execution { source, .. } => source.is_recoverable(),
            _ => false,
        }
    }
}

/// Result alias for target operations
pub type TargetResult<T> = Result<T, TargetError>;

// ----------------------------------------------------------------------------
// Sender Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum SenderError {
    #[error("Cannot resolve collector address {host}:{port}: {message}")]
    Resolve {
        host: String,
        port: u16,
        message: String,
    },

    #[error("Collector socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl SenderError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SenderError::Io(_))
    }
}

/// Result alias for sender operations
pub type SenderResult<T> = Result<T, SenderError>;

// ----------------------------------------------------------------------------
// Formula Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum FormulaError {
    #[error("Formula '{formula}' has no series")]
    Empty { formula: String },

    #[error("Target '{server}' is not monitored")]
    TargetNotFound { server: String },

    #[error("Metric '{metric}' is not attached to target '{server}'")]
    MetricNotFound { server: String, metric: String },

    #[error("Metric '{metric}' on target '{server}' is disabled")]
    MetricDisabled { server: String, metric: String },
}

/// Result alias for formula operations
pub type FormulaResult<T> = Result<T, FormulaError>;

// ----------------------------------------------------------------------------
// Persistence Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("The table \"{table}\" does not exist")]
    MissingTable { table: String },

    #[error("History store failure: {message}")]
    Store { message: String },

    #[error("Render request to {url} failed: {message}")]
    Fetch { url: String, message: String },

    #[error("Malformed render line '{line}': {message}")]
    Parse { line: String, message: String },

    #[error("Persistence session has not been started")]
    NotStarted,

    #[error(transparent)]
    Formula(#[from] FormulaError),
}

impl PersistError {
    /// Every export failure ends the session.
    pub fn is_recoverable(&self) -> bool {
        false
    }

    pub fn store(message: impl Into<String>) -> Self {
        PersistError::Store {
            message: message.into(),
        }
    }
}

/// Result alias for persistence operations
pub type PersistResult<T> = Result<T, PersistError>;

/// Result alias for the crate
pub type MonitorResult<T> = Result<T, MonitorError>;

// ----------------------------------------------------------------------------
// Error Chain Helpers
// ----------------------------------------------------------------------------

/// Render an error and every `source()` below it, outermost first.
pub fn error_chain(error: &(dyn StdError + 'static)) -> Vec<String> {
    let mut chain = vec![error.to_string()];
    let mut current = error.source();
    while let Some(cause) = current {
        chain.push(cause.to_string());
        current = cause.source();
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_classification() {
        let transient = QueryError::Target {
            target: "sql01".into(),
            message: "deadlock victim".into(),
        };
        let broken = QueryError::Execution {
            target: "sql01".into(),
            statement: "SELECT * FROM nope()".into(),
            message: "function nope() does not exist".into(),
        };
        assert!(transient.is_recoverable());
        assert!(!broken.is_recoverable());
        assert_eq!(broken.recovery_hint(), RecoveryHint::FixConfiguration);

        let wrapped = MonitorError::from(MetricError::from(transient));
        assert!(wrapped.is_recoverable());
        assert_eq!(wrapped.category(), "metric");
    }

    #[test]
    fn test_error_chain_walks_sources() {
        let err = TargetError::Execution {
            target: "sql01".into(),
            metric: "memory".into(),
            source: MetricError::SchemaMismatch {
                metric: "memory".into(),
                object: "metrics.get_memory".into(),
                missing: vec!["host".into()],
            },
        };
        let chain = error_chain(&err);
        assert_eq!(chain.len(), 2);
        assert!(chain[1].contains("[\"host\"]"));
    }
}
