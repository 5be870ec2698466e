//! # sqlgraphite - Database Health Metrics for Graphite
//!
//! Polls database health functions on a per-metric schedule and streams every
//! result row to a Graphite collector over UDP. An optional persistence session
//! reads derived series back from Graphite's render API and stores them in a
//! relational history table with idempotent upserts.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │  TARGET LOOPS ──push──► DISPATCH QUEUE ──drain──► SENDER ──UDP──► GRAPHITE │
//! │                                                                            │
//! │  PERSISTENCE LOOP ──render URL──► GRAPHITE ──CSV──► HISTORY STORE           │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Per-metric intervals**: each metric polls every 5, 15 or 60 seconds, or is disabled
//! - **Lock-free hand-off**: any number of target loops feed a single sender
//! - **Formulas**: derivative and ratio series composed into Graphite render targets
//! - **Idempotent history**: re-exported windows never overwrite, changed values go to overflow

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ============================================================================
// SECTION 1: MODULES
// ============================================================================

pub mod catalog;
pub mod config;
pub mod error;
pub mod formula;
pub mod logging;
pub mod metric;
pub mod persist;
pub mod query;
pub mod queue;
pub mod schedule;
pub mod sender;
pub mod target;
pub mod types;

pub use catalog::MetricCatalog;
pub use config::MonitorConfig;
pub use error::{MonitorError, MonitorResult};
pub use formula::{Formula, MetricReference, MetricResolver};
pub use metric::{MetricDefinition, MetricInstance, MetricInterval, PathFormatter};
pub use persist::{HistoryStore, PersistenceOptions, PersistenceRunner, PersistenceSession};
pub use query::{QuerySource, Row};
pub use queue::DispatchQueue;
pub use sender::GraphiteRunner;
pub use target::{Target, TargetDirectory, TargetHandle};
pub use types::{EmittedPoint, Timestamp};

// ============================================================================
// SECTION 2: CONSTANTS
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Human readable product name
pub const FULL_NAME: &str = "sqlgraphite";

/// Default Graphite plaintext port
pub const DEFAULT_GRAPHITE_PORT: u16 = 2003;

/// Target scheduler tick
pub const DEFAULT_TARGET_TICK_MS: u64 = 1_000;

/// Sender drain tick
pub const DEFAULT_SEND_INTERVAL_MS: u64 = 1_000;

/// Persistence export check tick
pub const DEFAULT_PERSIST_TICK_MS: u64 = 5_000;

/// Persistence session length used when none is configured
pub const DEFAULT_PERSIST_DURATION_SECS: u64 = 60;

/// Rows per combined history upsert
pub const DEFAULT_INSERT_BATCH_SIZE: usize = 1_000;

/// Schema holding the history tables
pub const DEFAULT_HISTORY_SCHEMA: &str = "metrics";

/// Schema applied to unqualified metric functions
pub const DEFAULT_OBJECT_SCHEMA: &str = "public";
