// ============================================================================
// METRIC DEFINITIONS & INSTANCES
// ============================================================================
// A `MetricDefinition` is an immutable template describing one table-valued
// function and how its rows map to Graphite paths. Attaching it to a target
// produces a `MetricInstance`, an owned copy that carries schedule state and
// the column schema discovered on that target.
// ============================================================================

use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, error, info, warn};

use crate::error::{MetricError, MetricResult, QueryError};
use crate::logging::PerfTimer;
use crate::query::{function_select, QuerySource, Row};
use crate::queue::DispatchQueue;
use crate::types::{append_dot, EmittedPoint, Timestamp};
use crate::DEFAULT_OBJECT_SCHEMA;

// ----------------------------------------------------------------------------
// Polling Interval
// ----------------------------------------------------------------------------

/// Polling interval restricted to the retention buckets Graphite is set up
/// for: disabled (-1), 5, 15 or 60 seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct MetricInterval(i64);

impl MetricInterval {
    pub const DISABLED: MetricInterval = MetricInterval(-1);
    pub const FIVE_SECONDS: MetricInterval = MetricInterval(5);
    pub const FIFTEEN_SECONDS: MetricInterval = MetricInterval(15);
    pub const SIXTY_SECONDS: MetricInterval = MetricInterval(60);

    /// Every accepted value.
    pub const ALLOWED: [i64; 4] = [-1, 5, 15, 60];

    pub fn new(seconds: i64) -> MetricResult<Self> {
        if Self::ALLOWED.contains(&seconds) {
            Ok(Self(seconds))
        } else {
            Err(MetricError::InvalidInterval { interval: seconds })
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.0 > 0
    }

    /// Seconds between runs, `None` when disabled.
    pub fn as_secs(&self) -> Option<u64> {
        if self.is_enabled() {
            Some(self.0 as u64)
        } else {
            None
        }
    }

    pub fn raw(&self) -> i64 {
        self.0
    }
}

impl Default for MetricInterval {
    fn default() -> Self {
        Self::SIXTY_SECONDS
    }
}

impl TryFrom<i64> for MetricInterval {
    type Error = MetricError;

    fn try_from(seconds: i64) -> Result<Self, Self::Error> {
        Self::new(seconds)
    }
}

impl From<MetricInterval> for i64 {
    fn from(interval: MetricInterval) -> Self {
        interval.0
    }
}

impl Display for MetricInterval {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.as_secs() {
            Some(secs) => write!(f, "{secs}s"),
            None => write!(f, "disabled"),
        }
    }
}

// ----------------------------------------------------------------------------
// Path Formatting Strategies
// ----------------------------------------------------------------------------

/// Turns the key columns of one row into the per-row part of a metric path.
pub trait PathFormatter: Send + Sync + Debug {
    fn key_path(&self, row: &Row, key_columns: &[String]) -> String;
}

/// Joins the non-empty key values with `.`, replacing spaces with `_`.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyJoinFormatter;

impl PathFormatter for KeyJoinFormatter {
    fn key_path(&self, row: &Row, key_columns: &[String]) -> String {
        key_columns
            .iter()
            .filter_map(|column| row.text(column))
            .filter(|value| !value.is_empty())
            .map(|value| value.replace(' ', "_"))
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// Adapts a plain function into a `PathFormatter`.
#[derive(Clone, Copy)]
pub struct FnFormatter(pub fn(&Row) -> String);

impl Debug for FnFormatter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("FnFormatter")
    }
}

impl PathFormatter for FnFormatter {
    fn key_path(&self, row: &Row, _key_columns: &[String]) -> String {
        (self.0)(row)
    }
}

// ----------------------------------------------------------------------------
// Metric Definition
// ----------------------------------------------------------------------------

/// Immutable description of one pollable measurement.
#[derive(Debug, Clone)]
pub struct MetricDefinition {
    function_name: String,
    key_columns: SmallVec<[String; 4]>,
    path_descriptor: Option<String>,
    metric_name: Option<String>,
    interval: MetricInterval,
    formatter: Arc<dyn PathFormatter>,
}

impl MetricDefinition {
    /// A function reference without a schema gets the default schema; a
    /// trailing `()` is dropped.
    pub fn new(function_name: impl AsRef<str>) -> Self {
        let mut name = function_name.as_ref().trim().to_string();
        if let Some(stripped) = name.strip_suffix("()") {
            name = stripped.to_string();
        }
        if !name.contains('.') {
            name = format!("{DEFAULT_OBJECT_SCHEMA}.{name}");
        }

        Self {
            function_name: name,
            key_columns: SmallVec::new(),
            path_descriptor: None,
            metric_name: None,
            interval: MetricInterval::default(),
            formatter: Arc::new(KeyJoinFormatter),
        }
    }

    /// Key columns in the order they appear in the path.
    pub fn with_key_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_path_descriptor(mut self, descriptor: impl Into<String>) -> Self {
        let descriptor = descriptor.into();
        self.path_descriptor = (!descriptor.is_empty()).then_some(descriptor);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.metric_name = (!name.is_empty()).then_some(name);
        self
    }

    pub fn with_interval(mut self, seconds: i64) -> MetricResult<Self> {
        self.interval = MetricInterval::new(seconds)?;
        Ok(self)
    }

    pub fn with_formatter(mut self, formatter: Arc<dyn PathFormatter>) -> Self {
        self.formatter = formatter;
        self
    }

    /// Explicit name, else path descriptor, else function name.
    pub fn name(&self) -> &str {
        self.metric_name
            .as_deref()
            .or(self.path_descriptor.as_deref())
            .unwrap_or(&self.function_name)
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }

    pub fn path_descriptor(&self) -> Option<&str> {
        self.path_descriptor.as_deref()
    }

    pub fn interval(&self) -> MetricInterval {
        self.interval
    }

    /// `root.descriptor.keypath.measurement` with each segment optional.
    pub fn build_path(&self, row: &Row, measurement: &str, root_path: &str) -> String {
        let mut path = append_dot(root_path);
        path.push_str(&append_dot(self.path_descriptor.as_deref().unwrap_or("")));
        if !row.is_empty() {
            path.push_str(&append_dot(&self.formatter.key_path(row, &self.key_columns)));
        }
        path.push_str(measurement);
        path
    }
}

// ----------------------------------------------------------------------------
// Metric Instance
// ----------------------------------------------------------------------------

/// A definition attached to exactly one target, with its own schedule.
#[derive(Debug, Clone)]
pub struct MetricInstance {
    definition: MetricDefinition,
    interval: MetricInterval,
    next_run: Option<Timestamp>,
    last_run: Option<Timestamp>,
    ready: bool,
    quoted_name: Option<String>,
    columns: Vec<String>,
    data_columns: Vec<String>,
}

impl MetricInstance {
    /// Copy `definition`, optionally overriding its interval, and schedule
    /// the first run one interval after `now`.
    pub fn attach(
        definition: &MetricDefinition,
        interval_override: Option<MetricInterval>,
        now: Timestamp,
    ) -> Self {
        let interval = interval_override.unwrap_or(definition.interval);
        Self {
            definition: definition.clone(),
            interval,
            next_run: interval.as_secs().map(|secs| now.add_secs(secs)),
            last_run: None,
            ready: false,
            quoted_name: None,
            columns: Vec::new(),
            data_columns: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }

    pub fn definition(&self) -> &MetricDefinition {
        &self.definition
    }

    pub fn interval(&self) -> MetricInterval {
        self.interval
    }

    pub fn next_run(&self) -> Option<Timestamp> {
        self.next_run
    }

    pub fn last_run(&self) -> Option<Timestamp> {
        self.last_run
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn data_columns(&self) -> &[String] {
        &self.data_columns
    }

    /// Quoted name once prepared, otherwise the plain function name.
    pub fn object_name(&self) -> &str {
        self.quoted_name
            .as_deref()
            .unwrap_or(self.definition.function_name())
    }

    /// Enabled and due at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        matches!(self.next_run, Some(next) if next <= now)
    }

    /// Change the interval. Disabling drops readiness; re-enabling forces
    /// preparation before the next execution.
    pub fn set_interval(&mut self, interval: MetricInterval, now: Timestamp) {
        if !interval.is_enabled() || !self.interval.is_enabled() {
            self.ready = false;
        }
        self.interval = interval;
        self.next_run = interval.as_secs().map(|secs| now.add_secs(secs));
    }

    /// Record the outcome of a run at `now` and schedule the next one.
    pub fn reschedule(&mut self, now: Timestamp, succeeded: bool) {
        if succeeded {
            self.last_run = Some(now);
        }
        self.next_run = self.interval.as_secs().map(|secs| now.add_secs(secs));
    }

    /// Validate the backing function on `source` and cache its schema.
    ///
    /// `Ok(false)` when the metric is disabled, the function is missing or
    /// the target reported a transient exception. A declared key column that
    /// the function does not return is a `SchemaMismatch`.
    pub async fn prepare(&mut self, source: &dyn QuerySource, target: &str) -> MetricResult<bool> {
        self.ready = false;

        if !self.interval.is_enabled() {
            return Ok(false);
        }

        let function = self.definition.function_name().to_string();
        self.quoted_name = Some(source.quote_name(&function));

        let exists = match recoverable(source.object_exists(&function).await, target, &function)? {
            Some(exists) => exists,
            None => return Ok(false),
        };
        if !exists {
            warn!(target: "sqlgraphite::metric", target_name = %target, object = %function,
                metric = %self.name(), "Required object was not found on target");
            return Ok(false);
        }

        let columns = match recoverable(source.get_columns(&function).await, target, &function)? {
            Some(columns) => columns,
            None => return Ok(false),
        };
        self.columns = columns.into_iter().map(|c| c.name).collect();

        let key_columns = self.definition.key_columns();
        let missing: Vec<String> = key_columns
            .iter()
            .filter(|k| !self.columns.contains(k))
            .cloned()
            .collect();
        if !missing.is_empty() {
            error!(target: "sqlgraphite::metric", target_name = %target, object = %function,
                missing = ?missing, "Key columns missing from function result");
            return Err(MetricError::SchemaMismatch {
                metric: self.name().to_string(),
                object: function,
                missing,
            });
        }

        self.data_columns = self
            .columns
            .iter()
            .filter(|c| !key_columns.contains(c))
            .cloned()
            .collect();

        info!(target: "sqlgraphite::metric", target_name = %target, metric = %self.name(),
            data_columns = self.data_columns.len(), "Metric is ready");
        self.ready = true;
        Ok(true)
    }

    /// Run the metric once and enqueue one point per row and data column.
    ///
    /// Every point of one execution carries the same timestamp. Returns
    /// `Ok(false)` when the metric could not be prepared or the target
    /// raised a transient exception.
    pub async fn execute(
        &mut self,
        source: &dyn QuerySource,
        target: &str,
        queue: &DispatchQueue,
        root_path: &str,
    ) -> MetricResult<bool> {
        if !self.ready && !self.prepare(source, target).await? {
            return Ok(false);
        }

        debug!(target: "sqlgraphite::metric", target_name = %target, metric = %self.name(),
            "Calling metric");

        let timer = PerfTimer::with_threshold("metric.execute", 1_000);
        let timestamp = Timestamp::now().as_secs();
        let statement = function_select(self.object_name());

        let rows = match recoverable(source.run_query(&statement).await, target, &statement)? {
            Some(rows) => rows,
            None => return Ok(false),
        };

        let mut emitted = 0usize;
        for row in rows.iter().filter(|r| !r.is_empty()) {
            for column in &self.data_columns {
                let Some(value) = row.get(column).and_then(|v| v.as_f64()) else {
                    debug!(target: "sqlgraphite::metric", metric = %self.name(), column = %column,
                        "Skipping non-numeric value");
                    continue;
                };
                let path = self.definition.build_path(row, column, root_path);
                queue.push(EmittedPoint::new(path, value, timestamp));
                emitted += 1;
            }
        }

        let elapsed_ms = timer.stop();
        debug!(target: "sqlgraphite::metric", target_name = %target, metric = %self.name(),
            rows = rows.len(), points = emitted, elapsed_ms, "Metric executed");
        Ok(true)
    }
}

/// Transient target exceptions become `None`; everything else propagates.
fn recoverable<T>(result: Result<T, QueryError>, target: &str, context: &str) -> MetricResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_recoverable() => {
            warn!(target: "sqlgraphite::metric", target_name = %target, context = %context,
                error = %e, "Target raised an exception, retrying next window");
            Ok(None)
        }
        Err(e) => {
            error!(target: "sqlgraphite::metric", target_name = %target, context = %context,
                error = %e, "Query failed");
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::testing::FakeSource;
    use crate::query::{ColumnInfo, MockQuerySource};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn host_metric() -> MetricDefinition {
        MetricDefinition::new("metrics.get_host_load")
            .with_key_columns(["host"])
            .with_path_descriptor("load")
            .with_interval(5)
            .unwrap()
    }

    fn host_row(host: &str, cpu: &str, mem: &str) -> Row {
        Row::new().with("host", host).with("cpu", cpu).with("mem", mem)
    }

    #[rstest]
    #[case(-1)]
    #[case(5)]
    #[case(15)]
    #[case(60)]
    fn test_allowed_intervals(#[case] seconds: i64) {
        assert!(MetricDefinition::new("f").with_interval(seconds).is_ok());
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(10)]
    #[case(30)]
    #[case(61)]
    #[case(3600)]
    fn test_rejected_intervals(#[case] seconds: i64) {
        let err = MetricDefinition::new("f").with_interval(seconds).unwrap_err();
        assert!(matches!(err, MetricError::InvalidInterval { interval } if interval == seconds));
    }

    #[test]
    fn test_definition_naming() {
        let bare = MetricDefinition::new("get_memory()");
        assert_eq!(bare.function_name(), "public.get_memory");
        assert_eq!(bare.name(), "public.get_memory");

        let described = MetricDefinition::new("metrics.get_memory").with_path_descriptor("memory");
        assert_eq!(described.name(), "memory");

        let named = described.clone().with_name("mem");
        assert_eq!(named.name(), "mem");
    }

    #[test]
    fn test_build_path_segments() {
        let def = host_metric();
        let row = host_row("web 01", "1", "2");
        assert_eq!(def.build_path(&row, "cpu", "root.sql01.5seconds"), "root.sql01.5seconds.load.web_01.cpu");
        assert_eq!(def.build_path(&Row::new(), "cpu", ""), "load.cpu");

        let missing_key = Row::new().with("cpu", "1");
        assert_eq!(def.build_path(&missing_key, "cpu", "r."), "r.load.cpu");
    }

    #[test]
    fn test_custom_formatter() {
        fn drive(row: &Row) -> String {
            format!("drive.{}.", row.text("drive").unwrap_or_default())
        }
        let def = MetricDefinition::new("metrics.get_io")
            .with_key_columns(["drive"])
            .with_formatter(Arc::new(FnFormatter(drive)));
        let row = Row::new().with("drive", "S");
        assert_eq!(def.build_path(&row, "reads", "r"), "r.drive.S.reads");
    }

    #[tokio::test]
    async fn test_execute_emits_row_then_column() {
        let source = FakeSource::new().with_object(
            "metrics.get_host_load",
            &["host", "cpu", "mem"],
            vec![host_row("a", "1", "2")],
        );
        let queue = DispatchQueue::new();
        let mut instance = MetricInstance::attach(&host_metric(), None, Timestamp::now());

        assert!(instance.execute(&source, "sql01", &queue, "root.path").await.unwrap());
        assert!(instance.is_ready());

        let first = queue.pop().unwrap();
        let second = queue.pop().unwrap();
        assert!(queue.pop().is_none());
        assert_eq!(first.path(), "root.path.load.a.cpu");
        assert_eq!(second.path(), "root.path.load.a.mem");
        assert_eq!(first.value(), 1.0);
        assert_eq!(second.value(), 2.0);
        assert_eq!(first.timestamp(), second.timestamp());
    }

    #[tokio::test]
    async fn test_execute_without_object_enqueues_nothing() {
        let source = FakeSource::new();
        let queue = DispatchQueue::new();
        let mut instance = MetricInstance::attach(&host_metric(), None, Timestamp::now());

        assert!(!instance.execute(&source, "sql01", &queue, "root").await.unwrap());
        assert!(!instance.is_ready());
        assert!(queue.is_empty());
        assert_eq!(source.query_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_key_column_is_schema_mismatch() {
        let source = FakeSource::new().with_object("metrics.get_host_load", &["cpu", "mem"], vec![]);
        let mut instance = MetricInstance::attach(&host_metric(), None, Timestamp::now());

        let err = instance.prepare(&source, "sql01").await.unwrap_err();
        match err {
            MetricError::SchemaMismatch { missing, .. } => assert_eq!(missing, vec!["host".to_string()]),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!instance.is_ready());
    }

    #[tokio::test]
    async fn test_transient_query_failure_returns_false() {
        let source = FakeSource::new().with_object(
            "metrics.get_host_load",
            &["host", "cpu"],
            vec![Row::new().with("host", "a").with("cpu", "1")],
        );
        let queue = DispatchQueue::new();
        let mut instance = MetricInstance::attach(&host_metric(), None, Timestamp::now());
        assert!(instance.prepare(&source, "sql01").await.unwrap());

        source.fail_next_query(QueryError::Target {
            target: "sql01".into(),
            message: "lock timeout".into(),
        });
        assert!(!instance.execute(&source, "sql01", &queue, "").await.unwrap());
        assert!(queue.is_empty());

        source.fail_next_query(QueryError::Connection {
            target: "sql01".into(),
            message: "reset by peer".into(),
        });
        assert!(instance.execute(&source, "sql01", &queue, "").await.is_err());
    }

    #[tokio::test]
    async fn test_prepare_checks_existence_before_columns() {
        let mut source = MockQuerySource::new();
        source.expect_quote_name().returning(|n| crate::query::quote_qualified(n));
        source
            .expect_object_exists()
            .withf(|name| name.to_string() == "metrics.get_host_load")
            .times(1)
            .returning(|_| Ok(true));
        source
            .expect_get_columns()
            .times(1)
            .returning(|_| Ok(vec![ColumnInfo::new("host", "text"), ColumnInfo::new("cpu", "int8")]));

        let mut instance = MetricInstance::attach(&host_metric(), None, Timestamp::now());
        assert!(instance.prepare(&source, "sql01").await.unwrap());
        assert_eq!(instance.data_columns(), &["cpu".to_string()]);
        assert_eq!(instance.object_name(), "\"metrics\".\"get_host_load\"");
    }

    #[test]
    fn test_disable_and_reenable() {
        let now = Timestamp::from_secs(1_000);
        let mut instance = MetricInstance::attach(&host_metric(), None, now);
        assert_eq!(instance.next_run(), Some(Timestamp::from_secs(1_005)));

        instance.set_interval(MetricInterval::DISABLED, now);
        assert_eq!(instance.next_run(), None);
        assert!(!instance.is_due(Timestamp::from_secs(10_000)));

        instance.set_interval(MetricInterval::FIFTEEN_SECONDS, now);
        assert_eq!(instance.next_run(), Some(Timestamp::from_secs(1_015)));
        assert!(!instance.is_ready());
    }
}
