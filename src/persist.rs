// ============================================================================
// HISTORY PERSISTENCE
// ============================================================================
// A persistence session replays formula results from the collector's render
// API into a relational history store:
// - one batch row per session, its id stamped on every history row
// - export passes on a fixed tick until the session cutoff
// - idempotent upserts: a re-exported value that matches is a no-op, a value
//   that changed goes to the overflow table once and never overwrites history
// ============================================================================

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as TokioMutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info};

use crate::error::{PersistError, PersistResult};
use crate::formula::{Formula, MetricResolver};
use crate::logging::{report_error, LogLevel, PerfTimer};
use crate::query::quote_ident;
use crate::schedule::{LoopControl, Periodic, PeriodicTimer};
use crate::{
    DEFAULT_HISTORY_SCHEMA, DEFAULT_INSERT_BATCH_SIZE, DEFAULT_PERSIST_DURATION_SECS,
    DEFAULT_PERSIST_TICK_MS,
};

const RENDER_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// ----------------------------------------------------------------------------
// Options
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceOptions {
    pub schema: String,
    pub history_table: String,
    pub formula_table: String,
    pub batch_table: String,
    pub duration: Duration,
    pub export_interval: Duration,
    pub tick: Duration,
    pub insert_batch_size: usize,
}

impl Default for PersistenceOptions {
    fn default() -> Self {
        Self {
            schema: DEFAULT_HISTORY_SCHEMA.into(),
            history_table: "History".into(),
            formula_table: "Formulas".into(),
            batch_table: "BatchRuns".into(),
            duration: Duration::from_secs(DEFAULT_PERSIST_DURATION_SECS),
            export_interval: Duration::ZERO,
            tick: Duration::from_millis(DEFAULT_PERSIST_TICK_MS),
            insert_batch_size: DEFAULT_INSERT_BATCH_SIZE,
        }
    }
}

impl PersistenceOptions {
    /// Zero means one minute.
    pub fn effective_duration(&self) -> Duration {
        if self.duration.is_zero() {
            Duration::from_secs(DEFAULT_PERSIST_DURATION_SECS)
        } else {
            self.duration
        }
    }

    pub fn tables(&self) -> HistoryTables {
        HistoryTables {
            schema: self.schema.clone(),
            history: self.history_table.clone(),
            formulas: self.formula_table.clone(),
            batches: self.batch_table.clone(),
        }
    }
}

/// Names of the four history relations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTables {
    pub schema: String,
    pub history: String,
    pub formulas: String,
    pub batches: String,
}

impl HistoryTables {
    fn qualify(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(table))
    }

    pub fn history(&self) -> String {
        self.qualify(&self.history)
    }

    pub fn overflow(&self) -> String {
        self.qualify(&format!("{}_overflow", self.history))
    }

    pub fn formulas(&self) -> String {
        self.qualify(&self.formulas)
    }

    pub fn batches(&self) -> String {
        self.qualify(&self.batches)
    }

    /// Tables that must exist before a session can start.
    pub fn required(&self) -> [String; 3] {
        [self.history(), self.formulas(), self.batches()]
    }
}

// ----------------------------------------------------------------------------
// History Store
// ----------------------------------------------------------------------------

/// One value of one formula at one instant within a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub formula_id: i32,
    pub measure_date: NaiveDateTime,
    pub value: f64,
    pub batch_id: i32,
    pub seconds_since_batch_start: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub inserted: u64,
    pub overflowed: u64,
}

impl std::ops::AddAssign for UpsertOutcome {
    fn add_assign(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.overflowed += other.overflowed;
    }
}

#[async_trait]
pub trait HistoryStore: Send + Sync + Debug {
    async fn verify_tables(&self) -> PersistResult<()>;

    /// Record a new batch and return its id.
    async fn start_batch(&self, name: &str) -> PersistResult<i32>;

    /// Id of the named formula, registering it with `url` if unknown.
    async fn formula_id(&self, name: &str, url: &str) -> PersistResult<i32>;

    /// Apply one batch of rows atomically.
    ///
    /// A row whose `(formula_id, measure_date, batch_id)` is absent from the
    /// history table is inserted there. A row whose key exists with a
    /// different value goes to the overflow table unless the overflow table
    /// already holds that key. Both decisions use the state before the call.
    async fn upsert(&self, rows: &[HistoryRow]) -> PersistResult<UpsertOutcome>;
}

/// First row for each (formula, date, batch) key, in input order.
///
/// A formula that joins several plain series renders one CSV series per
/// reference, so one batch can carry the same key more than once.
pub fn first_row_per_key(rows: &[HistoryRow]) -> Vec<&HistoryRow> {
    let mut seen = HashSet::with_capacity(rows.len());
    rows.iter()
        .filter(|r| seen.insert((r.formula_id, r.measure_date, r.batch_id)))
        .collect()
}

// ----------------------------------------------------------------------------
// PostgreSQL History Store
// ----------------------------------------------------------------------------

pub struct PgHistoryStore {
    tables: HistoryTables,
    client: Client,
    connection_task: JoinHandle<()>,
}

impl PgHistoryStore {
    pub async fn connect(connection_string: &str, tables: HistoryTables) -> PersistResult<Self> {
        let (client, connection) = tokio_postgres::connect(connection_string, NoTls)
            .await
            .map_err(|e| PersistError::store(format!("connect failed: {e}")))?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(target: "sqlgraphite::persist", error = %e, "History store connection terminated");
            }
        });
        info!(target: "sqlgraphite::persist", schema = %tables.schema, "Connected to history store");

        Ok(Self {
            tables,
            client,
            connection_task,
        })
    }

    fn upsert_statement(&self) -> String {
        let history = self.tables.history();
        let overflow = self.tables.overflow();
        format!(
            r#"WITH src AS (
    SELECT * FROM unnest($1::int4[], $2::timestamp[], $3::float8[], $4::int4[], $5::int8[])
        AS s(formula_id, measure_date, value, batch_id, seconds_since_batch_start)
), overflow_rows AS (
    INSERT INTO {overflow} ("FormulaID", "MeasureDate", "Value", "BatchID")
    SELECT s.formula_id, s.measure_date, s.value, s.batch_id FROM src AS s
    WHERE NOT EXISTS (SELECT 1 FROM {overflow} AS o
                      WHERE o."FormulaID" = s.formula_id AND o."MeasureDate" = s.measure_date AND o."BatchID" = s.batch_id)
      AND EXISTS (SELECT 1 FROM {history} AS h
                  WHERE h."FormulaID" = s.formula_id AND h."MeasureDate" = s.measure_date AND h."BatchID" = s.batch_id
                    AND h."Value" <> s.value)
    RETURNING 1
), history_rows AS (
    INSERT INTO {history} ("FormulaID", "MeasureDate", "Value", "BatchID", "SecondsSinceBatchStart")
    SELECT s.formula_id, s.measure_date, s.value, s.batch_id, s.seconds_since_batch_start FROM src AS s
    WHERE NOT EXISTS (SELECT 1 FROM {history} AS h
                      WHERE h."FormulaID" = s.formula_id AND h."MeasureDate" = s.measure_date AND h."BatchID" = s.batch_id)
    RETURNING 1
)
SELECT (SELECT count(*) FROM history_rows), (SELECT count(*) FROM overflow_rows)"#
        )
    }
}

fn store_error(context: &str, err: tokio_postgres::Error) -> PersistError {
    PersistError::store(format!("{context}: {err}"))
}

impl Debug for PgHistoryStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgHistoryStore")
            .field("tables", &self.tables)
            .field("closed", &self.client.is_closed())
            .finish()
    }
}

impl Drop for PgHistoryStore {
    fn drop(&mut self) {
        self.connection_task.abort();
    }
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn verify_tables(&self) -> PersistResult<()> {
        for table in self.tables.required() {
            let row = self
                .client
                .query_one("SELECT to_regclass($1::text) IS NOT NULL", &[&table])
                .await
                .map_err(|e| store_error("table lookup", e))?;
            let exists: bool = row.try_get(0).map_err(|e| store_error("table lookup", e))?;
            if !exists {
                return Err(PersistError::MissingTable { table });
            }
        }
        Ok(())
    }

    async fn start_batch(&self, name: &str) -> PersistResult<i32> {
        let statement = format!(
            r#"INSERT INTO {} ("BatchName") VALUES ($1) RETURNING "BatchID""#,
            self.tables.batches()
        );
        let row = self
            .client
            .query_one(&statement, &[&name])
            .await
            .map_err(|e| store_error("batch insert", e))?;
        row.try_get(0).map_err(|e| store_error("batch insert", e))
    }

    async fn formula_id(&self, name: &str, url: &str) -> PersistResult<i32> {
        let formulas = self.tables.formulas();
        let lookup = format!(r#"SELECT "FormulaID" FROM {formulas} WHERE "FormulaName" = $1"#);
        if let Some(row) = self
            .client
            .query_opt(&lookup, &[&name])
            .await
            .map_err(|e| store_error("formula lookup", e))?
        {
            return row.try_get(0).map_err(|e| store_error("formula lookup", e));
        }

        let insert = format!(
            r#"INSERT INTO {formulas} ("FormulaName", "FormulaURL") VALUES ($1, $2) RETURNING "FormulaID""#
        );
        let row = self
            .client
            .query_one(&insert, &[&name, &url])
            .await
            .map_err(|e| store_error("formula insert", e))?;
        row.try_get(0).map_err(|e| store_error("formula insert", e))
    }

    async fn upsert(&self, rows: &[HistoryRow]) -> PersistResult<UpsertOutcome> {
        let rows = first_row_per_key(rows);
        let formula_ids: Vec<i32> = rows.iter().map(|r| r.formula_id).collect();
        let dates: Vec<NaiveDateTime> = rows.iter().map(|r| r.measure_date).collect();
        let values: Vec<f64> = rows.iter().map(|r| r.value).collect();
        let batch_ids: Vec<i32> = rows.iter().map(|r| r.batch_id).collect();
        let offsets: Vec<i64> = rows.iter().map(|r| r.seconds_since_batch_start).collect();

        let row = self
            .client
            .query_one(
                &self.upsert_statement(),
                &[&formula_ids, &dates, &values, &batch_ids, &offsets],
            )
            .await
            .map_err(|e| store_error("history upsert", e))?;

        let inserted: i64 = row.try_get(0).map_err(|e| store_error("history upsert", e))?;
        let overflowed: i64 = row.try_get(1).map_err(|e| store_error("history upsert", e))?;
        Ok(UpsertOutcome {
            inserted: inserted as u64,
            overflowed: overflowed as u64,
        })
    }
}

// ----------------------------------------------------------------------------
// In-memory History Store
// ----------------------------------------------------------------------------

type HistoryKey = (i32, NaiveDateTime, i32);

#[derive(Debug, Default)]
struct MemoryState {
    batches: Vec<String>,
    formulas: Vec<(String, String)>,
    history: BTreeMap<HistoryKey, (f64, i64)>,
    overflow: BTreeMap<HistoryKey, f64>,
    upserts: usize,
}

/// Same semantics as the relational store, kept in process. Backs dry runs.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    state: Mutex<MemoryState>,
    missing_table: Option<String>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `table` as missing from `verify_tables`.
    pub fn with_missing_table(mut self, table: impl Into<String>) -> Self {
        self.missing_table = Some(table.into());
        self
    }

    pub fn history_len(&self) -> usize {
        self.state.lock().history.len()
    }

    pub fn overflow_len(&self) -> usize {
        self.state.lock().overflow.len()
    }

    pub fn history_value(&self, formula_id: i32, measure_date: NaiveDateTime, batch_id: i32) -> Option<f64> {
        self.state
            .lock()
            .history
            .get(&(formula_id, measure_date, batch_id))
            .map(|(value, _)| *value)
    }

    pub fn overflow_value(&self, formula_id: i32, measure_date: NaiveDateTime, batch_id: i32) -> Option<f64> {
        self.state
            .lock()
            .overflow
            .get(&(formula_id, measure_date, batch_id))
            .copied()
    }

    pub fn formula_count(&self) -> usize {
        self.state.lock().formulas.len()
    }

    pub fn upsert_count(&self) -> usize {
        self.state.lock().upserts
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn verify_tables(&self) -> PersistResult<()> {
        match &self.missing_table {
            Some(table) => Err(PersistError::MissingTable { table: table.clone() }),
            None => Ok(()),
        }
    }

    async fn start_batch(&self, name: &str) -> PersistResult<i32> {
        let mut state = self.state.lock();
        state.batches.push(name.to_string());
        Ok(state.batches.len() as i32)
    }

    async fn formula_id(&self, name: &str, url: &str) -> PersistResult<i32> {
        let mut state = self.state.lock();
        if let Some(index) = state.formulas.iter().position(|(n, _)| n == name) {
            return Ok(index as i32 + 1);
        }
        state.formulas.push((name.to_string(), url.to_string()));
        Ok(state.formulas.len() as i32)
    }

    async fn upsert(&self, rows: &[HistoryRow]) -> PersistResult<UpsertOutcome> {
        let mut state = self.state.lock();
        state.upserts += 1;

        let mut to_overflow = Vec::new();
        let mut to_history = Vec::new();
        for row in first_row_per_key(rows) {
            let key = (row.formula_id, row.measure_date, row.batch_id);
            match state.history.get(&key) {
                Some((existing, _)) if *existing != row.value && !state.overflow.contains_key(&key) => {
                    to_overflow.push((key, row.value));
                }
                Some(_) => {}
                None => to_history.push((key, (row.value, row.seconds_since_batch_start))),
            }
        }

        let outcome = UpsertOutcome {
            inserted: to_history.len() as u64,
            overflowed: to_overflow.len() as u64,
        };
        state.overflow.extend(to_overflow);
        state.history.extend(to_history);
        Ok(outcome)
    }
}

// ----------------------------------------------------------------------------
// Render Client
// ----------------------------------------------------------------------------

/// Fetches a render URL and returns the CSV body.
#[async_trait]
pub trait RenderClient: Send + Sync + Debug {
    async fn fetch(&self, url: &str) -> PersistResult<String>;
}

#[derive(Debug, Clone)]
pub struct HttpRenderClient {
    client: reqwest::Client,
}

impl HttpRenderClient {
    pub fn new(timeout: Duration) -> PersistResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PersistError::Fetch {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RenderClient for HttpRenderClient {
    async fn fetch(&self, url: &str) -> PersistResult<String> {
        let fetch_error = |e: reqwest::Error| PersistError::Fetch {
            url: url.to_string(),
            message: e.to_string(),
        };
        self.client
            .get(url)
            .send()
            .await
            .map_err(fetch_error)?
            .error_for_status()
            .map_err(fetch_error)?
            .text()
            .await
            .map_err(fetch_error)
    }
}

/// Parse `path,YYYY-MM-DD HH:MM:SS,value`. Blank lines and lines without a
/// value yield `None`. The path may itself contain commas.
pub fn parse_render_line(line: &str) -> PersistResult<Option<(NaiveDateTime, f64)>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let parse_error = |message: &str| PersistError::Parse {
        line: line.to_string(),
        message: message.to_string(),
    };

    let mut fields = line.rsplitn(3, ',');
    let value = fields.next().unwrap_or_default().trim();
    let (Some(date), Some(_path)) = (fields.next(), fields.next()) else {
        return Err(parse_error("expected path, timestamp and value"));
    };
    if value.is_empty() {
        return Ok(None);
    }

    let measure_date = NaiveDateTime::parse_from_str(date.trim(), RENDER_DATE_FORMAT)
        .map_err(|e| parse_error(&e.to_string()))?;
    let value = value
        .parse::<f64>()
        .map_err(|e| parse_error(&e.to_string()))?;
    Ok(Some((measure_date, value)))
}

// ----------------------------------------------------------------------------
// Persistence Runner
// ----------------------------------------------------------------------------

/// Timing of the session's one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRun {
    pub batch_id: i32,
    pub start: NaiveDateTime,
    pub cutoff: NaiveDateTime,
    pub next_export: NaiveDateTime,
    pub last_export: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSummary {
    pub formulas: usize,
    pub rows: usize,
    pub outcome: UpsertOutcome,
}

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

fn add(at: NaiveDateTime, duration: Duration) -> NaiveDateTime {
    at + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

pub struct PersistenceRunner {
    name: String,
    options: PersistenceOptions,
    render_host: String,
    store: Arc<dyn HistoryStore>,
    client: Arc<dyn RenderClient>,
    resolver: Arc<dyn MetricResolver>,
    formulas: BTreeMap<String, Formula>,
    formula_urls: HashMap<String, (i32, String)>,
    batch: Option<BatchRun>,
}

impl PersistenceRunner {
    /// Fails when any required table is missing from the store.
    pub async fn new(
        name: impl Into<String>,
        options: PersistenceOptions,
        render_host: impl Into<String>,
        store: Arc<dyn HistoryStore>,
        client: Arc<dyn RenderClient>,
        resolver: Arc<dyn MetricResolver>,
    ) -> PersistResult<Self> {
        store.verify_tables().await?;
        let name = name.into();
        info!(target: "sqlgraphite::persist", session = %name,
            duration_secs = options.effective_duration().as_secs(),
            export_interval_secs = options.export_interval.as_secs(), "Persistence session created");
        Ok(Self {
            name,
            options,
            render_host: render_host.into(),
            store,
            client,
            resolver,
            formulas: BTreeMap::new(),
            formula_urls: HashMap::new(),
            batch: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &PersistenceOptions {
        &self.options
    }

    pub fn batch(&self) -> Option<&BatchRun> {
        self.batch.as_ref()
    }

    pub fn formula_names(&self) -> impl Iterator<Item = &str> {
        self.formulas.keys().map(String::as_str)
    }

    /// A formula name can only be registered once.
    pub fn add_formula(&mut self, formula: Formula) -> bool {
        if self.formulas.contains_key(formula.name()) {
            error!(target: "sqlgraphite::persist", formula = %formula.name(),
                "Cannot add the same formula twice");
            return false;
        }
        debug!(target: "sqlgraphite::persist", formula = %formula.name(), "Formula added");
        self.formulas.insert(formula.name().to_string(), formula);
        true
    }

    pub fn remove_formula(&mut self, name: &str) -> Option<Formula> {
        self.formula_urls.remove(name);
        self.formulas.remove(name)
    }

    /// Record the batch and fix the session's cutoff relative to `now`.
    pub async fn begin_at(&mut self, now: NaiveDateTime) -> PersistResult<i32> {
        let batch_id = self.store.start_batch(&self.name).await?;
        self.batch = Some(BatchRun {
            batch_id,
            start: now,
            cutoff: add(now, self.options.effective_duration()),
            next_export: add(now, self.options.export_interval),
            last_export: None,
        });
        info!(target: "sqlgraphite::persist", session = %self.name, batch_id, "Batch started");
        Ok(batch_id)
    }

    /// One scheduler tick at `now`. Exports when the next export is due or
    /// the cutoff has passed; stops after a failed export or once past the
    /// cutoff.
    pub async fn tick_at(&mut self, now: NaiveDateTime) -> LoopControl {
        let Some(batch) = self.batch.as_mut() else {
            error!(target: "sqlgraphite::persist", session = %self.name, error = %PersistError::NotStarted,
                "Tick before start");
            return LoopControl::Stop;
        };

        let past_cutoff = now > batch.cutoff;
        if !(now > batch.next_export || past_cutoff) {
            return LoopControl::Continue;
        }
        batch.last_export = Some(now);
        batch.next_export = add(now, self.options.export_interval);

        if let Err(e) = self.export().await {
            report_error(LogLevel::Critical, "persist", "Export failed, stopping session", &e);
            return LoopControl::Stop;
        }

        if past_cutoff {
            info!(target: "sqlgraphite::persist", session = %self.name, "Reached cutoff");
            return LoopControl::Stop;
        }
        LoopControl::Continue
    }

    /// Fetch every formula and store its rows.
    pub async fn export(&mut self) -> PersistResult<ExportSummary> {
        let batch = self.batch.clone().ok_or(PersistError::NotStarted)?;
        let timer = PerfTimer::with_threshold("persist.export", self.options.tick.as_millis() as u64);
        let mut summary = ExportSummary::default();

        let names: Vec<String> = self.formulas.keys().cloned().collect();
        for name in names {
            let (formula_id, url) = self.formula_url(&name).await?;
            debug!(target: "sqlgraphite::persist", formula = %name, url = %url, "Fetching render data");
            let body = self.client.fetch(&url).await?;

            let mut pending = Vec::with_capacity(self.options.insert_batch_size);
            for line in body.lines() {
                let Some((measure_date, value)) = parse_render_line(line)? else {
                    continue;
                };
                pending.push(HistoryRow {
                    formula_id,
                    measure_date,
                    value,
                    batch_id: batch.batch_id,
                    seconds_since_batch_start: (measure_date - batch.start).num_seconds(),
                });
                if pending.len() >= self.options.insert_batch_size {
                    summary.rows += pending.len();
                    summary.outcome += self.store.upsert(&pending).await?;
                    pending.clear();
                }
            }
            if !pending.is_empty() {
                summary.rows += pending.len();
                summary.outcome += self.store.upsert(&pending).await?;
            }
            summary.formulas += 1;
        }

        let elapsed_ms = timer.stop();
        info!(target: "sqlgraphite::persist", session = %self.name, formulas = summary.formulas,
            rows = summary.rows, inserted = summary.outcome.inserted,
            overflowed = summary.outcome.overflowed, elapsed_ms, "Export pass complete");
        Ok(summary)
    }

    async fn formula_url(&mut self, name: &str) -> PersistResult<(i32, String)> {
        if let Some(cached) = self.formula_urls.get(name) {
            return Ok(cached.clone());
        }
        let formula = self
            .formulas
            .get(name)
            .ok_or_else(|| PersistError::store(format!("formula '{name}' is not registered")))?;
        let url = formula.render_url(self.resolver.as_ref(), &self.render_host, self.options.export_interval)?;
        let formula_id = self.store.formula_id(name, &url).await?;
        self.formula_urls
            .insert(name.to_string(), (formula_id, url.clone()));
        Ok((formula_id, url))
    }
}

impl Debug for PersistenceRunner {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceRunner")
            .field("name", &self.name)
            .field("formulas", &self.formulas.keys().collect::<Vec<_>>())
            .field("batch", &self.batch)
            .finish()
    }
}

#[async_trait]
impl Periodic for PersistenceRunner {
    async fn on_tick(&mut self) -> LoopControl {
        self.tick_at(local_now()).await
    }
}

// ----------------------------------------------------------------------------
// Persistence Session
// ----------------------------------------------------------------------------

/// A runner together with the timer that drives it.
#[derive(Debug)]
pub struct PersistenceSession {
    state: Arc<TokioMutex<PersistenceRunner>>,
    timer: PeriodicTimer,
}

impl PersistenceSession {
    pub fn new(runner: PersistenceRunner) -> Self {
        let tick = runner.options.tick;
        Self {
            state: Arc::new(TokioMutex::new(runner)),
            timer: PeriodicTimer::new("persistence", tick),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, PersistenceRunner> {
        self.state.lock().await
    }

    /// Start the batch and the export loop. Returns the batch id.
    pub async fn start(&mut self) -> PersistResult<i32> {
        let batch_id = self.state.lock().await.begin_at(local_now()).await?;
        self.run();
        Ok(batch_id)
    }

    pub fn run(&mut self) -> bool {
        self.timer.start(Arc::clone(&self.state))
    }

    pub async fn pause(&mut self) {
        self.timer.stop().await;
        debug!(target: "sqlgraphite::persist", "Persistence paused");
    }

    pub async fn quit(&mut self) {
        self.timer.stop().await;
        info!(target: "sqlgraphite::persist", "Persistence stopped");
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_running()
    }

    /// Wait until the loop stops on its own (cutoff or failure).
    pub async fn wait(&mut self) {
        self.timer.join().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FormulaError;
    use crate::formula::testing::StaticResolver;
    use crate::formula::MetricReference;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use tokio_test::assert_ok;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct FakeRender {
        body: Mutex<String>,
        fail: AtomicBool,
        delay: Duration,
        requests: AtomicUsize,
        completed: AtomicUsize,
    }

    impl FakeRender {
        fn serving(body: &str) -> Self {
            let fake = Self::default();
            *fake.body.lock() = body.to_string();
            fake
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl RenderClient for FakeRender {
        async fn fetch(&self, url: &str) -> PersistResult<String> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.completed.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(PersistError::Fetch {
                    url: url.to_string(),
                    message: "503 Service Unavailable".into(),
                });
            }
            Ok(self.body.lock().clone())
        }
    }

    const BODY: &str = "latency,2024-03-01 10:00:00,1.5\n\
                        latency,2024-03-01 10:00:15,\n\
                        latency,2024-03-01 10:00:30,2.5\n";

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, RENDER_DATE_FORMAT).unwrap()
    }

    fn resolver() -> Arc<StaticResolver> {
        Arc::new(StaticResolver::default().with("db01", "io", "io_stall", "db01.15seconds.IO.io_stall"))
    }

    fn formula(name: &str) -> Formula {
        Formula::new(name).add_series(MetricReference::new("db01", "io", "io_stall"), true)
    }

    async fn runner(
        options: PersistenceOptions,
        store: &Arc<MemoryHistoryStore>,
        render: &Arc<FakeRender>,
    ) -> PersistenceRunner {
        let mut runner = PersistenceRunner::new(
            "nightly",
            options,
            "graphite:8080",
            Arc::clone(store) as Arc<dyn HistoryStore>,
            Arc::clone(render) as Arc<dyn RenderClient>,
            resolver(),
        )
        .await
        .unwrap();
        assert!(runner.add_formula(formula("latency")));
        runner
    }

    #[rstest]
    #[case("a.b,2024-03-01 10:00:00,1.5", Some((at("2024-03-01 10:00:00"), 1.5)))]
    #[case("alias(x, \"a,b\"),2024-03-01 10:00:00,-2", Some((at("2024-03-01 10:00:00"), -2.0)))]
    #[case("a.b,2024-03-01 10:00:00,", None)]
    #[case("   ", None)]
    fn test_parse_render_line(#[case] line: &str, #[case] expected: Option<(NaiveDateTime, f64)>) {
        assert_eq!(parse_render_line(line).unwrap(), expected);
    }

    #[rstest]
    #[case("no commas here")]
    #[case("a.b,yesterday,1.0")]
    #[case("a.b,2024-03-01 10:00:00,abc")]
    fn test_parse_render_line_rejects(#[case] line: &str) {
        assert!(matches!(parse_render_line(line), Err(PersistError::Parse { .. })));
    }

    #[test]
    fn test_table_names() {
        let tables = PersistenceOptions::default().tables();
        assert_eq!(tables.history(), "\"metrics\".\"History\"");
        assert_eq!(tables.overflow(), "\"metrics\".\"History_overflow\"");
        assert_eq!(tables.required().len(), 3);
    }

    #[tokio::test]
    async fn test_missing_table_fails_construction() {
        let store = Arc::new(MemoryHistoryStore::new().with_missing_table("\"metrics\".\"BatchRuns\""));
        let result = PersistenceRunner::new(
            "nightly",
            PersistenceOptions::default(),
            "graphite",
            store as Arc<dyn HistoryStore>,
            Arc::new(FakeRender::default()) as Arc<dyn RenderClient>,
            resolver(),
        )
        .await;
        assert!(matches!(result, Err(PersistError::MissingTable { .. })));
    }

    #[tokio::test]
    async fn test_reexport_is_idempotent() {
        let store = Arc::new(MemoryHistoryStore::new());
        let render = Arc::new(FakeRender::serving(BODY));
        let mut runner = runner(PersistenceOptions::default(), &store, &render).await;
        runner.begin_at(at("2024-03-01 09:59:00")).await.unwrap();

        let first = assert_ok!(runner.export().await);
        assert_eq!(first.rows, 2);
        assert_eq!(first.outcome, UpsertOutcome { inserted: 2, overflowed: 0 });

        let second = assert_ok!(runner.export().await);
        assert_eq!(second.outcome, UpsertOutcome::default());
        assert_eq!(store.history_len(), 2);
        assert_eq!(store.overflow_len(), 0);
        assert_eq!(store.formula_count(), 1);
    }

    #[tokio::test]
    async fn test_changed_value_goes_to_overflow_once() {
        let store = Arc::new(MemoryHistoryStore::new());
        let render = Arc::new(FakeRender::serving(BODY));
        let mut runner = runner(PersistenceOptions::default(), &store, &render).await;
        let batch_id = runner.begin_at(at("2024-03-01 09:59:00")).await.unwrap();
        runner.export().await.unwrap();

        *render.body.lock() = BODY.replace("1.5", "9.0");
        let changed = runner.export().await.unwrap();
        assert_eq!(changed.outcome, UpsertOutcome { inserted: 0, overflowed: 1 });

        let key_date = at("2024-03-01 10:00:00");
        assert_eq!(store.history_value(1, key_date, batch_id), Some(1.5));
        assert_eq!(store.overflow_value(1, key_date, batch_id), Some(9.0));

        *render.body.lock() = BODY.replace("1.5", "7.0");
        let again = runner.export().await.unwrap();
        assert_eq!(again.outcome, UpsertOutcome::default());
        assert_eq!(store.overflow_len(), 1);
    }

    fn history_row(value: f64) -> HistoryRow {
        HistoryRow {
            formula_id: 1,
            measure_date: at("2024-03-01 10:00:00"),
            value,
            batch_id: 1,
            seconds_since_batch_start: 0,
        }
    }

    #[tokio::test]
    async fn test_repeated_key_in_one_batch_keeps_first_row() {
        let store = MemoryHistoryStore::new();
        let date = at("2024-03-01 10:00:00");

        let first = store.upsert(&[history_row(1.0), history_row(2.0)]).await.unwrap();
        assert_eq!(first, UpsertOutcome { inserted: 1, overflowed: 0 });
        assert_eq!(store.history_len(), 1);
        assert_eq!(store.history_value(1, date, 1), Some(1.0));

        let second = store.upsert(&[history_row(5.0), history_row(6.0)]).await.unwrap();
        assert_eq!(second, UpsertOutcome { inserted: 0, overflowed: 1 });
        assert_eq!(store.overflow_len(), 1);
        assert_eq!(store.overflow_value(1, date, 1), Some(5.0));
    }

    #[test]
    fn test_first_row_per_key_keeps_input_order() {
        let mut later = history_row(3.0);
        later.measure_date = at("2024-03-01 10:00:15");
        let rows = vec![history_row(1.0), later.clone(), history_row(2.0)];

        let kept: Vec<f64> = first_row_per_key(&rows).iter().map(|r| r.value).collect();
        assert_eq!(kept, vec![1.0, 3.0]);
    }

    #[tokio::test]
    async fn test_rows_are_flushed_in_batches() {
        let store = Arc::new(MemoryHistoryStore::new());
        let body: String = (0..5)
            .map(|i| format!("latency,2024-03-01 10:00:{:02},{i}\n", i * 10))
            .collect();
        let render = Arc::new(FakeRender::serving(&body));
        let options = PersistenceOptions {
            insert_batch_size: 2,
            ..PersistenceOptions::default()
        };
        let mut runner = runner(options, &store, &render).await;
        runner.begin_at(at("2024-03-01 10:00:00")).await.unwrap();

        let summary = runner.export().await.unwrap();
        assert_eq!(summary.rows, 5);
        assert_eq!(store.upsert_count(), 3);
        assert_eq!(store.history_len(), 5);
    }

    #[tokio::test]
    async fn test_seconds_since_batch_start() {
        let store = Arc::new(MemoryHistoryStore::new());
        let render = Arc::new(FakeRender::serving("x,2024-03-01 10:01:30,4\n"));
        let mut runner = runner(PersistenceOptions::default(), &store, &render).await;
        runner.begin_at(at("2024-03-01 10:00:00")).await.unwrap();
        runner.export().await.unwrap();

        let state = store.state.lock();
        let (_, offset) = state.history.values().next().unwrap();
        assert_eq!(*offset, 90);
    }

    #[tokio::test]
    async fn test_tick_schedule_and_cutoff() {
        let store = Arc::new(MemoryHistoryStore::new());
        let render = Arc::new(FakeRender::serving(BODY));
        let options = PersistenceOptions {
            duration: Duration::from_secs(60),
            export_interval: Duration::from_secs(30),
            ..PersistenceOptions::default()
        };
        let mut runner = runner(options, &store, &render).await;
        let start = at("2024-03-01 10:00:00");

        assert_eq!(runner.tick_at(start).await, LoopControl::Stop);

        runner.begin_at(start).await.unwrap();
        let batch = runner.batch().unwrap().clone();
        assert_eq!(batch.cutoff, at("2024-03-01 10:01:00"));
        assert_eq!(batch.next_export, at("2024-03-01 10:00:30"));

        assert_eq!(runner.tick_at(at("2024-03-01 10:00:05")).await, LoopControl::Continue);
        assert_eq!(render.requests.load(Ordering::SeqCst), 0);

        assert_eq!(runner.tick_at(at("2024-03-01 10:00:31")).await, LoopControl::Continue);
        assert_eq!(render.requests.load(Ordering::SeqCst), 1);
        let batch = runner.batch().unwrap();
        assert_eq!(batch.last_export, Some(at("2024-03-01 10:00:31")));
        assert_eq!(batch.next_export, at("2024-03-01 10:01:01"));

        assert_eq!(runner.tick_at(at("2024-03-01 10:01:00")).await, LoopControl::Continue);
        assert_eq!(runner.tick_at(at("2024-03-01 10:01:01")).await, LoopControl::Stop);
        assert_eq!(render.requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_duration_means_one_minute() {
        let options = PersistenceOptions {
            duration: Duration::ZERO,
            ..PersistenceOptions::default()
        };
        assert_eq!(options.effective_duration(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_fetch_failure_stops_session() {
        let store = Arc::new(MemoryHistoryStore::new());
        let render = Arc::new(FakeRender::serving(BODY));
        render.fail.store(true, Ordering::SeqCst);
        let mut runner = runner(PersistenceOptions::default(), &store, &render).await;
        let start = at("2024-03-01 10:00:00");
        runner.begin_at(start).await.unwrap();

        assert_eq!(runner.tick_at(at("2024-03-01 10:00:05")).await, LoopControl::Stop);
        assert_eq!(store.history_len(), 0);
    }

    #[tokio::test]
    async fn test_unresolvable_formula_fails_export() {
        let store = Arc::new(MemoryHistoryStore::new());
        let render = Arc::new(FakeRender::serving(BODY));
        let mut runner = runner(PersistenceOptions::default(), &store, &render).await;
        runner.add_formula(Formula::new("ghost").add_series(MetricReference::new("db09", "io", "x"), false));
        runner.begin_at(at("2024-03-01 10:00:00")).await.unwrap();

        let err = runner.export().await.unwrap_err();
        assert!(matches!(err, PersistError::Formula(FormulaError::MetricNotFound { .. })));
    }

    #[tokio::test]
    async fn test_formula_registry() {
        let store = Arc::new(MemoryHistoryStore::new());
        let render = Arc::new(FakeRender::serving(BODY));
        let mut runner = runner(PersistenceOptions::default(), &store, &render).await;

        assert!(!runner.add_formula(formula("latency")));
        assert_eq!(runner.formula_names().collect::<Vec<_>>(), vec!["latency"]);
        assert!(runner.remove_formula("latency").is_some());
        assert!(runner.remove_formula("latency").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_stops_itself_on_failure() {
        let store = Arc::new(MemoryHistoryStore::new());
        let render = Arc::new(FakeRender::serving(BODY));
        render.fail.store(true, Ordering::SeqCst);
        let runner = runner(PersistenceOptions::default(), &store, &render).await;

        let mut session = PersistenceSession::new(runner);
        assert_eq!(session.start().await.unwrap(), 1);
        session.wait().await;
        assert!(!session.is_running());
        assert_eq!(session.lock().await.batch().map(|b| b.batch_id), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quit_after_abandoned_wait_finishes_export() {
        let store = Arc::new(MemoryHistoryStore::new());
        let render = Arc::new(FakeRender::serving(BODY).slow(Duration::from_millis(800)));
        let runner = runner(PersistenceOptions::default(), &store, &render).await;

        let mut session = PersistenceSession::new(runner);
        session.start().await.unwrap();
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            _ = session.wait() => panic!("session ended before its cutoff"),
        }
        assert!(session.is_running());
        assert!(!session.run());

        session.quit().await;
        assert!(!session.is_running());
        assert_eq!(render.completed.load(Ordering::SeqCst), 1);
        assert_eq!(store.history_len(), 2);
    }
}
