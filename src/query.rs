// ============================================================================
// QUERY COLLABORATOR
// ============================================================================
// The narrow "run a query, get rows" seam used by metric instances, plus the
// PostgreSQL implementation that backs each monitored target.
// ============================================================================

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{debug, error, info};

use crate::error::{QueryError, QueryResult};

// ----------------------------------------------------------------------------
// Rows
// ----------------------------------------------------------------------------

/// A single value returned by a query.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    /// Numeric view used for Graphite values. Text is parsed since some
    /// drivers hand every value back as text.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Null => None,
            FieldValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            FieldValue::Int(i) => Some(*i as f64),
            FieldValue::Float(f) => Some(*f),
            FieldValue::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }

    /// Text view used for key columns. `None` for NULL.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            FieldValue::Null => None,
            FieldValue::Bool(b) => Some(Cow::Owned(b.to_string())),
            FieldValue::Int(i) => Some(Cow::Owned(i.to_string())),
            FieldValue::Float(f) => Some(Cow::Owned(f.to_string())),
            FieldValue::Text(s) => Some(Cow::Borrowed(s.as_str())),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

/// One result row, addressed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    fields: HashMap<String, FieldValue>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(column.into(), value.into());
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.fields.get(column)
    }

    pub fn text(&self, column: &str) -> Option<Cow<'_, str>> {
        self.fields.get(column).and_then(FieldValue::as_text)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }
}

impl<K, V> FromIterator<(K, V)> for Row
where
    K: Into<String>,
    V: Into<FieldValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Column descriptor of a query object's result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub type_name: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Identifier Quoting
// ----------------------------------------------------------------------------

/// Quote a single identifier. Already-quoted identifiers pass through.
pub fn quote_ident(ident: &str) -> String {
    if ident.len() >= 2 && ident.starts_with('"') && ident.ends_with('"') {
        return ident.to_string();
    }
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote every dot-separated part of an object name.
pub fn quote_qualified(object_name: &str) -> String {
    object_name
        .split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}

/// Statement selecting every row of a table-valued function.
pub fn function_select(quoted_name: &str) -> String {
    format!("SELECT * FROM {quoted_name}()")
}

// ----------------------------------------------------------------------------
// Query Source Trait
// ----------------------------------------------------------------------------

/// Query access to one monitored target.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuerySource: Send + Sync {
    /// Run a statement and return every row.
    async fn run_query(&self, statement: &str) -> QueryResult<Vec<Row>>;

    /// Result columns of a table-valued function.
    async fn get_columns(&self, object_name: &str) -> QueryResult<Vec<ColumnInfo>>;

    /// Whether a function, table or view with this name exists.
    async fn object_exists(&self, object_name: &str) -> QueryResult<bool>;

    fn quote_name(&self, object_name: &str) -> String {
        quote_qualified(object_name)
    }
}

// ----------------------------------------------------------------------------
// PostgreSQL Implementation
// ----------------------------------------------------------------------------

/// A target reached through `tokio-postgres`. Owns one connection.
pub struct PgQuerySource {
    target: String,
    client: Client,
    connection_task: JoinHandle<()>,
}

impl PgQuerySource {
    /// Connect and spawn the connection driver.
    pub async fn connect(target: &str, connection_string: &str) -> QueryResult<Self> {
        let (client, connection) = tokio_postgres::connect(connection_string, NoTls)
            .await
            .map_err(|e| QueryError::Connection {
                target: target.to_string(),
                message: e.to_string(),
            })?;

        let name = target.to_string();
        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(target: "sqlgraphite::query", target_name = %name, error = %e,
                    "Database connection terminated");
            }
        });

        info!(target: "sqlgraphite::query", target_name = %target, "Connected to target");

        Ok(Self {
            target: target.to_string(),
            client,
            connection_task,
        })
    }

    /// SQLSTATE class 42 (syntax / access rule) and 3F (invalid schema) mean
    /// the statement will never succeed.
    fn classify(&self, statement: &str, err: tokio_postgres::Error) -> QueryError {
        if err.is_closed() {
            return QueryError::Connection {
                target: self.target.clone(),
                message: err.to_string(),
            };
        }
        match err.as_db_error() {
            Some(db) => {
                let code = db.code().code();
                if code.starts_with("42") || code.starts_with("3F") {
                    QueryError::Execution {
                        target: self.target.clone(),
                        statement: statement.to_string(),
                        message: db.message().to_string(),
                    }
                } else {
                    QueryError::Target {
                        target: self.target.clone(),
                        message: db.message().to_string(),
                    }
                }
            }
            None => QueryError::Connection {
                target: self.target.clone(),
                message: err.to_string(),
            },
        }
    }
}

impl Debug for PgQuerySource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgQuerySource")
            .field("target", &self.target)
            .field("closed", &self.client.is_closed())
            .finish()
    }
}

impl Drop for PgQuerySource {
    fn drop(&mut self) {
        self.connection_task.abort();
    }
}

#[async_trait]
impl QuerySource for PgQuerySource {
    async fn run_query(&self, statement: &str) -> QueryResult<Vec<Row>> {
        debug!(target: "sqlgraphite::query", target_name = %self.target, statement, "Running query");

        let messages = self
            .client
            .simple_query(statement)
            .await
            .map_err(|e| self.classify(statement, e))?;

        let mut rows = Vec::new();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                let mut out = Row::new();
                for (idx, column) in row.columns().iter().enumerate() {
                    let value = match row.get(idx) {
                        Some(text) => FieldValue::Text(text.to_string()),
                        None => FieldValue::Null,
                    };
                    out.insert(column.name(), value);
                }
                rows.push(out);
            }
        }
        Ok(rows)
    }

    async fn get_columns(&self, object_name: &str) -> QueryResult<Vec<ColumnInfo>> {
        let statement = function_select(&self.quote_name(object_name));
        let prepared = self
            .client
            .prepare(&statement)
            .await
            .map_err(|e| self.classify(&statement, e))?;

        Ok(prepared
            .columns()
            .iter()
            .map(|c| ColumnInfo::new(c.name(), c.type_().name()))
            .collect())
    }

    async fn object_exists(&self, object_name: &str) -> QueryResult<bool> {
        const STATEMENT: &str =
            "SELECT to_regproc($1::text) IS NOT NULL OR to_regclass($1::text) IS NOT NULL";

        let row = self
            .client
            .query_one(STATEMENT, &[&object_name])
            .await
            .map_err(|e| self.classify(STATEMENT, e))?;

        row.try_get::<_, bool>(0)
            .map_err(|e| self.classify(STATEMENT, e))
    }
}

// ----------------------------------------------------------------------------
// In-memory source for tests
// ----------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone)]
    struct FakeObject {
        columns: Vec<String>,
        rows: Vec<Row>,
    }

    /// Serves fixed rows for registered functions.
    #[derive(Debug, Default)]
    pub struct FakeSource {
        objects: Mutex<HashMap<String, FakeObject>>,
        pending_failure: Mutex<Option<QueryError>>,
        queries: AtomicUsize,
    }

    impl FakeSource {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_object(self, name: &str, columns: &[&str], rows: Vec<Row>) -> Self {
            self.objects.lock().insert(
                name.to_string(),
                FakeObject {
                    columns: columns.iter().map(|c| c.to_string()).collect(),
                    rows,
                },
            );
            self
        }

        pub fn set_rows(&self, name: &str, rows: Vec<Row>) {
            if let Some(object) = self.objects.lock().get_mut(name) {
                object.rows = rows;
            }
        }

        /// The next `run_query` fails with `err`.
        pub fn fail_next_query(&self, err: QueryError) {
            *self.pending_failure.lock() = Some(err);
        }

        pub fn query_count(&self) -> usize {
            self.queries.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl QuerySource for FakeSource {
        async fn run_query(&self, statement: &str) -> QueryResult<Vec<Row>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.pending_failure.lock().take() {
                return Err(err);
            }
            let objects = self.objects.lock();
            let found = objects
                .iter()
                .find(|(name, _)| function_select(&quote_qualified(name)) == statement);
            match found {
                Some((_, object)) => Ok(object.rows.clone()),
                None => Err(QueryError::Execution {
                    target: "fake".into(),
                    statement: statement.to_string(),
                    message: "function does not exist".into(),
                }),
            }
        }

        async fn get_columns(&self, object_name: &str) -> QueryResult<Vec<ColumnInfo>> {
            let objects = self.objects.lock();
            Ok(objects
                .get(object_name)
                .map(|o| o.columns.iter().map(|c| ColumnInfo::new(c, "numeric")).collect())
                .unwrap_or_default())
        }

        async fn object_exists(&self, object_name: &str) -> QueryResult<bool> {
            Ok(self.objects.lock().contains_key(object_name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_qualified() {
        assert_eq!(quote_qualified("metrics.get_memory"), "\"metrics\".\"get_memory\"");
        assert_eq!(quote_qualified("\"Odd\".fn"), "\"Odd\".\"fn\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_field_value_views() {
        assert_eq!(FieldValue::from("12.5").as_f64(), Some(12.5));
        assert_eq!(FieldValue::from(" 7 ").as_f64(), Some(7.0));
        assert_eq!(FieldValue::from("n/a").as_f64(), None);
        assert_eq!(FieldValue::Null.as_text(), None);
        assert_eq!(FieldValue::from(3_i64).as_text().as_deref(), Some("3"));
        assert_eq!(FieldValue::from(true).as_f64(), Some(1.0));
    }

    #[test]
    fn test_row_from_iter() {
        let row: Row = [("host", "a"), ("cpu", "1")].into_iter().collect();
        assert_eq!(row.len(), 2);
        assert_eq!(row.text("host").as_deref(), Some("a"));
        assert!(row.get("mem").is_none());
    }
}
