// ============================================================================
// METRIC CATALOG
// ============================================================================
// Built-in health metrics plus any site-specific definitions from the
// configuration file. Intervals can always be overridden per target.
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use tracing::warn;

use crate::config::MetricDefinitionConfig;
use crate::error::MetricResult;
use crate::metric::{MetricDefinition, PathFormatter};
use crate::query::Row;

// ----------------------------------------------------------------------------
// IO path strategy
// ----------------------------------------------------------------------------

/// Per-drive totals for the `all` pseudo-database, per-database paths
/// otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoPathFormatter;

impl PathFormatter for IoPathFormatter {
    fn key_path(&self, row: &Row, _key_columns: &[String]) -> String {
        let database = row.text("database_name").unwrap_or_default();
        let file_type = row.text("database_file_type").unwrap_or_default();
        if database == "all" {
            let drive = row.text("physical_drive_letter").unwrap_or_default();
            format!("IO.{file_type}.{drive}.")
        } else {
            format!("IO.by_database.{}.{file_type}.", database.replace(' ', "_"))
        }
    }
}

// ----------------------------------------------------------------------------
// Built-in definitions
// ----------------------------------------------------------------------------

fn definition(
    function: &str,
    name: &str,
    descriptor: &str,
    keys: &[&str],
    interval: i64,
) -> MetricResult<MetricDefinition> {
    MetricDefinition::new(function)
        .with_name(name)
        .with_path_descriptor(descriptor)
        .with_key_columns(keys.iter().copied())
        .with_interval(interval)
}

fn builtin_definitions() -> MetricResult<Vec<MetricDefinition>> {
    Ok(vec![
        definition("metrics.get_waiting_tasks", "blocks_waits", "waits", &[], 5)?,
        definition("metrics.get_wait_stats", "wait_stats", "waits.statistics", &[], 5)?,
        definition(
            "metrics.get_async_network_waits",
            "async_network_waits",
            "waits.async_waits.by_host",
            &["host"],
            5,
        )?,
        definition("metrics.get_sql_server_statistics", "sql_server_statistics", "statistics", &[], 15)?,
        definition(
            "metrics.get_database_statistics",
            "database_statistics",
            "statistics.by_database",
            &["database_name"],
            15,
        )?,
        definition("metrics.get_connections", "connections", "statistics.connections", &[], 15)?,
        definition("metrics.get_clr_execution_time", "clr_execution", "statistics", &[], 15)?,
        definition(
            "metrics.get_resource_locks",
            "lock_stats",
            "statistics.resource_locks",
            &["waiting_resource"],
            60,
        )?,
        definition("metrics.get_latch_waits", "latch_wait_stats", "statistics", &[], 60)?,
        definition("metrics.get_memory_manager", "memory", "memory", &[], 15)?,
        definition("metrics.get_buffer_values", "buffers", "buffers", &[], 15)?,
        definition("metrics.get_buffer_node_values", "buffer_nodes", "nodes.buffers", &["buffer_node"], 60)?,
        definition(
            "metrics.get_scheduler_waits",
            "scheduler_waits",
            "nodes.schedulers",
            &["numa_node", "scheduler_id", "cpu_id"],
            15,
        )?,
        definition("metrics.get_session_requests", "session_requests", "session_requests", &[], 5)?,
        MetricDefinition::new("metrics.get_read_write_times")
            .with_name("io")
            .with_key_columns([
                "database_name",
                "database_file_type",
                "database_file_name",
                "physical_drive_letter",
            ])
            .with_formatter(Arc::new(IoPathFormatter))
            .with_interval(15)?,
    ])
}

static BUILTIN: Lazy<Vec<MetricDefinition>> = Lazy::new(|| match builtin_definitions() {
    Ok(definitions) => definitions,
    Err(e) => {
        warn!(target: "sqlgraphite::catalog", error = %e, "Built-in catalog rejected");
        Vec::new()
    }
});

// ----------------------------------------------------------------------------
// Catalog
// ----------------------------------------------------------------------------

/// Named metric definitions available for attaching to targets.
#[derive(Debug, Clone, Default)]
pub struct MetricCatalog {
    definitions: BTreeMap<String, MetricDefinition>,
}

impl MetricCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in health metrics.
    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        for definition in BUILTIN.iter() {
            catalog.insert(definition.clone());
        }
        catalog
    }

    /// Built-ins extended (or overridden by name) with configured definitions.
    pub fn with_configured(definitions: &[MetricDefinitionConfig]) -> MetricResult<Self> {
        let mut catalog = Self::builtin();
        for configured in definitions {
            catalog.insert(configured.to_definition()?);
        }
        Ok(catalog)
    }

    /// Insert by display name, returning any definition it replaced.
    pub fn insert(&mut self, definition: MetricDefinition) -> Option<MetricDefinition> {
        self.definitions.insert(definition.name().to_string(), definition)
    }

    pub fn get(&self, name: &str) -> Option<&MetricDefinition> {
        self.definitions.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetricDefinition> {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
