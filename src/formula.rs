// ============================================================================
// FORMULA ENGINE
// ============================================================================
// A formula names one derived series built from metrics that are attached to
// live targets. References stay unresolved until evaluation, so a formula can
// be declared before its targets exist and always reflects their current
// intervals.
// ============================================================================

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FormulaError, FormulaResult};
use crate::metric::MetricInterval;
use crate::query::Row;
use crate::types::canonical_target_name;

// ----------------------------------------------------------------------------
// Metric References
// ----------------------------------------------------------------------------

/// Names one measurement of one metric row on one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricReference {
    server: String,
    metric: String,
    measurement: String,
    keys: BTreeMap<String, String>,
}

impl MetricReference {
    /// `server` may use either `server\instance` or `server.instance`.
    pub fn new(server: impl AsRef<str>, metric: impl Into<String>, measurement: impl Into<String>) -> Self {
        Self {
            server: canonical_target_name(server.as_ref()),
            metric: metric.into(),
            measurement: measurement.into(),
            keys: BTreeMap::new(),
        }
    }

    pub fn with_key(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.keys.insert(column.into(), value.into());
        self
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn keys(&self) -> &BTreeMap<String, String> {
        &self.keys
    }

    /// The key values as the result row the path formatter expects.
    pub fn key_row(&self) -> Row {
        self.keys.iter().map(|(k, v)| (k.clone(), v.as_str())).collect()
    }
}

/// A reference resolved against a live target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSeries {
    pub path: String,
    pub interval: MetricInterval,
}

/// Looks up metric paths on the currently monitored targets.
pub trait MetricResolver: Send + Sync {
    fn resolve(&self, reference: &MetricReference) -> FormulaResult<ResolvedSeries>;
}

// ----------------------------------------------------------------------------
// Formula
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesSpec {
    pub reference: MetricReference,
    pub derivative: bool,
}

/// A named render target composed of one or more series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formula {
    name: String,
    series: Vec<SeriesSpec>,
    leader: Option<&'static str>,
}

impl Formula {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            series: Vec::new(),
            leader: None,
        }
    }

    pub fn add_series(mut self, reference: MetricReference, derivative: bool) -> Self {
        self.series.push(SeriesSpec { reference, derivative });
        self
    }

    /// Adds a series and wraps the whole list in `divideSeries`.
    pub fn divide_series(mut self, reference: MetricReference, derivative: bool) -> Self {
        self.series.push(SeriesSpec { reference, derivative });
        self.leader = Some("divideSeries");
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn series(&self) -> &[SeriesSpec] {
        &self.series
    }

    pub fn is_ratio(&self) -> bool {
        self.leader.is_some()
    }

    /// The unencoded render expression.
    ///
    /// Fails as a whole when any reference does not resolve.
    pub fn expression(&self, resolver: &dyn MetricResolver) -> FormulaResult<String> {
        if self.series.is_empty() {
            return Err(FormulaError::Empty {
                formula: self.name.clone(),
            });
        }

        let parts = self
            .series
            .iter()
            .map(|spec| {
                let resolved = resolver.resolve(&spec.reference)?;
                Ok(if spec.derivative {
                    format!("derivative({})", resolved.path)
                } else {
                    resolved.path
                })
            })
            .collect::<FormulaResult<Vec<_>>>()?;

        let mut body = parts.join(",");
        if let Some(leader) = self.leader {
            body = format!("{leader}({body})");
        }
        Ok(format!("alias(keepLastValue({body}), \"{}\")", self.name))
    }

    /// The URL-safe render expression.
    pub fn evaluate(&self, resolver: &dyn MetricResolver) -> FormulaResult<String> {
        self.expression(resolver).map(|expr| encode_expression(&expr))
    }

    /// CSV render URL covering two export intervals plus one minute.
    pub fn render_url(
        &self,
        resolver: &dyn MetricResolver,
        render_host: &str,
        export_interval: Duration,
    ) -> FormulaResult<String> {
        let url = format!(
            "http://{render_host}/render?target={}&from=-{}minutes&format=csv",
            self.evaluate(resolver)?,
            render_window_minutes(export_interval)
        );
        debug!(target: "sqlgraphite::formula", formula = %self.name, url = %url, "Built render URL");
        Ok(url)
    }
}

/// Minutes of history requested per export.
pub fn render_window_minutes(export_interval: Duration) -> u64 {
    (export_interval.as_secs() * 2) / 60 + 1
}

// ----------------------------------------------------------------------------
// Encoding
// ----------------------------------------------------------------------------

/// Percent-encode the characters Graphite's render API needs escaped inside a
/// `target` parameter. `.` and `/` are left alone.
pub fn encode_expression(expression: &str) -> String {
    let mut encoded = String::with_capacity(expression.len() * 2);
    for ch in expression.chars() {
        match ch {
            ' ' | '!' | '"' | '#' | '$' | '%' | '&' | '\'' | '(' | ')' | '*' | '+' | ',' | '-' => {
                encoded.push_str(&format!("%{:02X}", ch as u32));
            }
            other => encoded.push(other),
        }
    }
    encoded
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;

    /// Resolves `server/metric/measurement` to a fixed path.
    #[derive(Debug, Default)]
    pub struct StaticResolver {
        paths: HashMap<(String, String, String), String>,
    }

    impl StaticResolver {
        pub fn with(mut self, server: &str, metric: &str, measurement: &str, path: &str) -> Self {
            self.paths.insert(
                (canonical_target_name(server), metric.into(), measurement.into()),
                path.into(),
            );
            self
        }
    }

    impl MetricResolver for StaticResolver {
        fn resolve(&self, reference: &MetricReference) -> FormulaResult<ResolvedSeries> {
            let key = (
                reference.server().to_string(),
                reference.metric().to_string(),
                reference.measurement().to_string(),
            );
            self.paths
                .get(&key)
                .map(|path| ResolvedSeries {
                    path: path.clone(),
                    interval: MetricInterval::FIFTEEN_SECONDS,
                })
                .ok_or_else(|| FormulaError::MetricNotFound {
                    server: reference.server().to_string(),
                    metric: reference.metric().to_string(),
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::StaticResolver;
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn resolver() -> StaticResolver {
        StaticResolver::default()
            .with("db01\\a", "io", "io_stall", "db.db01.a.15seconds.IO.by_drive.S.io_stall")
            .with("db01\\a", "io", "reads_writes", "db.db01.a.15seconds.IO.by_drive.S.reads_writes")
    }

    #[test]
    fn test_ratio_formula() {
        let formula = Formula::new("latency")
            .add_series(MetricReference::new("db01\\a", "io", "io_stall"), true)
            .divide_series(MetricReference::new("db01.a", "io", "reads_writes"), false);

        let expr = formula.expression(&resolver()).unwrap();
        assert_eq!(
            expr,
            "alias(keepLastValue(divideSeries(derivative(db.db01.a.15seconds.IO.by_drive.S.io_stall),\
             db.db01.a.15seconds.IO.by_drive.S.reads_writes)), \"latency\")"
        );
        assert_eq!(formula.evaluate(&resolver()).unwrap(), formula.evaluate(&resolver()).unwrap());
        assert_eq!(expr.matches("keepLastValue").count(), 1);
    }

    #[test]
    fn test_plain_series_are_joined() {
        let formula = Formula::new("stalls")
            .add_series(MetricReference::new("db01\\a", "io", "io_stall"), false)
            .add_series(MetricReference::new("db01\\a", "io", "reads_writes"), false);
        let expr = formula.expression(&resolver()).unwrap();
        assert!(expr.starts_with("alias(keepLastValue(db.db01.a.15seconds.IO.by_drive.S.io_stall,db."));
        assert!(!formula.is_ratio());
    }

    #[test]
    fn test_unresolved_reference_fails_whole_formula() {
        let formula = Formula::new("broken")
            .add_series(MetricReference::new("db01\\a", "io", "io_stall"), false)
            .add_series(MetricReference::new("db01\\a", "memory", "total"), false);
        assert!(matches!(
            formula.expression(&resolver()),
            Err(FormulaError::MetricNotFound { .. })
        ));
        assert!(matches!(
            Formula::new("empty").expression(&resolver()),
            Err(FormulaError::Empty { .. })
        ));
    }

    #[test]
    fn test_render_url() {
        let formula = Formula::new("stall").add_series(MetricReference::new("db01\\a", "io", "io_stall"), false);
        let url = formula
            .render_url(&resolver(), "graphite:8080", Duration::from_secs(90))
            .unwrap();
        assert_eq!(
            url,
            "http://graphite:8080/render?target=alias%28keepLastValue%28db.db01.a.15seconds.IO.by_drive.S.io_stall%29%2C%20%22stall%22%29&from=-4minutes&format=csv"
        );
    }

    #[test]
    fn test_render_window() {
        assert_eq!(render_window_minutes(Duration::ZERO), 1);
        assert_eq!(render_window_minutes(Duration::from_secs(29)), 1);
        assert_eq!(render_window_minutes(Duration::from_secs(30)), 2);
        assert_eq!(render_window_minutes(Duration::from_secs(300)), 11);
    }

    #[test]
    fn test_encode_table() {
        assert_eq!(encode_expression(" !\"#$%&'()*+,-"), "%20%21%22%23%24%25%26%27%28%29%2A%2B%2C%2D");
        assert_eq!(encode_expression("a.b/c_d"), "a.b/c_d");
    }

    fn decode(encoded: &str) -> String {
        let mut out = String::new();
        let mut chars = encoded.chars();
        while let Some(ch) = chars.next() {
            if ch == '%' {
                let hex: String = chars.by_ref().take(2).collect();
                out.push(u8::from_str_radix(&hex, 16).unwrap() as char);
            } else {
                out.push(ch);
            }
        }
        out
    }

    proptest! {
        #[test]
        fn prop_encoding_is_reversible(input in "[ -~]{0,64}") {
            let encoded = encode_expression(&input);
            prop_assert!(!encoded.contains(' '));
            prop_assert!(!encoded.contains(','));
            prop_assert_eq!(decode(&encoded), input);
        }
    }
}
