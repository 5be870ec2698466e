// ============================================================================
// CORE TYPE SYSTEM
// ============================================================================
// Value types shared by the scheduler, the queue and the sender.
// ============================================================================

use std::fmt::{self, Display, Formatter};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Wall-clock timestamp in nanoseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create a new timestamp from nanoseconds since Unix epoch
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Create a new timestamp from seconds since Unix epoch
    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Current wall-clock time
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    /// Whole seconds, truncated. This is the Graphite wire timestamp.
    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1_000_000_000
    }

    #[inline]
    pub fn add_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_nanos() as i64))
    }

    #[inline]
    pub fn add_secs(&self, secs: u64) -> Self {
        self.add_duration(Duration::from_secs(secs))
    }

    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    #[inline]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        let duration = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_nanos_opt().unwrap_or(0))
    }
}

// ----------------------------------------------------------------------------
// Emitted Point
// ----------------------------------------------------------------------------

/// One Graphite data point. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmittedPoint {
    path: String,
    value: f64,
    timestamp: i64,
}

impl EmittedPoint {
    pub fn new(path: impl Into<String>, value: f64, timestamp: i64) -> Self {
        Self {
            path: path.into(),
            value,
            timestamp,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Epoch seconds
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Plaintext protocol line: `<path> <value> <epoch-seconds>\n`
    pub fn to_line(&self) -> String {
        format!("{} {} {}\n", self.path, self.value, self.timestamp)
    }
}

// ----------------------------------------------------------------------------
// Path helpers
// ----------------------------------------------------------------------------

/// Returns `segment` with exactly one trailing dot, or an empty string when
/// `segment` is empty.
pub fn append_dot(segment: &str) -> String {
    if segment.is_empty() {
        String::new()
    } else if segment.ends_with('.') {
        segment.to_string()
    } else {
        format!("{segment}.")
    }
}

/// `server\instance` becomes `server.instance`.
pub fn canonical_target_name(instance: &str) -> String {
    instance.replace('\\', ".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_timestamp_seconds_truncate() {
        let ts = Timestamp::from_nanos(1_700_000_000_999_999_999);
        assert_eq!(ts.as_secs(), 1_700_000_000);
        assert_eq!(ts.add_secs(5).as_secs(), 1_700_000_005);
    }

    #[test]
    fn test_point_line_format() {
        let point = EmittedPoint::new("db.host1.60seconds.memory.used", 42.0, 1_700_000_000);
        assert_eq!(point.to_line(), "db.host1.60seconds.memory.used 42 1700000000\n");

        let point = EmittedPoint::new("a.b", 0.25, 10);
        assert_eq!(point.to_line(), "a.b 0.25 10\n");
    }

    #[test]
    fn test_append_dot() {
        assert_eq!(append_dot(""), "");
        assert_eq!(append_dot("waits"), "waits.");
        assert_eq!(append_dot("waits."), "waits.");
    }

    #[test_case("sql01\\reporting", "sql01.reporting" ; "named instance")]
    #[test_case("sql01", "sql01" ; "default instance")]
    #[test_case("sql01.reporting", "sql01.reporting" ; "already canonical")]
    fn test_canonical_target_name(instance: &str, expected: &str) {
        assert_eq!(canonical_target_name(instance), expected);
    }
}
