//! Commit timestamps with nanosecond precision.
//!
//! Change stream records carry their commit time as seconds plus nanoseconds.
//! [`Timestamp`] keeps that precision as a single signed nanosecond count since
//! the Unix epoch, which makes ordering, range arithmetic, and atomic storage
//! straightforward. The representable range is roughly 1677..2262.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Errors produced while building a [`Timestamp`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimestampError {
    #[error("invalid RFC 3339 timestamp {value:?}: {reason}")]
    Parse { value: String, reason: String },

    #[error("timestamp outside the supported range (1677-09-21 to 2262-04-11)")]
    OutOfRange,
}

/// A UTC instant with nanosecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Earliest representable instant.
    pub const MIN: Timestamp = Timestamp(i64::MIN);

    /// Latest representable instant.
    pub const MAX: Timestamp = Timestamp(i64::MAX);

    /// The Unix epoch.
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Build from nanoseconds since the epoch.
    pub const fn from_nanos(nanos: i64) -> Self {
        Timestamp(nanos)
    }

    /// Nanoseconds since the epoch.
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    /// Build from the `(seconds, nanos)` pair used by change stream records.
    pub fn from_seconds_nanos(seconds: i64, nanos: u32) -> Result<Self, TimestampError> {
        if i64::from(nanos) >= NANOS_PER_SECOND {
            return Err(TimestampError::OutOfRange);
        }
        seconds
            .checked_mul(NANOS_PER_SECOND)
            .and_then(|n| n.checked_add(i64::from(nanos)))
            .map(Timestamp)
            .ok_or(TimestampError::OutOfRange)
    }

    /// Build from a chrono UTC datetime.
    pub fn from_datetime(dt: DateTime<Utc>) -> Result<Self, TimestampError> {
        dt.timestamp_nanos_opt()
            .map(Timestamp)
            .ok_or(TimestampError::OutOfRange)
    }

    /// Convert to a chrono UTC datetime.
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(NANOS_PER_SECOND);
        let nanos = self.0.rem_euclid(NANOS_PER_SECOND) as u32;
        // Every i64 nanosecond count is inside chrono's range.
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        Timestamp::from_datetime(Utc::now()).unwrap_or(Timestamp::MAX)
    }

    /// Add a nanosecond offset, returning `None` on overflow.
    pub fn checked_add_nanos(&self, nanos: i64) -> Option<Self> {
        self.0.checked_add(nanos).map(Timestamp)
    }

    /// Signed distance to `later` in nanoseconds.
    pub fn nanos_until(&self, later: Timestamp) -> i128 {
        i128::from(later.0) - i128::from(self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(
            &self
                .to_datetime()
                .to_rfc3339_opts(SecondsFormat::AutoSi, true),
        )
    }
}

impl FromStr for Timestamp {
    type Err = TimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = DateTime::parse_from_rfc3339(s.trim()).map_err(|e| TimestampError::Parse {
            value: s.to_string(),
            reason: e.to_string(),
        })?;
        Timestamp::from_datetime(parsed.with_timezone(&Utc))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
