//! Half-open commit timestamp interval.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::TrackerError;
use crate::core::Timestamp;

/// Interval `[start, end)` of commit timestamps owned by one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRange", into = "RawRange")]
pub struct TimestampRange {
    start: Timestamp,
    end: Timestamp,
}

impl TimestampRange {
    /// Create a range, rejecting `start > end`.
    pub fn new(start: Timestamp, end: Timestamp) -> Result<Self, TrackerError> {
        if start > end {
            return Err(TrackerError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// A range with no upper bound, used for partitions that have not been
    /// assigned an end time.
    pub fn unbounded_from(start: Timestamp) -> Self {
        Self {
            start,
            end: Timestamp::MAX,
        }
    }

    /// Inclusive lower bound.
    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// Exclusive upper bound.
    pub fn end(&self) -> Timestamp {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, position: Timestamp) -> bool {
        position >= self.start && position < self.end
    }

    /// Width of the range in nanoseconds.
    pub fn span_nanos(&self) -> i128 {
        self.start.nanos_until(self.end)
    }
}

impl fmt::Display for TimestampRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Serialize, Deserialize)]
struct RawRange {
    start: Timestamp,
    end: Timestamp,
}

impl TryFrom<RawRange> for TimestampRange {
    type Error = TrackerError;

    fn try_from(raw: RawRange) -> Result<Self, Self::Error> {
        TimestampRange::new(raw.start, raw.end)
    }
}

impl From<TimestampRange> for RawRange {
    fn from(range: TimestampRange) -> Self {
        RawRange {
            start: range.start,
            end: range.end,
        }
    }
}
