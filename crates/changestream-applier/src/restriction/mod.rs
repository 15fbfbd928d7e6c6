//! Progress tracking over commit-timestamp ranges.
//!
//! Every change stream partition owns a half-open [`TimestampRange`] and a
//! [`RangeTracker`] that decides which commit timestamps may still be
//! processed. Claims are ordered, splits hand the unclaimed remainder to a new
//! tracker, and the last claimed position is the resumption point after a
//! checkpoint.

pub mod range;
pub mod tracker;

pub use range::TimestampRange;
pub use tracker::{Claim, ClaimPolicy, ProgressHandle, RangeTracker};

use thiserror::Error;

use crate::core::Timestamp;

/// Tracker invariant violations.
///
/// These indicate a programming error in the caller (or a corrupt
/// checkpoint), never a data problem with a change event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("invalid range [{start}, {end}): start must not be after end")]
    InvalidRange { start: Timestamp, end: Timestamp },

    #[error("cannot claim {position} before the start of the range at {start}")]
    ClaimBeforeStart { position: Timestamp, start: Timestamp },

    #[error("range {range} is not fully processed (last claimed: {last_claimed})")]
    NotDone {
        range: TimestampRange,
        last_claimed: String,
    },
}
