//! Claim, split and checkpoint engine for one partition's timestamp range.
//!
//! A [`RangeTracker`] is owned by exactly one consumer. All mutation goes
//! through `&mut self`, so the single-writer rule is enforced by the borrow
//! checker rather than a lock. Other threads observe progress through a
//! [`ProgressHandle`], which reads a snapshot published with atomics after
//! every state change.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{TimestampRange, TrackerError};
use crate::core::Timestamp;

/// How a tracker treats a claim of exactly the last claimed position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimPolicy {
    /// Positions must be non-decreasing and inside the range.
    #[default]
    Monotonic,

    /// Like `Monotonic`, but a repeated claim of the last claimed position
    /// succeeds as a no-op before any other check. Used for partition
    /// discovery streams, where the same record may be redelivered.
    DeduplicateLast,
}

/// Outcome of a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The position was recorded as the new last claimed position.
    Claimed,
    /// Redelivery of the last claimed position, tolerated without state change.
    Duplicate,
    /// The position is behind the last claimed position.
    Stale,
    /// The position is at or beyond the end of the range.
    OutOfRange,
    /// The tracker has been marked done.
    Done,
}

impl Claim {
    /// Whether the caller may process the event at this position.
    pub fn is_claimed(&self) -> bool {
        matches!(self, Claim::Claimed | Claim::Duplicate)
    }

    /// Whether the partition has no further work at or after this position.
    pub fn is_finished(&self) -> bool {
        matches!(self, Claim::OutOfRange | Claim::Done)
    }
}

#[derive(Debug)]
struct SharedProgress {
    start: AtomicI64,
    end: AtomicI64,
    last_claimed: AtomicI64,
    has_claim: AtomicBool,
    done: AtomicBool,
}

impl SharedProgress {
    fn new(range: TimestampRange) -> Self {
        Self {
            start: AtomicI64::new(range.start().as_nanos()),
            end: AtomicI64::new(range.end().as_nanos()),
            last_claimed: AtomicI64::new(0),
            has_claim: AtomicBool::new(false),
            done: AtomicBool::new(false),
        }
    }

    fn last_claimed(&self) -> Option<Timestamp> {
        if self.has_claim.load(Ordering::Acquire) {
            Some(Timestamp::from_nanos(
                self.last_claimed.load(Ordering::Acquire),
            ))
        } else {
            None
        }
    }

    fn progress(&self) -> f64 {
        if self.done.load(Ordering::Acquire) {
            return 1.0;
        }
        let start = i128::from(self.start.load(Ordering::Acquire));
        let end = i128::from(self.end.load(Ordering::Acquire));
        let span = end - start;
        if span <= 0 {
            return 1.0;
        }
        match self.last_claimed() {
            None => 0.0,
            Some(last) => {
                let completed = i128::from(last.as_nanos()) - start;
                (completed as f64 / span as f64).clamp(0.0, 1.0)
            }
        }
    }
}

/// Read-only view of a tracker's progress, safe to use from other threads.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    shared: Arc<SharedProgress>,
}

impl ProgressHandle {
    /// Fraction of the range consumed, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        self.shared.progress()
    }

    pub fn last_claimed(&self) -> Option<Timestamp> {
        self.shared.last_claimed()
    }

    pub fn is_done(&self) -> bool {
        self.shared.done.load(Ordering::Acquire)
    }

    /// Current exclusive end of the tracked range (shrinks on split).
    pub fn end(&self) -> Timestamp {
        Timestamp::from_nanos(self.shared.end.load(Ordering::Acquire))
    }
}

/// Claim engine over a [`TimestampRange`].
#[derive(Debug)]
pub struct RangeTracker {
    range: TimestampRange,
    last_claimed: Option<Timestamp>,
    done: bool,
    policy: ClaimPolicy,
    shared: Arc<SharedProgress>,
}

impl RangeTracker {
    /// Create a tracker with no claims.
    pub fn new(range: TimestampRange, policy: ClaimPolicy) -> Self {
        Self {
            range,
            last_claimed: None,
            done: false,
            policy,
            shared: Arc::new(SharedProgress::new(range)),
        }
    }

    /// Tracker for a partition discovery stream.
    pub fn for_partition_discovery(range: TimestampRange) -> Self {
        Self::new(range, ClaimPolicy::DeduplicateLast)
    }

    /// Rebuild a tracker from a checkpoint. Positions below `last_claimed`
    /// will be refused, so no work below the resumption point is replayed.
    pub fn resume(
        range: TimestampRange,
        last_claimed: Option<Timestamp>,
        policy: ClaimPolicy,
    ) -> Result<Self, TrackerError> {
        let mut tracker = Self::new(range, policy);
        if let Some(position) = last_claimed {
            if position < range.start() {
                return Err(TrackerError::ClaimBeforeStart {
                    position,
                    start: range.start(),
                });
            }
            tracker.record_claim(position);
        }
        Ok(tracker)
    }

    pub fn range(&self) -> TimestampRange {
        self.range
    }

    pub fn last_claimed(&self) -> Option<Timestamp> {
        self.last_claimed
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn policy(&self) -> ClaimPolicy {
        self.policy
    }

    /// Handle for concurrent progress reads.
    pub fn progress_handle(&self) -> ProgressHandle {
        ProgressHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Attempt to claim `position` and report why it was or was not claimed.
    ///
    /// Fails only when `position` precedes the start of the range, which means
    /// the caller routed an event to the wrong partition.
    pub fn claim(&mut self, position: Timestamp) -> Result<Claim, TrackerError> {
        if self.done {
            return Ok(Claim::Done);
        }
        if self.policy == ClaimPolicy::DeduplicateLast && self.last_claimed == Some(position) {
            return Ok(Claim::Duplicate);
        }
        if position < self.range.start() {
            return Err(TrackerError::ClaimBeforeStart {
                position,
                start: self.range.start(),
            });
        }
        if position >= self.range.end() {
            return Ok(Claim::OutOfRange);
        }
        if matches!(self.last_claimed, Some(last) if position < last) {
            return Ok(Claim::Stale);
        }
        self.record_claim(position);
        Ok(Claim::Claimed)
    }

    /// Attempt to claim `position`.
    ///
    /// Returns `Ok(false)` without changing state when the position is at or
    /// past the end of the range, behind the last claim, or the tracker is done.
    pub fn try_claim(&mut self, position: Timestamp) -> Result<bool, TrackerError> {
        self.claim(position).map(|c| c.is_claimed())
    }

    /// Split off the unclaimed remainder.
    ///
    /// `fraction` (clamped to `[0, 1]`) selects how much of the remaining work
    /// stays with this tracker. On success the tracker keeps the primary range
    /// and the residual is returned for a new owner. Returns `None` when the
    /// tracker is done or no split point exists strictly after the last claim
    /// and before the end.
    pub fn try_split(&mut self, fraction: f64) -> Option<(TimestampRange, TimestampRange)> {
        if self.done {
            return None;
        }
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };

        let from = self.last_claimed.unwrap_or(self.range.start());
        let remaining = from.nanos_until(self.range.end());
        if remaining <= 0 {
            return None;
        }

        let mut offset = (remaining as f64 * fraction).ceil() as i128;
        if self.last_claimed.is_some() {
            offset = offset.max(1);
        }
        if offset >= remaining {
            return None;
        }

        // from + offset < end, so the sum fits in i64.
        let split = Timestamp::from_nanos((i128::from(from.as_nanos()) + offset) as i64);
        let primary = TimestampRange::new(self.range.start(), split).ok()?;
        let residual = TimestampRange::new(split, self.range.end()).ok()?;

        self.range = primary;
        self.shared.end.store(split.as_nanos(), Ordering::Release);
        Some((primary, residual))
    }

    /// Fraction of the range consumed, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        self.shared.progress()
    }

    /// Mark the range as finished. Idempotent.
    pub fn mark_done(&mut self) {
        self.done = true;
        self.shared.done.store(true, Ordering::Release);
    }

    /// Verify that no work remains in the range.
    pub fn check_done(&self) -> Result<(), TrackerError> {
        if self.done || self.range.is_empty() {
            return Ok(());
        }
        let end = i128::from(self.range.end().as_nanos());
        match self.last_claimed {
            Some(last) if i128::from(last.as_nanos()) + 1 >= end => Ok(()),
            last => Err(TrackerError::NotDone {
                range: self.range,
                last_claimed: last
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "none".to_string()),
            }),
        }
    }

    fn record_claim(&mut self, position: Timestamp) {
        self.last_claimed = Some(position);
        self.shared
            .last_claimed
            .store(position.as_nanos(), Ordering::Release);
        self.shared.has_claim.store(true, Ordering::Release);
    }
}
