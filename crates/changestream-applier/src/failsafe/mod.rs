//! Routing of events that could not be applied.
//!
//! Nothing that goes wrong with a single change event stops the partition.
//! [`FailureRouter::route`] classifies the failure:
//!
//! - events for tables outside the replicated schema are dropped with an
//!   informational log line;
//! - structural and data errors go to the severe dead-letter channel;
//! - write failures reported by the sink go to the retry channel.
//!
//! Both channels are unbounded, so routing never blocks the stream.

mod throttle;

pub use throttle::{Clock, ManualClock, SystemClock, ThrottledLogger, DEFAULT_LOG_INTERVAL};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info};

use crate::error::TranslateError;
use crate::sink::SinkError;

/// Where a failed event went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteDecision {
    /// Discarded; the event is outside the replicated schema.
    Drop,
    /// Sent to the retry channel for another attempt.
    Retry,
    /// Sent to the severe dead-letter channel.
    DeadLetter,
}

/// A failed event with enough context to diagnose and replay it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailsafeElement {
    pub original_payload: String,
    pub error_message: String,
    /// The error followed by its cause chain.
    pub stack_trace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
}

/// Sending halves of the failure channels.
#[derive(Debug, Clone)]
pub struct FailsafeSenders {
    pub dead_letter: UnboundedSender<FailsafeElement>,
    pub retry: UnboundedSender<FailsafeElement>,
}

/// Receiving halves of the failure channels.
#[derive(Debug)]
pub struct FailsafeReceivers {
    pub dead_letter: UnboundedReceiver<FailsafeElement>,
    pub retry: UnboundedReceiver<FailsafeElement>,
}

/// Create a pair of unbounded failure channels.
pub fn failsafe_channels() -> (FailsafeSenders, FailsafeReceivers) {
    let (dead_tx, dead_rx) = mpsc::unbounded_channel();
    let (retry_tx, retry_rx) = mpsc::unbounded_channel();
    (
        FailsafeSenders {
            dead_letter: dead_tx,
            retry: retry_tx,
        },
        FailsafeReceivers {
            dead_letter: dead_rx,
            retry: retry_rx,
        },
    )
}

/// Per-router outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    pub dropped: u64,
    pub dead_lettered: u64,
    pub retried: u64,
}

/// Classifies failures and forwards them to the failure channels.
#[derive(Debug)]
pub struct FailureRouter<C: Clock = SystemClock> {
    senders: FailsafeSenders,
    logger: ThrottledLogger<C>,
    seen_failure: bool,
    stats: RouterStats,
}

impl FailureRouter<SystemClock> {
    pub fn new(senders: FailsafeSenders) -> Self {
        Self::with_logger(senders, ThrottledLogger::default())
    }
}

impl<C: Clock> FailureRouter<C> {
    pub fn with_logger(senders: FailsafeSenders, logger: ThrottledLogger<C>) -> Self {
        Self {
            senders,
            logger,
            seen_failure: false,
            stats: RouterStats::default(),
        }
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Count an event that was applied.
    pub fn record_success(&mut self) {
        self.logger.record_success();
    }

    /// Route a translation failure for `payload`.
    pub fn route(&mut self, payload: &str, err: &TranslateError) -> RouteDecision {
        if err.is_scope_exclusion() {
            info!("Dropping change event: {}", err);
            self.stats.dropped += 1;
            return RouteDecision::Drop;
        }

        self.log_failure(&err.format_detailed());
        let element = FailsafeElement {
            original_payload: payload.to_string(),
            error_message: err.to_string(),
            stack_trace: err.format_detailed(),
            table: err.table().map(str::to_string),
        };
        if self.senders.dead_letter.send(element).is_err() {
            error!("Dead-letter channel is closed; failed event is lost");
        }
        self.stats.dead_lettered += 1;
        RouteDecision::DeadLetter
    }

    /// Route a sink failure for a statement generated from `payload`.
    pub fn route_sink_failure(
        &mut self,
        payload: &str,
        table: &str,
        err: &SinkError,
    ) -> RouteDecision {
        let message = format!("Write to {} failed: {}", table, err);
        self.log_failure(&message);
        let element = FailsafeElement {
            original_payload: payload.to_string(),
            error_message: message.clone(),
            stack_trace: message,
            table: Some(table.to_string()),
        };
        if self.senders.retry.send(element).is_err() {
            error!("Retry channel is closed; failed event is lost");
        }
        self.stats.retried += 1;
        RouteDecision::Retry
    }

    /// Only the first failure per router is logged in full.
    fn log_failure(&mut self, detail: &str) {
        if self.seen_failure {
            debug!("{}", detail);
        } else {
            self.seen_failure = true;
            error!("{}", detail);
        }
        self.logger.record_failure();
    }
}
