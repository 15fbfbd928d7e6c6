//! Per-partition processing loop.
//!
//! A [`PartitionApplier`] owns one partition's tracker and drives each
//! payload through claim, translation, execution and failure routing.
//! Processing within a partition is sequential; many appliers run side by
//! side, one per partition.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::catalog::CatalogHandle;
use crate::dml::{WriteStatement, WriteTranslator};
use crate::error::Result;
use crate::failsafe::{Clock, FailureRouter, RouteDecision, SystemClock};
use crate::model::ChangeEvent;
use crate::restriction::{Claim, ProgressHandle, RangeTracker, TimestampRange};
use crate::sink::WriteSink;
use crate::state::{PartitionCheckpoint, PartitionStatus};

/// What happened to one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The statement was executed.
    Applied(WriteStatement),
    /// The event was outside the replicated schema.
    Dropped,
    /// The event was sent to the dead-letter channel.
    DeadLettered,
    /// The write failed and the event was sent to the retry channel.
    Retried,
    /// The event is behind the last claimed position and was ignored.
    Skipped,
    /// The event lies past the end of the partition; no more work remains.
    Finished,
}

/// Per-partition counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplierStats {
    pub applied: u64,
    pub dropped: u64,
    pub dead_lettered: u64,
    pub retried: u64,
    pub skipped: u64,
}

/// Applies the change events of one partition.
pub struct PartitionApplier<C: Clock = SystemClock> {
    token: String,
    tracker: RangeTracker,
    catalog: CatalogHandle,
    translator: WriteTranslator,
    sink: Arc<dyn WriteSink>,
    router: FailureRouter<C>,
    stats: ApplierStats,
}

impl<C: Clock> PartitionApplier<C> {
    pub fn new(
        token: impl Into<String>,
        tracker: RangeTracker,
        catalog: CatalogHandle,
        translator: WriteTranslator,
        sink: Arc<dyn WriteSink>,
        router: FailureRouter<C>,
    ) -> Self {
        Self {
            token: token.into(),
            tracker,
            catalog,
            translator,
            sink,
            router,
            stats: ApplierStats::default(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn stats(&self) -> ApplierStats {
        self.stats
    }

    pub fn tracker(&self) -> &RangeTracker {
        &self.tracker
    }

    pub fn progress_handle(&self) -> ProgressHandle {
        self.tracker.progress_handle()
    }

    /// Hand the unclaimed remainder to another applier. Returns the residual
    /// range, or `None` when nothing can be split off.
    pub fn split(&mut self, fraction: f64) -> Option<TimestampRange> {
        let (primary, residual) = self.tracker.try_split(fraction)?;
        info!(
            "Partition {} split: keeping {}, handing off {}",
            self.token, primary, residual
        );
        Some(residual)
    }

    /// Process one payload.
    ///
    /// Fails only on a tracker invariant violation (an event earlier than the
    /// partition's start), which means the event was routed to the wrong
    /// partition.
    pub async fn apply(&mut self, payload: &str) -> Result<ApplyOutcome> {
        let event = match ChangeEvent::from_json(payload) {
            Ok(event) => event,
            Err(err) => return Ok(self.route_failure(payload, &err)),
        };

        match self.tracker.claim(event.commit_timestamp)? {
            Claim::Claimed | Claim::Duplicate => {}
            Claim::Stale => {
                debug!(
                    "Partition {}: skipping {} at {}, already past it",
                    self.token, event.table_name, event.commit_timestamp
                );
                self.stats.skipped += 1;
                return Ok(ApplyOutcome::Skipped);
            }
            Claim::OutOfRange | Claim::Done => return Ok(ApplyOutcome::Finished),
        }

        // Hold one snapshot for the whole event, even if the catalog is
        // replaced meanwhile.
        let catalog = self.catalog.snapshot();
        let statement = match self.translator.translate(&catalog, &event).await {
            Ok(statement) => statement,
            Err(err) => return Ok(self.route_failure(payload, &err)),
        };

        match self.sink.execute(&statement).await {
            Ok(()) => {
                self.router.record_success();
                self.stats.applied += 1;
                Ok(ApplyOutcome::Applied(statement))
            }
            Err(err) => {
                self.router
                    .route_sink_failure(payload, &statement.table, &err);
                self.stats.retried += 1;
                Ok(ApplyOutcome::Retried)
            }
        }
    }

    /// Apply payloads until the channel closes or the partition is finished.
    /// A finished partition is marked done.
    pub async fn run(&mut self, mut events: mpsc::Receiver<String>) -> Result<ApplierStats> {
        while let Some(payload) = events.recv().await {
            if self.apply(&payload).await? == ApplyOutcome::Finished {
                self.tracker.mark_done();
                info!("Partition {} reached the end of its range", self.token);
                break;
            }
        }
        Ok(self.stats)
    }

    /// Mark the partition as finished.
    pub fn finish(&mut self) {
        self.tracker.mark_done();
    }

    /// Current progress as a checkpoint entry.
    pub fn checkpoint(&self) -> PartitionCheckpoint {
        PartitionCheckpoint {
            range: self.tracker.range(),
            last_claimed: self.tracker.last_claimed(),
            status: if self.tracker.is_done() {
                PartitionStatus::Done
            } else {
                PartitionStatus::Active
            },
            applied: self.stats.applied,
            dropped: self.stats.dropped,
            dead_lettered: self.stats.dead_lettered,
            retried: self.stats.retried,
        }
    }

    fn route_failure(&mut self, payload: &str, err: &crate::error::TranslateError) -> ApplyOutcome {
        match self.router.route(payload, err) {
            RouteDecision::Drop => {
                self.stats.dropped += 1;
                ApplyOutcome::Dropped
            }
            RouteDecision::DeadLetter => {
                self.stats.dead_lettered += 1;
                ApplyOutcome::DeadLettered
            }
            RouteDecision::Retry => {
                self.stats.retried += 1;
                ApplyOutcome::Retried
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SchemaCatalog;
    use crate::coerce::ValueCoercer;
    use crate::core::Timestamp;
    use crate::failsafe::{failsafe_channels, FailsafeReceivers};
    use crate::restriction::ClaimPolicy;
    use crate::sink::MemorySink;
    use serde_json::json;

    const CATALOG: &str = r#"
tables:
  t1:
    source:
      name: human1
      primary_keys: [c1]
      columns:
        c1: { name: id, type: int }
        c2: { name: name1, type: varchar }
    target:
      name: person1
      columns:
        c1: { name: id, type: INT64 }
        c2: { name: name, type: STRING }
"#;

    fn ts(s: &str) -> Timestamp {
        s.parse().unwrap()
    }

    fn applier(sink: Arc<MemorySink>) -> (PartitionApplier, FailsafeReceivers) {
        let range = TimestampRange::new(ts("2024-01-01T00:00:00Z"), ts("2024-01-02T00:00:00Z")).unwrap();
        let (senders, receivers) = failsafe_channels();
        let applier = PartitionApplier::new(
            "p1",
            RangeTracker::new(range, ClaimPolicy::Monotonic),
            CatalogHandle::new(SchemaCatalog::from_yaml(CATALOG).unwrap()),
            WriteTranslator::new(ValueCoercer::default()),
            sink,
            FailureRouter::new(senders),
        );
        (applier, receivers)
    }

    fn insert(table: &str, id: &str, at: &str) -> String {
        json!({
            "tableName": table,
            "modType": "INSERT",
            "keysJson": {"id": id},
            "newValuesJson": {"name": "N"},
            "commitTimestamp": at
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_apply_in_order() {
        let sink = Arc::new(MemorySink::new());
        let (mut applier, _rx) = applier(sink.clone());

        let first = applier
            .apply(&insert("person1", "1", "2024-01-01T01:00:00Z"))
            .await
            .unwrap();
        assert!(matches!(first, ApplyOutcome::Applied(_)));
        applier
            .apply(&insert("person1", "2", "2024-01-01T02:00:00Z"))
            .await
            .unwrap();

        assert_eq!(sink.statements().await.len(), 2);
        assert_eq!(applier.stats().applied, 2);
        assert_eq!(
            applier.checkpoint().last_claimed,
            Some(ts("2024-01-01T02:00:00Z"))
        );
    }

    #[tokio::test]
    async fn test_stale_event_is_skipped() {
        let sink = Arc::new(MemorySink::new());
        let (mut applier, _rx) = applier(sink.clone());

        applier
            .apply(&insert("person1", "1", "2024-01-01T05:00:00Z"))
            .await
            .unwrap();
        let outcome = applier
            .apply(&insert("person1", "1", "2024-01-01T04:00:00Z"))
            .await
            .unwrap();

        assert_eq!(outcome, ApplyOutcome::Skipped);
        assert_eq!(sink.statements().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_table_is_dropped_without_dead_letter() {
        let sink = Arc::new(MemorySink::new());
        let (mut applier, mut rx) = applier(sink.clone());

        let outcome = applier
            .apply(&insert("Unknown", "1", "2024-01-01T01:00:00Z"))
            .await
            .unwrap();

        assert_eq!(outcome, ApplyOutcome::Dropped);
        assert!(rx.dead_letter.try_recv().is_err());
        assert_eq!(applier.stats().dropped, 1);
        // The position is still consumed.
        assert_eq!(
            applier.checkpoint().last_claimed,
            Some(ts("2024-01-01T01:00:00Z"))
        );
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dead_lettered() {
        let sink = Arc::new(MemorySink::new());
        let (mut applier, mut rx) = applier(sink);

        let outcome = applier.apply("{\"tableName\": 5}").await.unwrap();
        assert_eq!(outcome, ApplyOutcome::DeadLettered);
        let element = rx.dead_letter.try_recv().unwrap();
        assert_eq!(element.original_payload, "{\"tableName\": 5}");
    }

    #[tokio::test]
    async fn test_sink_failure_goes_to_retry() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_next(1);
        let (mut applier, mut rx) = applier(sink);

        let outcome = applier
            .apply(&insert("person1", "1", "2024-01-01T01:00:00Z"))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Retried);
        assert!(rx.retry.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_event_before_start_is_fatal() {
        let sink = Arc::new(MemorySink::new());
        let (mut applier, _rx) = applier(sink);
        let result = applier
            .apply(&insert("person1", "1", "2023-12-31T00:00:00Z"))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_stops_at_end_of_range() {
        let sink = Arc::new(MemorySink::new());
        let (mut applier, _rx) = applier(sink.clone());
        let (tx, rx) = mpsc::channel(8);

        tx.send(insert("person1", "1", "2024-01-01T01:00:00Z")).await.unwrap();
        tx.send(insert("person1", "2", "2024-01-03T00:00:00Z")).await.unwrap();
        tx.send(insert("person1", "3", "2024-01-01T03:00:00Z")).await.unwrap();
        drop(tx);

        let stats = applier.run(rx).await.unwrap();
        assert_eq!(stats.applied, 1);
        assert!(applier.tracker().is_done());
        assert_eq!(applier.checkpoint().status, PartitionStatus::Done);
    }

    #[tokio::test]
    async fn test_split_hands_off_remainder() {
        let sink = Arc::new(MemorySink::new());
        let (mut applier, _rx) = applier(sink);
        applier
            .apply(&insert("person1", "1", "2024-01-01T12:00:00Z"))
            .await
            .unwrap();

        let residual = applier.split(0.0).unwrap();
        assert_eq!(residual.end(), ts("2024-01-02T00:00:00Z"));
        assert!(residual.start() > ts("2024-01-01T12:00:00Z"));

        let outcome = applier
            .apply(&insert("person1", "2", "2024-01-01T18:00:00Z"))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_point_read_is_dead_lettered() {
        let store = Arc::new(crate::sink::InMemoryRowStore::new());
        store.fail_next(100);
        let range = TimestampRange::new(ts("2024-01-01T00:00:00Z"), ts("2024-01-02T00:00:00Z")).unwrap();
        let (senders, mut rx) = failsafe_channels();
        let sink = Arc::new(MemorySink::new());
        let mut applier = PartitionApplier::new(
            "p1",
            RangeTracker::new(range, ClaimPolicy::Monotonic),
            CatalogHandle::new(SchemaCatalog::from_yaml(CATALOG).unwrap()),
            WriteTranslator::new(ValueCoercer::default()).with_point_reader(store.clone()),
            sink.clone(),
            FailureRouter::new(senders),
        );

        let update = json!({
            "tableName": "person1",
            "modType": "UPDATE",
            "keysJson": {"id": "1"},
            "newValuesJson": {"name": "M"},
            "commitTimestamp": "2024-01-01T01:00:00Z",
            "valueCaptureType": "OLD_AND_NEW_VALUES"
        })
        .to_string();
        let outcome = applier.apply(&update).await.unwrap();

        assert_eq!(outcome, ApplyOutcome::DeadLettered);
        assert_eq!(store.reads(), 4);
        assert!(sink.statements().await.is_empty());

        let element = rx.dead_letter.try_recv().unwrap();
        assert_eq!(element.original_payload, update);
        assert_eq!(element.table.as_deref(), Some("person1"));
        assert!(rx.dead_letter.try_recv().is_err());
        assert!(rx.retry.try_recv().is_err());
        assert_eq!(applier.stats().dead_lettered, 1);
    }
}
