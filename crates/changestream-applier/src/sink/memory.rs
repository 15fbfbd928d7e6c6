//! In-memory sink and row store.
//!
//! `MemorySink` records every executed statement and `InMemoryRowStore` keeps
//! versioned rows for point reads. Both support failure injection, which the
//! CLI's offline mode and the tests use to exercise retry and dead-letter
//! paths without a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::{PointReadRequest, PointReader, Row, SinkError, WriteSink};
use crate::core::Timestamp;
use crate::dml::WriteStatement;
use crate::error::{ReplicateError, Result};

/// Records executed statements in order.
#[derive(Debug, Default)]
pub struct MemorySink {
    statements: Mutex<Vec<WriteStatement>>,
    failures_left: AtomicU32,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` executions fail with `SinkError::Unavailable`.
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Statements executed so far.
    pub async fn statements(&self) -> Vec<WriteStatement> {
        self.statements.lock().await.clone()
    }
}

#[async_trait]
impl WriteSink for MemorySink {
    async fn execute(&self, statement: &WriteStatement) -> std::result::Result<(), SinkError> {
        if take_failure(&self.failures_left) {
            return Err(SinkError::Unavailable("injected write failure".to_string()));
        }
        self.statements.lock().await.push(statement.clone());
        Ok(())
    }
}

/// One stored row version.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowVersion {
    pub table: String,
    pub key: Map<String, Value>,
    pub commit_timestamp: Timestamp,
    pub values: Map<String, Value>,
}

/// Versioned rows keyed by table and primary key.
#[derive(Debug, Default)]
pub struct InMemoryRowStore {
    rows: Mutex<HashMap<(String, String), Vec<(Timestamp, Row)>>>,
    failures_left: AtomicU32,
    reads: AtomicUsize,
}

impl InMemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load row versions from a JSON array of
    /// `{table, key, commitTimestamp, values}` objects.
    pub async fn from_json(json: &str) -> Result<Self> {
        let versions: Vec<RowVersion> = serde_json::from_str(json)?;
        let store = Self::new();
        for version in versions {
            store.insert(version).await;
        }
        Ok(store)
    }

    /// Load row versions from a JSON file.
    pub async fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content).await.map_err(|e| match e {
            ReplicateError::Json(e) => {
                ReplicateError::Config(format!("invalid rows file {}: {}", path.display(), e))
            }
            other => other,
        })
    }

    /// Store a row version. Versions are kept ordered by commit timestamp.
    pub async fn insert(&self, version: RowVersion) {
        let key = (version.table, key_string(&version.key));
        let mut rows = self.rows.lock().await;
        let versions = rows.entry(key).or_default();
        let pos = versions.partition_point(|(ts, _)| *ts <= version.commit_timestamp);
        versions.insert(pos, (version.commit_timestamp, version.values));
    }

    /// Make the next `count` reads fail with `SinkError::Unavailable`.
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Number of read attempts served, including injected failures.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PointReader for InMemoryRowStore {
    async fn read_row(&self, request: &PointReadRequest) -> std::result::Result<Row, SinkError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failures_left) {
            return Err(SinkError::Unavailable("injected read failure".to_string()));
        }

        let rows = self.rows.lock().await;
        let not_found = || SinkError::RowNotFound {
            table: request.table.clone(),
            timestamp: request.read_timestamp.to_string(),
        };
        let versions = rows
            .get(&(request.table.clone(), key_string(&request.key)))
            .ok_or_else(not_found)?;
        let (_, row) = versions
            .iter()
            .rev()
            .find(|(ts, _)| *ts <= request.read_timestamp)
            .ok_or_else(not_found)?;

        Ok(request
            .columns
            .iter()
            .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
            .collect())
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Key maps are sorted by column name, so the JSON text is canonical.
fn key_string(key: &Map<String, Value>) -> String {
    Value::Object(key.clone()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dml::{StatementKind, WriteStatement};
    use serde_json::json;

    fn ts(s: &str) -> Timestamp {
        s.parse().unwrap()
    }

    fn request(at: &str) -> PointReadRequest {
        PointReadRequest {
            table: "Singers".into(),
            key: json!({"SingerId": "1"}).as_object().unwrap().clone(),
            columns: vec!["FirstName".into(), "LastName".into()],
            read_timestamp: ts(at),
        }
    }

    async fn store() -> InMemoryRowStore {
        InMemoryRowStore::from_json(
            &json!([
                {
                    "table": "Singers",
                    "key": {"SingerId": "1"},
                    "commitTimestamp": "2024-01-01T00:00:00Z",
                    "values": {"FirstName": "Ann", "LastName": "Lee", "Extra": 1}
                },
                {
                    "table": "Singers",
                    "key": {"SingerId": "1"},
                    "commitTimestamp": "2024-01-02T00:00:00Z",
                    "values": {"FirstName": "Anne", "LastName": "Lee"}
                }
            ])
            .to_string(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_read_sees_version_at_timestamp() {
        let store = store().await;

        let row = store.read_row(&request("2024-01-01T12:00:00Z")).await.unwrap();
        assert_eq!(row["FirstName"], json!("Ann"));
        assert!(!row.contains_key("Extra"));

        let row = store.read_row(&request("2024-01-02T00:00:00Z")).await.unwrap();
        assert_eq!(row["FirstName"], json!("Anne"));
    }

    #[tokio::test]
    async fn test_read_before_first_version() {
        let store = store().await;
        let err = store.read_row(&request("2023-12-31T00:00:00Z")).await.unwrap_err();
        assert!(matches!(err, SinkError::RowNotFound { .. }));
    }

    #[tokio::test]
    async fn test_injected_read_failures() {
        let store = store().await;
        store.fail_next(2);
        assert!(store.read_row(&request("2024-01-03T00:00:00Z")).await.is_err());
        assert!(store.read_row(&request("2024-01-03T00:00:00Z")).await.is_err());
        assert!(store.read_row(&request("2024-01-03T00:00:00Z")).await.is_ok());
        assert_eq!(store.reads(), 3);
    }

    #[tokio::test]
    async fn test_memory_sink_records_and_fails() {
        let sink = MemorySink::new();
        let stmt = WriteStatement {
            kind: StatementKind::Delete,
            table: "t".into(),
            columns: vec![("id".into(), "1".into())],
            sql: "DELETE FROM `t` WHERE `id` = 1".into(),
        };

        sink.fail_next(1);
        assert!(sink.execute(&stmt).await.is_err());
        sink.execute(&stmt).await.unwrap();
        assert_eq!(sink.statements().await, vec![stmt]);
    }
}
