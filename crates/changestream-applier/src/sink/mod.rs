//! Collaborators that execute statements and serve point reads.
//!
//! - [`WriteSink`]: executes generated statements against the MySQL source
//! - [`PointReader`]: reads a row of the change stream database as of a
//!   commit timestamp (bounded staleness), used to rebuild full rows for
//!   updates that only captured modified columns
//!
//! [`memory`] holds in-memory implementations of both.

pub mod memory;

pub use memory::{InMemoryRowStore, MemorySink};

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::Timestamp;
use crate::dml::WriteStatement;

/// A row returned by a point read: column name to JSON value.
pub type Row = Map<String, Value>;

/// Failures reported by sink collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Transient failure (connection lost, deadline exceeded upstream, ...).
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    /// No row exists for the key at the requested timestamp.
    #[error("row not found in {table} at {timestamp}")]
    RowNotFound { table: String, timestamp: String },

    /// A single attempt ran past its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The statement was refused by the database.
    #[error("statement rejected: {0}")]
    Rejected(String),
}

impl SinkError {
    /// Whether another attempt could succeed. A missing row or a refused
    /// statement fails the same way every time.
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Unavailable(_) | SinkError::Timeout(_))
    }
}

/// A bounded-staleness read of one row.
#[derive(Debug, Clone, PartialEq)]
pub struct PointReadRequest {
    /// Change stream table name.
    pub table: String,
    /// Primary key values by change stream column name.
    pub key: Map<String, Value>,
    /// Change stream column names to read.
    pub columns: Vec<String>,
    /// The read observes the row as committed at this timestamp.
    pub read_timestamp: Timestamp,
}

/// Executes write statements.
#[async_trait]
pub trait WriteSink: Send + Sync {
    async fn execute(&self, statement: &WriteStatement) -> Result<(), SinkError>;
}

/// Reads a row as of a commit timestamp.
#[async_trait]
pub trait PointReader: Send + Sync {
    /// Return the requested columns of the row identified by `request.key`.
    ///
    /// Columns that are absent from the returned row are treated as not
    /// captured and left out of the generated statement.
    async fn read_row(&self, request: &PointReadRequest) -> Result<Row, SinkError>;
}
