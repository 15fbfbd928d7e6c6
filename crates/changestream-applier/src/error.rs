//! Error types for the change stream applier.
//!
//! Two families live here:
//!
//! - [`ReplicateError`] covers process-level failures (configuration, catalog
//!   loading, checkpoint files, tracker invariant violations). These abort the
//!   command that hit them.
//! - [`TranslateError`] covers a single change event. It never escapes a
//!   partition's processing loop; the failure router turns it into a drop or a
//!   dead-letter emission.

use std::fmt;

use thiserror::Error;

use crate::coerce::CoercionError;
use crate::restriction::TrackerError;
use crate::sink::SinkError;

/// Exit codes reported by the CLI.
pub const EXIT_CONFIG_ERROR: u8 = 1;
pub const EXIT_CATALOG_ERROR: u8 = 2;
pub const EXIT_STATE_ERROR: u8 = 3;
pub const EXIT_IO_ERROR: u8 = 7;
pub const EXIT_OTHER_ERROR: u8 = 10;

/// Main error type for applier operations.
#[derive(Error, Debug)]
pub enum ReplicateError {
    /// Configuration error (invalid YAML, missing fields, bad offsets, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Schema catalog could not be loaded or failed validation
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Checkpoint state file error
    #[error("State file error: {0}")]
    State(String),

    /// Config hash mismatch on resume
    #[error("Config has changed since the checkpoint was written - cannot resume. Use a new state file to start fresh.")]
    ConfigChanged,

    /// Range tracker invariant violation
    #[error("Range tracker error: {0}")]
    Tracker(#[from] TrackerError),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Processing was cancelled (SIGINT, etc.)
    #[error("Processing cancelled")]
    Cancelled,
}

impl ReplicateError {
    /// Create a Catalog error.
    pub fn catalog(message: impl Into<String>) -> Self {
        ReplicateError::Catalog(message.into())
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);
        output.push_str(&format_chain(self));
        output
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            ReplicateError::Config(_) | ReplicateError::Yaml(_) => EXIT_CONFIG_ERROR,
            ReplicateError::Catalog(_) => EXIT_CATALOG_ERROR,
            ReplicateError::State(_) | ReplicateError::ConfigChanged => EXIT_STATE_ERROR,
            ReplicateError::Io(_) => EXIT_IO_ERROR,
            _ => EXIT_OTHER_ERROR,
        }
    }
}

/// Result type alias for applier operations.
pub type Result<T> = std::result::Result<T, ReplicateError>;

/// Why a change event's primary key could not be assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimaryKeyGap {
    /// The source table declares no primary key at all.
    NotDeclared,
    /// A primary key column has no counterpart in the change stream schema.
    UnmappedColumn { column: String },
    /// A primary key column is absent from both the keys and the new values.
    ValueAbsent { column: String },
}

impl fmt::Display for PrimaryKeyGap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryKeyGap::NotDeclared => write!(f, "source table declares no primary key"),
            PrimaryKeyGap::UnmappedColumn { column } => write!(
                f,
                "primary key column {} has no mapping in the change stream schema",
                column
            ),
            PrimaryKeyGap::ValueAbsent { column } => {
                write!(f, "primary key column {} not found in the change event", column)
            }
        }
    }
}

/// Per-event translation failure.
#[derive(Error, Debug)]
pub enum TranslateError {
    /// The event's table is not part of the replicated schema.
    #[error("Table {table} has no schema mapping")]
    MissingSchemaMapping { table: String },

    /// The primary key could not be resolved.
    #[error("Cannot replicate table {table}: {gap}")]
    MissingPrimaryKey { table: String, gap: PrimaryKeyGap },

    /// A column value could not be converted to the source representation.
    #[error("Invalid value in table {table}: {source}")]
    InvalidTypeConversion {
        table: String,
        #[source]
        source: CoercionError,
    },

    /// The bounded-staleness read used to rebuild the full row kept failing.
    #[error("Point read of {table} at {timestamp} failed after {attempts} attempts")]
    StaleReadExhausted {
        table: String,
        timestamp: String,
        attempts: u32,
        #[source]
        source: SinkError,
    },

    /// The change event carries a mod type this applier does not handle.
    #[error("Unsupported mod type: {0}")]
    UnsupportedModType(String),

    /// The payload is not a change event.
    #[error("Malformed change event: {0}")]
    MalformedEvent(String),

    /// A mapped table or column name cannot be used as an identifier.
    #[error("Invalid identifier in table {table}: {message}")]
    InvalidIdentifier { table: String, message: String },
}

impl TranslateError {
    /// Whether this failure reflects a table that was never meant to be
    /// replicated. Such events are dropped instead of dead-lettered.
    pub fn is_scope_exclusion(&self) -> bool {
        matches!(
            self,
            TranslateError::MissingSchemaMapping { .. }
                | TranslateError::MissingPrimaryKey {
                    gap: PrimaryKeyGap::NotDeclared,
                    ..
                }
        )
    }

    /// Table the failing event belongs to, when known.
    pub fn table(&self) -> Option<&str> {
        match self {
            TranslateError::MissingSchemaMapping { table }
            | TranslateError::MissingPrimaryKey { table, .. }
            | TranslateError::InvalidTypeConversion { table, .. }
            | TranslateError::StaleReadExhausted { table, .. }
            | TranslateError::InvalidIdentifier { table, .. } => Some(table),
            TranslateError::UnsupportedModType(_) | TranslateError::MalformedEvent(_) => None,
        }
    }

    /// Render the message followed by every cause in the chain.
    pub fn format_detailed(&self) -> String {
        let mut output = self.to_string();
        output.push_str(&format_chain(self));
        output
    }
}

fn format_chain(err: &dyn std::error::Error) -> String {
    let mut output = String::new();
    let mut source = err.source();
    let mut depth = 1;
    while let Some(cause) = source {
        output.push_str(&format!("\nCaused by:\n  {}: {}", depth, cause));
        source = cause.source();
        depth += 1;
    }
    output
}
