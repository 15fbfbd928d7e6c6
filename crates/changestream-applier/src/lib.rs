//! # changestream-applier
//!
//! Change stream progress tracking and DML translation for reverse
//! replication into MySQL.
//!
//! This library provides:
//!
//! - **Range tracking** over commit timestamps, with claim, split and
//!   checkpoint support for parallel consumption
//! - **Schema mapping** from change stream tables and columns to MySQL tables
//! - **Value coercion** into MySQL literal expressions
//! - **DML translation** of change events into upserts and deletes, with full
//!   row point reads for partial updates
//! - **Failure routing** to dead-letter and retry channels with throttled logs
//! - **Resume capability** via signed JSON checkpoint files
//!
//! ## Example
//!
//! ```rust,no_run
//! use changestream_applier::{ChangeEvent, Config, SchemaCatalog, WriteTranslator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("applier.yaml")?;
//!     let catalog = SchemaCatalog::load(&config.catalog.path)?;
//!     let translator = WriteTranslator::new(config.coercer());
//!
//!     let event = ChangeEvent::from_json(r#"{
//!         "tableName": "person1", "modType": "INSERT",
//!         "keysJson": "{\"id\":1}", "newValuesJson": "{\"name\":\"John\"}",
//!         "commitTimestamp": "2024-01-01T00:00:00Z"
//!     }"#)?;
//!     let statement = translator.translate(&catalog, &event).await?;
//!     println!("{}", statement);
//!     Ok(())
//! }
//! ```

pub mod applier;
pub mod catalog;
pub mod coerce;
pub mod config;
pub mod core;
pub mod dml;
pub mod error;
pub mod failsafe;
pub mod model;
pub mod restriction;
pub mod sink;
pub mod state;
pub mod typemap;

// Re-exports for convenient access
pub use applier::{ApplierStats, ApplyOutcome, PartitionApplier};
pub use catalog::{CatalogHandle, ColumnId, SchemaCatalog, TableMapping};
pub use coerce::ValueCoercer;
pub use config::Config;
pub use crate::core::Timestamp;
pub use dml::{RetryPolicy, StatementKind, WriteStatement, WriteTranslator};
pub use error::{ReplicateError, Result, TranslateError};
pub use failsafe::{failsafe_channels, FailsafeElement, FailureRouter, RouteDecision};
pub use model::{ChangeEvent, ModType, ValueCaptureType};
pub use restriction::{ClaimPolicy, RangeTracker, TimestampRange};
pub use sink::{PointReader, WriteSink};
pub use state::CheckpointState;
