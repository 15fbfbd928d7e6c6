//! Shared building blocks.
//!
//! - [`timestamp`]: nanosecond commit timestamps
//! - [`identifier`]: MySQL identifier validation and quoting

pub mod identifier;
pub mod timestamp;

pub use identifier::{quote_mysql, validate_identifier, IdentifierError};
pub use timestamp::{Timestamp, TimestampError};
