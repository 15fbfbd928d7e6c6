//! Type vocabulary on both sides of the replication.
//!
//! The change stream side uses a small closed set of types ([`TargetType`]).
//! The MySQL side uses free-form lowercase type names, which are classified
//! into [`SourceTypeClass`] to decide how a literal is rendered.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unrecognized change stream type name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown change stream column type {0:?}")]
pub struct UnknownTypeError(pub String);

/// Column type in the change stream schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TargetType {
    String,
    Int64,
    Float64,
    Float32,
    Bool,
    Bytes,
    Json,
    Timestamp,
    Date,
    Numeric,
    Array,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::String => "STRING",
            TargetType::Int64 => "INT64",
            TargetType::Float64 => "FLOAT64",
            TargetType::Float32 => "FLOAT32",
            TargetType::Bool => "BOOL",
            TargetType::Bytes => "BYTES",
            TargetType::Json => "JSON",
            TargetType::Timestamp => "TIMESTAMP",
            TargetType::Date => "DATE",
            TargetType::Numeric => "NUMERIC",
            TargetType::Array => "ARRAY",
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, TargetType::Float64 | TargetType::Float32)
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetType {
    type Err = UnknownTypeError;

    /// Accepts bare names and sized names such as `STRING(MAX)`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let base = s.split('(').next().unwrap_or_default().trim();
        match base.to_ascii_uppercase().as_str() {
            "STRING" => Ok(TargetType::String),
            "INT64" => Ok(TargetType::Int64),
            "FLOAT64" => Ok(TargetType::Float64),
            "FLOAT32" => Ok(TargetType::Float32),
            "BOOL" => Ok(TargetType::Bool),
            "BYTES" => Ok(TargetType::Bytes),
            "JSON" => Ok(TargetType::Json),
            "TIMESTAMP" => Ok(TargetType::Timestamp),
            "DATE" => Ok(TargetType::Date),
            "NUMERIC" => Ok(TargetType::Numeric),
            "ARRAY" => Ok(TargetType::Array),
            _ => Err(UnknownTypeError(s.to_string())),
        }
    }
}

impl TryFrom<String> for TargetType {
    type Error = UnknownTypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TargetType> for String {
    fn from(t: TargetType) -> Self {
        t.as_str().to_string()
    }
}

/// How a MySQL column type renders a literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTypeClass {
    /// Rendered as a quoted string literal.
    Textual,
    /// Stored in the source's local time zone; converted from UTC on write.
    ZonedTemporal,
    /// Wrapped in `BINARY(...)`.
    Binary,
    /// Bit fields, written as hex literals.
    Bit,
    /// Numeric and other types written as bare text.
    Passthrough,
}

impl SourceTypeClass {
    /// Classify a MySQL type name such as `varchar` or `datetime`.
    pub fn classify(source_type: &str) -> Self {
        match base_type(source_type).as_str() {
            "varchar" | "char" | "text" | "tinytext" | "mediumtext" | "longtext" | "enum"
            | "date" | "time" | "year" | "set" | "json" | "geometry" | "geometrycollection"
            | "point" | "multipoint" | "linestring" | "multilinestring" | "polygon"
            | "multipolygon" | "tinyblob" | "mediumblob" | "blob" | "longblob" => {
                SourceTypeClass::Textual
            }
            "timestamp" | "datetime" => SourceTypeClass::ZonedTemporal,
            "binary" | "varbinary" => SourceTypeClass::Binary,
            "bit" => SourceTypeClass::Bit,
            _ => SourceTypeClass::Passthrough,
        }
    }
}

/// Lowercased type name without size or modifiers (`varchar(20)` → `varchar`).
pub fn base_type(source_type: &str) -> String {
    source_type
        .split(|c: char| c == '(' || c.is_whitespace())
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Map a MySQL type to the change stream type it is replicated as.
pub fn source_to_target(source_type: &str) -> TargetType {
    match base_type(source_type).as_str() {
        // Boolean
        "bool" | "boolean" => TargetType::Bool,

        // Integer types
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" => TargetType::Int64,

        // Floating point
        "float" => TargetType::Float32,
        "double" | "real" => TargetType::Float64,

        // Decimal/numeric
        "decimal" | "numeric" => TargetType::Numeric,

        // Binary types
        "bit" | "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" => {
            TargetType::Bytes
        }

        // Date/time types
        "date" => TargetType::Date,
        "datetime" | "timestamp" => TargetType::Timestamp,

        "json" => TargetType::Json,

        // Strings, enums, sets, time, year and spatial types
        _ => TargetType::String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_types() {
        assert_eq!(source_to_target("int"), TargetType::Int64);
        assert_eq!(source_to_target("bigint"), TargetType::Int64);
        assert_eq!(source_to_target("TINYINT(4)"), TargetType::Int64);
    }

    #[test]
    fn test_temporal_types() {
        assert_eq!(source_to_target("datetime"), TargetType::Timestamp);
        assert_eq!(source_to_target("timestamp"), TargetType::Timestamp);
        assert_eq!(source_to_target("date"), TargetType::Date);
        assert_eq!(source_to_target("time"), TargetType::String);
    }

    #[test]
    fn test_binary_types() {
        assert_eq!(source_to_target("bit(8)"), TargetType::Bytes);
        assert_eq!(source_to_target("varbinary"), TargetType::Bytes);
        assert_eq!(source_to_target("longblob"), TargetType::Bytes);
    }

    #[test]
    fn test_fallback_is_string() {
        assert_eq!(source_to_target("varchar(255)"), TargetType::String);
        assert_eq!(source_to_target("polygon"), TargetType::String);
        assert_eq!(source_to_target("something_new"), TargetType::String);
    }

    #[test]
    fn test_classify_source_types() {
        assert_eq!(SourceTypeClass::classify("varchar"), SourceTypeClass::Textual);
        assert_eq!(SourceTypeClass::classify("longblob"), SourceTypeClass::Textual);
        assert_eq!(SourceTypeClass::classify("date"), SourceTypeClass::Textual);
        assert_eq!(
            SourceTypeClass::classify("DATETIME(6)"),
            SourceTypeClass::ZonedTemporal
        );
        assert_eq!(SourceTypeClass::classify("varbinary"), SourceTypeClass::Binary);
        assert_eq!(SourceTypeClass::classify("bit"), SourceTypeClass::Bit);
        assert_eq!(SourceTypeClass::classify("int"), SourceTypeClass::Passthrough);
        assert_eq!(
            SourceTypeClass::classify("decimal(10,2)"),
            SourceTypeClass::Passthrough
        );
    }

    #[test]
    fn test_target_type_parse() {
        assert_eq!("INT64".parse::<TargetType>().unwrap(), TargetType::Int64);
        assert_eq!("string(max)".parse::<TargetType>().unwrap(), TargetType::String);
        assert!("INTERVAL".parse::<TargetType>().is_err());
    }

    #[test]
    fn test_target_type_serde() {
        let t: TargetType = serde_json::from_str("\"FLOAT32\"").unwrap();
        assert_eq!(t, TargetType::Float32);
        assert_eq!(serde_json::to_string(&TargetType::Bytes).unwrap(), "\"BYTES\"");
        assert!(serde_json::from_str::<TargetType>("\"VARCHAR\"").is_err());
    }
}
