//! Conversion of change stream values into MySQL literals.
//!
//! [`ValueCoercer::coerce`] renders one JSON value as a SQL expression in two
//! steps. The change stream type decides how the JSON value becomes text
//! (floats as plain decimals, booleans, joined string arrays, byte
//! expressions). The MySQL column type then decides how that text is wrapped
//! (quoted and escaped, converted from UTC, wrapped in `BINARY(...)`, or left
//! bare).
//!
//! [`decode_literal`] inverts the mapping for scalar columns. It is lossy by
//! construction: array columns cannot be recovered and NUL characters removed
//! while escaping are gone.

use std::str::FromStr;

use base64::{engine::general_purpose, Engine as _};
use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;

use crate::catalog::{SourceColumnDef, TargetColumnDef};
use crate::typemap::{SourceTypeClass, TargetType};

/// Offset used when no source time zone is configured.
pub const UTC_OFFSET: &str = "+00:00";

/// A value that cannot be rendered for its column.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot convert value {value} of column {column}: {reason}")]
pub struct CoercionError {
    pub column: String,
    pub value: String,
    pub reason: String,
}

impl CoercionError {
    fn new(column: &str, value: impl ToString, reason: impl Into<String>) -> Self {
        Self {
            column: column.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Whether `offset` has the `±HH:MM` shape MySQL's `CONVERT_TZ` accepts.
pub fn is_valid_offset(offset: &str) -> bool {
    let bytes = offset.as_bytes();
    if bytes.len() != 6 || !matches!(bytes[0], b'+' | b'-') || bytes[3] != b':' {
        return false;
    }
    let digits = |s: &str| s.parse::<u8>().ok().filter(|_| s.bytes().all(|b| b.is_ascii_digit()));
    match (digits(&offset[1..3]), digits(&offset[4..6])) {
        (Some(h), Some(m)) => h <= 14 && m <= 59,
        _ => false,
    }
}

/// Renders change stream values as MySQL literals.
#[derive(Debug, Clone)]
pub struct ValueCoercer {
    timezone_offset: String,
}

impl Default for ValueCoercer {
    fn default() -> Self {
        Self::new(UTC_OFFSET)
    }
}

impl ValueCoercer {
    /// `timezone_offset` is the source database's offset from UTC, `±HH:MM`.
    pub fn new(timezone_offset: impl Into<String>) -> Self {
        Self {
            timezone_offset: timezone_offset.into(),
        }
    }

    pub fn timezone_offset(&self) -> &str {
        &self.timezone_offset
    }

    /// Render `value` for the column described by `source` and `target`.
    pub fn coerce(
        &self,
        source: &SourceColumnDef,
        target: &TargetColumnDef,
        value: &Value,
    ) -> Result<String, CoercionError> {
        if value.is_null() {
            return Ok("NULL".to_string());
        }
        let text = self.target_text(source, target, value)?;
        if matches!(
            source.type_class(),
            SourceTypeClass::Passthrough | SourceTypeClass::Bit
        ) {
            check_bare_literal(&target.name, target.target_type, value, &text)?;
        }
        Ok(self.wrap_for_source(source, target.target_type, text))
    }

    fn target_text(
        &self,
        source: &SourceColumnDef,
        target: &TargetColumnDef,
        value: &Value,
    ) -> Result<String, CoercionError> {
        let column = target.name.as_str();
        match target.target_type {
            t if t.is_float() => float_text(column, value),
            TargetType::Bool => match value {
                Value::Bool(b) => Ok(b.to_string()),
                Value::String(s) if s.eq_ignore_ascii_case("true") => Ok("true".to_string()),
                Value::String(s) if s.eq_ignore_ascii_case("false") => Ok("false".to_string()),
                other => Err(CoercionError::new(column, other, "expected a boolean")),
            },
            TargetType::String if target.is_array => match value {
                Value::Array(items) => Ok(items
                    .iter()
                    .map(plain_text)
                    .collect::<Vec<_>>()
                    .join(",")),
                other => Err(CoercionError::new(column, other, "expected an array")),
            },
            TargetType::Bytes => {
                let encoded = value
                    .as_str()
                    .ok_or_else(|| CoercionError::new(column, value, "expected base64 text"))?;
                let decoded = general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| CoercionError::new(column, value, format!("invalid base64: {}", e)))?;
                if source.type_class() == SourceTypeClass::Bit {
                    Ok(format!("x'{}'", hex::encode(decoded)))
                } else {
                    Ok(format!("FROM_BASE64('{}')", encoded))
                }
            }
            _ => Ok(plain_text(value)),
        }
    }

    fn wrap_for_source(&self, source: &SourceColumnDef, target_type: TargetType, text: String) -> String {
        match source.type_class() {
            SourceTypeClass::Textual => quote_for(&text, target_type),
            SourceTypeClass::ZonedTemporal => {
                let utc = text
                    .strip_suffix('Z')
                    .or_else(|| text.strip_suffix("+00:00"))
                    .unwrap_or(&text);
                format!(
                    "CONVERT_TZ({},'{}','{}')",
                    quote_for(utc, target_type),
                    UTC_OFFSET,
                    self.timezone_offset
                )
            }
            SourceTypeClass::Binary => format!("BINARY({})", quote_for(&text, target_type)),
            SourceTypeClass::Bit | SourceTypeClass::Passthrough => text,
        }
    }
}

/// Strip NUL characters, double single quotes, escape backslashes.
pub fn escape_string(input: &str) -> String {
    input.replace('\0', "").replace('\'', "''").replace('\\', "\\\\")
}

/// Quote and escape, except for byte expressions which are already SQL.
fn quote_for(text: &str, target_type: TargetType) -> String {
    if target_type == TargetType::Bytes {
        text.to_string()
    } else {
        format!("'{}'", escape_string(text))
    }
}

/// Unquoted literals must be numbers; floats, booleans and byte expressions
/// were already validated by the target step.
fn check_bare_literal(
    column: &str,
    target_type: TargetType,
    value: &Value,
    text: &str,
) -> Result<(), CoercionError> {
    let valid = match target_type {
        t if t.is_float() => true,
        TargetType::Bool | TargetType::Bytes => true,
        TargetType::Int64 => text.parse::<i64>().is_ok() || text.parse::<u64>().is_ok(),
        _ => Decimal::from_str_exact(text).is_ok() || Decimal::from_scientific(text).is_ok(),
    };
    if valid {
        Ok(())
    } else if target_type == TargetType::Int64 {
        Err(CoercionError::new(column, value, "expected an integer"))
    } else {
        Err(CoercionError::new(column, value, "expected a numeric literal"))
    }
}

/// Strings raw, everything else as JSON text.
fn plain_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn float_text(column: &str, value: &Value) -> Result<String, CoercionError> {
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.is_finite() => Ok(format!("{}", f)),
            _ => Err(CoercionError::new(column, n, "not a finite number")),
        },
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(d) = Decimal::from_str_exact(trimmed) {
                return Ok(d.to_string());
            }
            if let Ok(d) = Decimal::from_scientific(trimmed) {
                return Ok(d.normalize().to_string());
            }
            match f64::from_str(trimmed) {
                Ok(f) if f.is_finite() => Ok(format!("{}", f)),
                _ => Err(CoercionError::new(column, value, "not a finite number")),
            }
        }
        other => Err(CoercionError::new(column, other, "expected a number")),
    }
}

/// Recover the change stream JSON value from a literal produced by
/// [`ValueCoercer::coerce`].
///
/// Returns `Ok(None)` for array columns, which cannot be recovered.
pub fn decode_literal(
    source: &SourceColumnDef,
    target: &TargetColumnDef,
    literal: &str,
) -> Result<Option<Value>, CoercionError> {
    if target.is_array || target.target_type == TargetType::Array {
        return Ok(None);
    }
    let literal = literal.trim();
    if literal == "NULL" {
        return Ok(Some(Value::Null));
    }
    let column = target.name.as_str();
    let fail = |reason: &str| CoercionError::new(column, literal, reason);

    let inner = match source.type_class() {
        SourceTypeClass::ZonedTemporal => {
            let args = literal
                .strip_prefix("CONVERT_TZ(")
                .and_then(|s| s.strip_suffix(')'))
                .ok_or_else(|| fail("expected CONVERT_TZ(...)"))?;
            let (first, _) = split_quoted(args).ok_or_else(|| fail("unterminated string"))?;
            unquote_for(first, target.target_type).ok_or_else(|| fail("expected a quoted string"))?
        }
        SourceTypeClass::Binary => {
            let wrapped = literal
                .strip_prefix("BINARY(")
                .and_then(|s| s.strip_suffix(')'))
                .ok_or_else(|| fail("expected BINARY(...)"))?;
            unquote_for(wrapped, target.target_type).ok_or_else(|| fail("expected a quoted string"))?
        }
        SourceTypeClass::Textual => {
            unquote_for(literal, target.target_type).ok_or_else(|| fail("expected a quoted string"))?
        }
        SourceTypeClass::Bit | SourceTypeClass::Passthrough => literal.to_string(),
    };

    let value = match target.target_type {
        TargetType::Bytes => Value::String(decode_bytes_expression(&inner).ok_or_else(|| fail("expected a byte expression"))?),
        TargetType::Int64 | TargetType::Numeric | TargetType::Date | TargetType::String | TargetType::Json => {
            Value::String(inner)
        }
        TargetType::Float64 | TargetType::Float32 => {
            let f: f64 = inner.parse().map_err(|_| fail("expected a number"))?;
            serde_json::Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| fail("not a finite number"))?
        }
        TargetType::Bool => match inner.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => return Err(fail("expected true or false")),
        },
        TargetType::Timestamp => {
            if inner.ends_with('Z') {
                Value::String(inner)
            } else {
                Value::String(format!("{}Z", inner))
            }
        }
        TargetType::Array => return Ok(None),
    };
    Ok(Some(value))
}

fn unquote_for(text: &str, target_type: TargetType) -> Option<String> {
    if target_type == TargetType::Bytes {
        return Some(text.to_string());
    }
    let (quoted, rest) = split_quoted(text)?;
    if !rest.trim().is_empty() {
        return None;
    }
    let body = quoted.strip_prefix('\'')?.strip_suffix('\'')?;
    Some(unescape_string(body))
}

/// Split a leading `'...'` token (with `''` escapes) from the rest of `text`.
fn split_quoted(text: &str) -> Option<(&str, &str)> {
    let bytes = text.as_bytes();
    if bytes.first() != Some(&b'\'') {
        return None;
    }
    let mut i = 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\'' if bytes.get(i + 1) == Some(&b'\'') => i += 2,
            b'\'' => return Some((&text[..=i], &text[i + 1..])),
            _ => i += 1,
        }
    }
    None
}

fn unescape_string(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'\\') => {
                chars.next();
                out.push('\\');
            }
            '\'' if chars.peek() == Some(&'\'') => {
                chars.next();
                out.push('\'');
            }
            other => out.push(other),
        }
    }
    out
}

fn decode_bytes_expression(expr: &str) -> Option<String> {
    if let Some(encoded) = expr
        .strip_prefix("FROM_BASE64('")
        .and_then(|s| s.strip_suffix("')"))
    {
        return Some(encoded.to_string());
    }
    let hex_digits = expr.strip_prefix("x'")?.strip_suffix('\'')?;
    let bytes = hex::decode(hex_digits).ok()?;
    Some(general_purpose::STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn src(source_type: &str) -> SourceColumnDef {
        SourceColumnDef::new("c1", "col", source_type)
    }

    fn tgt(target_type: TargetType) -> TargetColumnDef {
        TargetColumnDef::new("c1", "col", target_type)
    }

    fn coerce(source_type: &str, target_type: TargetType, value: Value) -> String {
        ValueCoercer::default()
            .coerce(&src(source_type), &tgt(target_type), &value)
            .unwrap()
    }

    #[test]
    fn test_null_is_null() {
        assert_eq!(coerce("varchar", TargetType::String, Value::Null), "NULL");
        assert_eq!(coerce("int", TargetType::Int64, Value::Null), "NULL");
    }

    #[test]
    fn test_textual_is_quoted_and_escaped() {
        assert_eq!(coerce("varchar", TargetType::String, json!("John")), "'John'");
        assert_eq!(coerce("text", TargetType::String, json!("O'Brien")), "'O''Brien'");
        assert_eq!(coerce("char", TargetType::String, json!("a\\b")), "'a\\\\b'");
        assert_eq!(coerce("varchar", TargetType::String, json!("a\u{0}b")), "'ab'");
        assert_eq!(coerce("date", TargetType::Date, json!("2024-01-31")), "'2024-01-31'");
    }

    #[test]
    fn test_escape_order() {
        // A quote followed by a backslash: quotes are doubled before
        // backslashes are escaped.
        assert_eq!(escape_string("'\\"), "''\\\\");
        assert_eq!(escape_string("\0'\0"), "''");
    }

    #[test]
    fn test_passthrough_types() {
        assert_eq!(coerce("int", TargetType::Int64, json!("42")), "42");
        assert_eq!(coerce("decimal", TargetType::Numeric, json!("12.50")), "12.50");
        assert_eq!(coerce("tinyint", TargetType::Bool, json!(true)), "true");
        assert_eq!(coerce("bigint", TargetType::Int64, json!(-7)), "-7");
        assert_eq!(
            coerce("bigint", TargetType::Int64, json!("18446744073709551615")),
            "18446744073709551615"
        );
        assert_eq!(coerce("decimal", TargetType::Numeric, json!(3.25)), "3.25");
    }

    #[test]
    fn test_unquoted_values_must_be_numeric() {
        let coercer = ValueCoercer::default();
        let rejected = [
            ("int", TargetType::Int64, json!("1 OR 1=1")),
            ("int", TargetType::Int64, json!("1.5")),
            ("int", TargetType::Int64, json!({"a": 1})),
            ("int", TargetType::Int64, json!([1])),
            ("decimal", TargetType::Numeric, json!("12.5; DROP TABLE t")),
            ("decimal", TargetType::Numeric, json!({"n": 1})),
            ("int", TargetType::String, json!("abc")),
            ("bit", TargetType::Int64, json!("0 OR 1")),
        ];
        for (source_type, target_type, value) in rejected {
            let err = coercer
                .coerce(&src(source_type), &tgt(target_type), &value)
                .unwrap_err();
            assert_eq!(err.column, "col", "value {}", value);
        }
    }

    #[test]
    fn test_floats() {
        assert_eq!(coerce("double", TargetType::Float64, json!(1.5)), "1.5");
        assert_eq!(coerce("double", TargetType::Float64, json!(3)), "3");
        assert_eq!(coerce("double", TargetType::Float64, json!(1e20)), "100000000000000000000");
        assert_eq!(coerce("float", TargetType::Float32, json!("2.50")), "2.50");
        assert_eq!(coerce("double", TargetType::Float64, json!("1e3")), "1000");

        let err = ValueCoercer::default()
            .coerce(&src("double"), &tgt(TargetType::Float64), &json!("NaN"))
            .unwrap_err();
        assert_eq!(err.column, "col");
        assert!(err.value.contains("NaN"));
    }

    #[test]
    fn test_bool_strings() {
        assert_eq!(coerce("bool", TargetType::Bool, json!("TRUE")), "true");
        assert!(ValueCoercer::default()
            .coerce(&src("bool"), &tgt(TargetType::Bool), &json!(1))
            .is_err());
    }

    #[test]
    fn test_string_arrays_are_joined() {
        let target = tgt(TargetType::String).array();
        let rendered = ValueCoercer::default()
            .coerce(&src("set"), &target, &json!(["a", "b", 3]))
            .unwrap();
        assert_eq!(rendered, "'a,b,3'");
    }

    #[test]
    fn test_bytes() {
        // "AQI=" is [0x01, 0x02]
        assert_eq!(coerce("bit", TargetType::Bytes, json!("AQI=")), "x'0102'");
        assert_eq!(coerce("bit", TargetType::Bytes, json!("")), "x''");
        assert_eq!(
            coerce("blob", TargetType::Bytes, json!("AQI=")),
            "FROM_BASE64('AQI=')"
        );
        assert_eq!(
            coerce("varbinary", TargetType::Bytes, json!("AQI=")),
            "BINARY(FROM_BASE64('AQI='))"
        );
        assert!(ValueCoercer::default()
            .coerce(&src("blob"), &tgt(TargetType::Bytes), &json!("not base64!"))
            .is_err());
    }

    #[test]
    fn test_binary_with_string_target() {
        assert_eq!(coerce("binary", TargetType::String, json!("ab")), "BINARY('ab')");
    }

    #[test]
    fn test_temporal_conversion() {
        let coercer = ValueCoercer::new("+05:30");
        let rendered = coercer
            .coerce(
                &src("datetime"),
                &tgt(TargetType::Timestamp),
                &json!("2024-01-01T10:00:00.123456Z"),
            )
            .unwrap();
        assert_eq!(
            rendered,
            "CONVERT_TZ('2024-01-01T10:00:00.123456','+00:00','+05:30')"
        );
    }

    #[test]
    fn test_offset_validation() {
        assert!(is_valid_offset("+00:00"));
        assert!(is_valid_offset("-08:00"));
        assert!(is_valid_offset("+14:00"));
        assert!(!is_valid_offset("00:00"));
        assert!(!is_valid_offset("+5:30"));
        assert!(!is_valid_offset("+15:00"));
        assert!(!is_valid_offset("+05:60"));
        assert!(!is_valid_offset("+0a:00"));
    }

    #[test]
    fn test_decode_round_trip_scalars() {
        let coercer = ValueCoercer::new("-07:00");
        let cases = [
            ("varchar", TargetType::String, json!("it's a \\ test")),
            ("int", TargetType::Int64, json!("17")),
            ("double", TargetType::Float64, json!(2.25)),
            ("bool", TargetType::Bool, json!(false)),
            ("timestamp", TargetType::Timestamp, json!("2024-06-01T12:00:00Z")),
            ("bit", TargetType::Bytes, json!("AQI=")),
            ("longblob", TargetType::Bytes, json!("AQI=")),
            ("varbinary", TargetType::Bytes, json!("AQI=")),
            ("json", TargetType::Json, json!("{\"a\":1}")),
        ];
        for (source_type, target_type, value) in cases {
            let (s, t) = (src(source_type), tgt(target_type));
            let literal = coercer.coerce(&s, &t, &value).unwrap();
            let decoded = decode_literal(&s, &t, &literal).unwrap();
            assert_eq!(decoded, Some(value), "literal {}", literal);
        }
    }

    #[test]
    fn test_decode_arrays_are_lost() {
        let target = tgt(TargetType::String).array();
        let literal = ValueCoercer::default()
            .coerce(&src("varchar"), &target, &json!(["x", "y"]))
            .unwrap();
        assert_eq!(decode_literal(&src("varchar"), &target, &literal).unwrap(), None);
    }

    #[test]
    fn test_decode_null_and_garbage() {
        assert_eq!(
            decode_literal(&src("varchar"), &tgt(TargetType::String), "NULL").unwrap(),
            Some(Value::Null)
        );
        assert!(decode_literal(&src("varchar"), &tgt(TargetType::String), "'open").is_err());
        assert!(decode_literal(&src("datetime"), &tgt(TargetType::Timestamp), "'x'").is_err());
    }
}
