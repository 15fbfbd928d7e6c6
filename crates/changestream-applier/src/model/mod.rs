//! Change events as delivered by the change stream.
//!
//! A [`ChangeEvent`] describes one captured row mutation. The upstream reader
//! emits events as JSON objects; the column maps (`keysJson`, `newValuesJson`,
//! `oldValuesJson`) arrive either as nested objects or as strings that hold a
//! JSON object, and the commit time either as an RFC 3339 string or as a
//! seconds/nanos pair. [`ChangeEvent::from_json`] accepts all of these shapes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::Timestamp;
use crate::error::TranslateError;

/// Column name to JSON value, as encoded by the change stream.
pub type ColumnValues = Map<String, Value>;

/// Kind of row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModType {
    Insert,
    Update,
    Delete,
}

impl ModType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModType::Insert => "INSERT",
            ModType::Update => "UPDATE",
            ModType::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ModType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModType {
    type Err = TranslateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INSERT" => Ok(ModType::Insert),
            "UPDATE" => Ok(ModType::Update),
            "DELETE" => Ok(ModType::Delete),
            _ => Err(TranslateError::UnsupportedModType(s.to_string())),
        }
    }
}

/// Which column values the change stream captured for an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueCaptureType {
    /// Only modified columns, with their old and new values.
    #[default]
    OldAndNew,
    /// The full new row image.
    NewRow,
    /// The full new row image plus old values of modified columns.
    NewRowAndOldValues,
}

impl ValueCaptureType {
    /// Whether an update carries every tracked column of the new row.
    pub fn captures_full_row(&self) -> bool {
        matches!(
            self,
            ValueCaptureType::NewRow | ValueCaptureType::NewRowAndOldValues
        )
    }
}

impl FromStr for ValueCaptureType {
    type Err = TranslateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OLD_AND_NEW" | "OLD_AND_NEW_VALUES" => Ok(ValueCaptureType::OldAndNew),
            "NEW_ROW" => Ok(ValueCaptureType::NewRow),
            "NEW_ROW_AND_OLD_VALUES" => Ok(ValueCaptureType::NewRowAndOldValues),
            other => Err(TranslateError::MalformedEvent(format!(
                "unknown value capture type {:?}",
                other
            ))),
        }
    }
}

/// One captured row mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub table_name: String,
    pub mod_type: ModType,
    #[serde(rename = "keysJson")]
    pub keys: ColumnValues,
    #[serde(rename = "oldValuesJson", skip_serializing_if = "Option::is_none")]
    pub old_values: Option<ColumnValues>,
    #[serde(rename = "newValuesJson", skip_serializing_if = "Option::is_none")]
    pub new_values: Option<ColumnValues>,
    pub commit_timestamp: Timestamp,
    pub value_capture_type: ValueCaptureType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_sequence: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_records_in_transaction: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvent {
    table_name: String,
    mod_type: String,
    #[serde(default, alias = "keys")]
    keys_json: Option<Value>,
    #[serde(default, alias = "oldValues")]
    old_values_json: Option<Value>,
    #[serde(default, alias = "newValues")]
    new_values_json: Option<Value>,
    #[serde(default)]
    commit_timestamp: Option<String>,
    #[serde(default)]
    commit_timestamp_seconds: Option<i64>,
    #[serde(default)]
    commit_timestamp_nanos: Option<u32>,
    #[serde(default)]
    value_capture_type: Option<String>,
    #[serde(default)]
    server_transaction_id: Option<String>,
    #[serde(default)]
    record_sequence: Option<String>,
    #[serde(default)]
    number_of_records_in_transaction: Option<u64>,
}

impl ChangeEvent {
    /// Parse an event from its JSON payload.
    pub fn from_json(payload: &str) -> Result<Self, TranslateError> {
        let value: Value = serde_json::from_str(payload)
            .map_err(|e| TranslateError::MalformedEvent(format!("invalid JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// Build an event from an already parsed JSON payload.
    pub fn from_value(value: Value) -> Result<Self, TranslateError> {
        let raw: RawEvent = serde_json::from_value(value)
            .map_err(|e| TranslateError::MalformedEvent(e.to_string()))?;

        let mod_type: ModType = raw.mod_type.parse()?;
        let value_capture_type = match raw.value_capture_type.as_deref() {
            Some(s) => s.parse()?,
            None => ValueCaptureType::default(),
        };
        let commit_timestamp = commit_time(
            raw.commit_timestamp.as_deref(),
            raw.commit_timestamp_seconds,
            raw.commit_timestamp_nanos,
        )?;

        let keys = column_map("keysJson", raw.keys_json)?.unwrap_or_default();
        let old_values = column_map("oldValuesJson", raw.old_values_json)?;
        let new_values = column_map("newValuesJson", raw.new_values_json)?;

        if raw.table_name.is_empty() {
            return Err(TranslateError::MalformedEvent(
                "tableName cannot be empty".to_string(),
            ));
        }

        Ok(ChangeEvent {
            table_name: raw.table_name,
            mod_type,
            keys,
            old_values,
            new_values,
            commit_timestamp,
            value_capture_type,
            server_transaction_id: raw.server_transaction_id,
            record_sequence: raw.record_sequence,
            number_of_records_in_transaction: raw.number_of_records_in_transaction,
        })
    }

    /// Canonical JSON encoding, accepted by [`ChangeEvent::from_json`].
    pub fn to_json(&self) -> String {
        // Serializing plain maps and strings cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Value of `column`, looking in the key columns first and then in the
    /// new values.
    pub fn lookup(&self, column: &str) -> Option<&Value> {
        self.keys
            .get(column)
            .or_else(|| self.new_values.as_ref().and_then(|m| m.get(column)))
    }

    /// Whether an update needs a point read to recover unchanged columns.
    pub fn needs_full_row(&self) -> bool {
        self.mod_type == ModType::Update && !self.value_capture_type.captures_full_row()
    }
}

fn commit_time(
    rfc3339: Option<&str>,
    seconds: Option<i64>,
    nanos: Option<u32>,
) -> Result<Timestamp, TranslateError> {
    if let Some(s) = rfc3339 {
        return s
            .parse()
            .map_err(|e| TranslateError::MalformedEvent(format!("commitTimestamp: {}", e)));
    }
    match seconds {
        Some(secs) => Timestamp::from_seconds_nanos(secs, nanos.unwrap_or(0))
            .map_err(|e| TranslateError::MalformedEvent(format!("commitTimestamp: {}", e))),
        None => Err(TranslateError::MalformedEvent(
            "missing commitTimestamp".to_string(),
        )),
    }
}

/// Accept a column map given as an object, a string holding an object, or null.
fn column_map(field: &str, value: Option<Value>) -> Result<Option<ColumnValues>, TranslateError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::Object(map)) => Ok(Some(map)),
            Ok(Value::Null) => Ok(None),
            Ok(_) => Err(TranslateError::MalformedEvent(format!(
                "{} must hold a JSON object",
                field
            ))),
            Err(e) => Err(TranslateError::MalformedEvent(format!("{}: {}", field, e))),
        },
        Some(_) => Err(TranslateError::MalformedEvent(format!(
            "{} must be an object or a JSON string",
            field
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_string_encoded_maps() {
        let payload = json!({
            "tableName": "Singers",
            "modType": "UPDATE",
            "keysJson": "{\"SingerId\":\"1\"}",
            "newValuesJson": "{\"FirstName\":\"Ann\"}",
            "oldValuesJson": "{\"FirstName\":\"Anne\"}",
            "commitTimestampSeconds": 1_700_000_000,
            "commitTimestampNanos": 42,
            "valueCaptureType": "OLD_AND_NEW_VALUES",
            "serverTransactionId": "tx-1",
            "recordSequence": "00000001",
            "numberOfRecordsInTransaction": 2
        })
        .to_string();

        let event = ChangeEvent::from_json(&payload).unwrap();
        assert_eq!(event.table_name, "Singers");
        assert_eq!(event.mod_type, ModType::Update);
        assert_eq!(event.keys["SingerId"], json!("1"));
        assert_eq!(event.new_values.as_ref().unwrap()["FirstName"], json!("Ann"));
        assert_eq!(event.commit_timestamp.as_nanos(), 1_700_000_000_000_000_042);
        assert_eq!(event.value_capture_type, ValueCaptureType::OldAndNew);
        assert_eq!(event.server_transaction_id.as_deref(), Some("tx-1"));
        assert_eq!(event.number_of_records_in_transaction, Some(2));
        assert!(event.needs_full_row());
    }

    #[test]
    fn test_parse_object_maps_and_rfc3339() {
        let payload = json!({
            "tableName": "person1",
            "modType": "INSERT",
            "keysJson": {"id": "1"},
            "newValuesJson": {"name": "John"},
            "commitTimestamp": "2024-05-01T00:00:00.5Z",
            "valueCaptureType": "NEW_ROW"
        })
        .to_string();

        let event = ChangeEvent::from_json(&payload).unwrap();
        assert_eq!(event.old_values, None);
        assert_eq!(event.lookup("name"), Some(&json!("John")));
        assert_eq!(event.commit_timestamp.to_string(), "2024-05-01T00:00:00.500Z");
        assert!(!event.needs_full_row());
    }

    #[test]
    fn test_keys_take_precedence() {
        let payload = json!({
            "tableName": "t",
            "modType": "UPDATE",
            "keysJson": {"id": "1"},
            "newValuesJson": {"id": "2", "v": "x"},
            "commitTimestamp": "2024-05-01T00:00:00Z"
        })
        .to_string();
        let event = ChangeEvent::from_json(&payload).unwrap();
        assert_eq!(event.lookup("id"), Some(&json!("1")));
        assert_eq!(event.lookup("v"), Some(&json!("x")));
        assert_eq!(event.lookup("missing"), None);
    }

    #[test]
    fn test_unknown_mod_type() {
        let payload = json!({
            "tableName": "t",
            "modType": "UPSERT",
            "keysJson": {},
            "commitTimestamp": "2024-05-01T00:00:00Z"
        })
        .to_string();
        assert!(matches!(
            ChangeEvent::from_json(&payload),
            Err(TranslateError::UnsupportedModType(m)) if m == "UPSERT"
        ));
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(
            ChangeEvent::from_json("not json"),
            Err(TranslateError::MalformedEvent(_))
        ));
        assert!(matches!(
            ChangeEvent::from_json(r#"{"modType":"INSERT"}"#),
            Err(TranslateError::MalformedEvent(_))
        ));

        let no_time = json!({"tableName": "t", "modType": "INSERT", "keysJson": {}}).to_string();
        assert!(matches!(
            ChangeEvent::from_json(&no_time),
            Err(TranslateError::MalformedEvent(m)) if m.contains("commitTimestamp")
        ));

        let bad_keys = json!({
            "tableName": "t",
            "modType": "INSERT",
            "keysJson": "[1,2]",
            "commitTimestamp": "2024-05-01T00:00:00Z"
        })
        .to_string();
        assert!(matches!(
            ChangeEvent::from_json(&bad_keys),
            Err(TranslateError::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_canonical_json_parses_back() {
        let payload = json!({
            "tableName": "t",
            "modType": "DELETE",
            "keysJson": {"id": "7"},
            "commitTimestamp": "2024-05-01T00:00:00Z",
            "valueCaptureType": "NEW_ROW_AND_OLD_VALUES"
        })
        .to_string();
        let event = ChangeEvent::from_json(&payload).unwrap();
        let again = ChangeEvent::from_json(&event.to_json()).unwrap();
        assert_eq!(again, event);
    }
}
