//! Debezium envelope decoding
//!
//! Accepts three shapes of message value:
//! - wrapped envelopes carrying `op`, `before` and `after`
//! - unwrapped rows (ExtractNewRecordState output), treated as a full-row update
//! - either of the above nested under `payload` next to a `schema`
//!   (`value.converter.schemas.enable = true`)

use serde_json::{Map, Value};

use super::models::{ChangeEvent, Operation, RawMessage, RowImage};
use crate::error::DecodeError;

/// Decode one raw message into a change event.
///
/// Returns `Ok(None)` for tombstones, which carry no row state.
pub fn decode(raw: &RawMessage) -> Result<Option<ChangeEvent>, DecodeError> {
    let Some(value) = raw.value.as_deref() else {
        return Ok(None);
    };

    let parsed: Value = serde_json::from_slice(value)
        .map_err(|e| DecodeError::Malformed(format!("invalid JSON: {}", e)))?;

    let Value::Object(envelope) = parsed else {
        return Err(DecodeError::Malformed(
            "message value is not a JSON object".to_string(),
        ));
    };

    let Some(envelope) = strip_schema(envelope) else {
        return Ok(None);
    };

    let event = match envelope.get("op") {
        None => ChangeEvent {
            operation: Operation::Update,
            before: None,
            after: Some(envelope),
            source_topic: raw.topic.clone(),
            source_offset: raw.offset,
            ts_ms: None,
        },
        Some(Value::String(code)) => ChangeEvent {
            operation: Operation::from_code(code),
            before: row_image(&envelope, "before")?,
            after: row_image(&envelope, "after")?,
            source_topic: raw.topic.clone(),
            source_offset: raw.offset,
            ts_ms: envelope.get("ts_ms").and_then(Value::as_i64),
        },
        Some(other) => {
            return Err(DecodeError::Malformed(format!(
                "'op' must be a string, got {}",
                other
            )))
        }
    };

    Ok(Some(event))
}

/// Unwrap `{"schema": ..., "payload": ...}`; `None` when the payload is null.
fn strip_schema(mut envelope: Map<String, Value>) -> Option<Map<String, Value>> {
    if !envelope.contains_key("schema") {
        return Some(envelope);
    }

    match envelope.remove("payload") {
        Some(Value::Object(payload)) => Some(payload),
        Some(Value::Null) => None,
        Some(other) => {
            envelope.insert("payload".to_string(), other);
            Some(envelope)
        }
        None => Some(envelope),
    }
}

fn row_image(envelope: &Map<String, Value>, field: &str) -> Result<Option<RowImage>, DecodeError> {
    match envelope.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(image)) => Ok(Some(image.clone())),
        Some(other) => Err(DecodeError::Malformed(format!(
            "'{}' must be an object or null, got {}",
            field, other
        ))),
    }
}
