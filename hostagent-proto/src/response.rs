//! Response-envelope normalization.
//!
//! Whatever shape a task produces, the caller always receives a JSON
//! object carrying `operation` and `response`.

use serde_json::{Map, Value};
use tracing::warn;

pub const KEY_OPERATION: &str = "operation";
pub const KEY_RESPONSE: &str = "response";
pub const RESPONSE_OK: &str = "ok";
pub const RESPONSE_FAILED: &str = "failed";

/// Normalize a task result into the response envelope.
///
/// A string result becomes the `response` value. An object result keeps
/// its fields, with `response` defaulting to `"ok"` when absent. Any
/// other shape collapses to a `"failed"` envelope.
pub fn generate_response(operation: &str, value: Value) -> String {
    let mut fields = match value {
        Value::String(s) => {
            let mut m = Map::new();
            m.insert(KEY_RESPONSE.to_string(), Value::String(s));
            m
        }
        Value::Object(mut m) => {
            m.entry(KEY_RESPONSE.to_string())
                .or_insert_with(|| Value::String(RESPONSE_OK.to_string()));
            m
        }
        other => {
            warn!(%operation, "unsupported task result shape: {other}");
            let mut m = Map::new();
            m.insert(
                KEY_RESPONSE.to_string(),
                Value::String(RESPONSE_FAILED.to_string()),
            );
            m
        }
    };

    fields.insert(
        KEY_OPERATION.to_string(),
        Value::String(operation.to_string()),
    );
    Value::Object(fields).to_string()
}
