// src/sandbox/schema.rs
// Structural output-schema inference from observed tool responses

use serde_json::{Map, Value, json};

/// Pick the value a response's output schema describes: the MCP
/// `structuredContent` when the server sent one, otherwise the whole
/// response object.
pub fn response_value(raw_response: &Value) -> &Value {
    raw_response
        .get("structuredContent")
        .unwrap_or(raw_response)
}

/// Generalize an observed value into a JSON schema.
///
/// Objects are typed field by field, arrays by the union of their element
/// schemas, and anything unknowable (null, empty arrays, mixed element
/// types) collapses to the any-equivalent `{}`.
pub fn infer_schema(value: &Value) -> Value {
    match value {
        Value::Null => json!({}),
        Value::Bool(_) => json!({"type": "boolean"}),
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                json!({"type": "integer"})
            } else {
                json!({"type": "number"})
            }
        }
        Value::String(_) => json!({"type": "string"}),
        Value::Array(items) => {
            if items.is_empty() {
                return json!({"type": "array", "items": {}});
            }
            let schemas: Vec<Value> = items.iter().map(infer_schema).collect();
            let first = &schemas[0];
            if schemas.iter().all(|s| s == first) {
                json!({"type": "array", "items": first})
            } else {
                json!({"type": "array", "items": {}})
            }
        }
        Value::Object(map) => {
            let properties: Map<String, Value> = map
                .iter()
                .map(|(key, val)| (key.clone(), infer_schema(val)))
                .collect();
            json!({"type": "object", "properties": properties})
        }
    }
}
