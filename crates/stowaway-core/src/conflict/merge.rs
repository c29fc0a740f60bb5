//! Field-level merge of client and server versions.

use serde_json::{Map, Value};

/// Fields consulted, in order, for a record's modification time.
pub const MODIFIED_FIELDS: [&str; 4] = ["updated_at", "last_modified", "modified_at", "lastModified"];

/// Fields the server always owns during a merge.
const IDENTITY_FIELDS: [&str; 2] = ["id", "created_at"];

/// Parse a timestamp given as RFC 3339 text, an integer-like string, or a
/// JSON number of Unix milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            #[allow(clippy::cast_possible_truncation)]
            number.as_f64().map(|float| float as i64)
        }),
        Value::String(text) => {
            let text = text.trim();
            chrono::DateTime::parse_from_rfc3339(text)
                .map(|parsed| parsed.timestamp_millis())
                .ok()
                .or_else(|| text.parse::<i64>().ok())
        }
        _ => None,
    }
}

/// Modification time of a record, from the first modification field present.
pub fn modified_at(record: &Value) -> Option<i64> {
    let object = record.as_object()?;
    MODIFIED_FIELDS
        .iter()
        .find_map(|field| object.get(*field))
        .and_then(parse_timestamp)
}

fn is_timestamp_field(key: &str) -> bool {
    MODIFIED_FIELDS.contains(&key) || key.ends_with("_at") || key.ends_with("At")
}

/// Merge `client` onto `server`.
///
/// Objects merge field by field, arrays merge by element `id` (plain values
/// are deduplicated), timestamp fields keep the later value, and any other
/// differing value takes the client's side. `merge_values(x, x) == x`.
pub fn merge_values(client: &Value, server: &Value) -> Value {
    match (client, server) {
        (Value::Object(client), Value::Object(server)) => {
            Value::Object(merge_objects(client, server))
        }
        (Value::Array(client), Value::Array(server)) => Value::Array(merge_arrays(client, server)),
        (client, _) => client.clone(),
    }
}

fn merge_objects(client: &Map<String, Value>, server: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = server.clone();
    for (key, client_value) in client {
        if IDENTITY_FIELDS.contains(&key.as_str()) {
            continue;
        }
        let Some(server_value) = server.get(key) else {
            merged.insert(key.clone(), client_value.clone());
            continue;
        };

        let value = if is_timestamp_field(key) {
            later_timestamp(client_value, server_value)
        } else {
            merge_values(client_value, server_value)
        };
        merged.insert(key.clone(), value);
    }
    merged
}

fn later_timestamp(client: &Value, server: &Value) -> Value {
    match (parse_timestamp(client), parse_timestamp(server)) {
        (Some(client_ms), Some(server_ms)) if server_ms >= client_ms => server.clone(),
        (None, Some(_)) => server.clone(),
        _ => client.clone(),
    }
}

fn element_id(value: &Value) -> Option<&Value> {
    value.as_object().and_then(|object| object.get("id"))
}

/// Each element pairs with at most one client item, so repeated ids match
/// up by position.
fn merge_arrays(client: &[Value], server: &[Value]) -> Vec<Value> {
    let mut merged = server.to_vec();
    let mut claimed = vec![false; merged.len()];
    for client_item in client {
        if let Some(id) = element_id(client_item) {
            let slot = merged
                .iter()
                .zip(&claimed)
                .position(|(existing, taken)| !taken && element_id(existing) == Some(id));
            if let Some(index) = slot {
                merged[index] = merge_values(client_item, &merged[index]);
                claimed[index] = true;
                continue;
            }
            merged.push(client_item.clone());
            claimed.push(true);
        } else if !merged.contains(client_item) {
            merged.push(client_item.clone());
            claimed.push(true);
        }
    }
    merged
}
