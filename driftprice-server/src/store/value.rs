//! Conversion between plain JSON and Firestore's typed REST value encoding.

use serde_json::{json, Map, Number, Value};

use super::StoreError;

pub fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            // Firestore wants 64-bit integers as decimal strings.
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64().unwrap_or(0.0) }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => json!({
            "arrayValue": { "values": items.iter().map(encode_value).collect::<Vec<_>>() }
        }),
        Value::Object(map) => json!({ "mapValue": { "fields": encode_fields(map) } }),
    }
}

pub fn encode_fields(fields: &Map<String, Value>) -> Value {
    Value::Object(
        fields
            .iter()
            .map(|(k, v)| (k.clone(), encode_value(v)))
            .collect(),
    )
}

pub fn decode_value(value: &Value) -> Result<Value, StoreError> {
    let obj = value
        .as_object()
        .ok_or_else(|| StoreError::Decode(format!("expected typed value, got {}", value)))?;
    let (kind, inner) = obj
        .iter()
        .next()
        .ok_or_else(|| StoreError::Decode("empty typed value".to_string()))?;

    match kind.as_str() {
        "nullValue" => Ok(Value::Null),
        "booleanValue" => inner
            .as_bool()
            .map(Value::Bool)
            .ok_or_else(|| bad(kind, inner)),
        "integerValue" => {
            let parsed = match inner {
                Value::String(s) => s.parse::<i64>().ok(),
                Value::Number(n) => n.as_i64(),
                _ => None,
            };
            parsed.map(Value::from).ok_or_else(|| bad(kind, inner))
        }
        // NaN and Infinity arrive as strings and have no JSON form.
        "doubleValue" => inner
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| bad(kind, inner)),
        "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" => inner
            .as_str()
            .map(|s| Value::String(s.to_string()))
            .ok_or_else(|| bad(kind, inner)),
        "geoPointValue" => Ok(inner.clone()),
        "arrayValue" => {
            let values = inner
                .get("values")
                .and_then(Value::as_array)
                .map(|items| items.iter().map(decode_value).collect::<Result<Vec<_>, _>>())
                .transpose()?
                .unwrap_or_default();
            Ok(Value::Array(values))
        }
        "mapValue" => Ok(Value::Object(decode_fields(inner.get("fields"))?)),
        other => Err(StoreError::Decode(format!("unsupported value type '{}'", other))),
    }
}

/// Decodes a document's `fields` object; a missing object means no fields.
pub fn decode_fields(fields: Option<&Value>) -> Result<Map<String, Value>, StoreError> {
    let Some(fields) = fields else {
        return Ok(Map::new());
    };
    let fields = fields
        .as_object()
        .ok_or_else(|| StoreError::Decode("document fields is not an object".to_string()))?;
    fields
        .iter()
        .map(|(k, v)| decode_value(v).map(|decoded| (k.clone(), decoded)))
        .collect()
}

/// A merge-update key split on `.` into field-path segments, so
/// `"stats.total"` names `total` inside the `stats` map.
pub type UpdatePath<'a> = (Vec<&'a str>, &'a Value);

/// Splits every update key into its field path. Empty segments, and a path
/// that is a prefix of another in the same update, are rejected.
pub fn update_paths(fields: &Map<String, Value>) -> Result<Vec<UpdatePath<'_>>, StoreError> {
    let mut paths = Vec::with_capacity(fields.len());
    for (key, value) in fields {
        let segments: Vec<&str> = key.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(StoreError::InvalidRecord(format!("invalid field path '{}'", key)));
        }
        paths.push((segments, value));
    }

    // Sorted, a path that is a prefix of others sits right before them.
    let mut sorted: Vec<&Vec<&str>> = paths.iter().map(|(segments, _)| segments).collect();
    sorted.sort();
    if let Some(pair) = sorted.windows(2).find(|w| w[1].starts_with(w[0])) {
        return Err(StoreError::InvalidRecord(format!(
            "field path '{}' conflicts with '{}'",
            pair[0].join("."),
            pair[1].join(".")
        )));
    }
    Ok(paths)
}

/// Update-mask form of a field path: each segment quoted, joined by `.`.
pub fn mask_path(segments: &[&str]) -> String {
    segments
        .iter()
        .map(|s| quote_segment(s))
        .collect::<Vec<_>>()
        .join(".")
}

/// Sets `value` at `segments` inside `map`. Missing or non-map
/// intermediates become maps, as in a Firestore field-path update.
pub fn insert_path(map: &mut Map<String, Value>, segments: &[&str], value: Value) {
    match segments {
        [] => {}
        [last] => {
            map.insert(last.to_string(), value);
        }
        [head, rest @ ..] => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(inner) = child {
                insert_path(inner, rest, value);
            }
        }
    }
}

/// Nests dotted update paths into the document shape Firestore expects next
/// to the update mask.
pub fn nest_paths(paths: &[UpdatePath<'_>]) -> Map<String, Value> {
    let mut nested = Map::new();
    for (segments, value) in paths {
        insert_path(&mut nested, segments, (*value).clone());
    }
    nested
}

fn quote_segment(name: &str) -> String {
    let mut chars = name.chars();
    let simple = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if simple {
        name.to_string()
    } else {
        format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
    }
}

fn bad(kind: &str, inner: &Value) -> StoreError {
    StoreError::Decode(format!("malformed {}: {}", kind, inner))
}
