//! TOON — tabular object-oriented notation.
//!
//! Token-efficient text encoding for arrays of uniform scalar objects:
//!
//! ```text
//! [2]{n,name}:
//!   1,alpha
//!   2,beta
//! ```
//!
//! Non-uniform or nested data falls back to JSON at the call site. Values
//! containing `,`, a newline, or a leading `"` are JSON-escaped; booleans
//! and `null` use their literals; numbers keep their canonical form.

use serde_json::{Map, Value};

/// Arrays below this row count stay JSON under `format: auto`.
pub const MIN_ROWS: usize = 5;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Encode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Whether a value is TOON-encodable with at least `min_rows` rows: an
/// array of objects sharing one key set, all values scalar.
pub fn is_tabular(value: &Value, min_rows: usize) -> bool {
    tabular_keys(value).is_some()
        && value.as_array().map(|a| a.len() >= min_rows).unwrap_or(false)
}

fn tabular_keys(value: &Value) -> Option<Vec<String>> {
    let rows = value.as_array()?;
    let first = rows.first()?.as_object()?;
    let keys: Vec<String> = first.keys().cloned().collect();
    for row in rows {
        let obj = row.as_object()?;
        if obj.len() != keys.len() || !keys.iter().all(|k| obj.contains_key(k)) {
            return None;
        }
        if obj.values().any(|v| v.is_array() || v.is_object()) {
            return None;
        }
    }
    Some(keys)
}

/// Encode under the `auto` policy: `None` unless the value is tabular with
/// at least [`MIN_ROWS`] rows.
pub fn encode(value: &Value) -> Option<String> {
    if !is_tabular(value, MIN_ROWS) {
        return None;
    }
    encode_forced(value)
}

/// Encode regardless of row count (the `totoon` filter and
/// `format: toon` both force encoding). `None` only when the shape is not
/// uniform tabular.
pub fn encode_forced(value: &Value) -> Option<String> {
    let keys = tabular_keys(value)?;
    let rows = value.as_array()?;

    let mut out = format!("[{}]{{{}}}:", rows.len(), keys.join(","));
    for row in rows {
        let obj = row.as_object()?;
        out.push_str("\n  ");
        let fields: Vec<String> = keys.iter().map(|k| encode_scalar(&obj[k])).collect();
        out.push_str(&fields.join(","));
    }
    Some(out)
}

fn encode_scalar(value: &Value) -> String {
    match value {
        Value::Null => "null".into(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => {
            if s.contains(',') || s.contains('\n') || s.starts_with('"') {
                serde_json::to_string(s).unwrap_or_default()
            } else {
                s.clone()
            }
        }
        // tabular_keys rejects nested values before we get here
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Decode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Decode TOON text back into a JSON value. Supports the array form
/// (`[N]{keys}:`) and the object-flavored form (`{keys}:` with a single
/// row). Unparseable input falls back to JSON parsing; `None` when neither
/// applies.
pub fn decode(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Some(decoded) = decode_toon(trimmed) {
        return Some(decoded);
    }
    serde_json::from_str(trimmed).ok()
}

fn decode_toon(text: &str) -> Option<Value> {
    let mut lines = text.lines();
    let header = lines.next()?.trim_end();
    let header = header.strip_suffix(':')?;

    let (expected_rows, keys) = if let Some(rest) = header.strip_prefix('[') {
        let (count, keyspec) = rest.split_once(']')?;
        let count: usize = count.parse().ok()?;
        (Some(count), parse_keys(keyspec)?)
    } else {
        (None, parse_keys(header)?)
    };

    let mut rows = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let fields = split_fields(line.trim());
        if fields.len() != keys.len() {
            return None;
        }
        let mut obj = Map::new();
        for (key, raw) in keys.iter().zip(fields) {
            obj.insert(key.clone(), decode_scalar(&raw));
        }
        rows.push(Value::Object(obj));
    }

    if let Some(expected) = expected_rows {
        if rows.len() != expected {
            return None;
        }
        Some(Value::Array(rows))
    } else {
        // Object-flavored: a single keyed row decodes to the object itself.
        match rows.len() {
            1 => rows.pop(),
            _ => Some(Value::Array(rows)),
        }
    }
}

fn parse_keys(spec: &str) -> Option<Vec<String>> {
    let inner = spec.strip_prefix('{')?.strip_suffix('}')?;
    if inner.is_empty() {
        return None;
    }
    Some(inner.split(',').map(|k| k.trim().to_string()).collect())
}

/// Split one row on top-level commas, honoring JSON-escaped strings.
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in line.chars() {
        if in_quotes {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_quotes = false;
            }
        } else if c == '"' && current.is_empty() {
            in_quotes = true;
            current.push(c);
        } else if c == ',' {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    fields.push(current);
    fields
}

fn decode_scalar(raw: &str) -> Value {
    let raw = raw.trim();
    match raw {
        "null" => Value::Null,
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => {
            if raw.starts_with('"') {
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
            } else if let Ok(n) = serde_json::from_str::<serde_json::Number>(raw) {
                Value::Number(n)
            } else {
                Value::String(raw.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_rows(n: usize) -> Value {
        Value::Array(
            (0..n)
                .map(|i| json!({"n": i, "name": format!("row{i}")}))
                .collect(),
        )
    }

    #[test]
    fn single_row_forced_encoding() {
        let rows = json!([{"n": 1}]);
        assert_eq!(encode_forced(&rows).unwrap(), "[1]{n}:\n  1");
        // auto policy leaves small arrays to JSON
        assert!(encode(&rows).is_none());
    }

    #[test]
    fn auto_threshold_is_five_rows() {
        assert!(encode(&sample_rows(4)).is_none());
        assert!(encode(&sample_rows(5)).is_some());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let rows = json!([
            {"id": 1, "label": "plain", "ok": true},
            {"id": 2, "label": "with, comma", "ok": false},
            {"id": 3, "label": "\"quoted\"", "ok": true},
            {"id": 4, "label": null, "ok": false},
            {"id": 5, "label": "multi\nline", "ok": true},
        ]);
        let encoded = encode(&rows).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, rows);
    }

    #[test]
    fn roundtrip_matches_json_roundtrip() {
        let rows = sample_rows(6);
        let via_json: Value =
            serde_json::from_str(&serde_json::to_string(&rows).unwrap()).unwrap();
        let via_toon = decode(&encode(&rows).unwrap()).unwrap();
        assert_eq!(via_json, via_toon);
    }

    #[test]
    fn non_uniform_arrays_are_not_tabular() {
        let mixed = json!([{"a": 1}, {"b": 2}, {"a": 3}, {"a": 4}, {"a": 5}]);
        assert!(!is_tabular(&mixed, 5));
        let nested = json!([
            {"a": {"x": 1}}, {"a": {"x": 2}}, {"a": {"x": 3}},
            {"a": {"x": 4}}, {"a": {"x": 5}}
        ]);
        assert!(!is_tabular(&nested, 5));
    }

    #[test]
    fn decode_falls_back_to_json() {
        assert_eq!(decode("[1, 2, 3]").unwrap(), json!([1, 2, 3]));
        assert_eq!(decode("{\"a\": 1}").unwrap(), json!({"a": 1}));
        assert!(decode("not anything").is_none());
    }

    #[test]
    fn object_flavored_decoding() {
        let decoded = decode("{n,name}:\n  7,seven").unwrap();
        assert_eq!(decoded, json!({"n": 7, "name": "seven"}));
    }

    #[test]
    fn row_count_mismatch_rejected() {
        assert!(decode_toon("[3]{n}:\n  1\n  2").is_none());
    }
}
