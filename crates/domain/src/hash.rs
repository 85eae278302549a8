//! Deterministic identity fingerprints.
//!
//! All hashes are 16-hex-char truncated SHA-256 over a canonical, sort-keyed
//! JSON serialization, so two processes running the same config and input
//! produce identical strings. `species_hash` deliberately excludes the model
//! so runs are comparable across providers.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::cascade::{Cascade, Cell};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Canonical JSON
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Serialize with object keys sorted recursively. Numbers use serde_json's
/// shortest-roundtrip formatting, which is stable across processes.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            // serde_json escaping of a bare string is deterministic.
            out.push_str(&serde_json::to_string(s).expect("string serialization is infallible"));
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(
                    &serde_json::to_string(key).expect("string serialization is infallible"),
                );
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

fn sha16(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Content hash
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Hash of normalized content: CRLF folded to LF, surrounding whitespace
/// trimmed.
pub fn content_hash(content: &str) -> String {
    let normalized = content.replace("\r\n", "\n");
    sha16(normalized.trim())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Species / genus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cell-level identity: config + input, model excluded.
pub fn species_hash(cell: &Cell, input_data: &Value) -> String {
    let basis = if cell.is_deterministic() {
        serde_json::json!({
            "tool": cell.tool,
            "inputs": cell.inputs,
            "input_data": input_data,
            "rules": cell.rules,
        })
    } else {
        serde_json::json!({
            "instructions": cell.instructions,
            "input_data": input_data,
            "candidates": cell.candidates,
            "rules": cell.rules,
            "output_schema": cell.output_schema,
            "wards": cell.wards,
        })
    };
    sha16(&canonical_json(&basis))
}

/// Cascade-level identity: structure + bucketed top-level input.
pub fn genus_hash(cascade: &Cascade, input_data: &Value) -> String {
    let cells: Vec<Value> = cascade
        .cells
        .iter()
        .map(|c| {
            serde_json::json!({
                "name": c.name,
                "type": if c.is_deterministic() { "deterministic" } else { "llm" },
                "tool": c.tool,
            })
        })
        .collect();
    let basis = serde_json::json!({
        "cascade_id": cascade.cascade_id,
        "cells": cells,
        "input_fingerprint": input_fingerprint(input_data),
        "input_data": input_data,
    });
    sha16(&canonical_json(&basis))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Input fingerprint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bucketed structural summary of an input: per key, `{type, size_bucket}`.
/// Values themselves are discarded.
pub fn input_fingerprint(input: &Value) -> Value {
    match input {
        Value::Object(map) => {
            let mut fp = Map::new();
            for (key, value) in map {
                fp.insert(key.clone(), fingerprint_entry(value));
            }
            Value::Object(fp)
        }
        other => fingerprint_entry(other),
    }
}

fn fingerprint_entry(value: &Value) -> Value {
    let (type_name, bucket) = match value {
        Value::Null => ("null", "tiny"),
        Value::Bool(_) => ("bool", "tiny"),
        Value::Number(_) => ("number", "tiny"),
        Value::String(s) => ("string", char_bucket(s.len())),
        Value::Array(items) => ("list", list_bucket(items.len())),
        Value::Object(_) => (
            "object",
            char_bucket(serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)),
        ),
    };
    serde_json::json!({"type": type_name, "size_bucket": bucket})
}

fn char_bucket(len: usize) -> &'static str {
    match len {
        0..=499 => "tiny",
        500..=1999 => "small",
        2000..=5999 => "medium",
        6000..=19999 => "large",
        _ => "huge",
    }
}

fn list_bucket(len: usize) -> &'static str {
    match len {
        0..=4 => "tiny",
        5..=19 => "small",
        20..=59 => "medium",
        60..=199 => "large",
        _ => "huge",
    }
}

/// Hash of the structural fingerprint alone — exposed as the
/// `structure_hash` template filter.
pub fn structure_hash(value: &Value) -> String {
    sha16(&canonical_json(&input_fingerprint(value)))
}
