//! Deterministic identity hashes for cells, cascades, and content.
//!
//! Two identities drive cross-run analytics:
//!
//! - **Species hash**: the behavioral DNA of a single cell execution. Two
//!   runs with identical cell configuration and identical rendered inputs
//!   share a species; model and cascade id are deliberately excluded so the
//!   same template can be compared across models and cascades.
//! - **Genus hash**: the identity of a whole cascade invocation. It captures
//!   the cascade id, the cell structure (names and variant kinds), and the
//!   shape of the inputs, so "similar invocations" cluster together.
//!
//! All hashes are SHA-256 over canonical JSON (sorted keys, no whitespace),
//! truncated to 16 lowercase hex characters.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::cascade::{Cell, CellVariant};

/// Length of truncated identity hashes in hex characters.
const HASH_LEN: usize = 16;

/// SHA-256 of `bytes`, truncated to 16 hex chars.
#[must_use]
pub fn short_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(HASH_LEN);
    for byte in digest.iter().take(HASH_LEN / 2) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Content hash of a JSON value in canonical form.
///
/// Used for log-row `content_hash` and ephemeral RAG deduplication.
#[must_use]
pub fn content_hash(value: &Value) -> String {
    short_hash(canonical_json(value).as_bytes())
}

/// Serialize a value deterministically: object keys sorted, no whitespace.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = String::from("{");
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                out.push_str(&canonical_json(&map[*key]));
            }
            out.push('}');
            out
        }
        Value::Array(items) => {
            let mut out = String::from("[");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&canonical_json(item));
            }
            out.push(']');
            out
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Compute the species hash for a cell plus its rendered input parameters.
///
/// LLM cells hash `instructions`; deterministic cells hash `tool` and its
/// input templates. Candidate configuration, rules, output schema, and wards
/// all participate: they are evolution pressure on the output. Model and
/// cascade id never participate.
#[must_use]
pub fn species_hash(cell: &Cell, input_data: &Value) -> String {
    let mut parts = Map::new();

    // Shared evolution pressure: wards, candidate config, and rules apply
    // to every variant and always participate.
    parts.insert("input_data".into(), input_data.clone());
    parts.insert("candidates".into(), to_value_or_null(&cell.candidates));
    parts.insert("rules".into(), to_value_or_null(&cell.rules));
    parts.insert("wards".into(), to_value_or_null(&cell.wards));

    match &cell.variant {
        CellVariant::Deterministic(det) => {
            parts.insert("tool".into(), Value::String(det.tool.clone()));
            parts.insert("inputs".into(), Value::Object(det.tool_inputs.clone()));
        }
        CellVariant::Llm(llm) => {
            parts.insert(
                "instructions".into(),
                Value::String(llm.instructions.clone()),
            );
            parts.insert("output_schema".into(), to_value_or_null(&llm.output_schema));
        }
        CellVariant::ForEachRow(map_cfg) => {
            parts.insert("for_each_row".into(), to_value_or_null(&Some(map_cfg)));
        }
        CellVariant::Screen(screen) => {
            parts.insert("htmx".into(), Value::String(screen.htmx.clone()));
        }
    }

    short_hash(canonical_json(&Value::Object(parts)).as_bytes())
}

/// Compute the genus hash for a cascade invocation.
///
/// Includes the cascade id, a structural summary of its cells, the raw input
/// data, and a size-bucketed input fingerprint for clustering.
#[must_use]
pub fn genus_hash(cascade_id: &str, cells: &[Cell], input_data: &Value) -> String {
    let cell_summaries: Vec<Value> = cells
        .iter()
        .map(|cell| {
            let mut entry = Map::new();
            entry.insert("name".into(), Value::String(cell.name.clone()));
            entry.insert(
                "type".into(),
                Value::String(cell.variant.kind_name().to_string()),
            );
            if let CellVariant::Deterministic(det) = &cell.variant {
                entry.insert("tool".into(), Value::String(det.tool.clone()));
            }
            Value::Object(entry)
        })
        .collect();

    let mut parts = Map::new();
    parts.insert("cascade_id".into(), Value::String(cascade_id.to_string()));
    parts.insert("cells".into(), Value::Array(cell_summaries));
    parts.insert(
        "input_fingerprint".into(),
        Value::String(input_fingerprint(input_data)),
    );
    parts.insert("input_data".into(), input_data.clone());

    short_hash(canonical_json(&Value::Object(parts)).as_bytes())
}

/// Structural fingerprint of inputs: keys, types, and size buckets.
///
/// `{"doc": "<40kb text>"}` and `{"doc": "hi"}` share structure but land in
/// different buckets, which is what the analytics clustering wants.
#[must_use]
pub fn input_fingerprint(input_data: &Value) -> String {
    if input_data.is_null() {
        return "empty".to_string();
    }
    if let Value::Object(map) = input_data {
        if map.is_empty() {
            return "empty".to_string();
        }
    }
    canonical_json(&structure_of(input_data))
}

fn structure_of(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, inner) in map {
                out.insert(key.clone(), structure_of(inner));
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            let bucket = match items.len() {
                0..=9 => "tiny",
                10..=99 => "small",
                100..=999 => "medium",
                _ => "large",
            };
            Value::Array(vec![Value::String("array".into()), Value::String(bucket.into())])
        }
        Value::String(text) => {
            let bucket = match text.len() {
                0..=19 => "tiny",
                20..=99 => "small",
                100..=499 => "medium",
                _ => "large",
            };
            Value::Array(vec![Value::String("str".into()), Value::String(bucket.into())])
        }
        Value::Number(num) => {
            let magnitude = num.as_f64().map(f64::abs).unwrap_or(0.0);
            let bucket = if magnitude < 10.0 {
                "tiny"
            } else if magnitude < 1_000.0 {
                "small"
            } else if magnitude < 1_000_000.0 {
                "medium"
            } else {
                "large"
            };
            Value::Array(vec![Value::String("number".into()), Value::String(bucket.into())])
        }
        Value::Bool(_) => Value::String("bool".into()),
        Value::Null => Value::String("null".into()),
    }
}

fn to_value_or_null<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
