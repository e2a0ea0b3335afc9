//! Content fingerprints over canonical JSON
//!
//! Fingerprints key the task-output cache, deduplicate queued jobs, and give
//! checkpoints stable derived ids. Canonicalization makes the hash independent
//! of map ordering and of float formatting quirks: object keys are sorted
//! recursively, `-0.0` collapses to `0`, and integral floats become integers.
//! Typed binary payloads are represented as `{"kind", "base64"}` objects and
//! hash like any other object.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

/// Hex length fingerprints are truncated to (128 bits of SHA-256)
pub const FINGERPRINT_LEN: usize = 32;

/// Recursively canonicalize a JSON value
///
/// - Object keys sort lexicographically
/// - Arrays canonicalize elementwise, order preserved
/// - Floats with no fractional part become integers; `-0.0` becomes `0`
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::new();
            for (key, val) in sorted {
                out.insert(key.clone(), canonicalize(val));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Number(n) => canonicalize_number(n),
        other => other.clone(),
    }
}

fn canonicalize_number(n: &Number) -> Value {
    if let Some(f) = n.as_f64() {
        if n.as_i64().is_none() && n.as_u64().is_none() {
            if f == 0.0 {
                return Value::Number(Number::from(0));
            }
            if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                return Value::Number(Number::from(f as i64));
            }
        }
    }
    Value::Number(n.clone())
}

/// SHA-256 over the canonical form, hex-truncated to [`FINGERPRINT_LEN`]
pub fn fingerprint(value: &Value) -> String {
    let canonical = canonicalize(value);
    // Canonical form serializes deterministically: serde_json preserves the
    // sorted insertion order of the rebuilt maps.
    let serialized = serde_json::to_vec(&canonical).unwrap_or_default();
    let digest = Sha256::digest(&serialized);
    let mut hexed = hex::encode(digest);
    hexed.truncate(FINGERPRINT_LEN);
    hexed
}

/// Cache key for a task execution: type + canonicalized input
pub fn task_cache_key(task_type: &str, input: &Value) -> String {
    fingerprint(&Value::Array(vec![
        Value::String(task_type.to_string()),
        canonicalize(input),
    ]))
}

/// Stable id for a queued job: queue name + canonicalized input
pub fn job_fingerprint(queue_name: &str, input: &Value) -> String {
    fingerprint(&Value::Array(vec![
        Value::String(queue_name.to_string()),
        canonicalize(input),
    ]))
}

/// Encode a typed binary payload as its wire representation
pub fn encode_bytes(kind: &str, bytes: &[u8]) -> Value {
    let mut map = Map::new();
    map.insert("kind".to_string(), Value::String(kind.to_string()));
    map.insert("base64".to_string(), Value::String(STANDARD.encode(bytes)));
    Value::Object(map)
}

/// Decode a `{"kind", "base64"}` object back into `(kind, bytes)`
pub fn decode_bytes(value: &Value) -> Option<(String, Vec<u8>)> {
    let map = value.as_object()?;
    if map.len() != 2 {
        return None;
    }
    let kind = map.get("kind")?.as_str()?;
    let encoded = map.get("base64")?.as_str()?;
    let bytes = STANDARD.decode(encoded.as_bytes()).ok()?;
    Some((kind.to_string(), bytes))
}
