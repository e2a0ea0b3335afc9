//! lz4 compression for checkpoint blobs
//!
//! Snapshots are canonical JSON; graphs with many tasks compress well and the
//! blobs are written on every superstep, so the cheap lz4 block codec is used
//! rather than a ratio-optimized one.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CheckpointError, Result};

/// An lz4-compressed JSON document
///
/// Serializes as base64 so blobs can travel inside JSON rows of a
/// [`TabularStorage`](taskgraph_storage::TabularStorage) backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompressedBlob {
    #[serde(with = "base64_bytes")]
    bytes: Vec<u8>,
}

impl CompressedBlob {
    /// Compress a JSON value into a blob
    pub fn from_json(value: &Value) -> Result<Self> {
        Ok(Self {
            bytes: compress_json(value)?,
        })
    }

    /// Inflate and parse the blob back into JSON
    pub fn to_json(&self) -> Result<Value> {
        decompress_json(&self.bytes)
    }

    /// Wrap already-compressed bytes (e.g. read back from storage)
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// The compressed byte payload
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Size of the compressed payload
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Compress a JSON value to lz4 block format (size-prefixed)
pub fn compress_json(value: &Value) -> Result<Vec<u8>> {
    let raw = serde_json::to_vec(value)?;
    lz4::block::compress(&raw, None, true)
        .map_err(|e| CheckpointError::Compression(e.to_string()))
}

/// Inflate an lz4 block (size-prefixed) and parse it as JSON
pub fn decompress_json(bytes: &[u8]) -> Result<Value> {
    let raw = lz4::block::decompress(bytes, None)
        .map_err(|e| CheckpointError::Corrupt(e.to_string()))?;
    serde_json::from_slice(&raw).map_err(|e| CheckpointError::Corrupt(e.to_string()))
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roundtrip_preserves_json() {
        let value = json!({
            "tasks": [{"id": "a", "status": "completed", "progress": 100}],
            "nested": {"deep": [1, 2, 3]},
        });
        let blob = CompressedBlob::from_json(&value).unwrap();
        assert_eq!(blob.to_json().unwrap(), value);
    }

    #[test]
    fn compresses_repetitive_state() {
        let tasks: Vec<Value> = (0..200)
            .map(|i| json!({"id": format!("task-{i}"), "status": "pending", "progress": 0}))
            .collect();
        let value = json!({ "tasks": tasks });
        let raw_len = serde_json::to_vec(&value).unwrap().len();
        let blob = CompressedBlob::from_json(&value).unwrap();
        assert!(blob.len() < raw_len / 2);
    }

    #[test]
    fn corrupt_blob_is_rejected() {
        let err = decompress_json(&[0xde, 0xad, 0xbe, 0xef]).unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt(_)));
    }

    #[test]
    fn serde_base64_roundtrip() {
        let blob = CompressedBlob::from_json(&json!({"k": "v"})).unwrap();
        let encoded = serde_json::to_string(&blob).unwrap();
        let decoded: CompressedBlob = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, blob);
    }
}
