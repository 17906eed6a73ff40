//! Document encoding for the index.
//!
//! Every document is stored as a JSON object with a consistent format that
//! includes metadata for version tracking and corruption detection.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{BlobId, DocKey};

/// an indexed document with metadata and payload
///
/// The internal format:
/// ```text
/// {
///   "_key": "MAIN",
///   "_version": 3,
///   "_updated_at": "xxxx-xx-xxT00:00:00Z",
///   "path": "MAIN",
///   "headTimestamp": 1700000000000
/// }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// document key (must match the filename in the git-backed index)
    pub key: DocKey,
    /// write counter, bumped by the index on every upsert
    pub version: u64,
    /// last write time
    pub updated_at: String,
    /// payload fields
    pub data: BTreeMap<String, Value>,
}

impl Document {
    /// creates a new document at version 1
    pub fn new(key: DocKey, data: BTreeMap<String, Value>) -> Self {
        Self {
            key,
            version: 1,
            updated_at: chrono::Utc::now().to_rfc3339(),
            data,
        }
    }

    /// create a document from any serializable payload
    ///
    /// the payload must serialize to a JSON object
    pub fn from_serialize<T: Serialize>(key: DocKey, payload: &T) -> StorageResult<Self> {
        match serde_json::to_value(payload)? {
            Value::Object(map) => Ok(Self::new(key, map.into_iter().collect())),
            _ => Err(StorageError::Internal(format!(
                "document {} payload must be a JSON object",
                key
            ))),
        }
    }

    /// decode the payload into a typed value
    pub fn to_payload<T: DeserializeOwned>(&self) -> StorageResult<T> {
        let map: serde_json::Map<String, Value> = self.data.clone().into_iter().collect();
        Ok(serde_json::from_value(Value::Object(map))?)
    }

    /// the successor of `previous`, keeping this document's payload
    pub(crate) fn succeeding(mut self, previous: Option<&Document>) -> Self {
        self.version = previous.map(|p| p.version + 1).unwrap_or(1);
        self.updated_at = chrono::Utc::now().to_rfc3339();
        self
    }

    /// get a field value by name
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }
}

/// internal format for JSON serialization
///
/// uses `_` prefix for metadata fields to avoid clashing with payload fields
#[derive(Serialize, Deserialize)]
struct DocumentJson {
    #[serde(rename = "_key")]
    key: String,
    #[serde(rename = "_version")]
    version: u64,
    #[serde(rename = "_updated_at")]
    updated_at: String,
    #[serde(flatten)]
    data: BTreeMap<String, Value>,
}

/// serialize a document to JSON bytes
///
/// uses BTreeMap for consistent key ordering (important for git deduplication)
pub fn serialize_document(doc: &Document) -> StorageResult<Vec<u8>> {
    let json = DocumentJson {
        key: doc.key.as_str().to_string(),
        version: doc.version,
        updated_at: doc.updated_at.clone(),
        data: doc.data.clone(),
    };

    Ok(serde_json::to_vec_pretty(&json)?)
}

/// deserialize a document from JSON bytes
///
/// validates that the key in the JSON matches the expected key
pub fn deserialize_document(bytes: &[u8], expected_key: &DocKey) -> StorageResult<Document> {
    let json: DocumentJson = serde_json::from_slice(bytes)?;

    if json.key != expected_key.as_str() {
        return Err(StorageError::CorruptedData {
            path: format!("{}.json", expected_key).into(),
            reason: format!(
                "key mismatch: file name suggests '{}' but content has '{}'",
                expected_key, json.key
            ),
        });
    }

    Ok(Document {
        key: expected_key.clone(),
        version: json.version,
        updated_at: json.updated_at,
        data: json.data,
    })
}

/// write a document as a blob to the repository
pub(crate) fn write_blob(repo: &git2::Repository, doc: &Document) -> StorageResult<BlobId> {
    let bytes = serialize_document(doc)?;
    let oid = repo.blob(&bytes)?;
    Ok(BlobId::new(oid))
}

/// read a blob's content from the repository
pub(crate) fn read_blob(repo: &git2::Repository, blob_id: BlobId) -> StorageResult<Vec<u8>> {
    let blob = repo.find_blob(blob_id.raw())?;
    Ok(blob.content().to_vec())
}
