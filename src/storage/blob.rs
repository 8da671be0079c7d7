//! Blob operations for record storage.
//!
//! Every record is stored as a separate JSON file. The body carries a small
//! metadata header (key, revision, timestamps) next to the typed fields of
//! whatever model the record encodes.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::error::{StorageError, StorageResult};
pub(crate) use crate::storage::types::{BlobId, RecordKey};

/// One row of a table: a model's fields plus bookkeeping.
///
/// On disk the bookkeeping fields carry a leading underscore so they can sit
/// next to the model's own fields in a single flat JSON object:
/// ```text
/// {"_key": "01hq...", "_revision": 2, "_created_at": "...", "_updated_at": "...", "number": 3}
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// key (must match filename without .json extension)
    pub key: RecordKey,
    /// bumped on every rewrite of the record
    pub revision: u64,
    pub created_at: String,
    pub updated_at: String,
    /// field values
    pub data: BTreeMap<String, Value>,
}

impl Record {
    /// creates a new record at revision 1
    pub fn new(key: RecordKey, data: BTreeMap<String, Value>) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            key,
            revision: 1,
            created_at: now.clone(),
            updated_at: now,
            data,
        }
    }

    /// encode any serializable model as a record body
    pub fn encode<T: Serialize>(key: RecordKey, model: &T) -> StorageResult<Self> {
        match serde_json::to_value(model)? {
            Value::Object(map) => Ok(Self::new(key, map.into_iter().collect())),
            _ => Err(StorageError::InvalidRecord(
                "record data must be a JSON object".to_string(),
            )),
        }
    }

    /// decode the record body back into a model
    pub fn decode<T: DeserializeOwned>(&self) -> StorageResult<T> {
        let map: serde_json::Map<String, Value> = self
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(serde_json::from_value(Value::Object(map))?)
    }

    /// create the next revision of this record with new field data
    pub fn with_update(self, new_data: BTreeMap<String, Value>) -> Self {
        Self {
            key: self.key,
            revision: self.revision + 1,
            created_at: self.created_at,
            updated_at: chrono::Utc::now().to_rfc3339(),
            data: new_data,
        }
    }

    /// re-encode a model into this record, keeping key and creation time
    pub fn with_model<T: Serialize>(self, model: &T) -> StorageResult<Self> {
        let fresh = Self::encode(self.key.clone(), model)?;
        Ok(self.with_update(fresh.data))
    }

    /// get a field value by name
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }
}

#[derive(Serialize, Deserialize)]
struct RecordJson {
    #[serde(rename = "_key")]
    key: String,
    #[serde(rename = "_revision")]
    revision: u64,
    #[serde(rename = "_created_at")]
    created_at: String,
    #[serde(rename = "_updated_at")]
    updated_at: String,
    #[serde(flatten)]
    data: BTreeMap<String, Value>,
}

/// Encode `record` as the bytes of its blob. Field order is sorted, so equal
/// records always produce the same blob id.
pub fn serialize_record(record: &Record) -> StorageResult<Vec<u8>> {
    let json = RecordJson {
        key: record.key.as_str().to_string(),
        revision: record.revision,
        created_at: record.created_at.clone(),
        updated_at: record.updated_at.clone(),
        data: record.data.clone(),
    };

    Ok(serde_json::to_vec_pretty(&json)?)
}

/// Decode a blob stored under `{expected_key}.json`.
pub fn deserialize_record(bytes: &[u8], expected_key: &RecordKey) -> StorageResult<Record> {
    let json: RecordJson = serde_json::from_slice(bytes)?;

    if json.key != expected_key.as_str() {
        return Err(StorageError::CorruptedData {
            path: format!("{}.json", expected_key).into(),
            reason: format!(
                "key mismatch: file name suggests '{}' but content has '{}'",
                expected_key, json.key
            ),
        });
    }

    Ok(Record {
        key: expected_key.clone(),
        revision: json.revision,
        created_at: json.created_at,
        updated_at: json.updated_at,
        data: json.data,
    })
}

pub fn write_blob(repo: &git2::Repository, record: &Record) -> StorageResult<BlobId> {
    let bytes = serialize_record(record)?;
    let oid = repo.blob(&bytes)?;
    Ok(BlobId::new(oid))
}

pub fn read_blob(repo: &git2::Repository, blob_id: BlobId) -> StorageResult<Vec<u8>> {
    let blob = repo.find_blob(blob_id.raw())?;
    Ok(blob.content().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        number: u64,
        base: Option<String>,
    }

    #[test]
    fn test_encode_decode_model() {
        let key = RecordKey::new("v1").unwrap();
        let model = Sample {
            name: "alpha".to_string(),
            number: 3,
            base: None,
        };

        let record = Record::encode(key.clone(), &model).unwrap();
        assert_eq!(record.key, key);
        assert_eq!(record.revision, 1);
        assert_eq!(record.get("number"), Some(&Value::Number(3.into())));

        let bytes = serialize_record(&record).unwrap();
        let restored = deserialize_record(&bytes, &key).unwrap();
        let decoded: Sample = restored.decode().unwrap();
        assert_eq!(decoded, model);
    }

    #[test]
    fn test_encode_rejects_non_objects() {
        let key = RecordKey::new("v1").unwrap();
        let result = Record::encode(key, &42u32);
        assert!(matches!(result, Err(StorageError::InvalidRecord(_))));
    }

    #[test]
    fn test_bookkeeping_fields_are_prefixed() {
        let mut data = BTreeMap::new();
        data.insert("zeta".to_string(), Value::Bool(true));
        data.insert("alpha".to_string(), Value::Null);
        let record = Record::new(RecordKey::new("abc").unwrap(), data);

        let text = String::from_utf8(serialize_record(&record).unwrap()).unwrap();
        assert!(text.contains("\"_key\": \"abc\""));
        assert!(text.contains("\"_revision\": 1"));
        assert!(text.find("\"alpha\"").unwrap() < text.find("\"zeta\"").unwrap());
    }

    #[test]
    fn test_equal_records_share_a_blob() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = git2::Repository::init(dir.path()).unwrap();
        let record = Record::new(RecordKey::new("same").unwrap(), BTreeMap::new());

        let first = write_blob(&repo, &record).unwrap();
        let second = write_blob(&repo, &record.clone()).unwrap();
        assert_eq!(first, second);
        assert_eq!(read_blob(&repo, first).unwrap(), serialize_record(&record).unwrap());
    }

    #[test]
    fn test_with_model_bumps_revision() {
        let key = RecordKey::new("r").unwrap();
        let first = Sample {
            name: "a".to_string(),
            number: 1,
            base: None,
        };
        let second = Sample {
            name: "a".to_string(),
            number: 2,
            base: Some("x".to_string()),
        };

        let record = Record::encode(key, &first).unwrap();
        let created = record.created_at.clone();
        let updated = record.with_model(&second).unwrap();

        assert_eq!(updated.revision, 2);
        assert_eq!(updated.created_at, created);
        assert_eq!(updated.decode::<Sample>().unwrap(), second);
    }

    #[test]
    fn test_blob_under_wrong_name_is_corrupt() {
        let bytes = serialize_record(&Record::new(RecordKey::new("stored").unwrap(), BTreeMap::new())).unwrap();

        match deserialize_record(&bytes, &RecordKey::new("filename").unwrap()) {
            Err(StorageError::CorruptedData { path, .. }) => assert_eq!(path, std::path::PathBuf::from("filename.json")),
            other => panic!("expected corrupted data, got {:?}", other),
        }
    }
}
