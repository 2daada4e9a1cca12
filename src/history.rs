use crate::client::Fields;
use crate::error::StorageError;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

pub const HISTORY_KEY_PREFIX: &str = "divination_history_";

pub const MAX_RECORDS_PER_KIND: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub prompt_summary: String,
    pub result_text: String,
    pub timestamp: i64,
    #[serde(default)]
    pub metadata: Fields,
}

/// The caller-provided part of a record; the store assigns id, type and time.
#[derive(Debug, Clone, Default)]
pub struct NewRecord {
    pub title: String,
    pub prompt_summary: String,
    pub result_text: String,
    pub metadata: Fields,
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.entries.lock().keys().cloned().collect())
    }
}

/// One `<key>.json` file per key inside a directory.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // Percent-encoded so distinct keys never share a file.
    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", urlencoding::encode(key)))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        match std::fs::remove_file(self.path_for(key)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            let Some(encoded) = name.strip_suffix(".json") else {
                continue;
            };
            match urlencoding::decode(encoded) {
                Ok(key) => keys.push(key.into_owned()),
                Err(err) => warn!(file = %name, error = %err, "skipping undecodable history file"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Completed readings, newest first, capped per type.
///
/// Every mutation is a full read-modify-write of one type's list under a
/// store-wide lock, since the backing store has no transactions.
pub struct HistoryStore {
    storage: Box<dyn KeyValueStore>,
    write_lock: Mutex<()>,
    capacity: usize,
}

impl HistoryStore {
    pub fn new(storage: impl KeyValueStore + 'static) -> Self {
        Self {
            storage: Box::new(storage),
            write_lock: Mutex::new(()),
            capacity: MAX_RECORDS_PER_KIND,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryStore::new())
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn save(&self, kind: &str, record: NewRecord) -> Result<HistoryRecord, StorageError> {
        let timestamp = Utc::now().timestamp_millis();
        let record = HistoryRecord {
            id: generate_id(timestamp),
            kind: kind.to_string(),
            title: record.title,
            prompt_summary: record.prompt_summary,
            result_text: record.result_text,
            timestamp,
            metadata: record.metadata,
        };

        let _guard = self.write_lock.lock();
        let key = storage_key(kind);
        let mut records = self.load(&key);
        records.insert(0, record.clone());
        records.truncate(self.capacity);
        self.storage.set(&key, &serde_json::to_string(&records)?)?;
        Ok(record)
    }

    /// Newest first; empty when nothing is stored or the data is unreadable.
    pub fn list_by_kind(&self, kind: &str) -> Vec<HistoryRecord> {
        self.load(&storage_key(kind))
    }

    pub fn list_all(&self) -> Vec<HistoryRecord> {
        let keys = match self.storage.keys() {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "failed to enumerate history");
                return Vec::new();
            }
        };

        let mut records: Vec<HistoryRecord> = keys
            .iter()
            .filter(|key| key.starts_with(HISTORY_KEY_PREFIX))
            .flat_map(|key| self.load(key))
            .collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records
    }

    pub fn find(&self, id: &str, kind: &str) -> Option<HistoryRecord> {
        self.list_by_kind(kind).into_iter().find(|record| record.id == id)
    }

    /// Remove one record. Storage errors are logged, not returned.
    pub fn delete(&self, id: &str, kind: &str) {
        let _guard = self.write_lock.lock();
        let key = storage_key(kind);
        let mut records = self.load(&key);
        let before = records.len();
        records.retain(|record| record.id != id);
        if records.len() == before {
            return;
        }

        let result = serde_json::to_string(&records)
            .map_err(StorageError::from)
            .and_then(|json| self.storage.set(&key, &json));
        if let Err(err) = result {
            warn!(%id, %kind, error = %err, "failed to delete history record");
        }
    }

    pub fn clear_all(&self) {
        let _guard = self.write_lock.lock();
        let keys = match self.storage.keys() {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "failed to enumerate history");
                return;
            }
        };

        for key in keys.iter().filter(|key| key.starts_with(HISTORY_KEY_PREFIX)) {
            if let Err(err) = self.storage.remove(key) {
                warn!(%key, error = %err, "failed to clear history");
            }
        }
    }

    fn load(&self, key: &str) -> Vec<HistoryRecord> {
        let raw = match self.storage.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(err) => {
                warn!(%key, error = %err, "failed to read history");
                return Vec::new();
            }
        };

        serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!(%key, error = %err, "ignoring corrupt history");
            Vec::new()
        })
    }
}

pub fn storage_key(kind: &str) -> String {
    format!("{HISTORY_KEY_PREFIX}{kind}")
}

// Timestamp plus random suffix: saves from independent controllers may land
// in the same millisecond.
fn generate_id(timestamp: i64) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{timestamp}-{}", &suffix[..9])
}
