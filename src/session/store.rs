//! Key-value persistence backing the session service.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::TurnloopError;

/// Minimal storage interface: JSON values under `/`-separated string keys.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, TurnloopError>;
    async fn put(&self, key: &str, value: serde_json::Value) -> Result<(), TurnloopError>;
    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, TurnloopError>;
    /// Remove a key; missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<(), TurnloopError>;
}

/// Process-local store, mostly for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, TurnloopError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> Result<(), TurnloopError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, TurnloopError> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), TurnloopError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// File-backed store: one JSON file per key under a base directory.
///
/// # Example
/// ```no_run
/// use turnloop::session::{FileStore, KeyValueStore};
///
/// # async fn demo() -> Result<(), turnloop::error::TurnloopError> {
/// let store = FileStore::new_default();
/// store.put("app/demo", serde_json::json!({"theme": "dark"})).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn new_default() -> Self {
        Self::new(default_store_dir())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf, TurnloopError> {
        let mut path = self.base_dir.clone();
        let mut segments = key.split('/').peekable();
        while let Some(segment) = segments.next() {
            if segment.is_empty() {
                return Err(TurnloopError::Store(format!("invalid store key '{key}'")));
            }
            let encoded = encode_segment(segment);
            if segments.peek().is_some() {
                path.push(encoded);
            } else {
                path.push(format!("{encoded}.json"));
            }
        }
        Ok(path)
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, TurnloopError> {
        let path = self.entry_path(key)?;
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let record: StoreRecord = serde_json::from_str(&raw)?;
        Ok(Some(record.value))
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> Result<(), TurnloopError> {
        let path = self.entry_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let record = StoreRecord {
            version: 1,
            key: key.to_string(),
            value,
            saved_at: Utc::now(),
        };
        let serialized = serde_json::to_vec_pretty(&record)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serialized).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, TurnloopError> {
        let mut keys = Vec::new();
        let mut pending = vec![(self.base_dir.clone(), String::new())];
        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if entry.file_type().await?.is_dir() {
                    let key = format!("{key_prefix}{}/", decode_segment(&name)?);
                    pending.push((entry.path(), key));
                } else if let Some(stem) = name.strip_suffix(".json") {
                    let key = format!("{key_prefix}{}", decode_segment(stem)?);
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), TurnloopError> {
        let path = self.entry_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreRecord {
    version: u32,
    key: String,
    value: serde_json::Value,
    saved_at: DateTime<Utc>,
}

fn default_store_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "turnloop")
        .map(|dirs| dirs.data_dir().join("sessions"))
        .unwrap_or_else(|| PathBuf::from(".turnloop/sessions"))
}

/// Reversible file-name encoding: alphanumerics, `-` and `_` pass through,
/// everything else becomes `%XX`.
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn decode_segment(encoded: &str) -> Result<String, TurnloopError> {
    let invalid = || TurnloopError::Store(format!("unrecognized store file '{encoded}'"));
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3).ok_or_else(invalid)?;
            out.push(u8::from_str_radix(hex, 16).map_err(|_| invalid())?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, FileStore) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn segments_round_trip_through_encoding() {
        for raw in ["plain", "with space", "dots.and/slash", "ünï", "%"] {
            assert_eq!(decode_segment(&encode_segment(raw)).unwrap(), raw);
        }
        assert!(!encode_segment("..").contains('.'));
    }

    #[tokio::test]
    async fn file_store_put_get_delete() {
        let (_dir, store) = temp_store();
        store.put("app/demo", json!({"theme": "dark"})).await.unwrap();

        assert_eq!(
            store.get("app/demo").await.unwrap(),
            Some(json!({"theme": "dark"}))
        );

        store.delete("app/demo").await.unwrap();
        assert_eq!(store.get("app/demo").await.unwrap(), None);
        store.delete("app/demo").await.unwrap();
    }

    #[tokio::test]
    async fn file_store_lists_by_prefix() {
        let (_dir, store) = temp_store();
        store.put("session/a/u 1/s1", json!(1)).await.unwrap();
        store.put("session/a/u 1/s2", json!(2)).await.unwrap();
        store.put("user/a/u 1", json!(3)).await.unwrap();

        let keys = store.list("session/a/").await.unwrap();
        assert_eq!(keys, vec!["session/a/u 1/s1", "session/a/u 1/s2"]);
        assert_eq!(store.list("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn file_store_rejects_empty_segments() {
        let (_dir, store) = temp_store();
        let err = store.put("app//x", json!(1)).await.unwrap_err();
        assert!(matches!(err, TurnloopError::Store(_)));
    }

    #[tokio::test]
    async fn memory_store_lists_sorted() {
        let store = MemoryStore::new();
        store.put("b", json!(1)).await.unwrap();
        store.put("a", json!(1)).await.unwrap();
        store.put("c/x", json!(1)).await.unwrap();
        assert_eq!(store.list("").await.unwrap(), vec!["a", "b", "c/x"]);
        assert_eq!(store.list("c/").await.unwrap(), vec!["c/x"]);
    }
}
