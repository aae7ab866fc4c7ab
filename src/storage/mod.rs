//! # Storage Module - Key/Value Persistence Layer
//!
//! Directory state is persisted as a single string value under one key of an
//! asynchronous key/value store. This module provides:
//!
//! - [`KeyValueStore`] - the minimal async `get`/`set`/`del` contract
//! - [`SledStore`] - embedded sled database, used by the `meshdir` binary
//! - [`MemoryStore`] - in-process map, used by tests and ephemeral sessions
//! - [`PersistentStorage`] - codec-aware wrapper writing `{ "v": <version>, "state": ... }`
//!
//! ## Failure Handling
//!
//! Reads never fail from the caller's point of view: a missing key, a store
//! error, a parse error, or a schema version mismatch all degrade to `None`
//! ("no persisted state") after being logged. Writes are logged on failure and
//! report success as a `bool`; in-memory state is never touched by either.
//!
//! ## Usage
//!
//! ```rust
//! use meshdir::codec::Value;
//! use meshdir::storage::{MemoryStore, PersistentStorage};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let storage = PersistentStorage::new(Arc::new(MemoryStore::new()), 1);
//! storage.set_item("nodedb", &Value::Map(vec![])).await;
//! assert_eq!(storage.get_item("nodedb").await, Some(Value::Map(vec![])));
//! # }
//! ```

use async_trait::async_trait;
use log::{debug, error, warn};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::codec::{Codec, Value};
use crate::metrics;

/// Errors raised by key/value store backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Wrapper around sled's error type.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Wrapper around IO errors (directory creation, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored bytes were not valid UTF-8.
    #[error("utf-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Asynchronous string-keyed, string-valued store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: String) -> Result<(), StorageError>;
    async fn del(&self, key: &str) -> Result<(), StorageError>;
}

/// In-process store backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.items.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.items().insert(key.to_string(), value);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StorageError> {
        self.items().remove(key);
        Ok(())
    }
}

const TREE_PERSIST: &str = "meshdir_persist";

/// Sled-backed store. All keys live in a dedicated tree.
pub struct SledStore {
    _db: sled::Db,
    tree: sled::Tree,
}

impl SledStore {
    /// Open (or create) the store rooted at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path_ref = path.as_ref();
        std::fs::create_dir_all(path_ref)?;
        let db = sled::open(path_ref)?;
        let tree = db.open_tree(TREE_PERSIST)?;
        debug!("Opened sled store at {}", path_ref.display());
        Ok(Self { _db: db, tree })
    }
}

#[async_trait]
impl KeyValueStore for SledStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.tree.get(key.as_bytes())? {
            Some(raw) => Ok(Some(String::from_utf8(raw.to_vec())?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.tree.insert(key.as_bytes(), value.into_bytes())?;
        self.tree.flush_async().await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StorageError> {
        self.tree.remove(key.as_bytes())?;
        self.tree.flush_async().await?;
        Ok(())
    }
}

/// Codec-aware wrapper around a [`KeyValueStore`].
pub struct PersistentStorage {
    store: Arc<dyn KeyValueStore>,
    codec: Codec,
    version: u32,
}

impl PersistentStorage {
    pub fn new(store: Arc<dyn KeyValueStore>, version: u32) -> Self {
        Self::with_codec(store, Codec::new(), version)
    }

    /// Use a codec carrying extra handlers.
    pub fn with_codec(store: Arc<dyn KeyValueStore>, codec: Codec, version: u32) -> Self {
        Self {
            store,
            codec,
            version,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Read and decode the state stored under `name`.
    pub async fn get_item(&self, name: &str) -> Option<Value> {
        let text = match self.store.get(name).await {
            Ok(Some(text)) => text,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read persisted state '{}': {}", name, e);
                return None;
            }
        };
        let payload: serde_json::Value = match serde_json::from_str(&text) {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to parse persisted state '{}': {}", name, e);
                return None;
            }
        };
        let found = payload.get("v").and_then(|v| v.as_u64());
        if found != Some(self.version as u64) {
            warn!(
                "Discarding persisted state '{}': schema version {:?}, expected {}",
                name, found, self.version
            );
            return None;
        }
        let state = payload.get("state").cloned().unwrap_or_default();
        match self.codec.revive(state) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Failed to decode persisted state '{}': {}", name, e);
                None
            }
        }
    }

    /// Encode and write `state` under `name`. Returns whether the write landed.
    pub async fn set_item(&self, name: &str, state: &Value) -> bool {
        let encoded = match self.codec.to_json(state) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to encode state '{}': {}", name, e);
                metrics::inc_persist_failed();
                return false;
            }
        };
        let text = json!({ "v": self.version, "state": encoded }).to_string();
        match self.store.set(name, text).await {
            Ok(()) => {
                metrics::inc_persist_written();
                true
            }
            Err(e) => {
                error!("Failed to write state '{}': {}", name, e);
                metrics::inc_persist_failed();
                false
            }
        }
    }

    pub async fn remove_item(&self, name: &str) -> bool {
        match self.store.del(name).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to remove state '{}': {}", name, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn payload_carries_version_and_envelopes() {
        let store = Arc::new(MemoryStore::new());
        let storage = PersistentStorage::new(store.clone(), 3);
        let state = Value::Map(vec![(Value::from(1u32), Value::Bytes(Bytes::from_static(&[9])))]);
        assert!(storage.set_item("k", &state).await);
        let raw = store.get("k").await.unwrap().unwrap();
        assert_eq!(
            raw,
            r#"{"state":{"__datatype":"Map","value":[[1,{"__datatype":"Uint8Array","value":[9]}]]},"v":3}"#
        );
        assert_eq!(storage.get_item("k").await, Some(state));
    }

    #[tokio::test]
    async fn corrupt_payload_reads_as_none() {
        let store = Arc::new(MemoryStore::new());
        store.set("k", "{\"v\":1,\"state\":".to_string()).await.unwrap();
        let storage = PersistentStorage::new(store, 1);
        assert_eq!(storage.get_item("k").await, None);
    }

    #[tokio::test]
    async fn version_mismatch_reads_as_none() {
        let store = Arc::new(MemoryStore::new());
        PersistentStorage::new(store.clone(), 1)
            .set_item("k", &Value::Null)
            .await;
        assert_eq!(PersistentStorage::new(store, 2).get_item("k").await, None);
    }

    #[tokio::test]
    async fn malformed_envelope_reads_as_none() {
        let store = Arc::new(MemoryStore::new());
        store
            .set("k", r#"{"v":1,"state":{"__datatype":"Map","value":"x"}}"#.to_string())
            .await
            .unwrap();
        assert_eq!(PersistentStorage::new(store, 1).get_item("k").await, None);
    }

    #[tokio::test]
    async fn remove_item_deletes_key() {
        let store = Arc::new(MemoryStore::new());
        let storage = PersistentStorage::new(store.clone(), 1);
        storage.set_item("k", &Value::Bool(true)).await;
        assert!(storage.remove_item("k").await);
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sled_store_round_trips() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = SledStore::open(tmp.path().join("db")).expect("open sled");
        store.set("a", "hello".to_string()).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("hello"));
        store.del("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }
}
