use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{NodeDbError, NodeDirectory, NodeError, NodeInfo};
use crate::codec::{CodecError, Persist, Value};
use crate::config::Config;
use crate::metrics;
use crate::storage::PersistentStorage;

pub const DEFAULT_CAPACITY: usize = 10;
pub const DEFAULT_PERSIST_KEY: &str = "nodedb";

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of directories held at once. Clamped to at least 1.
    pub capacity: usize,
    /// Storage key the whole registry is written under.
    pub persist_key: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            persist_key: DEFAULT_PERSIST_KEY.to_string(),
        }
    }
}

impl From<&Config> for RegistryConfig {
    fn from(config: &Config) -> Self {
        Self {
            capacity: config.registry.capacity,
            persist_key: config.storage.persist_key.clone(),
        }
    }
}

/// Plain data of one directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct DirectoryData {
    pub(crate) identity_key: u32,
    pub(crate) my_node_num: Option<u32>,
    pub(crate) nodes: BTreeMap<u32, NodeInfo>,
    pub(crate) errors: BTreeMap<u32, NodeError>,
}

impl DirectoryData {
    fn new(identity_key: u32) -> Self {
        Self {
            identity_key,
            ..Default::default()
        }
    }
}

impl Persist for DirectoryData {
    fn to_value(&self) -> Result<Value, CodecError> {
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for (num, node) in &self.nodes {
            nodes.push((Value::from(*num), node.to_value()?));
        }
        let mut errors = Vec::with_capacity(self.errors.len());
        for (num, err) in &self.errors {
            errors.push((Value::from(*num), err.to_value()?));
        }
        let mut fields = BTreeMap::new();
        fields.insert("identityKey".to_string(), Value::from(self.identity_key));
        fields.insert(
            "myNodeNum".to_string(),
            self.my_node_num.map(Value::from).unwrap_or(Value::Null),
        );
        fields.insert("nodeMap".to_string(), Value::Map(nodes));
        fields.insert("nodeErrors".to_string(), Value::Map(errors));
        Ok(Value::Object(fields))
    }

    fn from_value(mut value: Value) -> Result<Self, CodecError> {
        let identity_key = value
            .get("identityKey")
            .and_then(Value::as_u64)
            .and_then(|k| u32::try_from(k).ok())
            .ok_or_else(|| CodecError::Shape("directory without identityKey".into()))?;
        let my_node_num = match value.get("myNodeNum") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| CodecError::Shape("myNodeNum is not a node number".into()))?,
            ),
        };
        let mut data = DirectoryData {
            identity_key,
            my_node_num,
            ..Default::default()
        };
        // An unreadable entry costs only itself, never the whole directory.
        for (key, entry) in map_entries(value.take("nodeMap"), "nodeMap")? {
            match entry_key(&key).and_then(|num| Ok((num, NodeInfo::from_value(entry)?))) {
                Ok((num, node)) => {
                    data.nodes.insert(num, node);
                }
                Err(e) => warn!(
                    "Directory {}: skipping unreadable node {:?}: {}",
                    identity_key, key, e
                ),
            }
        }
        for (key, entry) in map_entries(value.take("nodeErrors"), "nodeErrors")? {
            match entry_key(&key).and_then(|num| Ok((num, NodeError::from_value(entry)?))) {
                Ok((num, err)) => {
                    data.errors.insert(num, err);
                }
                Err(e) => warn!(
                    "Directory {}: skipping unreadable node error {:?}: {}",
                    identity_key, key, e
                ),
            }
        }
        Ok(data)
    }
}

fn map_entries(value: Option<Value>, field: &str) -> Result<Vec<(Value, Value)>, CodecError> {
    match value {
        Some(Value::Map(entries)) => Ok(entries),
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(_) => Err(CodecError::Shape(format!("{} is not a map", field))),
    }
}

fn entry_key(key: &Value) -> Result<u32, CodecError> {
    key.as_u64()
        .and_then(|k| u32::try_from(k).ok())
        .ok_or_else(|| CodecError::Shape(format!("map key {:?} is not a node number", key)))
}

/// Registry state shared between the registry, its directory handles and the
/// persistence writer.
pub(crate) struct RegistryInner {
    pub(crate) directories: HashMap<u32, DirectoryData>,
    /// Identity keys in insertion order; front is evicted first.
    order: VecDeque<u32>,
    capacity: usize,
    dirty_tx: Option<mpsc::UnboundedSender<()>>,
}

impl RegistryInner {
    fn new(capacity: usize) -> Self {
        Self {
            directories: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            dirty_tx: None,
        }
    }

    pub(crate) fn mark_dirty(&self) {
        if let Some(tx) = &self.dirty_tx {
            let _ = tx.send(());
        }
    }

    pub(crate) fn directory(&self, key: u32) -> Result<&DirectoryData, NodeDbError> {
        self.directories
            .get(&key)
            .ok_or(NodeDbError::DirectoryNotFound(key))
    }

    pub(crate) fn directory_mut(&mut self, key: u32) -> Result<&mut DirectoryData, NodeDbError> {
        self.directories
            .get_mut(&key)
            .ok_or(NodeDbError::DirectoryNotFound(key))
    }

    fn insert(&mut self, data: DirectoryData) {
        let key = data.identity_key;
        if self.directories.insert(key, data).is_none() {
            self.order.push_back(key);
        }
        while self.directories.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.directories.remove(&oldest).is_some() {
                metrics::inc_directory_evicted();
                info!(
                    "Evicted node directory {} (capacity {} reached)",
                    oldest, self.capacity
                );
            }
        }
    }

    fn remove(&mut self, key: u32) -> Option<DirectoryData> {
        let removed = self.directories.remove(&key);
        if removed.is_some() {
            self.order.retain(|k| *k != key);
        }
        removed
    }

    /// Record the device identity of `key`, absorbing or discarding any other
    /// directory already resolved to the same device.
    pub(crate) fn set_node_num(&mut self, key: u32, my_node_num: u32) -> Result<(), NodeDbError> {
        self.directory(key)?;
        let stale: Vec<u32> = self
            .order
            .iter()
            .copied()
            .filter(|k| {
                *k != key
                    && self
                        .directories
                        .get(k)
                        .is_some_and(|d| d.my_node_num == Some(my_node_num))
            })
            .collect();
        for other_key in stale {
            let Some(other) = self.remove(other_key) else {
                continue;
            };
            let current = self.directory_mut(key)?;
            if current.nodes.is_empty() {
                info!(
                    "Merging node directory {} into {} (device 0x{:08x}, {} nodes)",
                    other_key,
                    key,
                    my_node_num,
                    other.nodes.len()
                );
                current.nodes.extend(other.nodes);
                current.errors.extend(other.errors);
                metrics::inc_directory_merged();
            } else {
                info!(
                    "Dropping stale node directory {} for device 0x{:08x}; {} already has data",
                    other_key, my_node_num, key
                );
            }
        }
        self.directory_mut(key)?.my_node_num = Some(my_node_num);
        self.mark_dirty();
        Ok(())
    }

    fn snapshot(&self) -> Result<Value, CodecError> {
        let mut entries = Vec::with_capacity(self.order.len());
        for key in &self.order {
            if let Some(data) = self.directories.get(key) {
                entries.push((Value::from(*key), data.to_value()?));
            }
        }
        Ok(Value::Map(entries))
    }
}

/// Owner of every [`NodeDirectory`]; bounded, persisted, identity-merging.
pub struct NodeDirectoryRegistry {
    shared: Arc<Mutex<RegistryInner>>,
    storage: Option<Arc<PersistentStorage>>,
    persist_key: String,
    writer: Option<JoinHandle<()>>,
}

pub(crate) fn lock(shared: &Mutex<RegistryInner>) -> MutexGuard<'_, RegistryInner> {
    shared.lock().unwrap_or_else(|p| p.into_inner())
}

impl NodeDirectoryRegistry {
    /// In-memory registry with no persistence.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            shared: Arc::new(Mutex::new(RegistryInner::new(config.capacity))),
            storage: None,
            persist_key: config.persist_key,
            writer: None,
        }
    }

    /// Rehydrate from `storage` and keep it updated from a background writer.
    ///
    /// Must be called inside a Tokio runtime.
    pub async fn open(storage: PersistentStorage, config: RegistryConfig) -> Self {
        let storage = Arc::new(storage);
        let mut registry = Self::new(config);
        match storage.get_item(&registry.persist_key).await {
            Some(state) => {
                let restored = registry.restore(state);
                info!("Restored {} node directories", restored);
            }
            None => debug!("No persisted node directories, starting fresh"),
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        lock(&registry.shared).dirty_tx = Some(tx);
        let shared = registry.shared.clone();
        let writer_storage = storage.clone();
        let key = registry.persist_key.clone();
        registry.writer = Some(tokio::spawn(async move {
            while rx.recv().await.is_some() {
                // Collapse a burst of mutations into one write.
                while rx.try_recv().is_ok() {}
                persist(&shared, &writer_storage, &key).await;
            }
        }));
        registry.storage = Some(storage);
        registry
    }

    /// Return the directory for `identity_key`, creating it if needed.
    pub fn add_directory(&self, identity_key: u32) -> NodeDirectory {
        let mut inner = lock(&self.shared);
        if !inner.directories.contains_key(&identity_key) {
            debug!("Creating node directory {}", identity_key);
            inner.insert(DirectoryData::new(identity_key));
            inner.mark_dirty();
        }
        NodeDirectory::new(identity_key, self.shared.clone())
    }

    pub fn get_directory(&self, identity_key: u32) -> Option<NodeDirectory> {
        let inner = lock(&self.shared);
        inner
            .directories
            .contains_key(&identity_key)
            .then(|| NodeDirectory::new(identity_key, self.shared.clone()))
    }

    /// All directories in insertion order.
    pub fn get_directories(&self) -> Vec<NodeDirectory> {
        let inner = lock(&self.shared);
        inner
            .order
            .iter()
            .map(|key| NodeDirectory::new(*key, self.shared.clone()))
            .collect()
    }

    pub fn remove_directory(&self, identity_key: u32) -> bool {
        let mut inner = lock(&self.shared);
        let removed = inner.remove(identity_key).is_some();
        if removed {
            debug!("Removed node directory {}", identity_key);
            inner.mark_dirty();
        }
        removed
    }

    pub fn len(&self) -> usize {
        lock(&self.shared).directories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        lock(&self.shared).capacity
    }

    /// Encoded view of every directory, keyed by identity key in insertion order.
    pub fn snapshot(&self) -> Result<Value, CodecError> {
        lock(&self.shared).snapshot()
    }

    /// Replace the registry contents with persisted state. Directories that
    /// never learned their device identity are dropped. Returns how many were kept.
    pub fn restore(&self, state: Value) -> usize {
        let entries = match state {
            Value::Map(entries) => entries,
            other => {
                warn!("Ignoring persisted node directories: not a map ({:?})", other);
                return 0;
            }
        };
        let mut inner = lock(&self.shared);
        inner.directories.clear();
        inner.order.clear();
        for (key, value) in entries {
            let data = match DirectoryData::from_value(value) {
                Ok(d) => d,
                Err(e) => {
                    warn!("Skipping unreadable node directory {:?}: {}", key, e);
                    continue;
                }
            };
            if data.my_node_num.is_none() {
                debug!(
                    "Dropping orphaned node directory {} (device identity never resolved)",
                    data.identity_key
                );
                continue;
            }
            inner.insert(data);
        }
        inner.directories.len()
    }

    /// Stop the background writer after it has written every queued change,
    /// then write the final state. Use this at shutdown: a plain drop leaves
    /// the writer running detached, which only completes while the runtime
    /// keeps going.
    pub async fn close(mut self) -> bool {
        lock(&self.shared).dirty_tx = None;
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.await {
                warn!("Node directory writer ended abnormally: {}", e);
            }
        }
        self.flush().await
    }

    /// Write the current state now. Returns false when there is no storage or the write failed.
    pub async fn flush(&self) -> bool {
        match &self.storage {
            Some(storage) => persist(&self.shared, storage, &self.persist_key).await,
            None => false,
        }
    }
}

impl Drop for NodeDirectoryRegistry {
    fn drop(&mut self) {
        // Closing the dirty channel lets the detached writer drain queued
        // signals, write once more and exit.
        lock(&self.shared).dirty_tx = None;
        self.writer.take();
    }
}

async fn persist(shared: &Mutex<RegistryInner>, storage: &PersistentStorage, key: &str) -> bool {
    let snapshot = lock(shared).snapshot();
    match snapshot {
        Ok(state) => storage.set_item(key, &state).await,
        Err(e) => {
            error!("Failed to snapshot node directories: {}", e);
            metrics::inc_persist_failed();
            false
        }
    }
}
