//! Process-wide counters for session and directory activity.
//! Read with [`snapshot`]; the `status` command prints them.
use std::sync::atomic::{AtomicU64, Ordering};

static HEARTBEATS_SENT: AtomicU64 = AtomicU64::new(0);
static HEARTBEATS_FAILED: AtomicU64 = AtomicU64::new(0);
static NODE_BATCHES_FLUSHED: AtomicU64 = AtomicU64::new(0);
static BATCHED_NODES: AtomicU64 = AtomicU64::new(0);
static REALTIME_NODE_UPDATES: AtomicU64 = AtomicU64::new(0);
static DIRECTORIES_EVICTED: AtomicU64 = AtomicU64::new(0);
static DIRECTORIES_MERGED: AtomicU64 = AtomicU64::new(0);
static PERSIST_WRITTEN: AtomicU64 = AtomicU64::new(0);
static PERSIST_FAILED: AtomicU64 = AtomicU64::new(0);

pub fn inc_heartbeat_sent() {
    HEARTBEATS_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_heartbeat_failed() {
    HEARTBEATS_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn observe_node_batch(len: usize) {
    NODE_BATCHES_FLUSHED.fetch_add(1, Ordering::Relaxed);
    BATCHED_NODES.fetch_add(len as u64, Ordering::Relaxed);
}
pub fn inc_realtime_node_update() {
    REALTIME_NODE_UPDATES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_directory_evicted() {
    DIRECTORIES_EVICTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_directory_merged() {
    DIRECTORIES_MERGED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_persist_written() {
    PERSIST_WRITTEN.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_persist_failed() {
    PERSIST_FAILED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub heartbeats_sent: u64,
    pub heartbeats_failed: u64,
    pub node_batches_flushed: u64,
    pub batched_nodes: u64,
    pub realtime_node_updates: u64,
    pub directories_evicted: u64,
    pub directories_merged: u64,
    pub persist_written: u64,
    pub persist_failed: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        heartbeats_sent: HEARTBEATS_SENT.load(Ordering::Relaxed),
        heartbeats_failed: HEARTBEATS_FAILED.load(Ordering::Relaxed),
        node_batches_flushed: NODE_BATCHES_FLUSHED.load(Ordering::Relaxed),
        batched_nodes: BATCHED_NODES.load(Ordering::Relaxed),
        realtime_node_updates: REALTIME_NODE_UPDATES.load(Ordering::Relaxed),
        directories_evicted: DIRECTORIES_EVICTED.load(Ordering::Relaxed),
        directories_merged: DIRECTORIES_MERGED.load(Ordering::Relaxed),
        persist_written: PERSIST_WRITTEN.load(Ordering::Relaxed),
        persist_failed: PERSIST_FAILED.load(Ordering::Relaxed),
    }
}
