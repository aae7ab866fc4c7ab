//! One dispatcher per event kind. Subscribers receive an unbounded channel and
//! only ever see the kind they subscribed to.

use std::sync::Mutex;
use tokio::sync::mpsc;

use super::{ConfigProgress, ConnectionState, ProgressUpdate, SessionError, Stage};
use crate::nodedb::{NodeInfo, PacketMeta};

/// Fan-out of a single event type to any number of subscribers.
///
/// Dispatch never blocks; subscribers that dropped their receiver are pruned
/// on the next dispatch.
pub struct EventDispatcher<T> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T> Default for EventDispatcher<T> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> EventDispatcher<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    pub fn dispatch(&self, event: T) {
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<T>>> {
        self.subscribers.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Directory-relevant events on one channel, in the order the device sent them.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryUpdate {
    MyNodeInfo(u32),
    Nodes(Vec<NodeInfo>),
    Packet(PacketMeta),
}

/// Every high-level signal a [`super::ConnectionSession`] emits.
#[derive(Default)]
pub struct SessionEvents {
    pub on_connection_state_change: EventDispatcher<ConnectionState>,
    pub on_stage_start: EventDispatcher<Stage>,
    pub on_progress: EventDispatcher<ProgressUpdate>,
    pub on_stage_complete: EventDispatcher<ConfigProgress>,
    pub on_configured: EventDispatcher<()>,
    /// Whole handshake batch once, then one single-element vec per update.
    pub on_nodes_received: EventDispatcher<Vec<NodeInfo>>,
    pub on_error: EventDispatcher<SessionError>,
    pub on_my_node_info: EventDispatcher<u32>,
    pub on_mesh_packet: EventDispatcher<PacketMeta>,
    /// Identity, node and packet events merged in arrival order.
    pub on_directory_update: EventDispatcher<DirectoryUpdate>,
}
