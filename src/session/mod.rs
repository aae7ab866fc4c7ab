//! # Device Connection Session
//!
//! Lifecycle state machine for one device connection. A session wraps a
//! [`MeshDevice`] (the transport-backed protocol client) and its stream of
//! [`DeviceEvent`]s, and turns them into a small set of high-level events
//! published through [`SessionEvents`].
//!
//! ## States
//!
//! ```text
//!  DISCONNECTED ──connect()──▶ CONFIGURING ──ConfigComplete──▶ CONFIGURED
//!       │  ▲                        ▲                              │
//!  status │ status                  └──── status: Configuring ─────┘
//! Connected│ Disconnected                 (also from CONNECTED)
//!       ▼  │
//!    CONNECTED            any ──status: Sleep──▶ DEVICE_SLEEP
//! ```
//!
//! - A transport `Configured` status is ignored; only the handshake
//!   completion signal enters `CONFIGURED`.
//! - A completion signal that arrives after the session went `DISCONNECTED`
//!   is ignored.
//!
//! ## Node Batching
//!
//! While configuring, node-info packets are buffered and flushed as a single
//! `on_nodes_received` batch when the handshake completes. Afterwards each
//! node-info packet is published on its own. Disconnecting abandons an
//! unfinished handshake: buffered nodes are dropped and later node-info
//! packets are published individually until the next `connect()`.
//!
//! ## Heartbeat
//!
//! `connect()` starts a periodic keep-alive (default every 5 minutes). A failed
//! heartbeat is logged and counted; it never changes state or stops the timer.

mod events;

pub use events::{DirectoryUpdate, EventDispatcher, SessionEvents};

use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::Config;
use crate::logutil::{escape_log, node_label};
use crate::metrics;
pub use crate::nodedb::PacketMeta;
use crate::nodedb::NodeInfo;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Configuring,
    Configured,
    DeviceSleep,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Configuring => "CONFIGURING",
            ConnectionState::Configured => "CONFIGURED",
            ConnectionState::DeviceSleep => "DEVICE_SLEEP",
        };
        f.write_str(s)
    }
}

/// Link status as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Connected,
    Disconnected,
    Configuring,
    Configured,
    Sleep,
}

/// Low-level events a device client delivers to its session.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Status(DeviceStatus),
    MyNodeInfo { my_node_num: u32 },
    Config,
    ModuleConfig,
    Channel,
    NodeInfo(NodeInfo),
    Packet(PacketMeta),
    /// Handshake finished; carries the request id echoed by the firmware.
    ConfigComplete(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Configuration,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Configuration => f.write_str("configuration"),
        }
    }
}

/// Counter categories reported through `on_progress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    Config,
    ModuleConfig,
    Channel,
    Node,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub stage: ProgressKind,
    pub count: u32,
}

/// Handshake counters. Reset only by `connect()`; `configuring` is also
/// cleared when the link drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigProgress {
    pub nodes: u32,
    pub configs: u32,
    pub module_configs: u32,
    pub channels: u32,
    pub configuring: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Protocol client for one device, as seen by a session.
#[async_trait]
pub trait MeshDevice: Send + Sync {
    /// Request the configuration stream (want-config handshake).
    async fn configure(&self) -> anyhow::Result<()>;
    /// Keep-alive request.
    async fn heartbeat(&self) -> anyhow::Result<()>;
    fn disconnect(&self);
}

#[derive(Debug, Clone)]
pub struct SessionTuning {
    pub heartbeat_interval: Duration,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

impl From<&Config> for SessionTuning {
    fn from(config: &Config) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(config.session.heartbeat_interval_secs.max(1)),
        }
    }
}

struct SessionState {
    connection: ConnectionState,
    progress: ConfigProgress,
    pending_nodes: Vec<NodeInfo>,
}

/// State and dispatchers shared with the event pump.
struct SessionCore {
    state: Mutex<SessionState>,
    events: SessionEvents,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl SessionCore {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn heartbeat_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.heartbeat.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat_slot().take() {
            handle.abort();
            debug!("Heartbeat stopped");
        }
    }

    /// Events are published while the state lock is held so every observer
    /// sees one global order.
    fn set_state(&self, st: &mut SessionState, next: ConnectionState) {
        if st.connection != next {
            debug!("Connection state {} -> {}", st.connection, next);
            st.connection = next;
            self.events.on_connection_state_change.dispatch(next);
        }
    }

    /// The counters stay as diagnostics; only the buffer and flag go.
    fn abandon_handshake(&self, st: &mut SessionState) {
        if st.progress.configuring {
            debug!(
                "Abandoning handshake with {} buffered nodes",
                st.pending_nodes.len()
            );
        }
        st.progress.configuring = false;
        st.pending_nodes.clear();
    }

    fn progress(&self, stage: ProgressKind, count: u32) {
        self.events.on_progress.dispatch(ProgressUpdate { stage, count });
    }

    fn handle(&self, event: DeviceEvent) {
        let mut st = self.lock();
        match event {
            DeviceEvent::Status(status) => self.on_status(&mut st, status),
            DeviceEvent::MyNodeInfo { my_node_num } => {
                debug!("Device identity {}", node_label(my_node_num));
                self.events.on_my_node_info.dispatch(my_node_num);
                self.events
                    .on_directory_update
                    .dispatch(DirectoryUpdate::MyNodeInfo(my_node_num));
            }
            DeviceEvent::Config => {
                st.progress.configs += 1;
                self.progress(ProgressKind::Config, st.progress.configs);
            }
            DeviceEvent::ModuleConfig => {
                st.progress.module_configs += 1;
                self.progress(ProgressKind::ModuleConfig, st.progress.module_configs);
            }
            DeviceEvent::Channel => {
                st.progress.channels += 1;
                self.progress(ProgressKind::Channel, st.progress.channels);
            }
            DeviceEvent::NodeInfo(node) => {
                st.progress.nodes += 1;
                self.progress(ProgressKind::Node, st.progress.nodes);
                if st.progress.configuring {
                    st.pending_nodes.push(node);
                } else {
                    trace!(
                        "Node update {} ({})",
                        node_label(node.num),
                        escape_log(node.long_name().unwrap_or("-"))
                    );
                    metrics::inc_realtime_node_update();
                    self.events.on_nodes_received.dispatch(vec![node.clone()]);
                    self.events
                        .on_directory_update
                        .dispatch(DirectoryUpdate::Nodes(vec![node]));
                }
            }
            DeviceEvent::Packet(meta) => {
                self.events.on_mesh_packet.dispatch(meta.clone());
                self.events
                    .on_directory_update
                    .dispatch(DirectoryUpdate::Packet(meta));
            }
            DeviceEvent::ConfigComplete(id) => self.on_config_complete(&mut st, id),
        }
    }

    fn on_status(&self, st: &mut SessionState, status: DeviceStatus) {
        match status {
            DeviceStatus::Connected => {
                if matches!(
                    st.connection,
                    ConnectionState::Disconnected | ConnectionState::DeviceSleep
                ) {
                    self.set_state(st, ConnectionState::Connected);
                }
            }
            DeviceStatus::Disconnected => {
                self.stop_heartbeat();
                self.abandon_handshake(st);
                self.set_state(st, ConnectionState::Disconnected);
            }
            DeviceStatus::Configuring => {
                if matches!(
                    st.connection,
                    ConnectionState::Configured | ConnectionState::Connected
                ) {
                    st.progress.configuring = true;
                    self.set_state(st, ConnectionState::Configuring);
                }
            }
            DeviceStatus::Configured => {
                trace!("Ignoring transport configured status; waiting for handshake completion");
            }
            DeviceStatus::Sleep => {
                if st.connection != ConnectionState::Disconnected {
                    self.set_state(st, ConnectionState::DeviceSleep);
                }
            }
        }
    }

    fn on_config_complete(&self, st: &mut SessionState, id: u32) {
        if st.connection == ConnectionState::Disconnected {
            debug!("Ignoring config complete 0x{:08x} after disconnect", id);
            return;
        }
        st.progress.configuring = false;
        let batch = std::mem::take(&mut st.pending_nodes);
        info!(
            "Configuration complete (id=0x{:08x}): {} nodes, {} configs, {} module configs, {} channels",
            id, st.progress.nodes, st.progress.configs, st.progress.module_configs, st.progress.channels
        );
        if !batch.is_empty() {
            metrics::observe_node_batch(batch.len());
            self.events.on_nodes_received.dispatch(batch.clone());
            self.events
                .on_directory_update
                .dispatch(DirectoryUpdate::Nodes(batch));
        }
        self.events.on_stage_complete.dispatch(st.progress);
        self.events.on_configured.dispatch(());
        self.set_state(st, ConnectionState::Configured);
    }
}

/// Lifecycle owner for exactly one device connection.
pub struct ConnectionSession {
    device: Arc<dyn MeshDevice>,
    core: Arc<SessionCore>,
    tuning: SessionTuning,
    pump: Option<JoinHandle<()>>,
}

impl ConnectionSession {
    /// Create a session and start consuming `device_events`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(
        device: Arc<dyn MeshDevice>,
        mut device_events: mpsc::UnboundedReceiver<DeviceEvent>,
        tuning: SessionTuning,
    ) -> Self {
        let core = Arc::new(SessionCore {
            state: Mutex::new(SessionState {
                connection: ConnectionState::Disconnected,
                progress: ConfigProgress::default(),
                pending_nodes: Vec::new(),
            }),
            events: SessionEvents::default(),
            heartbeat: Mutex::new(None),
        });
        let pump_core = core.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = device_events.recv().await {
                pump_core.handle(event);
            }
            debug!("Device event stream closed");
        });
        Self {
            device,
            core,
            tuning,
            pump: Some(pump),
        }
    }

    pub fn events(&self) -> &SessionEvents {
        &self.core.events
    }

    /// Feed one device event synchronously, bypassing the pump.
    pub fn handle_event(&self, event: DeviceEvent) {
        self.core.handle(event);
    }

    /// Start the handshake. Resolves when the device client's `configure` call
    /// does; node and completion events keep flowing through the pump meanwhile.
    pub async fn connect(&self) -> Result<(), SessionError> {
        {
            let mut st = self.core.lock();
            st.progress = ConfigProgress {
                configuring: true,
                ..Default::default()
            };
            st.pending_nodes.clear();
            self.core.set_state(&mut st, ConnectionState::Configuring);
        }
        self.start_heartbeat();
        self.core.events.on_stage_start.dispatch(Stage::Configuration);
        info!("Requesting device configuration");

        if let Err(e) = self.device.configure().await {
            let err = SessionError::Handshake(e.to_string());
            error!("Device configuration failed: {}", e);
            self.core.events.on_error.dispatch(err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Tear down the link. Safe in any state.
    pub fn disconnect(&self) {
        self.core.stop_heartbeat();
        self.device.disconnect();
        let mut st = self.core.lock();
        self.core.abandon_handshake(&mut st);
        self.core.set_state(&mut st, ConnectionState::Disconnected);
    }

    /// Stop background timers without touching the transport.
    pub fn destroy(&self) {
        self.core.stop_heartbeat();
    }

    pub fn get_connection_state(&self) -> ConnectionState {
        self.core.lock().connection
    }

    pub fn get_config_progress(&self) -> ConfigProgress {
        self.core.lock().progress
    }

    pub fn heartbeat_running(&self) -> bool {
        self.core
            .heartbeat_slot()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    fn start_heartbeat(&self) {
        let device = self.device.clone();
        let period = self.tuning.heartbeat_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match device.heartbeat().await {
                    Ok(()) => {
                        metrics::inc_heartbeat_sent();
                        trace!("Heartbeat sent");
                    }
                    Err(e) => {
                        metrics::inc_heartbeat_failed();
                        warn!("Heartbeat failed (will retry next interval): {}", e);
                    }
                }
            }
        });
        if let Some(previous) = self.core.heartbeat_slot().replace(handle) {
            previous.abort();
        }
        debug!(
            "Heartbeat started (every {}s)",
            self.tuning.heartbeat_interval.as_secs()
        );
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.core.stop_heartbeat();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}
