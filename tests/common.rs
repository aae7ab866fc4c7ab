//! Test utilities & fixtures.
//! Provides a scripted device client and small helpers for draining event streams.
#![allow(dead_code)] // Not every test binary uses every helper.

use async_trait::async_trait;
use meshdir::nodedb::{NodeInfo, User};
use meshdir::session::DeviceEvent;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Device client whose handshake replays a prepared event script.
pub struct ScriptedDevice {
    tx: mpsc::UnboundedSender<DeviceEvent>,
    script: Mutex<Vec<DeviceEvent>>,
    pub fail_configure: AtomicBool,
    pub fail_heartbeat: AtomicBool,
    pub configures: AtomicUsize,
    pub heartbeats: AtomicUsize,
    pub disconnects: AtomicUsize,
}

impl ScriptedDevice {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let device = Arc::new(Self {
            tx,
            script: Mutex::new(Vec::new()),
            fail_configure: AtomicBool::new(false),
            fail_heartbeat: AtomicBool::new(false),
            configures: AtomicUsize::new(0),
            heartbeats: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        });
        (device, rx)
    }

    /// Events sent on the next `configure` call.
    pub fn script(&self, events: Vec<DeviceEvent>) {
        *self.script.lock().unwrap() = events;
    }

    /// Push an unsolicited event (status change, realtime packet).
    pub fn emit(&self, event: DeviceEvent) {
        self.tx.send(event).unwrap();
    }
}

#[async_trait]
impl meshdir::session::MeshDevice for ScriptedDevice {
    async fn configure(&self) -> anyhow::Result<()> {
        self.configures.fetch_add(1, Ordering::SeqCst);
        if self.fail_configure.load(Ordering::SeqCst) {
            anyhow::bail!("radio not responding");
        }
        let events: Vec<DeviceEvent> = self.script.lock().unwrap().drain(..).collect();
        for event in events {
            self.tx.send(event)?;
        }
        Ok(())
    }

    async fn heartbeat(&self) -> anyhow::Result<()> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        if self.fail_heartbeat.load(Ordering::SeqCst) {
            anyhow::bail!("write timed out");
        }
        Ok(())
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Everything currently queued on `rx`.
pub fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}

/// Poll `check` until it holds or a second has passed.
pub async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

pub fn named_node(num: u32, long_name: &str) -> NodeInfo {
    NodeInfo {
        user: Some(User {
            id: format!("!{:08x}", num),
            long_name: long_name.to_string(),
            short_name: long_name.chars().take(4).collect(),
            ..Default::default()
        }),
        ..NodeInfo::new(num)
    }
}
