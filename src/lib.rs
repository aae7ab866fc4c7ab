//! # Meshdir - Node Directory and Session Layer for Meshtastic Clients
//!
//! Meshdir keeps track of the devices a Meshtastic client talks to and of every
//! mesh peer those devices have heard from.
//!
//! ## Features
//!
//! - **Connection Sessions**: A per-device state machine that drives the configuration
//!   handshake, batches the initial node dump, keeps the link alive with a heartbeat and
//!   republishes everything as typed event streams.
//! - **Node Directories**: One cache of peers per device, bounded in number, with
//!   automatic merging when a reconnecting device turns out to be one seen before.
//! - **Persistence**: Directories survive restarts through a versioned JSON payload
//!   stored in sled, with a codec that preserves maps and byte buffers.
//! - **Async Design**: Built with Tokio; persistence writes happen off the caller's path.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshdir::config::Config;
//! use meshdir::nodedb::{new_identity_key, NodeDirectoryRegistry};
//! use meshdir::storage::{PersistentStorage, SledStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("meshdir.toml").await?;
//!     let store = Arc::new(SledStore::open(&config.storage.data_dir)?);
//!     let storage = PersistentStorage::new(store, config.registry.schema_version);
//!     let registry = NodeDirectoryRegistry::open(storage, (&config).into()).await;
//!
//!     let directory = registry.add_directory(new_identity_key());
//!     println!("{} nodes known", directory.get_nodes_length()?);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`session`] - Device connection lifecycle and event streams
//! - [`nodedb`] - Node records, directories and the registry
//! - [`sync`] - Feeds session events into a directory
//! - [`codec`] - Type-preserving JSON codec
//! - [`storage`] - Key-value stores and the versioned persistence envelope
//! - [`config`] - Configuration management
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐      events      ┌─────────────────┐
//! │ ConnectionSession│ ───────────────▶ │  NodeDirectory  │
//! └─────────────────┘   (sync task)    └─────────────────┘
//!          │                                    │
//! ┌─────────────────┐                  ┌─────────────────┐
//! │   MeshDevice    │                  │    Registry     │ ← eviction, merge
//! └─────────────────┘                  └─────────────────┘
//!                                               │
//!                                      ┌─────────────────┐
//!                                      │ Codec + Storage │
//!                                      └─────────────────┘
//! ```

pub mod codec;
pub mod config;
pub mod logutil;
pub mod metrics;
pub mod nodedb;
pub mod session;
pub mod storage;
pub mod sync;
