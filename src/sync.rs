//! Glue between a [`ConnectionSession`] and the [`NodeDirectory`] of the same
//! device: identity, node batches and packet metadata are applied in the
//! order the device delivered them.

use log::{debug, warn};
use tokio::task::JoinHandle;

use crate::logutil::node_label;
use crate::nodedb::{NodeDbError, NodeDirectory};
use crate::session::{ConnectionSession, DirectoryUpdate};

/// Spawn a task applying `session` events to `directory`.
///
/// The task ends when the session is dropped or the directory leaves its
/// registry.
pub fn spawn_directory_sync(session: &ConnectionSession, directory: NodeDirectory) -> JoinHandle<()> {
    let mut updates = session.events().on_directory_update.subscribe();

    tokio::spawn(async move {
        let key = directory.identity_key();
        let result: Result<(), NodeDbError> = async {
            while let Some(update) = updates.recv().await {
                match update {
                    DirectoryUpdate::MyNodeInfo(num) => {
                        debug!("Directory {} belongs to {}", key, node_label(num));
                        directory.set_node_num(num)?;
                    }
                    DirectoryUpdate::Nodes(batch) => {
                        for node in batch {
                            directory.add_node(node)?;
                        }
                    }
                    DirectoryUpdate::Packet(meta) => directory.process_packet(&meta)?,
                }
            }
            Ok(())
        }
        .await;
        match result {
            Ok(()) => debug!("Directory sync for {} finished", key),
            Err(e) => warn!("Directory sync for {} stopped: {}", key, e),
        }
    })
}
