use chrono::Utc;
use log::debug;
use std::sync::{Arc, Mutex};

use super::registry::{lock, DirectoryData, RegistryInner};
use super::{NodeDbError, NodeError, NodeInfo, PacketMeta, Position, User};
use crate::logutil::{escape_log, node_label};

/// Handle onto one directory held by a [`super::NodeDirectoryRegistry`].
///
/// Cheap to clone. Every method re-resolves the directory by identity key and
/// returns [`NodeDbError::DirectoryNotFound`] once the registry has dropped it.
#[derive(Clone)]
pub struct NodeDirectory {
    identity_key: u32,
    shared: Arc<Mutex<RegistryInner>>,
}

impl std::fmt::Debug for NodeDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeDirectory")
            .field("identity_key", &self.identity_key)
            .finish()
    }
}

impl NodeDirectory {
    pub(crate) fn new(identity_key: u32, shared: Arc<Mutex<RegistryInner>>) -> Self {
        Self {
            identity_key,
            shared,
        }
    }

    fn read<R>(&self, f: impl FnOnce(&DirectoryData) -> R) -> Result<R, NodeDbError> {
        let inner = lock(&self.shared);
        Ok(f(inner.directory(self.identity_key)?))
    }

    fn write<R>(&self, f: impl FnOnce(&mut DirectoryData) -> R) -> Result<R, NodeDbError> {
        let mut inner = lock(&self.shared);
        let out = f(inner.directory_mut(self.identity_key)?);
        inner.mark_dirty();
        Ok(out)
    }

    pub fn identity_key(&self) -> u32 {
        self.identity_key
    }

    pub fn my_node_num(&self) -> Result<Option<u32>, NodeDbError> {
        self.read(|d| d.my_node_num)
    }

    /// Resolve this directory's device identity. See
    /// [`super::NodeDirectoryRegistry`] for the merge rules.
    pub fn set_node_num(&self, my_node_num: u32) -> Result<(), NodeDbError> {
        lock(&self.shared).set_node_num(self.identity_key, my_node_num)
    }

    /// Insert or fully replace the node keyed by `node.num`.
    pub fn add_node(&self, node: NodeInfo) -> Result<(), NodeDbError> {
        self.write(|d| {
            debug!(
                "Directory {}: node {} ({})",
                d.identity_key,
                node_label(node.num),
                escape_log(node.long_name().unwrap_or("-"))
            );
            d.nodes.insert(node.num, node);
        })
    }

    pub fn remove_node(&self, num: u32) -> Result<(), NodeDbError> {
        self.write(|d| {
            d.nodes.remove(&num);
        })
    }

    pub fn get_node(&self, num: u32) -> Result<Option<NodeInfo>, NodeDbError> {
        self.read(|d| d.nodes.get(&num).cloned())
    }

    /// Every node except this device's own entry.
    pub fn get_nodes(&self) -> Result<Vec<NodeInfo>, NodeDbError> {
        self.get_nodes_where(|_| true)
    }

    pub fn get_nodes_where<F>(&self, predicate: F) -> Result<Vec<NodeInfo>, NodeDbError>
    where
        F: Fn(&NodeInfo) -> bool,
    {
        self.read(|d| {
            d.nodes
                .iter()
                .filter(|(num, _)| Some(**num) != d.my_node_num)
                .map(|(_, node)| node)
                .filter(|node| predicate(*node))
                .cloned()
                .collect()
        })
    }

    /// Raw node count, self included.
    pub fn get_nodes_length(&self) -> Result<usize, NodeDbError> {
        self.read(|d| d.nodes.len())
    }

    pub fn get_my_node(&self) -> Result<Option<NodeInfo>, NodeDbError> {
        self.read(|d| d.my_node_num.and_then(|n| d.nodes.get(&n).cloned()))
    }

    pub fn set_node_error(&self, num: u32, error: impl Into<String>) -> Result<(), NodeDbError> {
        let error = error.into();
        self.write(|d| {
            d.errors.insert(num, NodeError { node: num, error });
        })
    }

    pub fn clear_node_error(&self, num: u32) -> Result<(), NodeDbError> {
        self.write(|d| {
            d.errors.remove(&num);
        })
    }

    pub fn get_node_error(&self, num: u32) -> Result<Option<NodeError>, NodeDbError> {
        self.read(|d| d.errors.get(&num).cloned())
    }

    pub fn has_node_error(&self, num: u32) -> Result<bool, NodeDbError> {
        self.read(|d| d.errors.contains_key(&num))
    }

    pub fn error_count(&self) -> Result<usize, NodeDbError> {
        self.read(|d| d.errors.len())
    }

    /// Refresh reception details for the sender of any mesh packet.
    pub fn process_packet(&self, meta: &PacketMeta) -> Result<(), NodeDbError> {
        let heard = if meta.rx_time > 0 {
            meta.rx_time
        } else {
            now_secs()
        };
        self.write(|d| {
            let node = d
                .nodes
                .entry(meta.from)
                .or_insert_with(|| NodeInfo::new(meta.from));
            node.last_heard = heard;
            node.snr = meta.rx_snr;
            node.channel = meta.channel;
            node.via_mqtt = meta.via_mqtt;
            if let Some(hops) = meta.hops_away() {
                node.hops_away = Some(hops);
            }
        })
    }

    pub fn add_user(&self, from: u32, user: User) -> Result<(), NodeDbError> {
        self.write(|d| {
            d.nodes
                .entry(from)
                .or_insert_with(|| NodeInfo::new(from))
                .user = Some(user);
        })
    }

    pub fn add_position(&self, from: u32, position: Position) -> Result<(), NodeDbError> {
        self.write(|d| {
            d.nodes
                .entry(from)
                .or_insert_with(|| NodeInfo::new(from))
                .position = Some(position);
        })
    }

    /// Unknown nodes are left alone.
    pub fn update_favorite(&self, num: u32, is_favorite: bool) -> Result<(), NodeDbError> {
        self.write(|d| {
            if let Some(node) = d.nodes.get_mut(&num) {
                node.is_favorite = is_favorite;
            }
        })
    }

    pub fn update_ignored(&self, num: u32, is_ignored: bool) -> Result<(), NodeDbError> {
        self.write(|d| {
            if let Some(node) = d.nodes.get_mut(&num) {
                node.is_ignored = is_ignored;
            }
        })
    }

    /// Reset the directory, optionally keeping this device's own entry.
    pub fn remove_all_nodes(&self, keep_my_node: bool) -> Result<(), NodeDbError> {
        self.write(|d| {
            let mine = d.my_node_num;
            d.nodes.retain(|num, _| keep_my_node && Some(*num) == mine);
        })
    }

    pub fn remove_all_node_errors(&self) -> Result<(), NodeDbError> {
        self.write(|d| d.errors.clear())
    }

    /// Drop nodes last heard more than `max_age` ago. Self, favorites and nodes
    /// never heard directly are kept. Returns how many were removed.
    pub fn prune_stale_nodes(&self, max_age: chrono::Duration) -> Result<usize, NodeDbError> {
        let cutoff = Utc::now().timestamp() - max_age.num_seconds();
        self.write(|d| {
            let mine = d.my_node_num;
            let before = d.nodes.len();
            d.nodes.retain(|num, node| {
                Some(*num) == mine
                    || node.is_favorite
                    || node.last_heard == 0
                    || i64::from(node.last_heard) >= cutoff
            });
            before - d.nodes.len()
        })
    }
}

fn now_secs() -> u32 {
    u32::try_from(Utc::now().timestamp()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodedb::{NodeDirectoryRegistry, RegistryConfig};

    fn directory() -> (NodeDirectoryRegistry, NodeDirectory) {
        let reg = NodeDirectoryRegistry::new(RegistryConfig::default());
        let dir = reg.add_directory(1);
        (reg, dir)
    }

    #[test]
    fn add_node_replaces_whole_record() {
        let (_reg, dir) = directory();
        let mut first = NodeInfo::new(9);
        first.snr = 3.0;
        first.is_favorite = true;
        dir.add_node(first).unwrap();
        dir.add_node(NodeInfo::new(9)).unwrap();
        let stored = dir.get_node(9).unwrap().unwrap();
        assert!(!stored.is_favorite);
        assert_eq!(stored.snr, 0.0);
        assert_eq!(dir.get_nodes_length().unwrap(), 1);
    }

    #[test]
    fn remove_missing_node_is_noop() {
        let (_reg, dir) = directory();
        dir.add_node(NodeInfo::new(1)).unwrap();
        dir.remove_node(2).unwrap();
        assert_eq!(dir.get_nodes_length().unwrap(), 1);
        dir.remove_node(1).unwrap();
        assert_eq!(dir.get_nodes_length().unwrap(), 0);
    }

    #[test]
    fn self_is_counted_but_not_listed() {
        let (_reg, dir) = directory();
        for num in [10, 11, 12] {
            dir.add_node(NodeInfo::new(num)).unwrap();
        }
        dir.set_node_num(11).unwrap();
        assert_eq!(dir.get_nodes_length().unwrap(), 3);
        let listed: Vec<u32> = dir.get_nodes().unwrap().iter().map(|n| n.num).collect();
        assert_eq!(listed, vec![10, 12]);
        assert_eq!(dir.get_my_node().unwrap().map(|n| n.num), Some(11));
        assert!(dir.get_node(11).unwrap().is_some());
    }

    #[test]
    fn filter_applies_after_self_exclusion() {
        let (_reg, dir) = directory();
        for num in [1, 2, 3] {
            let mut node = NodeInfo::new(num);
            node.is_favorite = num != 2;
            dir.add_node(node).unwrap();
        }
        dir.set_node_num(1).unwrap();
        let favs = dir.get_nodes_where(|n| n.is_favorite).unwrap();
        assert_eq!(favs.len(), 1);
        assert_eq!(favs[0].num, 3);
    }

    #[test]
    fn node_errors_are_keyed_by_node() {
        let (_reg, dir) = directory();
        assert!(!dir.has_node_error(4).unwrap());
        dir.set_node_error(4, "NO_CHANNEL").unwrap();
        assert_eq!(
            dir.get_node_error(4).unwrap(),
            Some(NodeError {
                node: 4,
                error: "NO_CHANNEL".into()
            })
        );
        dir.clear_node_error(4).unwrap();
        assert!(!dir.has_node_error(4).unwrap());
        dir.set_node_error(5, "x").unwrap();
        dir.set_node_error(6, "y").unwrap();
        dir.remove_all_node_errors().unwrap();
        assert_eq!(dir.error_count().unwrap(), 0);
    }

    #[test]
    fn process_packet_creates_and_refreshes() {
        let (_reg, dir) = directory();
        let meta = PacketMeta {
            from: 0x42,
            rx_time: 1_700_000_000,
            rx_snr: -4.5,
            hop_start: Some(3),
            hop_limit: Some(3),
            ..Default::default()
        };
        dir.process_packet(&meta).unwrap();
        let node = dir.get_node(0x42).unwrap().unwrap();
        assert_eq!(node.last_heard, 1_700_000_000);
        assert_eq!(node.snr, -4.5);
        assert_eq!(node.hops_away, Some(0));

        dir.process_packet(&PacketMeta {
            from: 0x42,
            rx_time: 0,
            rx_snr: 1.0,
            ..Default::default()
        })
        .unwrap();
        let node = dir.get_node(0x42).unwrap().unwrap();
        assert!(node.last_heard > 1_700_000_000);
        assert_eq!(node.hops_away, Some(0));
    }

    #[test]
    fn user_and_position_upsert() {
        let (_reg, dir) = directory();
        dir.add_user(
            8,
            User {
                long_name: "Mobile".into(),
                ..Default::default()
            },
        )
        .unwrap();
        dir.add_position(
            8,
            Position {
                latitude_i: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
        let node = dir.get_node(8).unwrap().unwrap();
        assert_eq!(node.long_name(), Some("Mobile"));
        assert_eq!(node.position.unwrap().latitude_i, Some(1));
    }

    #[test]
    fn favorite_and_ignore_skip_unknown_nodes() {
        let (_reg, dir) = directory();
        dir.update_favorite(3, true).unwrap();
        assert!(dir.get_node(3).unwrap().is_none());
        dir.add_node(NodeInfo::new(3)).unwrap();
        dir.update_favorite(3, true).unwrap();
        dir.update_ignored(3, true).unwrap();
        let node = dir.get_node(3).unwrap().unwrap();
        assert!(node.is_favorite && node.is_ignored);
    }

    #[test]
    fn remove_all_nodes_can_keep_self() {
        let (_reg, dir) = directory();
        for num in [1, 2, 3] {
            dir.add_node(NodeInfo::new(num)).unwrap();
        }
        dir.set_node_num(2).unwrap();
        dir.remove_all_nodes(true).unwrap();
        assert_eq!(dir.get_nodes_length().unwrap(), 1);
        assert!(dir.get_my_node().unwrap().is_some());
        dir.remove_all_nodes(false).unwrap();
        assert_eq!(dir.get_nodes_length().unwrap(), 0);
    }

    #[test]
    fn prune_keeps_self_favorites_and_unheard() {
        let (_reg, dir) = directory();
        let old = u32::try_from(Utc::now().timestamp() - 3 * 86_400).unwrap();
        let mut stale = NodeInfo::new(1);
        stale.last_heard = old;
        let mut fav = NodeInfo::new(2);
        fav.last_heard = old;
        fav.is_favorite = true;
        let mut me = NodeInfo::new(3);
        me.last_heard = old;
        let mut fresh = NodeInfo::new(4);
        fresh.last_heard = now_secs();
        for node in [stale, fav, me, fresh, NodeInfo::new(5)] {
            dir.add_node(node).unwrap();
        }
        dir.set_node_num(3).unwrap();
        assert_eq!(dir.prune_stale_nodes(chrono::Duration::days(1)).unwrap(), 1);
        assert!(dir.get_node(1).unwrap().is_none());
        assert_eq!(dir.get_nodes_length().unwrap(), 4);
    }

    #[test]
    fn handle_fails_after_removal() {
        let (reg, dir) = directory();
        assert!(reg.remove_directory(1));
        assert_eq!(
            dir.add_node(NodeInfo::new(1)),
            Err(NodeDbError::DirectoryNotFound(1))
        );
        assert_eq!(dir.get_nodes(), Err(NodeDbError::DirectoryNotFound(1)));
        assert_eq!(dir.set_node_num(1), Err(NodeDbError::DirectoryNotFound(1)));
        assert_eq!(dir.has_node_error(1), Err(NodeDbError::DirectoryNotFound(1)));
    }
}
