mod common;

use common::named_node;
use meshdir::nodedb::{NodeDbError, NodeDirectoryRegistry, RegistryConfig};

fn registry(capacity: usize) -> NodeDirectoryRegistry {
    NodeDirectoryRegistry::new(RegistryConfig {
        capacity,
        ..Default::default()
    })
}

#[test]
fn fresh_directory_adopts_previous_session_data() {
    let reg = registry(10);
    let old = reg.add_directory(1);
    old.set_node_num(0x42).unwrap();
    old.add_node(named_node(0x42, "Me")).unwrap();
    old.add_node(named_node(0x43, "Neighbor")).unwrap();
    old.set_node_error(0x43, "TIMEOUT").unwrap();

    let new = reg.add_directory(2);
    new.set_node_num(0x42).unwrap();

    assert_eq!(new.get_nodes_length().unwrap(), 2);
    assert!(new.has_node_error(0x43).unwrap());
    assert_eq!(reg.len(), 1);
    assert_eq!(old.get_nodes(), Err(NodeDbError::DirectoryNotFound(1)));
}

#[test]
fn populated_directory_keeps_its_own_data() {
    let reg = registry(10);
    let old = reg.add_directory(1);
    old.set_node_num(0x42).unwrap();
    old.add_node(named_node(0x99, "Stale")).unwrap();

    let new = reg.add_directory(2);
    new.add_node(named_node(0x10, "Fresh")).unwrap();
    new.set_node_num(0x42).unwrap();

    assert_eq!(new.get_nodes_length().unwrap(), 1);
    assert!(new.get_node(0x99).unwrap().is_none());
    assert!(reg.get_directory(1).is_none());
}

#[test]
fn different_devices_are_not_merged() {
    let reg = registry(10);
    let a = reg.add_directory(1);
    a.set_node_num(1).unwrap();
    a.add_node(named_node(7, "A-peer")).unwrap();
    let b = reg.add_directory(2);
    b.set_node_num(2).unwrap();

    assert_eq!(reg.len(), 2);
    assert_eq!(b.get_nodes_length().unwrap(), 0);
    assert_eq!(a.get_nodes_length().unwrap(), 1);
}

#[test]
fn repeating_the_identity_is_harmless() {
    let reg = registry(10);
    let dir = reg.add_directory(1);
    dir.set_node_num(5).unwrap();
    dir.add_node(named_node(6, "Peer")).unwrap();
    dir.set_node_num(5).unwrap();
    assert_eq!(dir.get_nodes_length().unwrap(), 1);
    assert_eq!(reg.len(), 1);
}

#[test]
fn oldest_directory_is_evicted_at_capacity() {
    let reg = registry(2);
    let first = reg.add_directory(1);
    reg.add_directory(2);
    // Touching an existing directory does not refresh its position.
    first.add_node(named_node(3, "Busy")).unwrap();
    reg.add_directory(3);

    let keys: Vec<u32> = reg.get_directories().iter().map(|d| d.identity_key()).collect();
    assert_eq!(keys, vec![2, 3]);
    assert_eq!(
        first.add_node(named_node(4, "Late")),
        Err(NodeDbError::DirectoryNotFound(1))
    );
}

#[test]
fn removed_directory_handles_fail_everywhere() {
    let reg = registry(10);
    let dir = reg.add_directory(9);
    assert!(reg.remove_directory(9));
    assert!(!reg.remove_directory(9));
    let missing = Err(NodeDbError::DirectoryNotFound(9));
    assert_eq!(dir.set_node_num(1), missing);
    assert_eq!(dir.remove_node(1), missing);
    assert_eq!(dir.clear_node_error(1), missing);
    assert_eq!(dir.get_nodes_length(), Err(NodeDbError::DirectoryNotFound(9)));
}
