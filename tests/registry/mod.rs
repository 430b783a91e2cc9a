//! Registry behavior through the public surface.
use mongocon::{
    Connection, ConnectionFlags, Manager, ReadMode, ReadPreference, ServerDef, ServerList,
    TopologyType,
};

use crate::mock::{self, MockCluster};

fn router_list(seeds: &[&str]) -> ServerList {
    let mut list = ServerList::new(TopologyType::Multiple);
    for host in seeds {
        list.servers.push(ServerDef::new(host, 27017));
    }
    list.read_pref = ReadPreference::new(ReadMode::Nearest, None);
    list
}

#[test]
fn deregister_reports_whether_an_entry_was_removed() {
    let cluster = MockCluster::new();
    cluster.add("a:27017", mock::standalone_doc());
    let mut manager = Manager::new(cluster.connector());
    let mut list = router_list(&["a"]);

    let con = manager
        .get_read_write_connection(&mut list, ConnectionFlags::empty())
        .unwrap()
        .unwrap();
    assert!(manager.connection_deregister(&con).unwrap());
    assert!(manager.connection_find_by_hash("a:27017").is_none());
    assert_eq!(cluster.closes("a:27017"), 1);
    assert!(!manager.connection_deregister(&con).unwrap());
}

#[test]
fn manually_registered_connections_are_discoverable() {
    let cluster = MockCluster::new();
    cluster.add("a:27017", mock::standalone_doc());
    let connector = cluster.connector();
    let mut manager = Manager::new(cluster.connector());
    let def = ServerDef::new("a", 27017);

    assert!(manager.connection_find_by_hash(&def.hash()).is_none());
    let con = Connection::connect(connector.as_ref(), &def).unwrap();
    manager.connection_register(con);
    assert!(manager.connection_find_by_hash(&def.hash()).is_some());
}

#[test]
fn dropping_the_manager_destroys_every_connection() {
    let cluster = MockCluster::new();
    cluster.add("a:27017", mock::mongos_doc());
    cluster.add("b:27017", mock::mongos_doc());
    let mut manager = Manager::new(cluster.connector());
    let mut list = router_list(&["a", "b"]);

    manager
        .get_read_write_connection(&mut list, ConnectionFlags::empty())
        .unwrap()
        .unwrap();
    assert_eq!(cluster.closes("a:27017"), 0);
    assert_eq!(cluster.closes("b:27017"), 0);

    drop(manager);
    assert_eq!(cluster.closes("a:27017"), 1);
    assert_eq!(cluster.closes("b:27017"), 1);
}
