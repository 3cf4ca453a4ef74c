use sctp_core::{
    AssociationState, JsonFileStore, Management, ManagementBuilder, ManagementError, MemoryStore,
    PersistenceStore, Snapshot,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn started_management(store: Arc<dyn PersistenceStore>) -> Management {
    let management = ManagementBuilder::new("mgmt-test")
        .with_store(store)
        .single_thread(true)
        .build();
    management.start().unwrap();
    management
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

#[test]
fn test_duplicate_server_endpoint_conflicts() {
    let management = started_management(Arc::new(MemoryStore::new()));

    management.add_server("S1", "127.0.0.1", 2345).unwrap();
    let err = management.add_server("S2", "127.0.0.1", 2345).unwrap_err();
    assert!(matches!(err, ManagementError::Conflict(_)), "got {err}");

    let err = management.add_server("S1", "127.0.0.1", 2346).unwrap_err();
    assert!(matches!(err, ManagementError::Conflict(_)), "got {err}");

    let names: Vec<_> = management.get_servers().iter().map(|s| s.name().to_string()).collect();
    assert_eq!(names, vec!["S1"]);
}

#[test]
fn test_remove_started_association_refused() {
    let store = Arc::new(MemoryStore::new());
    let management = started_management(store.clone());

    management
        .add_association("10.0.0.1", 1000, "10.0.0.2", 2000, "A1")
        .unwrap();
    management.start_association("A1").unwrap();
    assert!(management.get_association("A1").unwrap().is_started());

    let err = management.remove_association("A1").unwrap_err();
    assert!(matches!(err, ManagementError::Precondition(_)), "got {err}");
    assert_eq!(management.get_associations().len(), 1);
    assert!(store.snapshot().unwrap().associations[0].started);

    management.stop_association("A1").unwrap();
    management.remove_association("A1").unwrap();
    assert!(management.get_associations().is_empty());
    assert!(store.snapshot().unwrap().associations.is_empty());
}

#[test]
fn test_unreachable_client_is_retried_not_surfaced() {
    let management = started_management(Arc::new(MemoryStore::new()));
    management.set_connect_delay(Duration::from_secs(60));

    // 192.0.2.0/24 is reserved for documentation, so binding it fails and
    // the failure only shows in metrics
    management
        .add_association("192.0.2.1", 1000, "192.0.2.2", 2000, "A1")
        .unwrap();
    management.start_association("A1").unwrap();

    let association = management.get_association("A1").unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        association.state() == AssociationState::Reconnecting
    }));
    assert!(management.metrics().connect_failures >= 1);
    assert!(management.metrics().reconnects_scheduled >= 1);
    assert!(association.is_started());
}

#[test]
fn test_association_restartable() {
    let management = started_management(Arc::new(MemoryStore::new()));
    let peer = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let peer_port = peer.local_addr().unwrap().port();
    management
        .add_association("127.0.0.1", free_port(), "127.0.0.1", peer_port, "A1")
        .unwrap();
    let association = management.get_association("A1").unwrap();

    management.start_association("A1").unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        association.state() == AssociationState::Established
    }));

    management.stop_association("A1").unwrap();
    assert!(matches!(
        management.stop_association("A1"),
        Err(ManagementError::Precondition(_))
    ));

    // Same local endpoint and peer again; back up without waiting out the delay
    management.start_association("A1").unwrap();
    assert!(association.is_started());
    assert!(wait_until(Duration::from_secs(5), || {
        association.state() == AssociationState::Established
    }));
    assert_eq!(management.metrics().connect_failures, 0);
    assert!(matches!(
        management.start_association("A1"),
        Err(ManagementError::Precondition(_))
    ));
}

#[test]
fn test_server_restarts_immediately_after_stop() {
    println!("\n=== Server stop/start cycles ===");
    let management = started_management(Arc::new(MemoryStore::new()));
    let port = free_port();
    management.add_server("S1", "127.0.0.1", port).unwrap();

    management.start_server("S1").unwrap();
    for cycle in 0..50 {
        if cycle % 10 == 0 {
            thread::sleep(Duration::from_millis(20));
        }
        management.stop_server("S1").unwrap();
        if let Err(e) = management.start_server("S1") {
            panic!("restart {cycle} failed: {e}");
        }
    }
    assert!(management.get_server("S1").unwrap().is_started());

    // Listener is live after the last restart
    assert!(std::net::TcpStream::connect(("127.0.0.1", port)).is_ok());
    println!("✓ 50 restarts without a bind failure");
}

#[test]
fn test_stop_server_requires_stopped_associations() {
    let management = started_management(Arc::new(MemoryStore::new()));
    let port = free_port();

    management.add_server("S1", "127.0.0.1", port).unwrap();
    management
        .add_server_association("127.0.0.1", free_port(), "S1", "SA1")
        .unwrap();

    assert!(matches!(management.stop_server("S1"), Err(ManagementError::Precondition(_))));
    management.start_server("S1").unwrap();
    management.start_association("SA1").unwrap();
    assert_eq!(
        management.get_association("SA1").unwrap().state(),
        AssociationState::AwaitingPeer
    );

    assert!(matches!(management.stop_server("S1"), Err(ManagementError::Precondition(_))));
    assert!(matches!(management.remove_server("S1"), Err(ManagementError::Precondition(_))));
    assert!(management.get_server("S1").unwrap().is_started());

    management.stop_association("SA1").unwrap();
    management.stop_server("S1").unwrap();
    management.remove_server("S1").unwrap();
    // Removing the server leaves its association behind
    assert_eq!(management.get_associations().len(), 1);
}

#[test]
fn test_start_server_bind_failure_is_io() {
    let management = started_management(Arc::new(MemoryStore::new()));
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    management.add_server("S1", "127.0.0.1", port).unwrap();
    let err = management.start_server("S1").unwrap_err();
    assert!(matches!(err, ManagementError::Io(_)), "got {err}");
    assert!(!management.get_server("S1").unwrap().is_started());
}

#[test]
fn test_json_snapshot_restores_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();

    {
        let management = ManagementBuilder::new("restart")
            .persist_dir(dir.path())
            .single_thread(true)
            .build();
        management.start().unwrap();
        management.add_server("S1", "127.0.0.1", port).unwrap();
        management.start_server("S1").unwrap();
        management
            .add_server_association("127.0.0.1", free_port(), "S1", "SA1")
            .unwrap();
        management
            .add_association("10.0.0.1", 1000, "10.0.0.2", 2000, "A1")
            .unwrap();
        management.stop().unwrap();
    }

    let store = JsonFileStore::in_dir(dir.path(), "restart");
    let snapshot = store.load().unwrap().unwrap();
    assert_eq!(snapshot.servers.len(), 1);
    assert!(snapshot.servers[0].started);
    assert_eq!(snapshot.associations.len(), 2);

    let management = ManagementBuilder::new("restart")
        .persist_dir(dir.path())
        .single_thread(true)
        .build();
    management.start().unwrap();

    let server = management.get_server("S1").unwrap();
    assert!(server.is_started());
    assert_eq!(server.association_names(), vec!["SA1"]);
    let sa1 = management.get_association("SA1").unwrap();
    assert_eq!(sa1.server_name(), Some("S1"));
    assert_eq!(sa1.host_port(), port);
    assert!(!sa1.is_started());
    assert!(!management.get_association("A1").unwrap().is_started());

    management.stop().unwrap();
}

#[test]
fn test_in_process_restart_keeps_entities() {
    let store = Arc::new(MemoryStore::new());
    let management = started_management(store.clone());
    management
        .add_association("10.0.0.1", 1000, "10.0.0.2", 2000, "A1")
        .unwrap();
    let before = management.get_association("A1").unwrap();
    management.start_association("A1").unwrap();

    management.stop().unwrap();
    assert!(!before.is_started());
    assert!(store.snapshot().unwrap().associations[0].started);

    management.start().unwrap();
    let after = management.get_association("A1").unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert!(after.is_started());
}

struct FailingStore;

impl PersistenceStore for FailingStore {
    fn load(&self) -> sctp_core::Result<Option<Snapshot>> {
        Ok(None)
    }

    fn save(&self, _snapshot: &Snapshot) -> sctp_core::Result<()> {
        Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only").into())
    }
}

#[test]
fn test_persist_failure_does_not_undo_mutation() {
    let management = started_management(Arc::new(FailingStore));
    management.add_server("S1", "127.0.0.1", 2905).unwrap();
    assert_eq!(management.get_servers().len(), 1);
    management.remove_server("S1").unwrap();
    assert!(management.get_servers().is_empty());
}
