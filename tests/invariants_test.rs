use proptest::prelude::*;
use sctp_core::{
    Management, ManagementBuilder, ManagementError, MemoryStore, PersistenceStore, Snapshot,
};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

const NAMES: [&str; 4] = ["N1", "N2", "N3", "N4"];
const HOSTS: [&str; 2] = ["127.0.0.1", "10.0.0.1"];

#[derive(Debug, Clone)]
enum Op {
    AddServer { name: usize, host: usize, port: u16 },
    AddAssociation { name: usize, host_port: u16, peer: usize, peer_port: u16 },
    AddServerAssociation { name: usize, server: usize, peer: usize, peer_port: u16 },
    RemoveServer { name: usize },
    RemoveAssociation { name: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..4usize, 0..2usize, 1..4u16).prop_map(|(name, host, port)| Op::AddServer { name, host, port }),
        (0..4usize, 1..4u16, 0..2usize, 1..4u16).prop_map(|(name, host_port, peer, peer_port)| {
            Op::AddAssociation { name, host_port, peer, peer_port }
        }),
        (0..4usize, 0..4usize, 0..2usize, 1..4u16).prop_map(|(name, server, peer, peer_port)| {
            Op::AddServerAssociation { name, server, peer, peer_port }
        }),
        (0..4usize).prop_map(|name| Op::RemoveServer { name }),
        (0..4usize).prop_map(|name| Op::RemoveAssociation { name }),
    ]
}

fn apply(management: &Management, op: &Op) -> sctp_core::Result<()> {
    match *op {
        Op::AddServer { name, host, port } => management.add_server(NAMES[name], HOSTS[host], port).map(|_| ()),
        Op::AddAssociation { name, host_port, peer, peer_port } => management
            .add_association("192.0.2.1", host_port, HOSTS[peer], peer_port, NAMES[name])
            .map(|_| ()),
        Op::AddServerAssociation { name, server, peer, peer_port } => management
            .add_server_association(HOSTS[peer], peer_port, NAMES[server], NAMES[name])
            .map(|_| ()),
        Op::RemoveServer { name } => management.remove_server(NAMES[name]),
        Op::RemoveAssociation { name } => management.remove_association(NAMES[name]),
    }
}

type ServerRow = (String, String, u16, Vec<String>);
type AssociationRow = (String, String, u16, String, u16, Option<String>);

fn state_of(management: &Management) -> (BTreeSet<ServerRow>, Vec<AssociationRow>) {
    let servers = management
        .get_servers()
        .iter()
        .map(|s| {
            let mut linked = s.association_names();
            linked.sort();
            (s.name().to_string(), s.host_address().to_string(), s.host_port(), linked)
        })
        .collect();
    let associations = management
        .get_associations()
        .iter()
        .map(|a| {
            (
                a.name().to_string(),
                a.host_address().to_string(),
                a.host_port(),
                a.peer_address().to_string(),
                a.peer_port(),
                a.server_name().map(str::to_string),
            )
        })
        .collect();
    (servers, associations)
}

fn state_of_snapshot(snapshot: &Snapshot) -> (BTreeSet<ServerRow>, BTreeSet<AssociationRow>) {
    let servers = snapshot
        .servers
        .iter()
        .map(|s| {
            let mut linked = s.associations.clone();
            linked.sort();
            (s.name.clone(), s.host_address.clone(), s.host_port, linked)
        })
        .collect();
    let associations = snapshot
        .associations
        .iter()
        .map(|a| {
            (
                a.name.clone(),
                a.host_address.clone(),
                a.host_port,
                a.peer_address.clone(),
                a.peer_port,
                a.server_name.clone(),
            )
        })
        .collect();
    (servers, associations)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_names_and_endpoints_stay_unique(ops in prop::collection::vec(op(), 1..40)) {
        let store = Arc::new(MemoryStore::new());
        let management = ManagementBuilder::new("invariants")
            .with_store(store.clone())
            .single_thread(true)
            .build();
        management.start().unwrap();

        for op in &ops {
            let before = state_of(&management);
            let result = apply(&management, op);
            let after = state_of(&management);

            match result {
                Ok(()) => {
                    // The store holds exactly what the tables hold
                    let snapshot = store.load().unwrap().unwrap();
                    let (servers, associations) = state_of_snapshot(&snapshot);
                    prop_assert_eq!(&servers, &after.0);
                    prop_assert_eq!(associations, after.1.iter().cloned().collect::<BTreeSet<_>>());
                }
                Err(ManagementError::Io(e)) => prop_assert!(false, "unexpected I/O error: {}", e),
                Err(_) => prop_assert_eq!(&before, &after),
            }

            let server_endpoints: HashSet<_> = after.0.iter().map(|(_, h, p, _)| (h.clone(), *p)).collect();
            prop_assert_eq!(server_endpoints.len(), after.0.len());
            let server_names: HashSet<_> = after.0.iter().map(|(n, ..)| n.clone()).collect();
            prop_assert_eq!(server_names.len(), after.0.len());

            // Client and server associations share one name space
            let names: HashSet<_> = after.1.iter().map(|(n, ..)| n.clone()).collect();
            prop_assert_eq!(names.len(), after.1.len());
            let peers: HashSet<_> = after.1.iter().map(|(_, _, _, h, p, _)| (h.clone(), *p)).collect();
            prop_assert_eq!(peers.len(), after.1.len());

            // Every server link names a live association owned by that server
            for (server, _, _, linked) in &after.0 {
                for name in linked {
                    let owner = after.1.iter().find(|(n, ..)| n == name).and_then(|a| a.5.clone());
                    prop_assert_eq!(owner.as_deref(), Some(server.as_str()));
                }
            }
        }

        management.stop().unwrap();
    }
}
