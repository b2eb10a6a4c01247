// Integration tests for epidemic push
//
// Engine teardown accounting, end-to-end dissemination between local nodes and
// the cascade from a stopped link layer to the sessions that ran over it.

use async_trait::async_trait;
use meshcast_core::push::{BrokenSession, DisseminationEngine, EngineDeps, SessionBinding};
use meshcast_core::store::{ContentItem, MemoryContentStore};
use meshcast_core::transport::{
    pump_inbox, LinkAddress, LocalAdapter, LocalMedium, LocalProfile, SessionId, TransportCommand,
    TransportError, TransportSession, TransportType, PUSH_PROTOCOL,
};
use meshcast_core::{
    DensityTable, LinkLayerAdapter, MeshConfig, NetworkCoordinator, PushConfig, ScoreModel,
    ScoreWeights,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};

/// Accepts the announcement, then never completes a push
struct BlockedLink;

#[async_trait]
impl TransportSession for BlockedLink {
    async fn send(&self, command: TransportCommand) -> Result<(), TransportError> {
        if matches!(command, TransportCommand::PushContent(_)) {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_teardown_releases_every_handle_once() {
    let store = MemoryContentStore::new();
    let n = 25;
    for i in 0..n {
        store.insert(ContentItem::new("alice", "public", format!("status {}", i)));
    }

    let (broken, _broken_rx) = mpsc::unbounded_channel::<BrokenSession>();
    let deps = EngineDeps {
        store: Arc::new(store.clone()),
        feed: store.feed(),
        model: ScoreModel::new(ScoreWeights::default(), Arc::new(DensityTable::new(0.5))),
        profile: LocalProfile {
            name: "alice".to_string(),
            interests: vec![],
            groups: vec!["public".to_string()],
        },
        settings: PushConfig::default(),
        broken,
    };
    let binding = SessionBinding {
        address: LinkAddress::new("BB:11:22:33:44:55"),
        protocol: PUSH_PROTOCOL,
        session: SessionId::new(),
        transport: TransportType::Bluetooth,
        link: Arc::new(BlockedLink),
    };
    let engine = DisseminationEngine::start(binding, deps, &Handle::current());

    eventually("initial load", || store.acquisitions() == n as u64).await;
    assert_eq!(store.outstanding(), n);

    engine.stop().await;
    assert_eq!(store.outstanding(), 0);
    assert_eq!(store.releases(), n as u64);
    assert_eq!(store.double_releases(), 0);

    println!("✓ Teardown released all {} handles exactly once", n);
}

struct Node {
    coordinator: Arc<NetworkCoordinator>,
    store: MemoryContentStore,
    shutdown: watch::Sender<bool>,
}

fn node(medium: &Arc<LocalMedium>, address: &str, name: &str) -> Node {
    let store = MemoryContentStore::new();
    let mut config = MeshConfig::default();
    config.local_name = name.to_string();
    let coordinator = NetworkCoordinator::new(
        address,
        config,
        Arc::new(store.clone()),
        store.feed(),
        Arc::new(DensityTable::new(0.5)),
    )
    .unwrap();

    let (adapter, inbox) = LocalAdapter::attach(medium, &coordinator);
    adapter.start().unwrap();
    tokio::spawn(pump_inbox(inbox, Arc::downgrade(&coordinator), store.clone()));

    let (shutdown, shutdown_rx) = watch::channel(false);
    let runner = coordinator.clone();
    tokio::spawn(async move { runner.run_until_shutdown(shutdown_rx).await });

    Node {
        coordinator,
        store,
        shutdown,
    }
}

impl Node {
    async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.coordinator.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_content_reaches_connected_neighbor() {
    // Initialize tracing for debug output
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::INFO)
        .try_init();

    let medium = LocalMedium::new();
    let alice = node(&medium, "AA:00:00:00:00:01", "alice");
    let bob = node(&medium, "BB:00:00:00:00:02", "bob");

    let mut ids = Vec::new();
    for i in 0..10 {
        let item = ContentItem::new("alice", "public", format!("hello mesh {}", i));
        ids.push(item.id);
        alice.store.insert(item);
    }
    let bob_item = ContentItem::new("bob", "public", "hi alice");
    let bob_id = bob_item.id;
    bob.store.insert(bob_item);

    alice.coordinator.force_scan();

    eventually("bob to receive alice's content", || {
        ids.iter().all(|id| bob.store.get(*id).is_some())
    })
    .await;
    eventually("alice to receive bob's content", || alice.store.get(bob_id).is_some()).await;

    // items received from the network keep their mesh-wide identity
    let copy = bob.store.get(ids[0]).unwrap();
    assert_eq!(copy.author, "alice");
    assert_eq!(copy.body, "hello mesh 0");

    alice.stop().await;
    bob.stop().await;
    assert_eq!(alice.store.outstanding(), 0);
    assert_eq!(bob.store.outstanding(), 0);

    println!("✓ Content disseminated in both directions");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stopping_adapter_tears_down_its_sessions() {
    let medium = LocalMedium::new();
    let alice = node(&medium, "AA:00:00:00:00:01", "alice");
    let bob = node(&medium, "BB:00:00:00:00:02", "bob");
    let bob_address = LinkAddress::new("BB:00:00:00:00:02");
    let alice_address = LinkAddress::new("AA:00:00:00:00:01");

    alice.coordinator.force_scan();
    eventually("session on both ends", || {
        alice.coordinator.push().active_sessions().len() == 1
            && bob.coordinator.push().active_sessions().len() == 1
    })
    .await;

    let closed = alice
        .coordinator
        .stop_adapter(TransportType::Local)
        .await
        .unwrap();
    assert_eq!(closed, 1);
    assert!(!alice.coordinator.is_link_layer_enabled(TransportType::Local));
    assert!(alice.coordinator.push().active_sessions().is_empty());
    assert!(alice.coordinator.neighbors().is_empty());
    assert!(alice
        .coordinator
        .neighbor(&bob_address)
        .unwrap()
        .session(PUSH_PROTOCOL)
        .is_none());

    // the other end notices the link going away
    eventually("bob to drop the session", || {
        bob.coordinator.push().active_sessions().is_empty()
    })
    .await;
    assert!(bob
        .coordinator
        .neighbor(&alice_address)
        .unwrap()
        .session(PUSH_PROTOCOL)
        .is_none());

    alice.stop().await;
    bob.stop().await;
    assert_eq!(alice.store.outstanding(), 0);
    assert_eq!(bob.store.outstanding(), 0);

    println!("✓ Adapter stop cascades to its sessions");
}
