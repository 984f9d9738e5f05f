//! ---
//! hydra_section: "04-runtime-core"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "Presence, dispatch, queueing and correlation runtime."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use hydra_common::PresenceConfig;
use hydra_core::presence::{Identity, PresenceEngine};
use hydra_core::{
    ConnectionStatus, DebugEventType, Hydra, HydraError, LifecycleState, MemoryStore, Store,
};
use hydra_store::KeySpace;
use parking_lot::Mutex;
use prometheus::Registry;

use common::{config, eventually, start};

#[tokio::test(start_paused = true)]
async fn init_publishes_registration_presence_and_health() {
    let store = MemoryStore::new();
    let keys = KeySpace::default();
    let hydra = start(&store, "orders").await;
    let instance = hydra.instance_id().to_owned();

    assert_eq!(hydra.state(), LifecycleState::Registered);
    assert!(store.contains_key(&keys.service("orders")));
    assert!(store.contains_key(&keys.presence("orders", &instance)));
    assert!(store.contains_key(&keys.health("orders", &instance)));
    let ttl = store.ttl(&keys.presence("orders", &instance)).expect("presence expires");
    assert!(ttl <= Duration::from_secs(3) && ttl > Duration::from_secs(2));

    let raw = store.hget(&keys.nodes(), &instance).await.unwrap().expect("directory entry");
    let entry: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(entry["port"], "7000");

    let identity = hydra.identity().unwrap();
    assert_eq!(identity.ip, "127.0.0.1");
    assert_eq!(identity.port, 7000);

    let nodes = hydra.service_nodes().await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].instance_id, instance);
    assert_eq!(nodes[0].service_name, "orders");

    // ticks keep the liveness key fresh well past its TTL
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(store.contains_key(&keys.presence("orders", &instance)));

    hydra.shutdown(true).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unreachable_store_fails_init_without_presence() {
    let store = MemoryStore::new();
    store.set_available(false);
    let hydra = Hydra::new(config("orders"), Arc::new(store.connect()));

    let err = hydra.init().await.unwrap_err();
    assert!(matches!(err, HydraError::Initialization(_)), "{err}");
    assert_eq!(hydra.state(), LifecycleState::Unregistered);

    store.set_available(true);
    assert!(store.scan("*").await.unwrap().is_empty());
    assert!(matches!(hydra.discover("orders").await, Err(HydraError::NotInitialized)));
}

#[tokio::test(start_paused = true)]
async fn stale_instances_drop_out_of_discovery() {
    let store = MemoryStore::new();
    let observer = start(&store, "watcher").await;

    // an instance that writes presence once and then stops ticking
    let crashed = PresenceEngine::new(
        Arc::new(store.connect()),
        KeySpace::default(),
        Identity {
            service_name: "orders".into(),
            instance_id: "crashed01".into(),
            service_type: "test".into(),
            description: String::new(),
            version: "1.0.0".into(),
            ip: "10.0.0.9".into(),
            port: 7000,
            host_name: "node-9".into(),
            process_id: 99,
        },
        PresenceConfig::default(),
    );
    crashed.write_presence().await.unwrap();
    let live = start(&store, "orders").await;

    let found: HashSet<_> = observer
        .discover("orders")
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.instance_id)
        .collect();
    assert_eq!(found, HashSet::from(["crashed01".to_owned(), live.instance_id().to_owned()]));

    tokio::time::sleep(Duration::from_secs(4)).await;
    let found: Vec<_> = observer
        .discover("orders")
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.instance_id)
        .collect();
    assert_eq!(found, [live.instance_id().to_owned()]);

    // the directory still remembers it
    let nodes = observer.service_nodes().await.unwrap();
    assert!(nodes.iter().any(|entry| entry.instance_id == "crashed01"));
}

#[tokio::test(start_paused = true)]
async fn presence_resumes_after_the_store_comes_back() {
    let store = MemoryStore::new();
    let keys = KeySpace::default();
    let registry = Registry::new();
    let hydra = Hydra::with_metrics(config("orders"), Arc::new(store.connect()), &registry).unwrap();
    hydra.init().await.unwrap();
    let liveness = keys.presence("orders", hydra.instance_id());

    store.set_available(false);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!store.contains_key(&liveness));
    let failures = registry
        .gather()
        .into_iter()
        .find(|family| family.get_name() == "hydra_presence_tick_failures_total")
        .map(|family| family.get_metric()[0].get_counter().get_value())
        .unwrap_or_default();
    assert!(failures >= 4.0, "{failures}");

    store.set_available(true);
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert!(store.contains_key(&liveness));
    assert_eq!(hydra.state(), LifecycleState::Registered);

    hydra.shutdown(true).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn discovery_spreads_across_replicas() {
    let store = MemoryStore::new();
    let first = start(&store, "worker").await;
    let second = start(&store, "worker").await;
    let client = start(&store, "client").await;

    let mut leaders = HashSet::new();
    for _ in 0..64 {
        let entries = client.discover("worker").await.unwrap();
        assert_eq!(entries.len(), 2);
        leaders.insert(entries[0].instance_id.clone());
    }
    assert_eq!(
        leaders,
        HashSet::from([first.instance_id().to_owned(), second.instance_id().to_owned()])
    );
    assert!(client.discover("nobody").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_removes_instance_and_keeps_peers_running() {
    let store = MemoryStore::new();
    let keys = KeySpace::default();
    let leaving = start(&store, "worker").await;
    let staying = start(&store, "worker").await;
    let instance = leaving.instance_id().to_owned();

    leaving.shutdown(true).await.unwrap();
    assert_eq!(leaving.state(), LifecycleState::Deregistered);
    assert!(!store.contains_key(&keys.presence("worker", &instance)));
    assert!(!store.contains_key(&keys.health("worker", &instance)));
    assert!(matches!(leaving.discover("worker").await, Err(HydraError::NotInitialized)));
    assert!(matches!(leaving.init().await, Err(HydraError::Initialization(_))));

    let remaining = staying.discover("worker").await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].instance_id, staying.instance_id());
    assert!(staying
        .service_nodes()
        .await
        .unwrap()
        .iter()
        .all(|entry| entry.instance_id != instance));

    // second shutdown is a no-op
    leaving.shutdown(false).await.unwrap();
    staying.shutdown(false).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn connection_and_debug_callbacks_fire() {
    let store = MemoryStore::new();
    let hydra = Hydra::new(config("orders"), Arc::new(store.connect()));
    let debug_events = Arc::new(Mutex::new(Vec::new()));
    let statuses = Arc::new(Mutex::new(Vec::new()));

    let sink = debug_events.clone();
    hydra.on_debug_event(move |event| sink.lock().push(event.event_type));
    let sink = statuses.clone();
    hydra.on_connection_change(move |event| sink.lock().push(event.status));

    hydra.init().await.unwrap();
    assert_eq!(debug_events.lock().as_slice(), [DebugEventType::Register]);

    store.set_available(false);
    assert!(eventually(|| statuses.lock().contains(&ConnectionStatus::Disconnected)).await);
    store.set_available(true);
    assert!(eventually(|| statuses.lock().contains(&ConnectionStatus::Reconnected)).await);

    hydra.shutdown(true).await.unwrap();
    assert_eq!(statuses.lock().last(), Some(&ConnectionStatus::Disconnected));
}
