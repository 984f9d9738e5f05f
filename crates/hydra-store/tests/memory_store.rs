//! ---
//! hydra_section: "03-store-adapter"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "Backing store contract and adapters."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use hydra_store::{KeySpace, MemoryStore, Store};

#[tokio::test(start_paused = true)]
async fn presence_keys_vanish_while_directory_persists() -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let keys = KeySpace::default();

    for instance in ["a1", "b2"] {
        store
            .set(&keys.presence("svc", instance), instance.as_bytes(), Some(Duration::from_secs(3)))
            .await?;
        store.hset(&keys.nodes(), instance, "{}").await?;
    }
    store
        .set(&keys.presence("other", "c3"), b"c3", Some(Duration::from_secs(3)))
        .await?;

    let live = store.scan(&keys.presence_pattern("svc")).await?;
    assert_eq!(live.len(), 2);
    let instances: Vec<_> = live
        .iter()
        .filter_map(|key| keys.instance_from_presence("svc", key))
        .collect();
    assert_eq!(instances, vec!["a1", "b2"]);

    tokio::time::advance(Duration::from_secs(1)).await;
    store
        .expire(&keys.presence("svc", "a1"), Duration::from_secs(3))
        .await?;
    tokio::time::advance(Duration::from_secs(2)).await;

    let live = store.scan(&keys.presence_pattern("svc")).await?;
    assert_eq!(live, vec![keys.presence("svc", "a1")]);
    assert_eq!(store.hgetall(&keys.nodes()).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn clones_share_one_keyspace() -> Result<()> {
    let first = MemoryStore::new();
    let second = first.clone();

    let mut sub = second.subscribe(&["hydra:service:mc:svc".to_owned()]).await?;
    first.lpush("hydra:service:svc:received", "item").await?;
    assert_eq!(first.publish("hydra:service:mc:svc", "ping").await?, 1);

    assert_eq!(
        second.lrange("hydra:service:svc:received", 0, -1).await?,
        vec!["item"]
    );
    assert_eq!(sub.recv().await.map(|m| m.payload).as_deref(), Some("ping"));

    assert!(second.hdel("hydra:service:nodes", "missing").await.is_ok());
    assert_eq!(second.hget("hydra:service:nodes", "missing").await?, None);
    Ok(())
}
