//! ---
//! hydra_section: "04-runtime-core"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "Presence, dispatch, queueing and correlation runtime."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use hydra_core::{Hydra, HydraConfig, InboundMessage, MemoryStore};
use tokio::sync::mpsc;

pub fn config(service: &str) -> HydraConfig {
    let mut config = HydraConfig::new(service);
    config.service_ip = Some("127.0.0.1".to_owned());
    config.service_port = Some(7000);
    config.service_type = Some("test".to_owned());
    config
}

/// An initialized instance on its own connection to `store`'s keyspace.
pub async fn start(store: &MemoryStore, service: &str) -> Hydra {
    let hydra = Hydra::new(config(service), Arc::new(store.connect()));
    hydra.init().await.expect("hydra init");
    hydra
}

/// Forward every inbound message of `hydra` to the returned receiver.
pub fn capture(hydra: &Hydra) -> mpsc::UnboundedReceiver<InboundMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    hydra.on_message(move |msg| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(msg);
            Ok(())
        }
    });
    rx
}

pub async fn next(rx: &mut mpsc::UnboundedReceiver<InboundMessage>) -> Option<InboundMessage> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .ok()
        .flatten()
}

/// Poll `check` until it holds, for up to a few seconds of runtime time.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
