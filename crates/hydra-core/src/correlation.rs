//! ---
//! hydra_section: "04-runtime-core"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "Presence, dispatch, queueing and correlation runtime."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
//! Response correlation.
//!
//! A request's `mid` may carry at most one outstanding registration: either a
//! single-shot waiter (optionally restricted to one response type) or a
//! stream. Registration, resolution and removal all happen under one lock, so
//! a reply is either delivered to exactly one waiter or finds nothing and is
//! dropped.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use hydra_msg::InboundMessage;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::{HydraError, Result};

type SingleKey = (String, Option<String>);

#[derive(Default)]
struct Tables {
    next_generation: u64,
    /// mid -> generation of the registration currently holding it.
    in_use: HashMap<String, u64>,
    singles: HashMap<SingleKey, oneshot::Sender<InboundMessage>>,
    streams: HashMap<String, mpsc::UnboundedSender<InboundMessage>>,
}

impl Tables {
    fn claim(&mut self, mid: &str) -> Result<u64> {
        if self.in_use.contains_key(mid) {
            return Err(HydraError::DuplicateCorrelation(mid.to_owned()));
        }
        self.next_generation += 1;
        self.in_use.insert(mid.to_owned(), self.next_generation);
        Ok(self.next_generation)
    }

    fn holds(&self, mid: &str, generation: u64) -> bool {
        self.in_use.get(mid) == Some(&generation)
    }
}

/// Outstanding request registrations, shared by the dispatcher and callers.
#[derive(Clone, Default)]
pub struct ResponseRegistry {
    tables: Arc<Mutex<Tables>>,
}

impl ResponseRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a single-shot waiter for replies to `mid`, optionally only of `expected_type`.
    pub fn register_single(&self, mid: &str, expected_type: Option<&str>) -> Result<PendingResponse> {
        let (tx, rx) = oneshot::channel();
        let key = (mid.to_owned(), expected_type.map(str::to_owned));
        let mut tables = self.tables.lock();
        let generation = tables.claim(mid)?;
        tables.singles.insert(key.clone(), tx);
        trace!(mid, ?expected_type, "response waiter registered");
        Ok(PendingResponse {
            key,
            generation,
            rx,
            registry: self.clone(),
        })
    }

    /// Register a stream receiving every reply to `mid` until disposed.
    pub fn register_stream(&self, mid: &str) -> Result<ResponseStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut tables = self.tables.lock();
        let generation = tables.claim(mid)?;
        tables.streams.insert(mid.to_owned(), tx);
        trace!(mid, "response stream registered");
        Ok(ResponseStream {
            mid: mid.to_owned(),
            generation,
            rx,
            registry: Some(self.clone()),
        })
    }

    /// Deliver `msg` to the waiter registered for its `rmid`, if any.
    ///
    /// A type-specific waiter is preferred over a wildcard one. Single
    /// waiters are removed on delivery; streams stay until disposed.
    pub fn try_resolve(&self, msg: &InboundMessage) -> bool {
        let Some(rmid) = msg.umf().rmid.as_deref().filter(|rmid| !rmid.is_empty()) else {
            return false;
        };
        let mut tables = self.tables.lock();
        if !tables.in_use.contains_key(rmid) {
            return false;
        }

        let typed = (rmid.to_owned(), Some(msg.typ.clone()));
        let wildcard = (rmid.to_owned(), None);
        let waiter = tables
            .singles
            .remove(&typed)
            .or_else(|| tables.singles.remove(&wildcard));
        if let Some(waiter) = waiter {
            tables.in_use.remove(rmid);
            drop(tables);
            if waiter.send(msg.clone()).is_err() {
                debug!(mid = rmid, "response waiter gone before delivery");
            }
            return true;
        }

        if let Some(stream) = tables.streams.get(rmid) {
            if stream.send(msg.clone()).is_err() {
                debug!(mid = rmid, "response stream receiver gone");
            }
            return true;
        }
        false
    }

    /// Whether `mid` has an outstanding registration.
    pub fn is_waiting(&self, mid: &str) -> bool {
        self.tables.lock().in_use.contains_key(mid)
    }

    /// Number of outstanding registrations.
    pub fn pending(&self) -> usize {
        self.tables.lock().in_use.len()
    }

    fn clear_single(&self, key: &SingleKey, generation: u64) {
        let mut tables = self.tables.lock();
        if tables.holds(&key.0, generation) {
            tables.singles.remove(key);
            tables.in_use.remove(&key.0);
        }
    }

    fn clear_stream(&self, mid: &str, generation: u64) {
        let mut tables = self.tables.lock();
        if tables.holds(mid, generation) {
            tables.streams.remove(mid);
            tables.in_use.remove(mid);
        }
    }
}

/// A single-response registration. Dropping it unregisters the waiter.
pub struct PendingResponse {
    key: SingleKey,
    generation: u64,
    rx: oneshot::Receiver<InboundMessage>,
    registry: ResponseRegistry,
}

impl PendingResponse {
    /// Message id this waiter is correlated to.
    pub fn mid(&self) -> &str {
        &self.key.0
    }

    /// Wait for the correlated reply. Timeouts are the caller's concern.
    pub async fn wait(&mut self) -> Result<InboundMessage> {
        (&mut self.rx).await.map_err(|_| HydraError::Cancelled)
    }
}

impl fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResponse")
            .field("mid", &self.key.0)
            .field("expected_type", &self.key.1)
            .finish()
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.registry.clear_single(&self.key, self.generation);
    }
}

/// Replies correlated to one request, in arrival order at this instance.
///
/// No end marker exists at this layer: consumers stop on an application
/// sentinel and dispose. Dropping the stream disposes it.
pub struct ResponseStream {
    mid: String,
    generation: u64,
    rx: mpsc::UnboundedReceiver<InboundMessage>,
    registry: Option<ResponseRegistry>,
}

impl ResponseStream {
    /// Message id this stream is correlated to.
    pub fn mid(&self) -> &str {
        &self.mid
    }

    /// Next reply; `None` once disposed and drained.
    pub async fn next_message(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }

    /// Unregister and close. Replies already buffered can still be read.
    pub fn dispose(&mut self) {
        if let Some(registry) = self.registry.take() {
            registry.clear_stream(&self.mid, self.generation);
            self.rx.close();
            trace!(mid = %self.mid, "response stream disposed");
        }
    }

    /// Whether [`ResponseStream::dispose`] has run.
    pub fn is_disposed(&self) -> bool {
        self.registry.is_none()
    }
}

impl fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStream")
            .field("mid", &self.mid)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Stream for ResponseStream {
    type Item = InboundMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use hydra_msg::Umf;
    use serde_json::json;

    fn reply(rmid: &str, typ: &str) -> InboundMessage {
        let umf = Umf::new("abc@caller:/", typ, json!({"ok": true})).with_rmid(rmid);
        InboundMessage::parse(umf.to_json().unwrap()).unwrap()
    }

    #[test]
    fn duplicate_registration_fails_fast() {
        let registry = ResponseRegistry::new();
        let first = registry.register_single("X", None).unwrap();
        assert!(matches!(
            registry.register_single("X", Some("other")),
            Err(HydraError::DuplicateCorrelation(mid)) if mid == "X"
        ));
        assert!(matches!(
            registry.register_stream("X"),
            Err(HydraError::DuplicateCorrelation(_))
        ));

        drop(first);
        assert!(!registry.is_waiting("X"));
        registry.register_single("X", None).unwrap();
    }

    #[tokio::test]
    async fn resolves_exactly_once() {
        let registry = ResponseRegistry::new();
        let mut pending = registry.register_single("X", None).unwrap();

        assert!(registry.try_resolve(&reply("X", "pong")));
        assert!(!registry.try_resolve(&reply("X", "pong")));

        let msg = pending.wait().await.unwrap();
        assert_eq!(msg.typ, "pong");
        assert_eq!(registry.pending(), 0);

        // re-registering after resolution is allowed
        let _again = registry.register_single("X", None).unwrap();
        drop(pending);
        assert!(registry.is_waiting("X"), "stale handle must not clear a newer registration");
    }

    #[tokio::test]
    async fn typed_waiter_ignores_other_types() {
        let registry = ResponseRegistry::new();
        let mut pending = registry.register_single("X", Some("result")).unwrap();

        assert!(!registry.try_resolve(&reply("X", "progress")));
        assert!(registry.is_waiting("X"));
        assert!(registry.try_resolve(&reply("X", "result")));
        assert_eq!(pending.wait().await.unwrap().typ, "result");
    }

    #[test]
    fn messages_without_rmid_are_ignored() {
        let registry = ResponseRegistry::new();
        let _pending = registry.register_single("X", None).unwrap();
        let plain = InboundMessage::parse(Umf::new("svc:/", "ping", json!({})).to_json().unwrap()).unwrap();
        assert!(!registry.try_resolve(&plain));
        assert!(registry.is_waiting("X"));
    }

    #[tokio::test]
    async fn stream_collects_until_disposed() {
        let registry = ResponseRegistry::new();
        let mut stream = registry.register_stream("S").unwrap();

        for typ in ["part", "part", "part-complete"] {
            assert!(registry.try_resolve(&reply("S", typ)));
        }
        let mut types = Vec::new();
        while let Some(msg) = stream.next().await {
            let done = msg.typ.ends_with("-complete");
            types.push(msg.typ);
            if done {
                break;
            }
        }
        assert_eq!(types, ["part", "part", "part-complete"]);

        stream.dispose();
        assert!(stream.is_disposed());
        assert!(!registry.try_resolve(&reply("S", "late")));
        assert!(stream.next_message().await.is_none());
        registry.register_stream("S").unwrap();
    }

    #[test]
    fn dropping_a_stream_unregisters_it() {
        let registry = ResponseRegistry::new();
        {
            let _stream = registry.register_stream("S").unwrap();
            assert!(registry.is_waiting("S"));
        }
        assert!(!registry.is_waiting("S"));
    }

    #[test]
    fn handles_debug_by_message_id() {
        let registry = ResponseRegistry::new();
        let pending = registry.register_single("X", Some("pong")).unwrap();
        assert_eq!(
            format!("{pending:?}"),
            r#"PendingResponse { mid: "X", expected_type: Some("pong") }"#
        );
        let mut stream = registry.register_stream("S").unwrap();
        assert_eq!(format!("{stream:?}"), r#"ResponseStream { mid: "S", disposed: false }"#);
        stream.dispose();
        assert_eq!(format!("{stream:?}"), r#"ResponseStream { mid: "S", disposed: true }"#);
    }
}
