//! ---
//! hydra_section: "03-store-adapter"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "Backing store contract and adapters."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::{mpsc, watch};

use crate::Result;

/// Primitive operations Hydra needs from a shared store.
///
/// Adapters add no transactional semantics beyond what the backing store
/// offers. Connection loss after startup is reported through
/// [`Store::connection_status`] rather than retried here.
#[async_trait]
pub trait Store: Send + Sync {
    /// Human-readable adapter name for logging.
    fn name(&self) -> &'static str;

    /// Round-trip to the store.
    async fn ping(&self) -> Result<()>;

    /// Set a string value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;
    /// Fetch a string value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Delete a key of any type. Returns whether it existed.
    async fn del(&self, key: &str) -> Result<bool>;
    /// Set a key's time to live. Returns whether the key existed.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Set one hash field.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    /// Fetch one hash field.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    /// Fetch every field of a hash.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    /// Remove one hash field. Returns whether it existed.
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;

    /// Push onto the head of a list. Returns the new length.
    async fn lpush(&self, key: &str, value: &str) -> Result<usize>;
    /// Atomically pop the tail of `source` and push it onto the head of `destination`.
    async fn rpoplpush(&self, source: &str, destination: &str) -> Result<Option<String>>;
    /// Remove occurrences of `value`: `count > 0` from the head, `count < 0`
    /// from the tail, `0` all. Returns the number removed.
    async fn lrem(&self, key: &str, count: isize, value: &str) -> Result<usize>;
    /// Read a list slice with inclusive, possibly negative, bounds.
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    /// Publish to a channel. Returns the number of receivers.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;
    /// Subscribe to a set of channels.
    async fn subscribe(&self, channels: &[String]) -> Result<Subscription>;

    /// Every live key matching a glob pattern.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>>;

    /// Watch connection status transitions.
    fn connection_status(&self) -> watch::Receiver<ConnectionEvent>;

    /// Release the connection. Further commands fail.
    async fn close(&self) -> Result<()>;
}

/// A message delivered on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Message payload.
    pub payload: String,
}

/// Receiving half of a subscription. Ends when the store drops the sender.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<PubSubMessage>,
}

impl Subscription {
    /// Wrap the receiving half of an adapter's delivery channel.
    pub fn new(rx: mpsc::UnboundedReceiver<PubSubMessage>) -> Self {
        Self { rx }
    }

    /// Next delivered message, or `None` once the subscription ends.
    pub async fn recv(&mut self) -> Option<PubSubMessage> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = PubSubMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Connection states surfaced to embedding applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// The connection is down.
    Disconnected,
    /// Initial connection established.
    Connected,
    /// The connection came back after a disconnect.
    Reconnected,
}

/// A connection status transition with optional detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// New status.
    pub status: ConnectionStatus,
    /// Adapter-supplied detail, typically the error text.
    pub message: Option<String>,
}

impl ConnectionEvent {
    /// Status event without detail.
    pub fn new(status: ConnectionStatus) -> Self {
        Self {
            status,
            message: None,
        }
    }

    /// Status event carrying detail.
    pub fn with_message(status: ConnectionStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
        }
    }
}

/// Glob matching with `*` and `?` as used by key scans. `\` escapes the next character.
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();
    let (mut p, mut c) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while c < candidate.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, c));
                p += 1;
                continue;
            }
            Some('?') => {
                p += 1;
                c += 1;
                continue;
            }
            Some('\\') if pattern.get(p + 1) == Some(&candidate[c]) => {
                p += 2;
                c += 1;
                continue;
            }
            Some(ch) if *ch != '\\' && *ch == candidate[c] => {
                p += 1;
                c += 1;
                continue;
            }
            _ => {}
        }
        match backtrack {
            Some((star, matched)) => {
                p = star + 1;
                c = matched + 1;
                backtrack = Some((star, matched + 1));
            }
            None => return false,
        }
    }
    pattern[p..].iter().all(|ch| *ch == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_presence_patterns() {
        let pattern = "hydra:service:svc:*:presence";
        assert!(glob_match(pattern, "hydra:service:svc:abc:presence"));
        assert!(glob_match(pattern, "hydra:service:svc::presence"));
        assert!(!glob_match(pattern, "hydra:service:svc:abc:health"));
        assert!(!glob_match(pattern, "hydra:service:other:abc:presence"));
    }

    #[test]
    fn glob_question_mark_and_escape() {
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(glob_match("a\\*c", "a*c"));
        assert!(!glob_match("a\\*c", "abc"));
        assert!(glob_match("*", ""));
        assert!(glob_match("**x", "abx"));
    }
}
