//! ---
//! hydra_section: "03-store-adapter"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "Backing store contract and adapters."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::trace;

use crate::store::{glob_match, ConnectionEvent, ConnectionStatus, PubSubMessage, Store, Subscription};
use crate::{Result, StoreError};

#[derive(Debug)]
enum Value {
    Bytes(Vec<u8>),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
}

#[derive(Debug)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

struct Subscriber {
    connection: u64,
    channels: HashSet<String>,
    tx: mpsc::UnboundedSender<PubSubMessage>,
}

#[derive(Default)]
struct State {
    slots: HashMap<String, Slot>,
    subscribers: Vec<Subscriber>,
    /// Status senders of every open connection, by connection id.
    connections: HashMap<u64, Arc<watch::Sender<ConnectionEvent>>>,
    next_connection: u64,
    unavailable: bool,
}

impl State {
    fn open_connection(&mut self) -> Connection {
        self.next_connection += 1;
        let (status, _) = watch::channel(ConnectionEvent::new(ConnectionStatus::Connected));
        let status = Arc::new(status);
        self.connections.insert(self.next_connection, status.clone());
        Connection {
            id: self.next_connection,
            closed: AtomicBool::new(false),
            status,
        }
    }

    /// Live slot at `key`, evicting it first if its TTL has passed.
    fn live(&mut self, key: &str) -> Option<&mut Slot> {
        let now = Instant::now();
        if self.slots.get(key).is_some_and(|slot| slot.expired(now)) {
            self.slots.remove(key);
        }
        self.slots.get_mut(key)
    }

    fn hash_mut(&mut self, key: &str, create: bool) -> Result<Option<&mut HashMap<String, String>>> {
        if self.live(key).is_none() {
            if !create {
                return Ok(None);
            }
            self.slots.insert(
                key.to_owned(),
                Slot {
                    value: Value::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        match self.slots.get_mut(key).map(|slot| &mut slot.value) {
            Some(Value::Hash(hash)) => Ok(Some(hash)),
            Some(_) => Err(StoreError::WrongType(key.to_owned())),
            None => Ok(None),
        }
    }

    fn list_mut(&mut self, key: &str, create: bool) -> Result<Option<&mut VecDeque<String>>> {
        if self.live(key).is_none() {
            if !create {
                return Ok(None);
            }
            self.slots.insert(
                key.to_owned(),
                Slot {
                    value: Value::List(VecDeque::new()),
                    expires_at: None,
                },
            );
        }
        match self.slots.get_mut(key).map(|slot| &mut slot.value) {
            Some(Value::List(list)) => Ok(Some(list)),
            Some(_) => Err(StoreError::WrongType(key.to_owned())),
            None => Ok(None),
        }
    }

    /// Empty hashes and lists cease to exist, as they do in Redis.
    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.slots.get(key).map(|slot| &slot.value) {
            Some(Value::Hash(hash)) => hash.is_empty(),
            Some(Value::List(list)) => list.is_empty(),
            _ => false,
        };
        if empty {
            self.slots.remove(key);
        }
    }
}

struct Connection {
    id: u64,
    closed: AtomicBool,
    status: Arc<watch::Sender<ConnectionEvent>>,
}

/// Process-local [`Store`] with Redis-like semantics.
///
/// A `MemoryStore` is one connection to an in-process keyspace. Clones share
/// the connection; [`MemoryStore::connect`] opens another one onto the same
/// keyspace, so several runtimes see each other exactly as they would through
/// a shared server and closing one leaves the others working. Expiry follows
/// `tokio::time`, so paused-clock tests can advance past TTLs deterministically.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    connection: Arc<Connection>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty keyspace and open a connection to it.
    pub fn new() -> Self {
        let mut state = State::default();
        let connection = state.open_connection();
        Self {
            state: Arc::new(Mutex::new(state)),
            connection: Arc::new(connection),
        }
    }

    /// Open another connection to the same keyspace.
    pub fn connect(&self) -> Self {
        let connection = self.state.lock().open_connection();
        Self {
            state: self.state.clone(),
            connection: Arc::new(connection),
        }
    }

    /// Make every command on every connection fail as if the server were unreachable.
    pub fn set_available(&self, available: bool) {
        let mut state = self.state.lock();
        let was_unavailable = state.unavailable;
        state.unavailable = !available;
        let event = match (was_unavailable, available) {
            (false, false) => ConnectionEvent::with_message(
                ConnectionStatus::Disconnected,
                "memory store marked unavailable",
            ),
            (true, true) => ConnectionEvent::new(ConnectionStatus::Reconnected),
            _ => return,
        };
        for status in state.connections.values() {
            status.send_replace(event.clone());
        }
    }

    /// Publish a connection status transition to this connection's watchers.
    pub fn set_connection_status(&self, event: ConnectionEvent) {
        self.connection.status.send_replace(event);
    }

    /// Lock the keyspace for a command on this connection.
    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        if self.connection.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let state = self.state.lock();
        if state.unavailable {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(state)
    }

    /// Remaining time to live of `key`, if it exists and expires.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut state = self.state.lock();
        let expires_at = state.live(key)?.expires_at?;
        Some(expires_at.saturating_duration_since(Instant::now()))
    }

    /// Whether `key` currently exists.
    pub fn contains_key(&self, key: &str) -> bool {
        self.state.lock().live(key).is_some()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        self.lock().map(drop)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut state = self.lock()?;
        state.slots.insert(
            key.to_owned(),
            Slot {
                value: Value::Bytes(value.to_vec()),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut state = self.lock()?;
        match state.live(key).map(|slot| &slot.value) {
            Some(Value::Bytes(bytes)) => Ok(Some(bytes.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_owned())),
            None => Ok(None),
        }
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut state = self.lock()?;
        let existed = state.live(key).is_some();
        state.slots.remove(key);
        Ok(existed)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.lock()?;
        match state.live(key) {
            Some(slot) => {
                slot.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(hash) = state.hash_mut(key, true)? {
            hash.insert(field.to_owned(), value.to_owned());
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut state = self.lock()?;
        Ok(state
            .hash_mut(key, false)?
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut state = self.lock()?;
        Ok(state.hash_mut(key, false)?.map(|hash| hash.clone()).unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut state = self.lock()?;
        let removed = state
            .hash_mut(key, false)?
            .map_or(false, |hash| hash.remove(field).is_some());
        state.drop_if_empty(key);
        Ok(removed)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<usize> {
        let mut state = self.lock()?;
        Ok(state
            .list_mut(key, true)?
            .map(|list| {
                list.push_front(value.to_owned());
                list.len()
            })
            .unwrap_or_default())
    }

    async fn rpoplpush(&self, source: &str, destination: &str) -> Result<Option<String>> {
        let mut state = self.lock()?;
        // check the destination type before mutating the source
        state.list_mut(destination, false)?;
        let Some(item) = state.list_mut(source, false)?.and_then(|list| list.pop_back()) else {
            return Ok(None);
        };
        state.drop_if_empty(source);
        if let Some(list) = state.list_mut(destination, true)? {
            list.push_front(item.clone());
        }
        Ok(Some(item))
    }

    async fn lrem(&self, key: &str, count: isize, value: &str) -> Result<usize> {
        let mut state = self.lock()?;
        let Some(list) = state.list_mut(key, false)? else {
            return Ok(0);
        };
        let limit = if count == 0 { usize::MAX } else { count.unsigned_abs() };
        let mut removed = 0;
        if count < 0 {
            let mut index = list.len();
            while index > 0 && removed < limit {
                index -= 1;
                if list[index] == value {
                    list.remove(index);
                    removed += 1;
                }
            }
        } else {
            let mut index = 0;
            while index < list.len() && removed < limit {
                if list[index] == value {
                    list.remove(index);
                    removed += 1;
                } else {
                    index += 1;
                }
            }
        }
        state.drop_if_empty(key);
        Ok(removed)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut state = self.lock()?;
        let Some(list) = state.list_mut(key, false)? else {
            return Ok(Vec::new());
        };
        let len = list.len() as isize;
        let resolve = |index: isize| if index < 0 { len + index } else { index };
        let start = resolve(start).max(0);
        let stop = resolve(stop).min(len - 1);
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(list
            .range(start as usize..=stop as usize)
            .cloned()
            .collect())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let mut state = self.lock()?;
        state.subscribers.retain(|sub| !sub.tx.is_closed());
        let mut delivered = 0;
        for subscriber in state.subscribers.iter().filter(|sub| sub.channels.contains(channel)) {
            let message = PubSubMessage {
                channel: channel.to_owned(),
                payload: payload.to_owned(),
            };
            if subscriber.tx.send(message).is_ok() {
                delivered += 1;
            }
        }
        trace!(channel, delivered, "memory publish");
        Ok(delivered)
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription> {
        let mut state = self.lock()?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push(Subscriber {
            connection: self.connection.id,
            channels: channels.iter().cloned().collect(),
            tx,
        });
        Ok(Subscription::new(rx))
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let mut state = self.lock()?;
        let now = Instant::now();
        state.slots.retain(|_, slot| !slot.expired(now));
        let mut keys: Vec<String> = state
            .slots
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn connection_status(&self) -> watch::Receiver<ConnectionEvent> {
        self.connection.status.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.connection.closed.store(true, Ordering::Release);
        let mut state = self.state.lock();
        let id = self.connection.id;
        state.subscribers.retain(|sub| sub.connection != id);
        state.connections.remove(&id);
        drop(state);
        self.set_connection_status(ConnectionEvent::with_message(
            ConnectionStatus::Disconnected,
            "connection closed",
        ));
        Ok(())
    }
}
