//! ---
//! hydra_section: "03-store-adapter"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "Backing store contract and adapters."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
//! Redis-backed [`Store`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use hydra_common::config::RedisConfig;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{Client, FromRedisValue};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::{ConnectionEvent, ConnectionStatus, PubSubMessage, Store, Subscription};
use crate::{Result, StoreError};

const SCAN_BATCH: usize = 250;

/// [`Store`] over a multiplexed Redis connection.
///
/// Every subscription opens its own pub/sub connection, drained by a
/// background task. When that stream ends the status watch reports
/// [`ConnectionStatus::Disconnected`].
pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
    status: Arc<watch::Sender<ConnectionEvent>>,
    pubsub_tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RedisStore {
    /// Connect using the configured host, port and database.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url())?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|err| StoreError::Unavailable(format!("{}: {err}", config.host_port())))?;
        info!(endpoint = %config.connection_string(), db = config.db, "redis store connected");
        let (status, _) = watch::channel(ConnectionEvent::new(ConnectionStatus::Connected));
        Ok(Self {
            client,
            conn,
            status: Arc::new(status),
            pubsub_tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let mut conn = self.conn.clone();
        match cmd.query_async::<_, T>(&mut conn).await {
            Ok(value) => {
                if self.status.borrow().status == ConnectionStatus::Disconnected {
                    self.status
                        .send_replace(ConnectionEvent::new(ConnectionStatus::Reconnected));
                }
                Ok(value)
            }
            Err(err) => {
                if err.is_io_error() || err.is_connection_dropped() {
                    self.status.send_replace(ConnectionEvent::with_message(
                        ConnectionStatus::Disconnected,
                        err.to_string(),
                    ));
                }
                Err(err.into())
            }
        }
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl Store for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<()> {
        let _: String = self.query(&redis::cmd("PING")).await?;
        Ok(())
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = self.query(&cmd).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let removed: usize = self.query(redis::cmd("DEL").arg(key)).await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.query(redis::cmd("PEXPIRE").arg(key).arg(millis(ttl)))
            .await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let _: usize = self.query(redis::cmd("HSET").arg(key).arg(field).arg(value)).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.query(redis::cmd("HGET").arg(key).arg(field)).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.query(redis::cmd("HGETALL").arg(key)).await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let removed: usize = self.query(redis::cmd("HDEL").arg(key).arg(field)).await?;
        Ok(removed > 0)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<usize> {
        self.query(redis::cmd("LPUSH").arg(key).arg(value)).await
    }

    async fn rpoplpush(&self, source: &str, destination: &str) -> Result<Option<String>> {
        self.query(redis::cmd("RPOPLPUSH").arg(source).arg(destination))
            .await
    }

    async fn lrem(&self, key: &str, count: isize, value: &str) -> Result<usize> {
        self.query(redis::cmd("LREM").arg(key).arg(count).arg(value))
            .await
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        self.query(redis::cmd("LRANGE").arg(key).arg(start).arg(stop))
            .await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        self.query(redis::cmd("PUBLISH").arg(channel).arg(payload))
            .await
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel).await?;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let status = self.status.clone();
        let channels = channels.to_vec();
        let task = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload = match msg.get_payload::<String>() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(channel = %msg.get_channel_name(), error = %err, "dropping non-text pubsub payload");
                        continue;
                    }
                };
                let message = PubSubMessage {
                    channel: msg.get_channel_name().to_owned(),
                    payload,
                };
                if tx.send(message).is_err() {
                    debug!(?channels, "subscription receiver dropped");
                    return;
                }
            }
            status.send_replace(ConnectionEvent::with_message(
                ConnectionStatus::Disconnected,
                "pubsub connection closed",
            ));
        });
        self.pubsub_tasks.lock().push(task);
        Ok(Subscription::new(rx))
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .query(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH),
                )
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    fn connection_status(&self) -> watch::Receiver<ConnectionEvent> {
        self.status.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        for task in self.pubsub_tasks.lock().drain(..) {
            task.abort();
        }
        self.status.send_replace(ConnectionEvent::with_message(
            ConnectionStatus::Disconnected,
            "connection closed",
        ));
        Ok(())
    }
}
