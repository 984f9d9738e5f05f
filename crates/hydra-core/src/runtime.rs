//! ---
//! hydra_section: "04-runtime-core"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "Presence, dispatch, queueing and correlation runtime."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
//! The embeddable runtime.
//!
//! Startup: validate config, reach the store, resolve identity, write the
//! registration record, subscribe to both inbound channels, publish first
//! presence, then start the background tasks. Shutdown runs the reverse:
//! stop ticking, optionally drain inbound handlers, remove the directory
//! entry and liveness keys, then release the store connection.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use hydra_common::HydraConfig;
use hydra_msg::{InboundMessage, Umf};
use hydra_store::{ConnectionEvent, ConnectionStatus, KeySpace, Store};
use parking_lot::{Mutex, RwLock};
use prometheus::Registry;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::Cache;
use crate::callbacks::{Callbacks, DebugEvent, DebugEventType};
use crate::correlation::{ResponseRegistry, ResponseStream};
use crate::dispatch::Dispatcher;
use crate::events::EventQueue;
use crate::metrics::HydraMetrics;
use crate::net;
use crate::presence::{Identity, PresenceEngine, PresenceEntry};
use crate::queue::{Backoff, DurableQueue, QueueProcessor};
use crate::{HydraError, Result};

/// Default wait for a correlated response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Where an instance is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Built but not yet initialized, or initialization failed.
    Unregistered,
    /// Initialization is in progress.
    Registering,
    /// Presence is published and messages flow.
    Registered,
    /// Shutdown is in progress.
    ShuttingDown,
    /// Shut down. The instance cannot be initialized again.
    Deregistered,
}

/// Options for [`Hydra::await_response`].
#[derive(Debug, Clone)]
pub struct ResponseOptions {
    /// Only a reply of this `typ` resolves the wait. `None` accepts any.
    pub expected_type: Option<String>,
    /// How long to wait for the reply.
    pub timeout: Duration,
    /// Token that aborts the wait when cancelled.
    pub cancel: Option<CancellationToken>,
}

impl Default for ResponseOptions {
    fn default() -> Self {
        Self {
            expected_type: None,
            timeout: DEFAULT_RESPONSE_TIMEOUT,
            cancel: None,
        }
    }
}

impl ResponseOptions {
    /// Only accept a reply of type `typ`.
    pub fn expect_type(mut self, typ: impl Into<String>) -> Self {
        self.expected_type = Some(typ.into());
        self
    }

    /// Wait at most `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Abort the wait when `token` is cancelled.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Everything that only exists between a successful init and shutdown.
struct Live {
    identity: Identity,
    presence: Arc<PresenceEngine>,
    dispatcher: Arc<Dispatcher>,
    queue: DurableQueue,
    cache: Cache,
    events: Arc<EventQueue>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    config: HydraConfig,
    store: Arc<dyn Store>,
    keys: KeySpace,
    instance_id: String,
    callbacks: Arc<Callbacks>,
    registry: ResponseRegistry,
    metrics: Option<Arc<HydraMetrics>>,
    state: Mutex<LifecycleState>,
    live: RwLock<Option<Arc<Live>>>,
}

/// A Hydra service instance. Cheap to clone; clones share one instance.
#[derive(Clone)]
pub struct Hydra {
    inner: Arc<Inner>,
}

impl Hydra {
    /// Build an instance over `store`. Nothing touches the store until [`Hydra::init`].
    pub fn new(config: HydraConfig, store: Arc<dyn Store>) -> Self {
        Self::build(config, store, None)
    }

    /// Like [`Hydra::new`], also registering runtime metrics with `registry`.
    pub fn with_metrics(config: HydraConfig, store: Arc<dyn Store>, registry: &Registry) -> Result<Self> {
        let metrics = HydraMetrics::register(registry)
            .map_err(|err| HydraError::Initialization(format!("metrics registration failed: {err}")))?;
        Ok(Self::build(config, store, Some(Arc::new(metrics))))
    }

    /// Connect to the Redis server named by `config.redis`.
    #[cfg(feature = "redis")]
    pub async fn connect(config: HydraConfig) -> Result<Self> {
        let store = hydra_store::RedisStore::connect(&config.redis)
            .await
            .map_err(|err| {
                HydraError::Initialization(format!(
                    "redis at {} unreachable: {err}",
                    config.redis.connection_string()
                ))
            })?;
        Ok(Self::new(config, Arc::new(store)))
    }

    fn build(config: HydraConfig, store: Arc<dyn Store>, metrics: Option<Arc<HydraMetrics>>) -> Self {
        let keys = KeySpace::new(config.redis.prefix.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                keys,
                instance_id: Uuid::new_v4().simple().to_string(),
                callbacks: Arc::new(Callbacks::default()),
                registry: ResponseRegistry::new(),
                metrics,
                state: Mutex::new(LifecycleState::Unregistered),
                live: RwLock::new(None),
            }),
        }
    }

    /// Configuration this instance was built with.
    pub fn config(&self) -> &HydraConfig {
        &self.inner.config
    }

    /// Configured service name.
    pub fn service_name(&self) -> &str {
        &self.inner.config.service_name
    }

    /// Unique id generated for this instance.
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// This instance's sender address, `{instance}@{service}:/`.
    pub fn route(&self) -> String {
        format!("{}@{}:/", self.inner.instance_id, self.inner.config.service_name)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.inner.state.lock()
    }

    /// The advertised identity. Available once initialized.
    pub fn identity(&self) -> Result<Identity> {
        Ok(self.live()?.identity.clone())
    }

    /// Child of the runtime's shutdown token, for tasks that should stop with it.
    pub fn shutdown_token(&self) -> Result<CancellationToken> {
        Ok(self.live()?.cancel.child_token())
    }

    fn live(&self) -> Result<Arc<Live>> {
        self.inner.live.read().clone().ok_or(HydraError::NotInitialized)
    }

    /// Handler for every message delivered on this instance's channels.
    /// Replace it at any time; the last registration wins.
    pub fn on_message<F, Fut>(&self, handler: F)
    where
        F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.callbacks.set_message_handler(handler);
    }

    /// Handler for errors caught in handlers and background loops.
    pub fn on_internal_error(&self, handler: impl Fn(&HydraError) + Send + Sync + 'static) {
        self.inner.callbacks.set_error_handler(handler);
    }

    /// Handler for debug events.
    pub fn on_debug_event(&self, handler: impl Fn(&DebugEvent) + Send + Sync + 'static) {
        self.inner.callbacks.set_debug_handler(handler);
    }

    /// Handler for store connection status transitions.
    pub fn on_connection_change(&self, handler: impl Fn(&ConnectionEvent) + Send + Sync + 'static) {
        self.inner.callbacks.set_connection_handler(handler);
    }

    /// Register this instance and start its background tasks.
    ///
    /// Fails with [`HydraError::Initialization`] when the config is invalid or
    /// the store cannot be reached; no presence is written in that case.
    pub async fn init(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != LifecycleState::Unregistered {
                return Err(HydraError::Initialization(format!(
                    "cannot initialize from state {:?}",
                    *state
                )));
            }
            *state = LifecycleState::Registering;
        }

        match self.start().await {
            Ok(live) => {
                info!(
                    service = %live.identity.service_name,
                    instance = %live.identity.instance_id,
                    ip = %live.identity.ip,
                    port = live.identity.port,
                    store = self.inner.store.name(),
                    "hydra registered"
                );
                *self.inner.live.write() = Some(live);
                *self.inner.state.lock() = LifecycleState::Registered;
                Ok(())
            }
            Err(err) => {
                error!(service = %self.service_name(), error = %err, "hydra initialization failed");
                *self.inner.state.lock() = LifecycleState::Unregistered;
                Err(err)
            }
        }
    }

    async fn start(&self) -> Result<Arc<Live>> {
        let inner = &self.inner;
        let config = &inner.config;
        config
            .validate()
            .map_err(|err| HydraError::Initialization(format!("{err:#}")))?;
        inner.store.ping().await.map_err(|err| {
            HydraError::Initialization(format!("{} store unreachable: {err}", inner.store.name()))
        })?;

        let ip = net::resolve_service_ip(config.service_ip.as_deref()).await;
        let identity = Identity {
            service_name: config.service_name.clone(),
            instance_id: inner.instance_id.clone(),
            service_type: config.service_type.clone().unwrap_or_default(),
            description: config.service_description.clone().unwrap_or_default(),
            version: config.service_version.clone().unwrap_or_default(),
            ip: ip.to_string(),
            port: config.service_port.unwrap_or(0),
            host_name: net::host_name(),
            process_id: std::process::id(),
        };

        let presence = Arc::new(PresenceEngine::new(
            inner.store.clone(),
            inner.keys.clone(),
            identity.clone(),
            config.presence.clone(),
        ));
        presence.register_service().await.map_err(initialization)?;
        inner.callbacks.emit_debug(DebugEvent::new(
            DebugEventType::Register,
            format!("registered service {}", identity.service_name),
        ));

        let channels = [
            inner.keys.broadcast_channel(&identity.service_name),
            inner.keys.instance_channel(&identity.service_name, &identity.instance_id),
        ];
        let subscription = inner
            .store
            .subscribe(&channels)
            .await
            .map_err(|err| initialization(err.into()))?;
        debug!(?channels, "subscribed");

        presence.write_presence().await.map_err(initialization)?;
        presence.write_health().await.map_err(initialization)?;

        let cancel = CancellationToken::new();
        let events = Arc::new(EventQueue::new());
        let dispatcher = Arc::new(Dispatcher::new(
            inner.store.clone(),
            inner.keys.clone(),
            presence.clone(),
            inner.callbacks.clone(),
            inner.metrics.clone(),
        ));
        let tasks = vec![
            presence.clone().spawn(cancel.child_token(), inner.metrics.clone()),
            dispatcher.clone().spawn_inbound(
                subscription,
                inner.registry.clone(),
                events.clone(),
                cancel.child_token(),
            ),
            watch_connection(
                inner.store.connection_status(),
                inner.callbacks.clone(),
                cancel.child_token(),
            ),
        ];

        Ok(Arc::new(Live {
            queue: DurableQueue::new(
                inner.store.clone(),
                inner.keys.clone(),
                inner.callbacks.clone(),
                inner.metrics.clone(),
            ),
            cache: Cache::new(inner.store.clone(), inner.keys.clone(), identity.service_name.clone()),
            identity,
            presence,
            dispatcher,
            events,
            cancel,
            tasks: Mutex::new(tasks),
        }))
    }

    /// Build an envelope from this instance. A bare service name in `to`
    /// gets the `:/` suffix.
    pub fn create_umf<B>(&self, to: &str, typ: &str, bdy: B, rmid: Option<&str>) -> Umf<B> {
        let to = if to.contains(':') {
            to.to_owned()
        } else {
            format!("{to}:/")
        };
        let umf = Umf::new(to, typ, bdy).with_from(self.route());
        match rmid {
            Some(rmid) => umf.with_rmid(rmid),
            None => umf,
        }
    }

    /// Reply to `request`: addressed to its sender, correlated to its `mid`.
    pub fn create_response<R, B>(&self, request: &Umf<R>, typ: &str, bdy: B) -> Umf<B> {
        Umf::new(request.frm.clone(), typ, bdy)
            .with_from(self.route())
            .with_rmid(request.mid.clone())
    }

    /// Send to one instance of the addressed service. Returns whether it reached a subscriber.
    pub async fn send<B: Serialize + Sync>(&self, umf: &Umf<B>) -> Result<bool> {
        self.live()?.dispatcher.send(umf).await
    }

    /// [`Hydra::send`] for an already serialized envelope addressed to `to`.
    pub async fn send_raw(&self, to: &str, json: &str) -> Result<bool> {
        self.live()?.dispatcher.send_raw(to, json).await
    }

    /// Send to every instance of the addressed service. Returns the receiver count.
    pub async fn broadcast<B: Serialize + Sync>(&self, umf: &Umf<B>) -> Result<usize> {
        self.live()?.dispatcher.broadcast(umf).await
    }

    /// [`Hydra::broadcast`] for an already serialized envelope addressed to `to`.
    pub async fn broadcast_raw(&self, to: &str, json: &str) -> Result<usize> {
        self.live()?.dispatcher.broadcast_raw(to, json).await
    }

    /// Append `umf` to the durable queue of the addressed service.
    pub async fn enqueue<B: Serialize + Sync>(&self, umf: &Umf<B>) -> Result<()> {
        self.live()?.queue.enqueue(umf).await
    }

    /// [`Hydra::enqueue`] for an already serialized envelope addressed to `to`.
    pub async fn enqueue_raw(&self, to: &str, json: &str) -> Result<()> {
        self.live()?.queue.enqueue_raw(to, json).await
    }

    /// Next item from this service's queue, now held in progress until acknowledged.
    pub async fn dequeue(&self) -> Result<Option<String>> {
        self.dequeue_from(&self.inner.config.service_name).await
    }

    /// Next item from the queue of `service`, now held in progress until acknowledged.
    pub async fn dequeue_from(&self, service: &str) -> Result<Option<String>> {
        self.live()?.queue.dequeue(service).await
    }

    /// Finish an item taken with [`Hydra::dequeue`]. `completed = false` requeues it.
    pub async fn acknowledge(&self, raw: &str, completed: bool) -> Result<()> {
        self.live()?
            .queue
            .acknowledge(&self.inner.config.service_name, raw, completed)
            .await
    }

    /// A poller over this service's queue using the configured backoff ladder.
    /// Failures go to the internal-error callback.
    pub fn queue_processor(&self) -> Result<QueueProcessor> {
        let live = self.live()?;
        let callbacks = self.inner.callbacks.clone();
        Ok(QueueProcessor::new(
            live.queue.clone(),
            self.inner.config.service_name.clone(),
            Backoff::new(self.inner.config.queue.backoff_ms.clone()),
        )
        .on_dequeue_error(move |err| callbacks.report_error(err)))
    }

    /// Send `umf` directly and wait for the reply correlated to its `mid`.
    ///
    /// Fails immediately with [`HydraError::NoRecipient`] when no live
    /// instance is subscribed, and with [`HydraError::DuplicateCorrelation`]
    /// when `umf.mid` is already awaiting a response.
    pub async fn await_response<B: Serialize + Sync>(
        &self,
        umf: &Umf<B>,
        options: ResponseOptions,
    ) -> Result<InboundMessage> {
        let live = self.live()?;
        let mut pending = self
            .inner
            .registry
            .register_single(&umf.mid, options.expected_type.as_deref())?;
        let started = tokio::time::Instant::now();
        if !live.dispatcher.send(umf).await? {
            return Err(HydraError::NoRecipient(umf.route().service_name));
        }

        let external = options.cancel.unwrap_or_default();
        let result = tokio::select! {
            biased;
            reply = pending.wait() => reply,
            _ = tokio::time::sleep(options.timeout) => Err(HydraError::Timeout(options.timeout)),
            _ = external.cancelled() => Err(HydraError::Cancelled),
            _ = live.cancel.cancelled() => Err(HydraError::Cancelled),
        };
        match &result {
            Ok(_) => {
                if let Some(metrics) = &self.inner.metrics {
                    metrics.observe_response_latency(started.elapsed());
                }
            }
            Err(err) => debug!(mid = %umf.mid, error = %err, "response wait ended without a reply"),
        }
        result
    }

    /// Send `umf` and stream every reply correlated to its `mid` until the
    /// stream is disposed or dropped. No timeout applies.
    pub async fn await_response_stream<B: Serialize + Sync>(
        &self,
        umf: &Umf<B>,
        broadcast: bool,
    ) -> Result<ResponseStream> {
        let live = self.live()?;
        let stream = self.inner.registry.register_stream(&umf.mid)?;
        let reached = if broadcast {
            live.dispatcher.broadcast(umf).await? > 0
        } else {
            live.dispatcher.send(umf).await?
        };
        if !reached {
            return Err(HydraError::NoRecipient(umf.route().service_name));
        }
        Ok(stream)
    }

    /// Live instances of `service`, shuffled.
    pub async fn discover(&self, service: &str) -> Result<Vec<PresenceEntry>> {
        self.live()?.presence.discover(service).await
    }

    /// Every directory entry, including stale ones.
    pub async fn service_nodes(&self) -> Result<Vec<PresenceEntry>> {
        self.live()?.presence.service_nodes().await
    }

    /// Cache scoped to this service.
    pub fn cache(&self) -> Result<Cache> {
        Ok(self.live()?.cache.clone())
    }

    /// Deregister and release the store. With `flush`, in-flight inbound
    /// handlers get up to the configured flush timeout to finish.
    /// Does nothing unless the instance is registered.
    pub async fn shutdown(&self, flush: bool) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != LifecycleState::Registered {
                debug!(state = ?*state, "shutdown ignored");
                return Ok(());
            }
            *state = LifecycleState::ShuttingDown;
        }
        let Some(live) = self.inner.live.read().clone() else {
            *self.inner.state.lock() = LifecycleState::Deregistered;
            return Ok(());
        };
        info!(service = %live.identity.service_name, instance = %live.identity.instance_id, flush, "hydra shutting down");

        live.cancel.cancel();
        let tasks = std::mem::take(&mut *live.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                if err.is_panic() {
                    error!(error = %err, "background task panicked");
                }
            }
        }

        if flush {
            live.events.flush(self.inner.config.presence.flush_timeout).await;
        } else {
            live.events.close();
        }

        if let Err(err) = live.presence.deregister().await {
            warn!(error = %err, "deregistration failed; presence will expire on its own");
        }
        self.inner.live.write().take();

        let closed = self.inner.store.close().await;
        self.inner.callbacks.notify_connection(&ConnectionEvent::with_message(
            ConnectionStatus::Disconnected,
            "shutdown",
        ));
        *self.inner.state.lock() = LifecycleState::Deregistered;
        info!(instance = %self.inner.instance_id, "hydra deregistered");
        closed.map_err(HydraError::from)
    }
}

fn initialization(err: HydraError) -> HydraError {
    match err {
        err @ HydraError::Initialization(_) => err,
        other => HydraError::Initialization(other.to_string()),
    }
}

fn watch_connection(
    mut status: watch::Receiver<ConnectionEvent>,
    callbacks: Arc<Callbacks>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let event = status.borrow_and_update().clone();
                    callbacks.notify_connection(&event);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydra_store::MemoryStore;
    use serde_json::json;

    fn hydra(service: &str) -> Hydra {
        Hydra::new(HydraConfig::new(service), Arc::new(MemoryStore::new()))
    }

    #[test]
    fn create_umf_fills_addresses() {
        let hydra = hydra("billing");
        let umf = hydra.create_umf("ledger", "post", json!({"amount": 3}), None);
        assert_eq!(umf.to, "ledger:/");
        assert_eq!(umf.frm, format!("{}@billing:/", hydra.instance_id()));
        assert!(umf.rmid.is_none());

        let pinned = hydra.create_umf("abc@ledger:[post]/entries", "post", (), Some("m1"));
        assert_eq!(pinned.to, "abc@ledger:[post]/entries");
        assert_eq!(pinned.rmid.as_deref(), Some("m1"));
    }

    #[test]
    fn create_response_targets_the_sender() {
        let hydra = hydra("ledger");
        let request = Umf::new("ledger:/", "balance", json!({})).with_from("xyz@billing:/");
        let reply = hydra.create_response(&request, "balance-result", json!({"balance": 10}));
        assert_eq!(reply.to, "xyz@billing:/");
        assert_eq!(reply.rmid.as_deref(), Some(request.mid.as_str()));
        assert_eq!(reply.frm, hydra.route());
    }

    #[tokio::test]
    async fn operations_before_init_fail() {
        let hydra = hydra("svc");
        let umf = hydra.create_umf("other", "ping", json!({}), None);
        assert!(matches!(hydra.send(&umf).await, Err(HydraError::NotInitialized)));
        assert!(matches!(hydra.dequeue().await, Err(HydraError::NotInitialized)));
        assert!(matches!(hydra.cache(), Err(HydraError::NotInitialized)));
        assert_eq!(hydra.state(), LifecycleState::Unregistered);
        hydra.shutdown(true).await.unwrap();
        assert_eq!(hydra.state(), LifecycleState::Unregistered);
    }

    #[tokio::test]
    async fn invalid_config_fails_init() {
        let hydra = hydra("bad:name");
        assert!(matches!(hydra.init().await, Err(HydraError::Initialization(_))));
        assert_eq!(hydra.state(), LifecycleState::Unregistered);
    }

    #[test]
    fn response_options_builder() {
        let token = CancellationToken::new();
        let options = ResponseOptions::default()
            .expect_type("pong")
            .timeout(Duration::from_secs(2))
            .cancel_on(token);
        assert_eq!(options.expected_type.as_deref(), Some("pong"));
        assert_eq!(options.timeout, Duration::from_secs(2));
        assert_eq!(ResponseOptions::default().timeout, Duration::from_secs(30));
    }
}
