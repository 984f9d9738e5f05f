//! ---
//! hydra_section: "04-runtime-core"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "Presence, dispatch, queueing and correlation runtime."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
//! Durable queue and its polling consumer.
//!
//! Each service owns a `received` list and an `in-progress` list. Dequeue
//! atomically moves the oldest item from one to the other; acknowledgement
//! removes it from `in-progress` and, when processing did not complete, puts
//! it back on `received`. Items dequeued by a consumer that dies before
//! acknowledging stay in `in-progress` until an operator intervenes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hydra_msg::{InboundMessage, Umf};
use hydra_store::{KeySpace, Store};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::callbacks::{Callbacks, DebugEvent, DebugEventType, ErrorHandler};
use crate::metrics::HydraMetrics;
use crate::{HydraError, Result};

/// List-backed queue with a received list and an in-progress list per service.
#[derive(Clone)]
pub struct DurableQueue {
    store: Arc<dyn Store>,
    keys: KeySpace,
    callbacks: Arc<Callbacks>,
    metrics: Option<Arc<HydraMetrics>>,
}

impl DurableQueue {
    /// Queue over `store`.
    pub fn new(
        store: Arc<dyn Store>,
        keys: KeySpace,
        callbacks: Arc<Callbacks>,
        metrics: Option<Arc<HydraMetrics>>,
    ) -> Self {
        Self {
            store,
            keys,
            callbacks,
            metrics,
        }
    }

    /// Push `umf` onto the `received` list of the service it is addressed to.
    pub async fn enqueue<B: Serialize + Sync>(&self, umf: &Umf<B>) -> Result<()> {
        self.enqueue_raw(&umf.to, &umf.to_json()?).await
    }

    /// [`DurableQueue::enqueue`] for an already serialized envelope addressed to `to`.
    pub async fn enqueue_raw(&self, to: &str, json: &str) -> Result<()> {
        let route = hydra_msg::parse_route(to)
            .into_result()
            .map_err(|source| HydraError::route(to, source))?;
        let queue = self.keys.received_queue(&route.service_name);
        let depth = self.store.lpush(&queue, json).await?;
        trace!(queue = %queue, depth, "enqueued");
        self.observe("enqueue");
        self.callbacks.emit_debug(
            DebugEvent::new(DebugEventType::SendQueue, format!("queued for {}", route.service_name))
                .with_umf(json),
        );
        Ok(())
    }

    /// Move the oldest received item of `service` to in-progress and return it.
    pub async fn dequeue(&self, service: &str) -> Result<Option<String>> {
        let item = self
            .store
            .rpoplpush(
                &self.keys.received_queue(service),
                &self.keys.in_progress_queue(service),
            )
            .await?;
        if let Some(raw) = &item {
            self.observe("dequeue");
            self.callbacks.emit_debug(
                DebugEvent::new(DebugEventType::QueueReceived, format!("dequeued from {service}"))
                    .with_umf(raw.as_str()),
            );
        }
        Ok(item)
    }

    /// Drop `raw` from the in-progress list of `service`. When `completed` is
    /// false the item goes back onto `received` for another attempt.
    pub async fn acknowledge(&self, service: &str, raw: &str, completed: bool) -> Result<()> {
        let removed = self
            .store
            .lrem(&self.keys.in_progress_queue(service), -1, raw)
            .await?;
        if removed == 0 {
            debug!(service, "acknowledged item was not in progress");
        }
        if !completed {
            self.store.lpush(&self.keys.received_queue(service), raw).await?;
        }
        self.observe(if completed { "complete" } else { "requeue" });
        self.callbacks.emit_debug(
            DebugEvent::new(
                DebugEventType::MarkQueueMessage,
                format!("marked {service} item completed={completed}"),
            )
            .with_umf(raw),
        );
        Ok(())
    }

    fn observe(&self, op: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.observe_queue(op);
        }
    }
}

/// Poll delay ladder. The first rung is the base delay used while items flow.
#[derive(Debug, Clone)]
pub struct Backoff {
    ladder: Vec<Duration>,
    step: usize,
}

impl Backoff {
    /// An empty ladder falls back to a single 10ms rung.
    pub fn new(ladder: Vec<Duration>) -> Self {
        let ladder = if ladder.is_empty() {
            vec![Duration::from_millis(10)]
        } else {
            ladder
        };
        Self { ladder, step: 0 }
    }

    /// Delay before the next poll.
    pub fn current(&self) -> Duration {
        self.ladder[self.step]
    }

    /// Climb one rung, staying on the last, and return the new delay.
    pub fn on_empty(&mut self) -> Duration {
        self.step = (self.step + 1).min(self.ladder.len() - 1);
        self.current()
    }

    /// Back to the base delay.
    pub fn on_message(&mut self) -> Duration {
        self.step = 0;
        self.current()
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(hydra_common::QueueConfig::default().backoff_ms)
    }
}

/// Work performed on each dequeued item. Implementations acknowledge
/// through the runtime when done.
#[async_trait]
pub trait QueueHandler: Send + Sync + 'static {
    /// Handle one dequeued message. An error is reported and the item stays in progress.
    async fn process(&self, msg: InboundMessage) -> anyhow::Result<()>;
}

/// Polls one service's queue with a self-adjusting delay.
pub struct QueueProcessor {
    queue: DurableQueue,
    service: String,
    backoff: Backoff,
    error_handler: Option<ErrorHandler>,
}

impl QueueProcessor {
    /// Processor polling the queue of `service`.
    pub fn new(queue: DurableQueue, service: impl Into<String>, backoff: Backoff) -> Self {
        Self {
            queue,
            service: service.into(),
            backoff,
            error_handler: None,
        }
    }

    /// Receives dequeue and processing failures. The poll loop keeps running.
    pub fn on_dequeue_error(mut self, handler: impl Fn(&HydraError) + Send + Sync + 'static) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Service whose queue is polled.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// One poll. Returns the delay before the next one.
    pub async fn poll_once(&mut self, handler: &dyn QueueHandler) -> Duration {
        let raw = match self.queue.dequeue(&self.service).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return self.backoff.on_empty(),
            Err(err) => {
                self.report(&err);
                return self.backoff.current();
            }
        };

        match InboundMessage::parse(raw) {
            Ok(msg) => {
                if let Err(err) = handler.process(msg).await {
                    self.report(&HydraError::DequeueHandler(err));
                }
            }
            Err(err) => self.report(&HydraError::Msg(err)),
        }
        self.backoff.on_message()
    }

    fn report(&self, err: &HydraError) {
        debug!(queue = %self.service, error = %err, "queue poll failed");
        if let Some(handler) = &self.error_handler {
            handler(err);
        }
    }

    /// Poll until `cancel` fires. No poll is scheduled after cancellation.
    pub fn spawn<H: QueueHandler>(mut self, handler: Arc<H>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(queue = %self.service, "queue processor started");
            let mut delay = self.backoff.current();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = self.poll_once(handler.as_ref()).await;
            }
            info!(queue = %self.service, "queue processor stopped");
        })
    }
}
