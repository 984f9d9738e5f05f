//! ---
//! hydra_section: "04-runtime-core"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "Presence, dispatch, queueing and correlation runtime."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
//! Outbound routing and inbound demultiplexing.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use hydra_msg::{InboundMessage, Umf};
use hydra_store::{KeySpace, Store, Subscription};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::callbacks::{Callbacks, DebugEvent, DebugEventType};
use crate::correlation::ResponseRegistry;
use crate::events::EventQueue;
use crate::metrics::HydraMetrics;
use crate::presence::PresenceEngine;
use crate::{HydraError, Result};

/// Routes outbound envelopes to store channels and pumps inbound deliveries.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    keys: KeySpace,
    presence: Arc<PresenceEngine>,
    callbacks: Arc<Callbacks>,
    metrics: Option<Arc<HydraMetrics>>,
}

impl Dispatcher {
    /// Dispatcher resolving unpinned addresses through `presence`.
    pub fn new(
        store: Arc<dyn Store>,
        keys: KeySpace,
        presence: Arc<PresenceEngine>,
        callbacks: Arc<Callbacks>,
        metrics: Option<Arc<HydraMetrics>>,
    ) -> Self {
        Self {
            store,
            keys,
            presence,
            callbacks,
            metrics,
        }
    }

    /// Publish to one instance of the addressed service.
    ///
    /// A pinned instance is published to directly. Otherwise the first entry
    /// of a freshly shuffled discovery list is picked. Returns whether any
    /// subscriber received the payload; `Ok(false)` when nothing is live.
    pub async fn send<B: Serialize + Sync>(&self, umf: &Umf<B>) -> Result<bool> {
        self.send_raw(&umf.to, &umf.to_json()?).await
    }

    /// [`Dispatcher::send`] for an already serialized envelope addressed to `to`.
    pub async fn send_raw(&self, to: &str, json: &str) -> Result<bool> {
        let route = hydra_msg::parse_route(to)
            .into_result()
            .map_err(|source| HydraError::route(to, source))?;

        let instance = if route.has_instance() {
            route.instance.clone()
        } else {
            match self.presence.discover(&route.service_name).await?.into_iter().next() {
                Some(entry) => entry.instance_id,
                None => {
                    debug!(service = %route.service_name, "no live instance for direct send");
                    self.observe_dropped();
                    return Ok(false);
                }
            }
        };

        let channel = self.keys.instance_channel(&route.service_name, &instance);
        let receivers = self.store.publish(&channel, json).await?;
        trace!(channel = %channel, receivers, "direct send published");
        if let Some(metrics) = &self.metrics {
            metrics.observe_sent("direct");
        }
        self.callbacks.emit_debug(
            DebugEvent::new(DebugEventType::SendMessage, format!("sent to {channel}")).with_umf(json),
        );
        Ok(receivers > 0)
    }

    /// Publish to every subscribed instance of the addressed service.
    /// Returns the number of receivers.
    pub async fn broadcast<B: Serialize + Sync>(&self, umf: &Umf<B>) -> Result<usize> {
        self.broadcast_raw(&umf.to, &umf.to_json()?).await
    }

    /// [`Dispatcher::broadcast`] for an already serialized envelope addressed to `to`.
    pub async fn broadcast_raw(&self, to: &str, json: &str) -> Result<usize> {
        let route = hydra_msg::parse_route(to)
            .into_result()
            .map_err(|source| HydraError::route(to, source))?;
        let channel = self.keys.broadcast_channel(&route.service_name);
        let receivers = self.store.publish(&channel, json).await?;
        trace!(channel = %channel, receivers, "broadcast published");
        if let Some(metrics) = &self.metrics {
            metrics.observe_sent("broadcast");
        }
        self.callbacks.emit_debug(
            DebugEvent::new(DebugEventType::SendBroadcastMessage, format!("broadcast to {channel}"))
                .with_umf(json),
        );
        Ok(receivers)
    }

    fn observe_dropped(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.observe_dropped();
        }
    }

    /// Pump deliveries from `subscription` until cancelled or the store ends it.
    ///
    /// Each delivery is decoded here and handled on its own task: first offered
    /// to the correlation registry, then passed to the message handler.
    pub fn spawn_inbound(
        self: Arc<Self>,
        mut subscription: Subscription,
        registry: ResponseRegistry,
        events: Arc<EventQueue>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let delivery = tokio::select! {
                    _ = cancel.cancelled() => break,
                    delivery = subscription.recv() => delivery,
                };
                let Some(delivery) = delivery else {
                    debug!("subscription closed by store");
                    break;
                };

                let msg = match InboundMessage::parse(delivery.payload) {
                    Ok(msg) => msg,
                    Err(err) => {
                        self.observe_dropped();
                        self.callbacks.report_error(&HydraError::Msg(err));
                        continue;
                    }
                };
                if let Some(metrics) = &self.metrics {
                    metrics.observe_received();
                }
                self.callbacks.emit_debug(
                    DebugEvent::new(
                        DebugEventType::MessageReceived,
                        format!("received {} on {}", msg.typ, delivery.channel),
                    )
                    .with_umf(msg.raw()),
                );

                let dispatcher = self.clone();
                let registry = registry.clone();
                if !events.spawn(async move { dispatcher.handle(msg, &registry).await }) {
                    break;
                }
            }
            debug!("inbound pump stopped");
        })
    }

    async fn handle(&self, msg: InboundMessage, registry: &ResponseRegistry) {
        if registry.try_resolve(&msg) {
            trace!(mid = %msg.umf().mid, typ = %msg.typ, "delivered to response waiter");
        }
        let Some(handler) = self.callbacks.message_handler() else {
            trace!(typ = %msg.typ, "no message handler registered");
            return;
        };
        let mid = msg.umf().mid.clone();
        let err = match AssertUnwindSafe(async move { handler(msg).await }).catch_unwind().await {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err,
            Err(payload) => anyhow::anyhow!("handler panicked: {}", panic_message(payload.as_ref())),
        };
        debug!(mid = %mid, "message handler failed");
        if let Some(metrics) = &self.metrics {
            metrics.observe_handler_error();
        }
        self.callbacks.report_error(&HydraError::InternalDispatch(err));
    }
}

fn panic_message<'a>(payload: &'a (dyn Any + Send + 'static)) -> &'a str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
