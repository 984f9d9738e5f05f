//! ---
//! hydra_section: "04-runtime-core"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "Presence, dispatch, queueing and correlation runtime."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use hydra_msg::InboundMessage;
use hydra_store::ConnectionEvent;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::HydraError;

/// Inbound message handler.
pub type MessageHandler =
    Arc<dyn Fn(InboundMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
/// Receives errors caught at the dispatch boundary and in background loops.
pub type ErrorHandler = Arc<dyn Fn(&HydraError) + Send + Sync>;
/// Receives debug events.
pub type DebugHandler = Arc<dyn Fn(&DebugEvent) + Send + Sync>;
/// Receives store connection status transitions.
pub type ConnectionHandler = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// Kinds of activity reported to the debug callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugEventType {
    /// An inbound message was decoded.
    MessageReceived,
    /// A direct send was published.
    SendMessage,
    /// An item was taken from a queue.
    QueueReceived,
    /// An item was added to a queue.
    SendQueue,
    /// A broadcast was published.
    SendBroadcastMessage,
    /// A queue item was acknowledged.
    MarkQueueMessage,
    /// The service registration record was written.
    Register,
}

/// One debug notification.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugEvent {
    /// What happened.
    pub event_type: DebugEventType,
    /// Wire form of the envelope involved, when there is one.
    pub umf: Option<String>,
    /// Human-readable summary.
    pub message: String,
}

impl DebugEvent {
    /// Event without an envelope attached.
    pub fn new(event_type: DebugEventType, message: impl Into<String>) -> Self {
        Self {
            event_type,
            umf: None,
            message: message.into(),
        }
    }

    /// Attach the wire form of the envelope involved.
    pub fn with_umf(mut self, umf: impl Into<String>) -> Self {
        self.umf = Some(umf.into());
        self
    }
}

/// Single-registration callback slots. The last registration wins.
#[derive(Default)]
pub struct Callbacks {
    message: RwLock<Option<MessageHandler>>,
    internal_error: RwLock<Option<ErrorHandler>>,
    debug: RwLock<Option<DebugHandler>>,
    connection: RwLock<Option<ConnectionHandler>>,
}

impl Callbacks {
    /// Install the inbound message handler.
    pub fn set_message_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: MessageHandler = Arc::new(move |msg| Box::pin(handler(msg)));
        *self.message.write() = Some(handler);
    }

    /// Install the internal-error handler.
    pub fn set_error_handler(&self, handler: impl Fn(&HydraError) + Send + Sync + 'static) {
        *self.internal_error.write() = Some(Arc::new(handler));
    }

    /// Install the debug event handler.
    pub fn set_debug_handler(&self, handler: impl Fn(&DebugEvent) + Send + Sync + 'static) {
        *self.debug.write() = Some(Arc::new(handler));
    }

    /// Install the connection status handler.
    pub fn set_connection_handler(
        &self,
        handler: impl Fn(&ConnectionEvent) + Send + Sync + 'static,
    ) {
        *self.connection.write() = Some(Arc::new(handler));
    }

    /// Current message handler, if one is installed.
    pub fn message_handler(&self) -> Option<MessageHandler> {
        self.message.read().clone()
    }

    /// Log and forward an error that must not escape a background loop.
    pub fn report_error(&self, err: &HydraError) {
        warn!(error = %err, "hydra internal error");
        let handler = self.internal_error.read().clone();
        if let Some(handler) = handler {
            handler(err);
        }
    }

    /// Log `event` and forward it to the debug handler.
    pub fn emit_debug(&self, event: DebugEvent) {
        debug!(event = ?event.event_type, umf = ?event.umf, "{}", event.message);
        let handler = self.debug.read().clone();
        if let Some(handler) = handler {
            handler(&event);
        }
    }

    /// Log a connection transition and forward it to the connection handler.
    pub fn notify_connection(&self, event: &ConnectionEvent) {
        match event.message.as_deref() {
            Some(detail) => warn!(status = ?event.status, detail, "store connection status changed"),
            None => debug!(status = ?event.status, "store connection status changed"),
        }
        let handler = self.connection.read().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }
}
