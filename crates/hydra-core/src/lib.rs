//! ---
//! hydra_section: "04-runtime-core"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "Presence, dispatch, queueing and correlation runtime."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Hydra runtime core.
//!
//! [`Hydra`] gives a process an identity within a fleet of services sharing a
//! store: it publishes presence and health, discovers peers, and exchanges
//! UMF messages directly, by broadcast, through durable queues, and as
//! correlated request/response pairs.

use std::time::Duration;

use hydra_msg::{MsgError, RouteError};
use hydra_store::StoreError;

pub mod cache;
pub mod callbacks;
pub mod correlation;
pub mod dispatch;
pub mod events;
pub mod metrics;
pub mod net;
pub mod presence;
pub mod queue;
pub mod runtime;

/// Result alias used throughout the runtime.
pub type Result<T> = std::result::Result<T, HydraError>;

/// Runtime error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum HydraError {
    /// Store unreachable or configuration unusable during init. Fatal.
    #[error("initialization failed: {0}")]
    Initialization(String),
    /// An operation needing a live connection ran before init completed or after shutdown.
    #[error("hydra is not initialized")]
    NotInitialized,
    /// A routing address could not be parsed.
    #[error("invalid route '{route}': {source}")]
    Route {
        /// The address as given.
        route: String,
        /// Why it was rejected.
        source: RouteError,
    },
    /// No live instance was reachable for a send that expects a reply.
    #[error("no live recipient for '{0}'")]
    NoRecipient(String),
    /// A second waiter was registered for a message id still awaiting a response.
    #[error("message {0} is already waiting for a response")]
    DuplicateCorrelation(String),
    /// A correlated response did not arrive in time.
    #[error("no response within {0:?}")]
    Timeout(Duration),
    /// The caller's token fired or the runtime shut down while waiting.
    #[error("operation cancelled")]
    Cancelled,
    /// A user message handler failed.
    #[error("message handler failed: {0:#}")]
    InternalDispatch(anyhow::Error),
    /// A queue handler failed while processing a dequeued message.
    #[error("queue handler failed: {0:#}")]
    DequeueHandler(anyhow::Error),
    /// A store command failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// An envelope could not be encoded or decoded.
    #[error(transparent)]
    Msg(#[from] MsgError),
    /// A value could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HydraError {
    pub(crate) fn route(route: &str, source: RouteError) -> Self {
        Self::Route {
            route: route.to_owned(),
            source,
        }
    }
}

pub use cache::Cache;
pub use callbacks::{DebugEvent, DebugEventType};
pub use correlation::{PendingResponse, ResponseRegistry, ResponseStream};
pub use metrics::HydraMetrics;
pub use presence::{HealthEntry, Identity, MemoryStats, PresenceEntry, RegistrationEntry};
pub use queue::{Backoff, DurableQueue, QueueHandler, QueueProcessor};
pub use runtime::{Hydra, LifecycleState, ResponseOptions};

pub use hydra_common::HydraConfig;
pub use hydra_msg::{InboundMessage, ReceivedUmf, RouteEntry, Umf};
pub use hydra_store::{ConnectionEvent, ConnectionStatus, MemoryStore, Store};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_errors_name_the_address() {
        let err = HydraError::route("svc", RouteError::InvalidSegments);
        assert_eq!(
            err.to_string(),
            "invalid route 'svc': route field has invalid number of routable segments"
        );
    }

    #[test]
    fn handler_errors_keep_context_chain() {
        let err = HydraError::InternalDispatch(
            anyhow::anyhow!("db down").context("loading order"),
        );
        assert_eq!(err.to_string(), "message handler failed: loading order: db down");
    }
}
