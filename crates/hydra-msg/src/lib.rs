//! ---
//! hydra_section: "02-messaging-envelope"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "UMF envelope model, wire codec and route grammar."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Universal Message Format (UMF) primitives shared by every Hydra peer.

pub mod route;
pub mod umf;

/// Shared result type for envelope operations.
pub type Result<T> = std::result::Result<T, MsgError>;

/// Errors raised while encoding or decoding envelopes.
#[derive(Debug, thiserror::Error)]
pub enum MsgError {
    /// Wire payload was not a JSON object.
    #[error("envelope must be a JSON object")]
    NotAnObject,
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub use route::{parse_route, RouteEntry, RouteError};
pub use umf::{InboundMessage, ReceivedUmf, Umf, UMF_VERSION};
