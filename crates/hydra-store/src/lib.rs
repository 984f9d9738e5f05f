//! ---
//! hydra_section: "03-store-adapter"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "Backing store contract and adapters."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Store adapter for Hydra.
//!
//! Everything above this crate talks to the shared store through the
//! [`Store`] trait and names keys through [`KeySpace`]. [`MemoryStore`] is a
//! process-local implementation used by tests and single-process setups;
//! `RedisStore` (feature `redis`) talks to a real server.

pub mod keys;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod store;

/// Result alias used throughout the store crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The adapter was closed and no longer accepts commands.
    #[error("store connection closed")]
    Closed,
    /// A command was issued against a key holding another kind of value.
    #[error("wrong value type at key '{0}'")]
    WrongType(String),
    /// Errors reported by the Redis client.
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

pub use keys::KeySpace;
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;
pub use store::{ConnectionEvent, ConnectionStatus, PubSubMessage, Store, Subscription};
