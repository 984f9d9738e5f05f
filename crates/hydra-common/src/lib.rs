//! ---
//! hydra_section: "01-core-functionality"
//! hydra_subsection: "module"
//! hydra_type: "source"
//! hydra_scope: "code"
//! hydra_description: "Shared primitives and utilities for the Hydra runtime."
//! hydra_version: "v0.1.0"
//! hydra_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Shared primitives for the Hydra workspace.
//! This crate exposes configuration loading and logging setup consumed by
//! the store adapters and the runtime core.

pub mod config;
pub mod logging;

pub use config::{
    HydraConfig, LoadedHydraConfig, LoggingConfig, PresenceConfig, QueueConfig, RedisConfig,
};
pub use logging::{init_tracing, LogFormat};
