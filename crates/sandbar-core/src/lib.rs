//! Coordination core for the one live sandboxed runtime.
//!
//! This crate ties the engine boundary and the document model together into
//! the session layer: the [`Coordinator`] owns the singleton runtime instance
//! (boot deduplication, reference counting, the project-switch exclusion
//! protocol), [`provision`] drives a mounted file tree up to a running dev
//! server, [`RuntimeLease`] is the per-consumer acquire/write/release
//! contract with stale-attempt suppression, and [`ChangeBridge`] merges
//! runtime-side file mutations back into the document model.

pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod lease;
pub mod provision;

pub use bridge::ChangeBridge;
pub use config::{parse_config_file, parse_config_str, CommandLine, ConfigError, ProvisionConfig};
pub use coordinator::Coordinator;
pub use lease::RuntimeLease;
pub use provision::{provision, validate_transition, ProvisionState};

use sandbar_engine::EngineError;
use sandbar_tree::TreeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("engine boot failed: {0}")]
    Boot(String),
    #[error("file mount failed: {0}")]
    Mount(String),
    #[error("dependency install exited with code {code}")]
    Install { code: i32 },
    #[error("dev server exited with code {code} before signalling ready")]
    Start { code: i32 },
    #[error("write failed for '{path}': {source}")]
    Write {
        path: String,
        #[source]
        source: EngineError,
    },
    #[error("project '{requested}' is not the current binding")]
    NotBound { requested: String },
    #[error("no live runtime instance; acquire one first")]
    NoInstance,
    #[error("runtime lease is stale")]
    StaleLease,
    #[error("invalid provisioning transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("tree error: {0}")]
    Tree(#[from] TreeError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}
