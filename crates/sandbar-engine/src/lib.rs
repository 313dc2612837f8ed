//! Virtualization-engine boundary for Sandbar.
//!
//! This crate defines the narrow surface the coordination core depends on:
//! the [`Engine`] trait (boot) and the [`Runtime`] trait (mount, spawn,
//! filesystem primitives, change watching, and the server-ready event
//! source), plus [`ProcessHandle`] for line-oriented process output with an
//! exit-code future. The real engine lives outside this codebase; the
//! in-memory [`MockEngine`] implements the full surface for tests and the
//! CLI demo.

pub mod engine;
pub mod mock;
pub mod process;

pub use engine::{Engine, FsEvent, FsWatcher, Runtime, ServerReady};
pub use mock::{CommandScript, MockEngine};
pub use process::{ProcessController, ProcessHandle};

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("engine boot failed: {0}")]
    Boot(String),
    #[error("mount failed: {0}")]
    Mount(String),
    #[error("no file at '{0}'")]
    PathNotFound(String),
    #[error("failed to spawn '{0}'")]
    Spawn(String),
    #[error("runtime is torn down")]
    TornDown,
}
