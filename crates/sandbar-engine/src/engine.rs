use crate::process::ProcessHandle;
use crate::EngineError;
use async_trait::async_trait;
use sandbar_tree::MountTree;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Fired once the provisioned dev server starts accepting connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerReady {
    pub port: u16,
    pub url: String,
}

/// A change notification for a watched runtime path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEvent {
    Created,
    Changed,
    Removed,
}

/// Subscription to change events for a single path. Dropping the watcher
/// detaches the subscription.
#[derive(Debug)]
pub struct FsWatcher {
    events: mpsc::UnboundedReceiver<FsEvent>,
}

impl FsWatcher {
    pub fn new(events: mpsc::UnboundedReceiver<FsEvent>) -> Self {
        Self { events }
    }

    /// Next event, or `None` once the runtime side is gone.
    pub async fn next_event(&mut self) -> Option<FsEvent> {
        self.events.recv().await
    }
}

/// Factory boundary for the external virtualization engine.
#[async_trait]
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    /// Boot a fresh runtime instance. Expensive; callers are expected to
    /// deduplicate concurrent boots.
    async fn boot(&self) -> Result<Arc<dyn Runtime>, EngineError>;
}

/// One live sandboxed runtime: an ephemeral filesystem plus a process-spawn
/// surface. All methods may suspend; none may block unrelated callers.
#[async_trait]
pub trait Runtime: Send + Sync {
    async fn mount(&self, files: &MountTree) -> Result<(), EngineError>;

    /// Spawn a process. Never deduplicated: each call is a distinct process.
    async fn spawn(&self, command: &str, args: &[String]) -> Result<ProcessHandle, EngineError>;

    async fn read_file(&self, path: &str) -> Result<String, EngineError>;

    async fn write_file(&self, path: &str, content: &str) -> Result<(), EngineError>;

    async fn mkdir_all(&self, path: &str) -> Result<(), EngineError>;

    async fn remove_recursive(&self, path: &str) -> Result<(), EngineError>;

    /// Names of the entries directly under `path`.
    async fn read_dir(&self, path: &str) -> Result<Vec<String>, EngineError>;

    async fn watch(&self, path: &str) -> Result<FsWatcher, EngineError>;

    fn subscribe_server_ready(&self) -> broadcast::Receiver<ServerReady>;

    /// Destroy the instance. Idempotent; never fails.
    async fn teardown(&self);
}
