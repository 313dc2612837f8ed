use crate::coordinator::Coordinator;
use crate::provision::ProvisionState;
use crate::CoreError;
use sandbar_engine::{ProcessHandle, Runtime, ServerReady};
use sandbar_tree::MountTree;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// A consumer's claim on the shared runtime, bound to one project and one
/// coordinator generation.
///
/// Every mutation funnels through the lease so that attempts from a
/// superseded binding (the runtime was switched, reset, or torn down under
/// this consumer) are refused with [`CoreError::StaleLease`] instead of
/// landing in a newer consumer's session. Call
/// [`release`](Self::release) when done; a lease dropped without releasing
/// leaks its claim and is logged.
pub struct RuntimeLease {
    coordinator: Arc<Coordinator>,
    project: String,
    generation: u64,
    runtime: Arc<dyn Runtime>,
    released: bool,
}

impl std::fmt::Debug for RuntimeLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeLease")
            .field("project", &self.project)
            .field("generation", &self.generation)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl RuntimeLease {
    pub(crate) fn bind(
        coordinator: Arc<Coordinator>,
        project: String,
        generation: u64,
        runtime: Arc<dyn Runtime>,
    ) -> Self {
        Self {
            coordinator,
            project,
            generation,
            runtime,
            released: false,
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Whether this lease still addresses the current binding.
    pub fn is_live(&self) -> bool {
        self.coordinator.generation() == self.generation
    }

    /// Direct runtime access for read-side consumers such as the change
    /// bridge. Liveness is not re-checked here; mutations should go through
    /// the lease methods instead.
    pub fn runtime(&self) -> Arc<dyn Runtime> {
        Arc::clone(&self.runtime)
    }

    fn check_live(&self) -> Result<(), CoreError> {
        if self.is_live() {
            Ok(())
        } else {
            Err(CoreError::StaleLease)
        }
    }

    /// Write one file into the runtime, creating parent directories as
    /// needed.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<(), CoreError> {
        self.check_live()?;
        let map_err = |source| CoreError::Write {
            path: path.to_owned(),
            source,
        };
        if let Some(parent) = path.rfind('/').map(|idx| &path[..idx]) {
            if !parent.is_empty() {
                self.runtime.mkdir_all(parent).await.map_err(map_err)?;
            }
        }
        self.runtime.write_file(path, content).await.map_err(map_err)
    }

    pub async fn mount_files(&self, files: &MountTree) -> Result<(), CoreError> {
        self.check_live()?;
        self.coordinator.mount_files(files, &self.project).await
    }

    pub async fn spawn(&self, command: &str, args: &[String]) -> Result<ProcessHandle, CoreError> {
        self.check_live()?;
        self.coordinator.spawn(command, args, &self.project).await
    }

    pub async fn subscribe_server_ready(
        &self,
    ) -> Result<broadcast::Receiver<ServerReady>, CoreError> {
        self.check_live()?;
        self.coordinator.subscribe_server_ready(&self.project).await
    }

    /// Advance the observable provisioning state on behalf of this lease.
    pub fn set_state(&self, next: ProvisionState) -> Result<(), CoreError> {
        self.coordinator.try_set_provision(self.generation, next)
    }

    /// Surrender the claim. Consuming the lease makes a second release
    /// unrepresentable.
    pub async fn release(mut self) {
        self.released = true;
        self.coordinator.release().await;
    }

    /// Swap this claim for one on `project_id`: release first, then acquire,
    /// so the coordinator sees the reference count dip before the new claim.
    pub async fn rebind(self, project_id: &str) -> Result<RuntimeLease, CoreError> {
        let coordinator = Arc::clone(&self.coordinator);
        self.release().await;
        coordinator.acquire(project_id).await
    }
}

impl Drop for RuntimeLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                project = %self.project,
                "runtime lease dropped without release; claim leaks until reset"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbar_engine::MockEngine;

    #[tokio::test]
    async fn write_creates_parent_directories() {
        let engine = Arc::new(MockEngine::new());
        let coordinator = Coordinator::new(engine);
        let lease = coordinator.acquire("proj-1").await.unwrap();

        lease
            .write_file("/src/components/button.jsx", "export default Button")
            .await
            .unwrap();
        assert_eq!(
            lease
                .runtime()
                .read_file("/src/components/button.jsx")
                .await
                .unwrap(),
            "export default Button"
        );
        lease.release().await;
    }

    #[tokio::test]
    async fn rebind_switches_binding() {
        let engine = Arc::new(MockEngine::new());
        let coordinator = Coordinator::new(engine.clone());

        let lease = coordinator.acquire("proj-1").await.unwrap();
        let lease = lease.rebind("proj-2").await.unwrap();
        assert_eq!(lease.project(), "proj-2");
        assert_eq!(
            coordinator.current_project().await,
            Some("proj-2".to_owned())
        );
        // The old claim was surrendered before the new one was taken, so the
        // first instance was torn down at zero claims.
        assert_eq!(engine.teardowns(), 1);
        assert_eq!(engine.boots(), 2);
        lease.release().await;
    }

    #[tokio::test]
    async fn stale_lease_refuses_mutations() {
        let engine = Arc::new(MockEngine::new());
        let coordinator = Coordinator::new(engine);

        let stale = coordinator.acquire("proj-1").await.unwrap();
        let live = coordinator.acquire("proj-2").await.unwrap();

        assert!(!stale.is_live());
        assert!(matches!(
            stale.write_file("/a.js", "x").await,
            Err(CoreError::StaleLease)
        ));
        assert!(matches!(
            stale.spawn("npm", &[]).await,
            Err(CoreError::StaleLease)
        ));
        assert!(matches!(
            stale.subscribe_server_ready().await,
            Err(CoreError::StaleLease)
        ));
        assert!(live.is_live());

        stale.release().await;
        live.release().await;
    }
}
