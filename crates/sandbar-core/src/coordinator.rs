use crate::lease::RuntimeLease;
use crate::provision::ProvisionState;
use crate::CoreError;
use sandbar_engine::{Engine, ProcessHandle, Runtime, ServerReady};
use sandbar_tree::MountTree;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

/// Runtime filesystem entries that survive a project switch.
const RESERVED_PATHS: [&str; 4] = ["tmp", "proc", "dev", "sys"];

/// Command names matched when killing long-running processes before a
/// switch. A heuristic safety net, not a correctness guarantee.
const KNOWN_PROCESS_PATTERNS: [&str; 6] =
    ["npm", "node", "react-scripts", "express", "vite", "webpack"];

/// Memoized outcome of an in-flight boot or mount. The cell stays `None`
/// while the operation runs; waiters observe the value through cloned
/// receivers so concurrent callers share one underlying operation.
type PendingOutcome = watch::Receiver<Option<Result<(), String>>>;

struct State {
    runtime: Option<Arc<dyn Runtime>>,
    project: Option<String>,
    refs: u32,
    boot_pending: Option<PendingOutcome>,
    mount_pending: Option<PendingOutcome>,
}

/// Owner and arbiter of the one live runtime instance.
///
/// Explicitly constructed and injectable — never a module-level static — so
/// tests can run independent coordinators side by side. All consumer access
/// goes through [`acquire`](Self::acquire) and the returned
/// [`RuntimeLease`]; consumers never tear the instance down directly.
pub struct Coordinator {
    engine: Arc<dyn Engine>,
    state: Mutex<State>,
    /// Project-switch exclusion: teardown-and-rebind sequences never
    /// interleave, and acquires arriving mid-switch wait here.
    switch_lock: Mutex<()>,
    /// Bumped on every switch, teardown, and force reset. Leases capture the
    /// value at bind time; a mismatch marks the lease stale.
    generation: AtomicU64,
    provision_tx: watch::Sender<ProvisionState>,
    /// Keeps the provisioning channel open: `watch::Sender::send` fails
    /// without updating the value once every receiver is dropped.
    _provision_rx: watch::Receiver<ProvisionState>,
}

impl Coordinator {
    pub fn new(engine: Arc<dyn Engine>) -> Arc<Self> {
        let (provision_tx, provision_rx) = watch::channel(ProvisionState::Idle);
        Arc::new(Self {
            engine,
            state: Mutex::new(State {
                runtime: None,
                project: None,
                refs: 0,
                boot_pending: None,
                mount_pending: None,
            }),
            switch_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            provision_tx,
            _provision_rx: provision_rx,
        })
    }

    /// Claim the shared runtime for `project_id`.
    ///
    /// Waits out any in-progress switch, performs one when the requested
    /// project differs from the current binding, increments the reference
    /// count, and boots the engine lazily — concurrent acquires during a
    /// boot share a single underlying engine boot.
    pub async fn acquire(self: &Arc<Self>, project_id: &str) -> Result<RuntimeLease, CoreError> {
        let generation = {
            let _switching = self.switch_lock.lock().await;
            let needs_switch = {
                let state = self.state.lock().await;
                state
                    .project
                    .as_deref()
                    .is_some_and(|current| current != project_id)
            };
            if needs_switch {
                self.switch_binding(project_id).await;
            }
            let mut state = self.state.lock().await;
            if state.project.as_deref() != Some(project_id) {
                state.project = Some(project_id.to_owned());
            }
            state.refs += 1;
            self.generation()
        };

        match self.runtime_shared().await {
            Ok(runtime) => Ok(RuntimeLease::bind(
                Arc::clone(self),
                project_id.to_owned(),
                generation,
                runtime,
            )),
            Err(e) => {
                // The claim taken above is surrendered on a failed boot.
                self.release().await;
                Err(e)
            }
        }
    }

    /// Mount a transformed file tree for the given binding.
    ///
    /// Idempotent per binding: a mount already in flight (or already
    /// completed) for the current binding is shared, not repeated. A failed
    /// mount clears the memoized outcome so a retry issues a fresh mount.
    pub async fn mount_files(&self, files: &MountTree, project_id: &str) -> Result<(), CoreError> {
        loop {
            let waiter = {
                let mut state = self.state.lock().await;
                if state.project.as_deref() != Some(project_id) {
                    return Err(CoreError::NotBound {
                        requested: project_id.to_owned(),
                    });
                }
                let runtime = state.runtime.clone().ok_or(CoreError::NoInstance)?;
                match &state.mount_pending {
                    Some(rx) => rx.clone(),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        state.mount_pending = Some(rx);
                        drop(state);
                        return self.mount_now(&runtime, files, project_id, tx).await;
                    }
                }
            };
            match await_outcome(waiter).await {
                Some(Ok(())) => return Ok(()),
                Some(Err(msg)) => return Err(CoreError::Mount(msg)),
                // Pending vanished (switch raced us): re-check the binding.
                None => continue,
            }
        }
    }

    async fn mount_now(
        &self,
        runtime: &Arc<dyn Runtime>,
        files: &MountTree,
        project_id: &str,
        tx: watch::Sender<Option<Result<(), String>>>,
    ) -> Result<(), CoreError> {
        info!("mounting files for project {project_id}");
        let result = runtime.mount(files).await;
        match result {
            Ok(()) => {
                // Successful outcome stays memoized for the binding's
                // lifetime; an immediately repeated mount is a no-op.
                let _ = tx.send(Some(Ok(())));
                Ok(())
            }
            Err(e) => {
                let mut state = self.state.lock().await;
                if state.project.as_deref() == Some(project_id) {
                    state.mount_pending = None;
                }
                drop(state);
                let msg = e.to_string();
                let _ = tx.send(Some(Err(msg.clone())));
                Err(CoreError::Mount(msg))
            }
        }
    }

    /// Spawn a process in the bound runtime. Pass-through: each call is a
    /// distinct process, never deduplicated.
    pub async fn spawn(
        &self,
        command: &str,
        args: &[String],
        project_id: &str,
    ) -> Result<ProcessHandle, CoreError> {
        let runtime = self.bound_runtime(project_id).await?;
        Ok(runtime.spawn(command, args).await?)
    }

    /// Per-binding access to the engine's server-ready event channel.
    pub async fn subscribe_server_ready(
        &self,
        project_id: &str,
    ) -> Result<broadcast::Receiver<ServerReady>, CoreError> {
        let runtime = self.bound_runtime(project_id).await?;
        Ok(runtime.subscribe_server_ready())
    }

    /// Surrender one claim. On the transition to zero outstanding claims the
    /// instance is torn down; releasing with no claims outstanding is a
    /// programming error and is logged, never treated as a negative count.
    pub async fn release(&self) {
        let doomed = {
            let mut state = self.state.lock().await;
            if state.refs == 0 {
                warn!("release with no outstanding claims (double release?)");
                return;
            }
            state.refs -= 1;
            if state.refs > 0 {
                debug!(refs = state.refs, "released one runtime claim");
                return;
            }
            let runtime = state.runtime.take();
            state.project = None;
            state.boot_pending = None;
            state.mount_pending = None;
            self.generation.fetch_add(1, Ordering::SeqCst);
            let _ = self.provision_tx.send(ProvisionState::Idle);
            runtime
        };
        if let Some(runtime) = doomed {
            info!("last claim released; tearing down runtime instance");
            self.kill_known_processes(&runtime).await;
            runtime.teardown().await;
        }
    }

    /// Emergency full teardown bypassing reference counting. Operator
    /// recovery only — not part of the normal lifecycle.
    pub async fn force_reset(&self) {
        let _switching = self.switch_lock.lock().await;
        warn!("force reset: tearing down runtime regardless of claims");
        let doomed = {
            let mut state = self.state.lock().await;
            state.project = None;
            state.refs = 0;
            state.boot_pending = None;
            state.mount_pending = None;
            self.generation.fetch_add(1, Ordering::SeqCst);
            let _ = self.provision_tx.send(ProvisionState::Idle);
            state.runtime.take()
        };
        if let Some(runtime) = doomed {
            self.kill_known_processes(&runtime).await;
            self.clear_filesystem(&runtime).await;
            runtime.teardown().await;
        }
    }

    /// Observer access to the provisioning state channel. Reset to `Idle`
    /// whenever the binding changes.
    pub fn watch_provision(&self) -> watch::Receiver<ProvisionState> {
        self.provision_tx.subscribe()
    }

    pub async fn current_project(&self) -> Option<String> {
        self.state.lock().await.project.clone()
    }

    pub async fn ref_count(&self) -> u32 {
        self.state.lock().await.refs
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Transition the observable provisioning state on behalf of a lease.
    /// Rejected when the lease's generation is no longer current, so a stale
    /// attempt can never fire into a newer consumer's view.
    pub(crate) fn try_set_provision(
        &self,
        lease_generation: u64,
        next: ProvisionState,
    ) -> Result<(), CoreError> {
        if self.generation() != lease_generation {
            return Err(CoreError::StaleLease);
        }
        let current = *self.provision_tx.borrow();
        crate::provision::validate_transition(current, next)?;
        let _ = self.provision_tx.send(next);
        Ok(())
    }

    async fn bound_runtime(&self, project_id: &str) -> Result<Arc<dyn Runtime>, CoreError> {
        let state = self.state.lock().await;
        if state.project.as_deref() != Some(project_id) {
            return Err(CoreError::NotBound {
                requested: project_id.to_owned(),
            });
        }
        state.runtime.clone().ok_or(CoreError::NoInstance)
    }

    /// Return the shared instance, booting it if necessary. Exactly one
    /// engine boot is issued no matter how many callers arrive while it is
    /// in flight; all of them observe the same outcome.
    async fn runtime_shared(&self) -> Result<Arc<dyn Runtime>, CoreError> {
        loop {
            let waiter = {
                let mut state = self.state.lock().await;
                if let Some(runtime) = &state.runtime {
                    return Ok(Arc::clone(runtime));
                }
                match &state.boot_pending {
                    Some(rx) => rx.clone(),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        state.boot_pending = Some(rx);
                        drop(state);
                        return self.boot_now(tx).await;
                    }
                }
            };
            match await_outcome(waiter).await {
                Some(Ok(())) => {} // instance should now be present; re-check
                Some(Err(msg)) => return Err(CoreError::Boot(msg)),
                // Booter was superseded by a switch; re-check and retry.
                None => {}
            }
        }
    }

    async fn boot_now(
        &self,
        tx: watch::Sender<Option<Result<(), String>>>,
    ) -> Result<Arc<dyn Runtime>, CoreError> {
        let started_at = self.generation();
        debug!("booting runtime instance via engine '{}'", self.engine.name());
        let result = self.engine.boot().await;

        let mut state = self.state.lock().await;
        if self.generation() != started_at {
            // A switch happened mid-boot: this instance belongs to a binding
            // that no longer exists. Discard it and let waiters retry.
            drop(state);
            if let Ok(runtime) = result {
                debug!("discarding runtime booted for a superseded binding");
                runtime.teardown().await;
            }
            drop(tx);
            return Err(CoreError::StaleLease);
        }
        state.boot_pending = None;
        match result {
            Ok(runtime) => {
                state.runtime = Some(Arc::clone(&runtime));
                drop(state);
                info!("runtime instance booted");
                let _ = tx.send(Some(Ok(())));
                Ok(runtime)
            }
            Err(e) => {
                drop(state);
                let msg = e.to_string();
                let _ = tx.send(Some(Err(msg.clone())));
                Err(CoreError::Boot(msg))
            }
        }
    }

    /// The switch protocol. Caller holds the switch lock. Every cleanup step
    /// is best-effort: failures are logged and the remaining steps still
    /// run, so an unrecoverable engine error cannot strand the switch.
    async fn switch_binding(&self, new_project: &str) {
        let (runtime, old_project) = {
            let mut state = self.state.lock().await;
            (state.runtime.take(), state.project.clone())
        };
        info!(
            "switching binding from {} to {new_project}",
            old_project.as_deref().unwrap_or("<none>")
        );
        if let Some(runtime) = &runtime {
            self.kill_known_processes(runtime).await;
            self.clear_filesystem(runtime).await;
            runtime.teardown().await;
        }
        let mut state = self.state.lock().await;
        state.boot_pending = None;
        state.mount_pending = None;
        state.project = Some(new_project.to_owned());
        self.generation.fetch_add(1, Ordering::SeqCst);
        let _ = self.provision_tx.send(ProvisionState::Idle);
    }

    /// Best-effort kill of known long-running dev processes by name.
    async fn kill_known_processes(&self, runtime: &Arc<dyn Runtime>) {
        for pattern in KNOWN_PROCESS_PATTERNS {
            match runtime
                .spawn("pkill", &["-f".to_owned(), pattern.to_owned()])
                .await
            {
                Ok(process) => {
                    let _ = process.wait().await;
                }
                Err(e) => debug!("pkill {pattern} unavailable: {e}"),
            }
        }
    }

    /// Best-effort removal of all runtime filesystem entries except the
    /// reserved system paths.
    async fn clear_filesystem(&self, runtime: &Arc<dyn Runtime>) {
        let entries = match runtime.read_dir("/").await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("could not list runtime root during cleanup: {e}");
                return;
            }
        };
        for entry in entries {
            if RESERVED_PATHS.contains(&entry.as_str()) {
                continue;
            }
            if let Err(e) = runtime.remove_recursive(&format!("/{entry}")).await {
                warn!("failed to remove /{entry} during cleanup: {e}");
            }
        }
    }
}

async fn await_outcome(mut rx: PendingOutcome) -> Option<Result<(), String>> {
    loop {
        let current = rx.borrow().clone();
        if let Some(outcome) = current {
            return Some(outcome);
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone();
        }
    }
}
