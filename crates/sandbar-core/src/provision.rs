use crate::config::ProvisionConfig;
use crate::lease::RuntimeLease;
use crate::CoreError;
use sandbar_engine::ServerReady;
use sandbar_tree::{transform_tree, ProjectTree};
use std::fmt;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

/// Observable stage of the provisioning pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    Idle,
    Transforming,
    Mounting,
    Installing,
    Starting,
    Ready,
    Failed,
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Transforming => "transforming",
            Self::Mounting => "mounting",
            Self::Installing => "installing",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Check whether `from -> to` is a legal provisioning transition.
///
/// The pipeline only moves forward through its stages; any active stage may
/// fail, a failed pipeline may be retried from the top, and any stage
/// collapses back to idle when the binding is torn down.
pub fn validate_transition(from: ProvisionState, to: ProvisionState) -> Result<(), CoreError> {
    use ProvisionState::*;
    let ok = matches!(
        (from, to),
        (Idle | Failed, Transforming)
            | (Transforming, Mounting)
            | (Mounting, Installing)
            | (Installing, Starting)
            | (Starting, Ready)
            | (Transforming | Mounting | Installing | Starting, Failed)
            | (_, Idle)
    );
    if ok {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Drive a project tree through the full provisioning pipeline on `lease`:
/// transform, mount, install dependencies, start the dev server, and wait
/// for the server-ready signal. Progress and process output are streamed to
/// `output` one line at a time.
///
/// On any failure the observable state is set to `Failed` and a final error
/// line is emitted; a stale lease aborts silently instead, since a newer
/// binding now owns the state channel.
pub async fn provision(
    lease: &RuntimeLease,
    tree: &ProjectTree,
    config: &ProvisionConfig,
    output: &mpsc::UnboundedSender<String>,
) -> Result<ServerReady, CoreError> {
    match run_pipeline(lease, tree, config, output).await {
        Ok(ready) => Ok(ready),
        Err(CoreError::StaleLease) => Err(CoreError::StaleLease),
        Err(e) => {
            let _ = output.send(format!("error: {e}"));
            // Best effort; a lease gone stale mid-pipeline loses the race.
            let _ = lease.set_state(ProvisionState::Failed);
            Err(e)
        }
    }
}

async fn run_pipeline(
    lease: &RuntimeLease,
    tree: &ProjectTree,
    config: &ProvisionConfig,
    output: &mpsc::UnboundedSender<String>,
) -> Result<ServerReady, CoreError> {
    lease.set_state(ProvisionState::Transforming)?;
    let files = transform_tree(tree);
    debug!("transformed {} top-level entries", files.len());

    lease.set_state(ProvisionState::Mounting)?;
    let _ = output.send("mounting project files".to_owned());
    lease.mount_files(&files).await?;

    lease.set_state(ProvisionState::Installing)?;
    let _ = output.send(format!("installing dependencies: {}", config.install));
    let mut install = lease
        .spawn(config.install.program(), config.install.args())
        .await?;
    while let Some(line) = install.next_line().await {
        let _ = output.send(line);
    }
    let code = install.exit_code().await;
    if code != 0 {
        return Err(CoreError::Install { code });
    }

    lease.set_state(ProvisionState::Starting)?;
    let _ = output.send(format!("starting development server: {}", config.start));
    // Subscribe before spawning so an immediately-emitted ready event
    // cannot be missed.
    let mut ready_rx = lease.subscribe_server_ready().await?;
    let mut server = lease
        .spawn(config.start.program(), config.start.args())
        .await?;

    loop {
        tokio::select! {
            event = ready_rx.recv() => match event {
                Ok(ready) => {
                    let _ = output.send(format!("server ready at {}", ready.url));
                    lease.set_state(ProvisionState::Ready)?;
                    info!(port = ready.port, "dev server ready");
                    return Ok(ready);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    let code = server.exit_code().await;
                    return Err(CoreError::Start { code });
                }
            },
            line = server.next_line() => match line {
                Some(line) => {
                    let _ = output.send(line);
                }
                // Output stream closed: the server exited before ready.
                None => {
                    let code = server.exit_code().await;
                    return Err(CoreError::Start { code });
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Coordinator;
    use sandbar_engine::{CommandScript, MockEngine};
    use sandbar_tree::parse_tree_str;
    use std::sync::Arc;

    fn sample_tree() -> ProjectTree {
        parse_tree_str(
            r#"{
              "folderName": "app",
              "items": [
                { "filename": "package", "fileExtension": "json",
                  "content": "{\"name\":\"app\"}" },
                {
                  "folderName": "src",
                  "items": [
                    { "filename": "index", "fileExtension": "js", "content": "run()" }
                  ]
                }
              ]
            }"#,
        )
        .unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn transition_table() {
        use ProvisionState::*;
        assert!(validate_transition(Idle, Transforming).is_ok());
        assert!(validate_transition(Failed, Transforming).is_ok());
        assert!(validate_transition(Transforming, Mounting).is_ok());
        assert!(validate_transition(Installing, Starting).is_ok());
        assert!(validate_transition(Starting, Ready).is_ok());
        assert!(validate_transition(Installing, Failed).is_ok());
        assert!(validate_transition(Ready, Idle).is_ok());

        assert!(validate_transition(Idle, Installing).is_err());
        assert!(validate_transition(Ready, Failed).is_err());
        assert!(validate_transition(Mounting, Starting).is_err());
        assert!(validate_transition(Ready, Transforming).is_err());
    }

    #[tokio::test]
    async fn pipeline_reaches_ready() {
        let engine = Arc::new(MockEngine::new());
        engine.script("npm install", CommandScript::exits(0).line("added 40 packages"));
        engine.script(
            "npm run start",
            CommandScript::running()
                .line("compiled successfully")
                .ready(3000, "http://localhost:3000"),
        );
        let coordinator = Coordinator::new(engine.clone());
        let lease = coordinator.acquire("proj-1").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let ready = provision(&lease, &sample_tree(), &ProvisionConfig::default(), &tx)
            .await
            .unwrap();
        assert_eq!(ready.port, 3000);
        assert_eq!(*coordinator.watch_provision().borrow(), ProvisionState::Ready);

        let lines = drain(&mut rx);
        assert!(lines.iter().any(|l| l.contains("added 40 packages")));
        assert!(lines.iter().any(|l| l == "server ready at http://localhost:3000"));
        lease.release().await;
    }

    #[tokio::test]
    async fn install_failure_fails_pipeline() {
        let engine = Arc::new(MockEngine::new());
        engine.script(
            "npm install",
            CommandScript::exits(1).line("npm ERR! code ERESOLVE"),
        );
        let coordinator = Coordinator::new(engine.clone());
        let lease = coordinator.acquire("proj-1").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let err = provision(&lease, &sample_tree(), &ProvisionConfig::default(), &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Install { code: 1 }));
        assert_eq!(*coordinator.watch_provision().borrow(), ProvisionState::Failed);

        let lines = drain(&mut rx);
        assert!(lines.iter().any(|l| l.contains("ERESOLVE")));
        assert!(lines.last().unwrap().starts_with("error:"));

        // The dev server was never started.
        assert!(!engine
            .spawned_commands()
            .iter()
            .any(|c| c.contains("npm run start")));
        lease.release().await;
    }

    #[tokio::test]
    async fn server_exit_before_ready_fails_pipeline() {
        let engine = Arc::new(MockEngine::new());
        engine.script("npm install", CommandScript::exits(0));
        engine.script(
            "npm run start",
            CommandScript::exits(7).line("Error: listen EADDRINUSE"),
        );
        let coordinator = Coordinator::new(engine.clone());
        let lease = coordinator.acquire("proj-1").await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = provision(&lease, &sample_tree(), &ProvisionConfig::default(), &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Start { code: 7 }));
        assert_eq!(*coordinator.watch_provision().borrow(), ProvisionState::Failed);
        lease.release().await;
    }

    #[tokio::test]
    async fn failed_pipeline_can_be_retried() {
        let engine = Arc::new(MockEngine::new());
        engine.script("npm install", CommandScript::exits(1));
        let coordinator = Coordinator::new(engine.clone());
        let lease = coordinator.acquire("proj-1").await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let config = ProvisionConfig::default();
        provision(&lease, &sample_tree(), &config, &tx)
            .await
            .unwrap_err();

        engine.script("npm install", CommandScript::exits(0));
        engine.script(
            "npm run start",
            CommandScript::running().ready(5173, "http://localhost:5173"),
        );
        let ready = provision(&lease, &sample_tree(), &config, &tx)
            .await
            .unwrap();
        assert_eq!(ready.port, 5173);
        lease.release().await;
    }

    #[tokio::test]
    async fn stale_lease_aborts_without_failed_state() {
        let engine = Arc::new(MockEngine::new());
        let coordinator = Coordinator::new(engine.clone());
        let lease = coordinator.acquire("proj-1").await.unwrap();

        // A switch to another project makes the first lease stale.
        let second = coordinator.acquire("proj-2").await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = provision(&lease, &sample_tree(), &ProvisionConfig::default(), &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::StaleLease));
        // The new binding's view is untouched by the stale attempt.
        assert_eq!(*coordinator.watch_provision().borrow(), ProvisionState::Idle);

        lease.release().await;
        second.release().await;
    }
}
