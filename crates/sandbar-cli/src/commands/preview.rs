use super::{colorize_state, json_pretty, spin_fail, spin_ok, spinner, EXIT_SUCCESS};
use sandbar_core::{provision, Coordinator, ProvisionConfig};
use sandbar_engine::{CommandScript, MockEngine};
use sandbar_tree::parse_tree_file;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Run the full provisioning pipeline for a project tree inside a scripted
/// in-memory runtime and report the outcome.
///
/// The scripted runtime stands in for a real sandbox: the install command
/// exits with `install_exit` and the dev server signals ready immediately,
/// so the command exercises transform, mount, install, and start without
/// any external tooling.
pub fn run(
    tree_path: &Path,
    project: &str,
    config: &ProvisionConfig,
    install_exit: i32,
    json: bool,
) -> Result<u8, String> {
    let tree = parse_tree_file(tree_path).map_err(|e| format!("tree error: {e}"))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("async runtime: {e}"))?;

    runtime.block_on(async {
        let engine = Arc::new(MockEngine::new());
        engine.script(
            config.install.to_string(),
            CommandScript::exits(install_exit).line("added 42 packages"),
        );
        engine.script(
            config.start.to_string(),
            CommandScript::running()
                .line("dev server listening")
                .ready(3000, "http://localhost:3000"),
        );
        let coordinator = Coordinator::new(engine);
        let lease = coordinator
            .acquire(project)
            .await
            .map_err(|e| format!("provision error: {e}"))?;

        let pb = (!json).then(|| spinner("provisioning preview..."));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let printer = {
            let pb = pb.clone();
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    if let Some(pb) = &pb {
                        pb.println(format!("  {line}"));
                    }
                }
            })
        };

        let result = provision(&lease, &tree, config, &tx).await;
        drop(tx);
        let _ = printer.await;

        match result {
            Ok(ready) => {
                if let Some(pb) = &pb {
                    spin_ok(
                        pb,
                        &format!("preview {} at {}", colorize_state("ready"), ready.url),
                    );
                }
                if json {
                    let payload = serde_json::json!({
                        "project": project,
                        "state": "ready",
                        "port": ready.port,
                        "url": ready.url,
                    });
                    println!("{}", json_pretty(&payload)?);
                } else {
                    println!("preview ready at {} (port {})", ready.url, ready.port);
                }
                lease.release().await;
                Ok(EXIT_SUCCESS)
            }
            Err(e) => {
                if let Some(pb) = &pb {
                    spin_fail(pb, &format!("provisioning {}", colorize_state("failed")));
                }
                lease.release().await;
                Err(format!("provision error: {e}"))
            }
        }
    })
}
