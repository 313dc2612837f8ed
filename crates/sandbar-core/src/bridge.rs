use sandbar_engine::{FsEvent, Runtime};
use sandbar_tree::DocumentModel;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Background task that funnels runtime-side writes to one file back into
/// the document model.
///
/// The runtime filesystem starts empty, so the bridge first polls until the
/// watched file exists (reporting its initial content), then switches to the
/// engine's change events for the rest of its life. Stopping is cooperative:
/// [`close`](Self::close) resolves once the task has actually exited, and
/// dropping the bridge cancels the task outright.
pub struct ChangeBridge {
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ChangeBridge {
    pub fn spawn(
        runtime: Arc<dyn Runtime>,
        documents: Arc<Mutex<DocumentModel>>,
        path: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let path = path.into();
        let task = tokio::spawn(run_bridge(runtime, documents, path, poll_interval, stop_rx));
        Self {
            stop,
            task: Some(task),
        }
    }

    /// Stop the bridge and wait for its task to finish.
    pub async fn close(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ChangeBridge {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_bridge(
    runtime: Arc<dyn Runtime>,
    documents: Arc<Mutex<DocumentModel>>,
    path: String,
    poll_interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    // Poll until the file appears. Watching an entry that does not exist yet
    // would miss the mount that creates it.
    loop {
        match runtime.read_file(&path).await {
            Ok(content) => {
                apply(&documents, &path, &content);
                break;
            }
            Err(_) => {
                tokio::select! {
                    () = tokio::time::sleep(poll_interval) => {}
                    res = stop.changed() => {
                        if res.is_err() || *stop.borrow() {
                            return;
                        }
                    }
                }
            }
        }
    }
    debug!("change bridge switching from poll to watch for {path}");

    let mut watcher = match runtime.watch(&path).await {
        Ok(watcher) => watcher,
        Err(e) => {
            warn!("could not watch {path}: {e}");
            return;
        }
    };
    loop {
        tokio::select! {
            res = stop.changed() => {
                if res.is_err() || *stop.borrow() {
                    return;
                }
            }
            event = watcher.next_event() => match event {
                Some(FsEvent::Created | FsEvent::Changed) => {
                    match runtime.read_file(&path).await {
                        Ok(content) => apply(&documents, &path, &content),
                        Err(e) => debug!("read after change event failed for {path}: {e}"),
                    }
                }
                Some(FsEvent::Removed) => {
                    debug!("watched file {path} removed");
                }
                // Watcher stream closed, usually runtime teardown.
                None => return,
            },
        }
    }
}

fn apply(documents: &Mutex<DocumentModel>, path: &str, content: &str) {
    let Ok(mut model) = documents.lock() else {
        warn!("document model lock poisoned; dropping update for {path}");
        return;
    };
    if model.apply_external_update(path, content) {
        debug!("merged runtime update for {path}");
    } else {
        debug!("runtime update for {path} has no matching tree leaf");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Coordinator;
    use sandbar_engine::{CommandScript, MockEngine};
    use sandbar_tree::{parse_tree_str, transform_tree};
    use tokio::time::timeout;

    const MANIFEST: &str = "/package.json";

    fn documents() -> Arc<Mutex<DocumentModel>> {
        Arc::new(Mutex::new(DocumentModel::new(
            parse_tree_str(
                r#"{
                  "folderName": "app",
                  "items": [
                    { "filename": "package", "fileExtension": "json", "content": "{\"v\":1}" }
                  ]
                }"#,
            )
            .unwrap(),
        )))
    }

    async fn wait_for_content(docs: &Arc<Mutex<DocumentModel>>, expected: &str) {
        let deadline = timeout(Duration::from_secs(2), async {
            loop {
                {
                    let model = docs.lock().unwrap();
                    if model.tree().content_at(&["package.json"]) == Some(expected) {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        deadline.await.expect("document model never saw the update");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn polls_until_mount_then_watches() {
        let engine = Arc::new(MockEngine::new());
        // Delay the scripted write so the bridge has finished its poll phase
        // and registered its watcher by the time the write lands.
        engine.script(
            "npm install",
            CommandScript::exits(0)
                .writes(MANIFEST, "{\"v\":2}")
                .delayed(Duration::from_millis(100)),
        );
        let coordinator = Coordinator::new(engine.clone());
        let lease = coordinator.acquire("proj-1").await.unwrap();

        let docs = documents();
        let bridge = ChangeBridge::spawn(
            lease.runtime(),
            Arc::clone(&docs),
            MANIFEST,
            Duration::from_millis(10),
        );

        // Nothing is mounted yet; the bridge is in its polling phase.
        tokio::time::sleep(Duration::from_millis(30)).await;
        {
            let model = docs.lock().unwrap();
            assert_eq!(model.tree().content_at(&["package.json"]), Some("{\"v\":1}"));
        }

        let tree = docs.lock().unwrap().tree().clone();
        lease.mount_files(&transform_tree(&tree)).await.unwrap();
        wait_for_content(&docs, "{\"v\":1}").await;

        // A runtime-side rewrite now flows through the watcher.
        lease
            .spawn("npm", &["install".to_owned()])
            .await
            .unwrap()
            .wait()
            .await;
        wait_for_content(&docs, "{\"v\":2}").await;

        bridge.close().await;
        lease.release().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn external_update_overwrites_dirty_open_document() {
        let engine = Arc::new(MockEngine::new());
        engine.script(
            "npm install",
            CommandScript::exits(0)
                .writes(MANIFEST, "{\"v\":9}")
                .delayed(Duration::from_millis(100)),
        );
        let coordinator = Coordinator::new(engine);
        let lease = coordinator.acquire("proj-1").await.unwrap();

        let docs = documents();
        {
            let mut model = docs.lock().unwrap();
            model.open(MANIFEST).unwrap();
            model.edit(MANIFEST, "unsaved local edit").unwrap();
        }
        let tree = docs.lock().unwrap().tree().clone();
        lease.mount_files(&transform_tree(&tree)).await.unwrap();

        let bridge = ChangeBridge::spawn(
            lease.runtime(),
            Arc::clone(&docs),
            MANIFEST,
            Duration::from_millis(10),
        );
        lease
            .spawn("npm", &["install".to_owned()])
            .await
            .unwrap()
            .wait()
            .await;
        wait_for_content(&docs, "{\"v\":9}").await;
        {
            let model = docs.lock().unwrap();
            let doc = model.open_document(MANIFEST).unwrap();
            assert_eq!(doc.content, "{\"v\":9}");
            assert!(!doc.dirty);
        }

        bridge.close().await;
        lease.release().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_stops_polling_promptly() {
        let engine = Arc::new(MockEngine::new());
        let coordinator = Coordinator::new(engine);
        let lease = coordinator.acquire("proj-1").await.unwrap();

        // The manifest never appears, so the bridge stays in its poll loop
        // until asked to stop.
        let bridge = ChangeBridge::spawn(
            lease.runtime(),
            documents(),
            MANIFEST,
            Duration::from_millis(10),
        );
        timeout(Duration::from_secs(1), bridge.close())
            .await
            .expect("bridge did not stop");
        lease.release().await;
    }
}
