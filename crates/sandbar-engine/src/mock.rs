use crate::engine::{Engine, FsEvent, FsWatcher, Runtime, ServerReady};
use crate::process::ProcessHandle;
use crate::EngineError;
use async_trait::async_trait;
use sandbar_tree::{MountNode, MountTree};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Scripted behavior for one command line in the mock runtime.
///
/// The default script emits nothing and keeps running until teardown; use
/// [`exits`](Self::exits) for terminating commands.
#[derive(Debug, Clone, Default)]
pub struct CommandScript {
    pub output: Vec<String>,
    pub exit: Option<i32>,
    pub writes: Vec<(String, String)>,
    pub ready: Option<ServerReady>,
    pub delay: Option<Duration>,
}

impl CommandScript {
    pub fn exits(code: i32) -> Self {
        Self {
            exit: Some(code),
            ..Self::default()
        }
    }

    /// Script for a process that keeps running until teardown. Same as the
    /// default, spelled out for readability at call sites.
    pub fn running() -> Self {
        Self::default()
    }

    pub fn line(mut self, line: impl Into<String>) -> Self {
        self.output.push(line.into());
        self
    }

    /// Have the process rewrite a runtime file before finishing, the way a
    /// package manager rewrites a manifest.
    pub fn writes(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.writes.push((path.into(), content.into()));
        self
    }

    pub fn ready(mut self, port: u16, url: impl Into<String>) -> Self {
        self.ready = Some(ServerReady {
            port,
            url: url.into(),
        });
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Default)]
struct MockShared {
    scripts: Mutex<HashMap<String, CommandScript>>,
    spawned: Mutex<Vec<String>>,
    boots: AtomicUsize,
    mounts: AtomicUsize,
    teardowns: AtomicUsize,
}

/// In-memory engine: boots [`MockRuntime`] instances with an empty
/// filesystem and the engine's scripted command table. Counters expose how
/// many boots, mounts, and teardowns the engine has observed so tests can
/// assert deduplication and teardown-at-zero behavior.
pub struct MockEngine {
    shared: Arc<MockShared>,
    boot_failures: Mutex<VecDeque<String>>,
    boot_delay: Mutex<Option<Duration>>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self {
            shared: Arc::new(MockShared::default()),
            boot_failures: Mutex::new(VecDeque::new()),
            boot_delay: Mutex::new(None),
        }
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the behavior of a full command line (`"npm install"`).
    pub fn script(&self, command_line: impl Into<String>, script: CommandScript) {
        if let Ok(mut scripts) = self.shared.scripts.lock() {
            scripts.insert(command_line.into(), script);
        }
    }

    /// Make the next boot attempt fail with the given message.
    pub fn fail_next_boot(&self, message: impl Into<String>) {
        if let Ok(mut failures) = self.boot_failures.lock() {
            failures.push_back(message.into());
        }
    }

    /// Delay every boot, widening the window in which concurrent acquires
    /// must share one boot.
    pub fn set_boot_delay(&self, delay: Duration) {
        if let Ok(mut slot) = self.boot_delay.lock() {
            *slot = Some(delay);
        }
    }

    pub fn boots(&self) -> usize {
        self.shared.boots.load(Ordering::SeqCst)
    }

    pub fn mounts(&self) -> usize {
        self.shared.mounts.load(Ordering::SeqCst)
    }

    pub fn teardowns(&self) -> usize {
        self.shared.teardowns.load(Ordering::SeqCst)
    }

    /// Every command line spawned across all runtime instances, in order.
    pub fn spawned_commands(&self) -> Vec<String> {
        self.shared
            .spawned
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Engine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    async fn boot(&self) -> Result<Arc<dyn Runtime>, EngineError> {
        let delay = self.boot_delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.shared.boots.fetch_add(1, Ordering::SeqCst);
        let failure = self.boot_failures.lock().ok().and_then(|mut f| f.pop_front());
        if let Some(message) = failure {
            return Err(EngineError::Boot(message));
        }
        tracing::debug!("mock engine booted");
        Ok(Arc::new(MockRuntime {
            inner: Arc::new(RuntimeInner {
                shared: Arc::clone(&self.shared),
                fs: Mutex::new(BTreeMap::new()),
                watchers: Mutex::new(Vec::new()),
                ready_tx: broadcast::channel(8).0,
                torn_down: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Dir,
    File(String),
}

struct RuntimeInner {
    shared: Arc<MockShared>,
    fs: Mutex<BTreeMap<String, Entry>>,
    watchers: Mutex<Vec<(String, mpsc::UnboundedSender<FsEvent>)>>,
    ready_tx: broadcast::Sender<ServerReady>,
    torn_down: AtomicBool,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

pub struct MockRuntime {
    inner: Arc<RuntimeInner>,
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_owned()
    } else {
        format!("/{trimmed}")
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(idx) => path[..idx].to_owned(),
    }
}

impl RuntimeInner {
    fn check_live(&self) -> Result<(), EngineError> {
        if self.torn_down.load(Ordering::SeqCst) {
            Err(EngineError::TornDown)
        } else {
            Ok(())
        }
    }

    fn lock_fs(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Entry>>, EngineError> {
        self.fs
            .lock()
            .map_err(|e| EngineError::Spawn(format!("mutex poisoned: {e}")))
    }

    fn write_entry(&self, path: &str, content: &str) -> Result<(), EngineError> {
        let path = normalize(path);
        let event = {
            let mut fs = self.lock_fs()?;
            let parent = parent_of(&path);
            if parent != "/" && fs.get(&parent) != Some(&Entry::Dir) {
                return Err(EngineError::PathNotFound(parent));
            }
            let existed = fs.insert(path.clone(), Entry::File(content.to_owned()));
            if existed.is_some() {
                FsEvent::Changed
            } else {
                FsEvent::Created
            }
        };
        self.notify(&path, event);
        Ok(())
    }

    fn notify(&self, path: &str, event: FsEvent) {
        let Ok(mut watchers) = self.watchers.lock() else {
            return;
        };
        watchers.retain(|(watched, tx)| {
            if watched == path {
                tx.send(event).is_ok()
            } else {
                !tx.is_closed()
            }
        });
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn mount(&self, files: &MountTree) -> Result<(), EngineError> {
        self.inner.check_live()?;
        self.inner.shared.mounts.fetch_add(1, Ordering::SeqCst);
        let mut fs = self.inner.lock_fs()?;
        insert_mounted(&mut fs, "", files);
        tracing::debug!(entries = fs.len(), "mock mount complete");
        Ok(())
    }

    async fn spawn(&self, command: &str, args: &[String]) -> Result<ProcessHandle, EngineError> {
        self.inner.check_live()?;
        let line = if args.is_empty() {
            command.to_owned()
        } else {
            format!("{command} {}", args.join(" "))
        };
        if let Ok(mut spawned) = self.inner.shared.spawned.lock() {
            spawned.push(line.clone());
        }
        let script = self
            .inner
            .shared
            .scripts
            .lock()
            .map_err(|e| EngineError::Spawn(format!("mutex poisoned: {e}")))?
            .get(&line)
            .cloned()
            .unwrap_or_else(|| CommandScript::exits(0));

        let (ctrl, handle) = ProcessHandle::channel(&line);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            if let Some(delay) = script.delay {
                tokio::time::sleep(delay).await;
            }
            for output_line in &script.output {
                ctrl.line(output_line.clone());
            }
            for (path, content) in &script.writes {
                if let Err(e) = inner.write_entry(path, content) {
                    tracing::warn!("scripted write to {path} failed: {e}");
                }
            }
            if let Some(event) = script.ready.clone() {
                let _ = inner.ready_tx.send(event);
            }
            match script.exit {
                Some(code) => ctrl.exit(code),
                None => {
                    // Long-running process: hold the controller open until
                    // teardown aborts this task.
                    let _ctrl = ctrl;
                    std::future::pending::<()>().await;
                }
            }
        });
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.push(task);
        }
        Ok(handle)
    }

    async fn read_file(&self, path: &str) -> Result<String, EngineError> {
        self.inner.check_live()?;
        let path = normalize(path);
        let fs = self.inner.lock_fs()?;
        match fs.get(&path) {
            Some(Entry::File(content)) => Ok(content.clone()),
            _ => Err(EngineError::PathNotFound(path)),
        }
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), EngineError> {
        self.inner.check_live()?;
        self.inner.write_entry(path, content)
    }

    async fn mkdir_all(&self, path: &str) -> Result<(), EngineError> {
        self.inner.check_live()?;
        let path = normalize(path);
        if path == "/" {
            return Ok(());
        }
        let mut fs = self.inner.lock_fs()?;
        let mut prefix = String::new();
        for segment in path.trim_start_matches('/').split('/') {
            prefix.push('/');
            prefix.push_str(segment);
            fs.entry(prefix.clone()).or_insert(Entry::Dir);
        }
        Ok(())
    }

    async fn remove_recursive(&self, path: &str) -> Result<(), EngineError> {
        self.inner.check_live()?;
        let path = normalize(path);
        let removed: Vec<String> = {
            let mut fs = self.inner.lock_fs()?;
            let doomed: Vec<String> = fs
                .keys()
                .filter(|k| **k == path || k.starts_with(&format!("{path}/")))
                .cloned()
                .collect();
            for key in &doomed {
                fs.remove(key);
            }
            doomed
        };
        for key in removed {
            self.inner.notify(&key, FsEvent::Removed);
        }
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<String>, EngineError> {
        self.inner.check_live()?;
        let path = normalize(path);
        let fs = self.inner.lock_fs()?;
        Ok(fs
            .keys()
            .filter(|k| parent_of(k) == path)
            .map(|k| k.rsplit('/').next().unwrap_or(k).to_owned())
            .collect())
    }

    async fn watch(&self, path: &str) -> Result<FsWatcher, EngineError> {
        self.inner.check_live()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .watchers
            .lock()
            .map_err(|e| EngineError::Spawn(format!("mutex poisoned: {e}")))?
            .push((normalize(path), tx));
        Ok(FsWatcher::new(rx))
    }

    fn subscribe_server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.inner.ready_tx.subscribe()
    }

    async fn teardown(&self) {
        if self.inner.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.inner.shared.teardowns.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("mock runtime torn down");
    }
}

fn insert_mounted(fs: &mut BTreeMap<String, Entry>, prefix: &str, files: &MountTree) {
    for (name, node) in files {
        let path = format!("{prefix}/{name}");
        match node {
            MountNode::File { contents } => {
                fs.insert(path, Entry::File(contents.clone()));
            }
            MountNode::Directory(children) => {
                fs.insert(path.clone(), Entry::Dir);
                insert_mounted(fs, &path, children);
            }
        }
    }
}
