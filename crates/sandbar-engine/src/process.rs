use tokio::sync::{mpsc, oneshot};

/// Handle to a spawned runtime process: a line-oriented output stream plus an
/// exit-code future. Output lines are delivered in order; the stream ends
/// (returns `None`) when the process finishes, after which the exit code is
/// available.
#[derive(Debug)]
pub struct ProcessHandle {
    command: String,
    output: mpsc::UnboundedReceiver<String>,
    exit: Option<oneshot::Receiver<i32>>,
    exit_code: Option<i32>,
}

/// Producer side of a [`ProcessHandle`], held by the engine implementation.
#[derive(Debug)]
pub struct ProcessController {
    output: mpsc::UnboundedSender<String>,
    exit: oneshot::Sender<i32>,
}

impl ProcessHandle {
    /// Create a connected controller/handle pair for `command`.
    pub fn channel(command: impl Into<String>) -> (ProcessController, ProcessHandle) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        (
            ProcessController {
                output: out_tx,
                exit: exit_tx,
            },
            ProcessHandle {
                command: command.into(),
                output: out_rx,
                exit: Some(exit_rx),
                exit_code: None,
            },
        )
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Next output line, or `None` once the process has exited and the
    /// stream is drained.
    pub async fn next_line(&mut self) -> Option<String> {
        self.output.recv().await
    }

    /// Await the exit code. A process whose controller vanished without
    /// reporting (e.g. runtime teardown) yields -1.
    pub async fn exit_code(&mut self) -> i32 {
        if let Some(code) = self.exit_code {
            return code;
        }
        let code = match self.exit.take() {
            Some(rx) => rx.await.unwrap_or(-1),
            None => -1,
        };
        self.exit_code = Some(code);
        code
    }

    /// Drain remaining output and wait for the process to finish.
    pub async fn wait(mut self) -> i32 {
        while self.next_line().await.is_some() {}
        self.exit_code().await
    }
}

impl ProcessController {
    pub fn line(&self, line: impl Into<String>) {
        let _ = self.output.send(line.into());
    }

    /// Report the exit code and close the output stream.
    pub fn exit(self, code: i32) {
        drop(self.output);
        let _ = self.exit.send(code);
    }
}
