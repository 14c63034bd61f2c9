use {
    std::{collections::VecDeque, sync::Arc, time::Duration},
    tracing::{error, info, warn},
    tokio::{
        io::{AsyncBufReadExt, AsyncRead, BufReader},
        sync::oneshot,
        time::timeout,
    },
    tokio_util::sync::CancellationToken,
    parking_lot::Mutex,
    crate::{
        error::WorkerProcessError,
        process::{
            factory::{WorkerProcessContext, create_worker_process},
            registry::ProcessRegistry,
        },
    },
};

const STDERR_TAIL_LINES: usize = 3;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Exit notification of a worker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerExit {
    pub exit_code: Option<i32>,
    /// Last lines the worker wrote to stderr.
    pub stderr: Vec<String>,
}

impl WorkerExit {
    pub fn describe(&self) -> String {
        let code = match self.exit_code {
            Some(code) => format!("worker process exited with code {code}"),
            None => "worker process was terminated".to_owned(),
        };
        if self.stderr.is_empty() {
            code
        } else {
            format!("{code}: {}", self.stderr.join(" | "))
        }
    }
}

pub trait WorkerHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Asks the worker to stop. Returns immediately, the exit is reported through
    /// [`LaunchedWorker::exited`].
    fn terminate(&self);
}

pub struct LaunchedWorker {
    pub handle: Box<dyn WorkerHandle>,
    pub exited: oneshot::Receiver<WorkerExit>,
}

/// Starts workers. Implemented by the process launcher and by in-process test workers.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, context: WorkerProcessContext) -> Result<LaunchedWorker, WorkerProcessError>;
}

pub struct ProcessWorkerLauncher {
    registry: Arc<dyn ProcessRegistry>,
}

impl ProcessWorkerLauncher {
    pub fn new(registry: Arc<dyn ProcessRegistry>) -> Self {
        Self {
            registry,
        }
    }
}

impl WorkerLauncher for ProcessWorkerLauncher {
    fn launch(&self, context: WorkerProcessContext) -> Result<LaunchedWorker, WorkerProcessError> {
        let mut command = create_worker_process(&context);
        let mut child = command.spawn()
            .map_err(|source| WorkerProcessError::Spawn { executable: context.config.executable.clone(), source })?;

        let pid = child.id();
        let worker_id = context.worker_id.clone();
        info!(worker_id, language = context.language, pid, "started worker process");
        if let Some(pid) = pid {
            if !self.registry.register(pid) {
                warn!(worker_id, pid, "worker process was already registered");
            }
        }

        let stdout = child.stdout.take().ok_or(WorkerProcessError::MissingPipe { stream: "stdout" })?;
        let stderr = child.stderr.take().ok_or(WorkerProcessError::MissingPipe { stream: "stderr" })?;
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        let stdout_task = tokio::spawn(forward_output(worker_id.clone(), stdout, None));
        let stderr_task = tokio::spawn(forward_output(worker_id.clone(), stderr, Some(stderr_tail.clone())));

        let terminate = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        let registry = self.registry.clone();
        {
            let terminate = terminate.clone();
            tokio::spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    _ = terminate.cancelled() => {
                        if let Err(err) = child.start_kill() {
                            warn!(worker_id, "failed to kill worker process: {err:?}");
                        }
                        child.wait().await
                    }
                };

                // grandchildren may keep the pipes open
                let _ = timeout(OUTPUT_DRAIN_TIMEOUT, stdout_task).await;
                let _ = timeout(OUTPUT_DRAIN_TIMEOUT, stderr_task).await;
                if let Some(pid) = pid {
                    registry.unregister(pid);
                }

                let exit = WorkerExit {
                    exit_code: match status {
                        Ok(status) => status.code(),
                        Err(err) => {
                            error!(worker_id, "failed to wait for worker process: {err:?}");
                            None
                        }
                    },
                    stderr: stderr_tail.lock().iter().cloned().collect(),
                };
                info!(worker_id, exit_code = exit.exit_code, "worker process exited");
                let _ = exit_tx.send(exit);
            });
        }

        Ok(LaunchedWorker {
            handle: Box::new(ProcessHandle { pid, terminate }),
            exited: exit_rx,
        })
    }
}

struct ProcessHandle {
    pid: Option<u32>,
    terminate: CancellationToken,
}

impl WorkerHandle for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn terminate(&self) {
        self.terminate.cancel();
    }
}

/// Forwards worker output lines to the log. Lines mentioning errors or warnings are logged
/// at that level.
async fn forward_output<R: AsyncRead + Unpin>(worker_id: String, output: R, tail: Option<Arc<Mutex<VecDeque<String>>>>) {
    let mut lines = BufReader::new(output).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(v)) => v,
            Ok(None) => break,
            Err(err) => {
                warn!(worker_id, "failed to read worker output: {err:?}");
                break;
            }
        };

        match classify_line(&line) {
            LineLevel::Error => error!(target: "worker", worker_id, "{line}"),
            LineLevel::Warn => warn!(target: "worker", worker_id, "{line}"),
            LineLevel::Info => info!(target: "worker", worker_id, "{line}"),
        }

        if let Some(tail) = &tail {
            let mut tail = tail.lock();
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
enum LineLevel {
    Error,
    Warn,
    Info,
}

fn classify_line(line: &str) -> LineLevel {
    let line = line.to_ascii_lowercase();
    if line.contains("error") {
        LineLevel::Error
    } else if line.contains("warn") {
        LineLevel::Warn
    } else {
        LineLevel::Info
    }
}
