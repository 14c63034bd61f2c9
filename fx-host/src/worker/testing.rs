//! In-process worker used by channel and dispatcher tests. Talks to the channel pair directly,
//! without a socket or a child process.

use {
    std::{
        collections::HashMap,
        path::PathBuf,
        sync::{Arc, atomic::{AtomicBool, AtomicUsize, Ordering}},
        time::Duration,
    },
    tokio::sync::{Notify, oneshot},
    tokio_util::sync::CancellationToken,
    parking_lot::Mutex,
    fx_rpc::{
        CloseSharedMemoryResourcesResponse,
        Content,
        FunctionLoadResponse,
        InvocationRequest,
        InvocationResponse,
        ParameterBinding,
        ParameterData,
        RpcException,
        StartStream,
        StatusResult,
        StreamingMessage,
        TypedData,
        WorkerInitResponse,
        WorkerMetadata,
        WorkerStatusResponse,
        capabilities,
    },
    crate::{
        channels::{ChannelPair, WorkerChannels},
        data_cache::{FunctionDataCache, NullFunctionDataCache, SharedFunctionDataCache},
        error::WorkerProcessError,
        events::ScriptEventManager,
        functions::FunctionMetadata,
        logs::{BoxLogger, NoopLogger},
        metrics::Metrics,
        process::{LaunchedWorker, WorkerExit, WorkerHandle, WorkerLauncher, WorkerProcessContext},
        shared_memory::SharedMemoryManager,
        worker::WorkerChannelContext,
    },
};

pub(crate) const FAKE_PID: u32 = 4242;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum FakeWorkerMode {
    Normal,
    /// Opens its stream but never answers the init request.
    NeverInit,
    /// Fails every function load.
    FailLoad,
}

/// Behavior of an invocation is picked by the entry point of the function:
/// `echo` answers with `result = "ok"` plus every input, `silent` never answers,
/// `crash` exits with code 1 and `fail` reports a user code failure.
pub(crate) struct FakeLauncher {
    mode: FakeWorkerMode,
    channels: Arc<WorkerChannels>,
    shared_memory: Mutex<Option<Arc<SharedMemoryManager>>>,
    received: Mutex<Vec<InvocationRequest>>,
    cancels: Mutex<Vec<String>>,
    cancelled: Notify,
    launches: AtomicUsize,
    terminated: Arc<AtomicBool>,
}

impl FakeLauncher {
    pub(crate) fn new(mode: FakeWorkerMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            channels: Arc::new(WorkerChannels::new()),
            shared_memory: Mutex::new(None),
            received: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
            cancelled: Notify::new(),
            launches: AtomicUsize::new(0),
            terminated: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Worker reads shared memory inputs through this manager.
    pub(crate) fn with_shared_memory(self: Arc<Self>, shared_memory: Arc<SharedMemoryManager>) -> Arc<Self> {
        *self.shared_memory.lock() = Some(shared_memory);
        self
    }

    pub(crate) fn channels(&self) -> Arc<WorkerChannels> {
        self.channels.clone()
    }

    pub(crate) fn received(&self) -> Vec<InvocationRequest> {
        self.received.lock().clone()
    }

    pub(crate) fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub(crate) fn terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_for_cancel(&self, invocation_id: &str) {
        loop {
            let cancelled = self.cancelled.notified();
            tokio::pin!(cancelled);
            cancelled.as_mut().enable();
            if self.cancels.lock().iter().any(|v| v == invocation_id) {
                return;
            }
            cancelled.await;
        }
    }

    async fn run(
        self: Arc<Self>,
        pair: Arc<ChannelPair>,
        request_id: String,
        stop: CancellationToken,
        exited: oneshot::Sender<WorkerExit>,
    ) {
        let _ = pair.send_inbound(StreamingMessage::new(StartStream { worker_id: pair.worker_id().to_owned() })
            .with_request_id(request_id));

        let outbound = pair.outbound_reader();
        let mut entry_points = HashMap::new();
        let exit_code = loop {
            let message = tokio::select! {
                _ = stop.cancelled() => break None,
                message = outbound.recv_async() => match message {
                    Ok(message) => message,
                    Err(_) => break Some(0),
                },
            };

            let request_id = message.request_id;
            let reply = match message.content {
                Content::WorkerInitRequest(_) if self.mode == FakeWorkerMode::NeverInit => None,
                Content::WorkerInitRequest(_) => Some(Content::from(WorkerInitResponse {
                    worker_version: "1.0.0".to_owned(),
                    capabilities: [
                        capabilities::SHARED_MEMORY_DATA_TRANSFER,
                        capabilities::FUNCTION_DATA_CACHE,
                        capabilities::HANDLES_INVOCATION_CANCEL_MESSAGE,
                        capabilities::HANDLES_WORKER_TERMINATE_MESSAGE,
                        capabilities::WORKER_STATUS,
                    ].into_iter().map(|v| (v.to_owned(), capabilities::ENABLED.to_owned())).collect(),
                    worker_metadata: Some(WorkerMetadata {
                        runtime_name: "fake".to_owned(),
                        runtime_version: "1".to_owned(),
                        worker_version: "1.0.0".to_owned(),
                    }),
                    result: StatusResult::success(),
                })),
                Content::FunctionLoadRequest(request) => {
                    entry_points.insert(request.function_id.clone(), request.metadata.entry_point.clone());
                    let result = match self.mode {
                        FakeWorkerMode::FailLoad => StatusResult::failure(RpcException::new("cannot load function")),
                        _ => StatusResult::success(),
                    };
                    Some(Content::from(FunctionLoadResponse { function_id: request.function_id, result }))
                },
                Content::InvocationRequest(request) => {
                    self.received.lock().push(request.clone());
                    let entry_point = entry_points.get(&request.function_id).cloned().unwrap_or_default();
                    match entry_point.as_str() {
                        "echo" => Some(Content::from(self.echo(request))),
                        "fail" => Some(Content::from(InvocationResponse {
                            invocation_id: request.invocation_id,
                            output_data: Vec::new(),
                            return_value: None,
                            result: StatusResult::failure(RpcException::user("fake", "boom")),
                        })),
                        "crash" => break Some(1),
                        _ => None,
                    }
                },
                Content::InvocationCancel(cancel) => {
                    self.cancels.lock().push(cancel.invocation_id);
                    self.cancelled.notify_waiters();
                    None
                },
                Content::WorkerStatusRequest(_) => Some(Content::from(WorkerStatusResponse {})),
                Content::CloseSharedMemoryResourcesRequest(request) => Some(Content::from(CloseSharedMemoryResourcesResponse {
                    close_map_results: request.map_names.into_iter().map(|v| (v, true)).collect(),
                })),
                Content::WorkerTerminate(_) => break Some(0),
                _ => None,
            };

            if let Some(reply) = reply {
                let _ = pair.send_inbound(StreamingMessage::new(reply).with_request_id(request_id));
            }
        };

        let stderr = match exit_code {
            Some(1) => vec!["fake worker crashed".to_owned()],
            _ => Vec::new(),
        };
        let _ = exited.send(WorkerExit { exit_code, stderr });
    }

    fn echo(&self, request: InvocationRequest) -> InvocationResponse {
        let shared_memory = self.shared_memory.lock().clone();
        let mut output_data = vec![ParameterBinding::inline("result", TypedData::from("ok"))];
        for binding in request.input_data {
            let value = match binding.data {
                ParameterData::Data(value) => value,
                ParameterData::SharedMemory(reference) => match shared_memory.as_ref().map(|v| v.get_typed(&reference)) {
                    Some(Ok(value)) => value,
                    _ => TypedData::Null,
                },
            };
            output_data.push(ParameterBinding::inline(binding.name, value));
        }

        InvocationResponse {
            invocation_id: request.invocation_id,
            output_data,
            return_value: None,
            result: StatusResult::success(),
        }
    }
}

impl WorkerLauncher for Arc<FakeLauncher> {
    fn launch(&self, context: WorkerProcessContext) -> Result<LaunchedWorker, WorkerProcessError> {
        let pair = self.channels.try_get_channels(&context.worker_id)
            .ok_or(WorkerProcessError::AlreadyStarted)?;
        self.launches.fetch_add(1, Ordering::SeqCst);

        let stop = CancellationToken::new();
        let (exited_tx, exited_rx) = oneshot::channel();
        tokio::spawn(self.clone().run(pair, context.request_id, stop.clone(), exited_tx));

        Ok(LaunchedWorker {
            handle: Box::new(FakeHandle {
                stop,
                terminated: self.terminated.clone(),
            }),
            exited: exited_rx,
        })
    }
}

struct FakeHandle {
    stop: CancellationToken,
    terminated: Arc<AtomicBool>,
}

impl WorkerHandle for FakeHandle {
    fn pid(&self) -> Option<u32> {
        Some(FAKE_PID)
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.stop.cancel();
    }
}

pub(crate) fn fake_context(
    launcher: Arc<FakeLauncher>,
    shared_memory: Option<Arc<SharedMemoryManager>>,
    data_cache: Option<Arc<SharedFunctionDataCache>>,
) -> Arc<WorkerChannelContext> {
    let data_cache: Arc<dyn FunctionDataCache> = match data_cache {
        Some(v) => v,
        None => Arc::new(NullFunctionDataCache),
    };

    Arc::new(WorkerChannelContext {
        channels: launcher.channels(),
        launcher: Arc::new(launcher),
        shared_memory,
        data_cache,
        events: Arc::new(ScriptEventManager::new()),
        logger: Arc::new(BoxLogger::new(NoopLogger::new())),
        metrics: Metrics::new().unwrap(),
        rpc_host: "127.0.0.1".to_owned(),
        rpc_port: 0,
        functions_dir: PathBuf::from("."),
        invocation_timeout: Duration::from_secs(300),
    })
}

pub(crate) fn fake_functions() -> Vec<FunctionMetadata> {
    ["echo", "silent", "crash", "fail"].into_iter()
        .map(|name| FunctionMetadata::new(name, "fake", format!("{name}.js")).with_entry_point(name))
        .collect()
}
