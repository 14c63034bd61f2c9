use {
    std::{
        collections::HashMap,
        path::PathBuf,
        sync::{Arc, atomic::{AtomicBool, Ordering}},
        time::Duration,
    },
    tracing::{debug, error, info, trace, warn},
    tokio::{
        sync::{oneshot, watch},
        time::{Instant, sleep, timeout},
    },
    tokio_util::sync::CancellationToken,
    parking_lot::Mutex,
    futures::future::join_all,
    fx_rpc::{
        CloseSharedMemoryResourcesRequest,
        Content,
        ContentCase,
        FunctionLoadRequest,
        InvocationCancel,
        InvocationRequest,
        InvocationResponse,
        ParameterBinding,
        ParameterData,
        RpcException,
        RpcLog,
        RpcLogCategory,
        RpcLogLevel,
        RpcSharedMemory,
        Status,
        StreamingMessage,
        TypedData,
        WorkerInitRequest,
        WorkerStatusRequest,
        WorkerTerminate,
        capabilities,
    },
    crate::{
        channels::{ChannelPair, WorkerChannels},
        config::WorkerConfig,
        data_cache::{CacheHandle, FunctionDataCache},
        error::{ChannelError, InvocationError, WorkerChannelError},
        events::{SOURCE_WORKER_CHANNEL, SOURCE_WORKER_PROCESS, ScriptEvent, ScriptEventKind, ScriptEventManager},
        functions::FunctionMetadata,
        invocation::{InvocationInput, InvocationResult, ScriptInvocationContext},
        logs::{BoxLogger, LogMessageEvent, Logger},
        metrics::Metrics,
        process::{WorkerExit, WorkerHandle, WorkerLauncher, WorkerProcessContext},
        shared_memory::SharedMemoryManager,
        worker::{
            WorkerChannelState,
            pending::{InvocationOutcome, PendingInvocation, PendingInvocations},
        },
    },
};

pub const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Collaborators shared by every worker channel of a host.
pub struct WorkerChannelContext {
    pub channels: Arc<WorkerChannels>,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub shared_memory: Option<Arc<SharedMemoryManager>>,
    pub data_cache: Arc<dyn FunctionDataCache>,
    pub events: Arc<ScriptEventManager>,
    pub logger: Arc<BoxLogger>,
    pub metrics: Metrics,
    pub rpc_host: String,
    pub rpc_port: u16,
    pub functions_dir: PathBuf,
    pub invocation_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStatus {
    pub state: WorkerChannelState,
    /// Round trip of the last answered status request.
    pub latency: Option<Duration>,
    pub pending_invocations: usize,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
struct ResponseKey {
    case: ContentCase,
    request_id: String,
}

enum ResponseError {
    Timeout,
    Closed,
}

/// Host side of one worker process: owns its lifecycle and multiplexes invocations over
/// its channel pair.
#[derive(Clone)]
pub struct RpcWorkerChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    worker_id: String,
    language: String,
    config: Arc<WorkerConfig>,
    functions: HashMap<String, FunctionMetadata>,
    context: Arc<WorkerChannelContext>,

    state: watch::Sender<WorkerChannelState>,
    fault_reason: Mutex<Option<String>>,
    error_reported: AtomicBool,

    pending: PendingInvocations,
    responses: Mutex<HashMap<ResponseKey, oneshot::Sender<StreamingMessage>>>,
    capabilities: Mutex<HashMap<String, String>>,
    load_errors: Mutex<HashMap<String, String>>,

    pair: Mutex<Option<Arc<ChannelPair>>>,
    handle: Mutex<Option<Box<dyn WorkerHandle>>>,
    last_activity: Mutex<Instant>,
    latency: Mutex<Option<Duration>>,

    /// Cancelled when the channel is released, stops background tasks.
    stopped: CancellationToken,
    /// Cancelled when the worker process exits.
    exited: CancellationToken,
}

impl RpcWorkerChannel {
    pub fn new(
        context: Arc<WorkerChannelContext>,
        language: impl Into<String>,
        config: Arc<WorkerConfig>,
        functions: Vec<FunctionMetadata>,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                worker_id: uuid::Uuid::new_v4().to_string(),
                language: language.into(),
                config,
                functions: functions.into_iter().map(|v| (v.name.clone(), v)).collect(),
                context,

                state: watch::Sender::new(WorkerChannelState::Created),
                fault_reason: Mutex::new(None),
                error_reported: AtomicBool::new(false),

                pending: PendingInvocations::new(),
                responses: Mutex::new(HashMap::new()),
                capabilities: Mutex::new(HashMap::new()),
                load_errors: Mutex::new(HashMap::new()),

                pair: Mutex::new(None),
                handle: Mutex::new(None),
                last_activity: Mutex::new(Instant::now()),
                latency: Mutex::new(None),

                stopped: CancellationToken::new(),
                exited: CancellationToken::new(),
            }),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    pub fn language(&self) -> &str {
        &self.inner.language
    }

    pub fn state(&self) -> WorkerChannelState {
        *self.inner.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == WorkerChannelState::Ready
    }

    pub fn fault_reason(&self) -> Option<String> {
        self.inner.fault_reason.lock().clone()
    }

    pub fn has_invocation(&self, invocation_id: &str) -> bool {
        self.inner.pending.contains(invocation_id)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn capabilities(&self) -> HashMap<String, String> {
        self.inner.capabilities.lock().clone()
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.inner.capabilities.lock().get(name).is_some_and(|v| capabilities::is_enabled(v))
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.handle.lock().as_ref().and_then(|v| v.pid())
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            state: self.state(),
            latency: *self.inner.latency.lock(),
            pending_invocations: self.pending_count(),
            pid: self.pid(),
        }
    }

    /// Launches the worker and runs the init handshake. Returns once the channel is `Ready`.
    /// On failure the channel is `Faulted` and a `WorkerError` event has been published.
    pub async fn start(&self) -> Result<(), WorkerChannelError> {
        let started = self.inner.state.send_if_modified(|state| {
            if *state == WorkerChannelState::Created {
                *state = WorkerChannelState::Initializing;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(WorkerChannelError::InvalidState { state: self.state() });
        }

        info!(worker_id = self.worker_id(), language = self.language(), "starting worker channel");
        if let Err(err) = self.initialize().await {
            self.fault(err.to_string(), !err.is_protocol_fault());
            return Err(err);
        }

        let ready = self.inner.state.send_if_modified(|state| {
            if *state == WorkerChannelState::Initializing {
                *state = WorkerChannelState::Ready;
                true
            } else {
                false
            }
        });
        if !ready {
            return Err(WorkerChannelError::Disconnected {
                reason: self.fault_reason().unwrap_or_else(|| "worker channel stopped during startup".to_owned()),
            });
        }

        info!(worker_id = self.worker_id(), language = self.language(), "worker channel is ready");
        if self.has_capability(capabilities::WORKER_STATUS) {
            tokio::spawn(self.clone().probe_status());
        }
        Ok(())
    }

    async fn initialize(&self) -> Result<(), WorkerChannelError> {
        let inner = &self.inner;
        let context = &inner.context;

        let pair = context.channels.add_channels(&inner.worker_id)?;
        let inbound = pair.take_inbound_reader()?;
        *inner.pair.lock() = Some(pair);

        let request_id = uuid::Uuid::new_v4().to_string();
        let (start_key, start_stream) = self.expect_response(ContentCase::StartStream, &request_id);
        tokio::spawn(self.clone().read_inbound(inbound));

        let launched = context.launcher.launch(WorkerProcessContext {
            worker_id: inner.worker_id.clone(),
            request_id,
            language: inner.language.clone(),
            config: inner.config.as_ref().clone(),
            host: context.rpc_host.clone(),
            port: context.rpc_port,
            functions_dir: context.functions_dir.clone(),
            shared_memory_directories: context.shared_memory.as_ref()
                .map(|v| v.directories().to_vec())
                .unwrap_or_default(),
        })?;
        *inner.handle.lock() = Some(launched.handle);
        tokio::spawn(self.clone().watch_exit(launched.exited));

        let startup_timeout = inner.config.startup_timeout();
        self.await_response(start_key, start_stream, startup_timeout).await
            .map_err(|err| self.startup_error(err, WorkerChannelError::StartupTimeout { timeout: startup_timeout }))?;
        debug!(worker_id = inner.worker_id, "worker opened its stream");

        let request_id = uuid::Uuid::new_v4().to_string();
        let (init_key, init_response) = self.expect_response(ContentCase::WorkerInitResponse, &request_id);
        self.send(StreamingMessage::new(WorkerInitRequest {
            host_version: HOST_VERSION.to_owned(),
            capabilities: self.host_capabilities(),
            worker_directory: inner.config.working_directory.as_ref()
                .unwrap_or(&context.functions_dir)
                .to_string_lossy()
                .into_owned(),
            function_app_directory: context.functions_dir.to_string_lossy().into_owned(),
        }).with_request_id(request_id)).map_err(|err| WorkerChannelError::Disconnected { reason: err.to_string() })?;

        let init_timeout = inner.config.init_timeout();
        let response = self.await_response(init_key, init_response, init_timeout).await
            .map_err(|err| self.startup_error(err, WorkerChannelError::InitTimeout { timeout: init_timeout }))?;
        let Content::WorkerInitResponse(response) = response.content else {
            return Err(WorkerChannelError::InitFailed { reason: "unexpected init response".to_owned() });
        };
        if !response.result.is_success() {
            return Err(WorkerChannelError::InitFailed { reason: response.result.failure_message() });
        }
        if let Some(metadata) = &response.worker_metadata {
            info!(
                worker_id = inner.worker_id,
                runtime = metadata.runtime_name,
                runtime_version = metadata.runtime_version,
                worker_version = metadata.worker_version,
                "worker initialized"
            );
        }
        inner.capabilities.lock().extend(response.capabilities);

        let missing: Vec<String> = inner.config.required_capabilities.iter()
            .filter(|capability| !self.has_capability(capability))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(WorkerChannelError::IncompatibleCapabilities { missing });
        }

        let loads = join_all(inner.functions.values().map(|function| self.load_function(function))).await;
        loads.into_iter().collect::<Result<Vec<()>, _>>()?;
        Ok(())
    }

    async fn load_function(&self, function: &FunctionMetadata) -> Result<(), WorkerChannelError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (key, response) = self.expect_response(ContentCase::FunctionLoadResponse, &request_id);
        self.send(StreamingMessage::new(FunctionLoadRequest {
            function_id: function.function_id.clone(),
            metadata: function.to_rpc(),
        }).with_request_id(request_id)).map_err(|err| WorkerChannelError::Disconnected { reason: err.to_string() })?;

        let error = match self.await_response(key, response, self.inner.config.load_timeout()).await {
            Ok(StreamingMessage { content: Content::FunctionLoadResponse(response), .. }) => {
                if response.result.is_success() {
                    None
                } else {
                    Some(response.result.failure_message())
                }
            },
            Ok(_) => Some("unexpected function load response".to_owned()),
            Err(ResponseError::Timeout) => Some("function load timed out".to_owned()),
            Err(ResponseError::Closed) => {
                return Err(WorkerChannelError::Disconnected {
                    reason: self.fault_reason().unwrap_or_else(|| "worker stream closed".to_owned()),
                });
            }
        };

        if let Some(error) = error {
            warn!(worker_id = self.worker_id(), function = function.name, "function failed to load: {error}");
            self.inner.load_errors.lock().insert(function.name.clone(), error);
        }
        Ok(())
    }

    fn startup_error(&self, err: ResponseError, on_timeout: WorkerChannelError) -> WorkerChannelError {
        match err {
            ResponseError::Timeout => on_timeout,
            ResponseError::Closed => WorkerChannelError::Disconnected {
                reason: self.fault_reason().unwrap_or_else(|| "worker stream closed".to_owned()),
            },
        }
    }

    fn host_capabilities(&self) -> HashMap<String, String> {
        let context = &self.inner.context;
        let mut host_capabilities = HashMap::new();
        host_capabilities.insert(capabilities::MULTI_STREAM.to_owned(), capabilities::ENABLED.to_owned());
        if context.shared_memory.is_some() {
            host_capabilities.insert(capabilities::SHARED_MEMORY_DATA_TRANSFER.to_owned(), capabilities::ENABLED.to_owned());
        }
        if context.data_cache.is_enabled() {
            host_capabilities.insert(capabilities::FUNCTION_DATA_CACHE.to_owned(), capabilities::ENABLED.to_owned());
        }
        host_capabilities
    }

    /// Runs the invocation on this worker and waits for its outcome.
    pub async fn invoke(&self, invocation: ScriptInvocationContext) -> Result<InvocationResult, InvocationError> {
        let inner = &self.inner;
        let state = self.state();
        if state != WorkerChannelState::Ready {
            return Err(InvocationError::WorkerNotReady { worker_id: inner.worker_id.clone(), state });
        }

        let function = inner.functions.get(&invocation.function_name)
            .ok_or_else(|| InvocationError::FunctionNotFound { function: invocation.function_name.clone() })?;
        if let Some(reason) = inner.load_errors.lock().get(&function.name).cloned() {
            return Err(InvocationError::FunctionLoad { function: function.name.clone(), reason });
        }

        let invocation_id = invocation.invocation_id.clone();
        let (pending, mut receiver) = PendingInvocation::new(function.name.clone());
        if inner.pending.insert(&invocation_id, pending).is_err() {
            return Err(InvocationError::DuplicateInvocationId { invocation_id });
        }
        inner.context.metrics.invocations_in_flight.inc();
        trace!(worker_id = inner.worker_id, invocation_id, function = function.name, "sending invocation");

        let input_data = self.bind_inputs(&invocation_id, &invocation.inputs);
        let request = StreamingMessage::new(InvocationRequest {
            invocation_id: invocation_id.clone(),
            function_id: function.function_id.clone(),
            input_data,
            trigger_metadata: invocation.trigger_metadata.clone(),
        });
        if let Err(err) = self.send(request) {
            self.complete_invocation(&invocation_id, Err(InvocationError::WorkerDisconnected {
                worker_id: inner.worker_id.clone(),
                reason: err.to_string(),
            }));
        }

        let invocation_timeout = invocation.timeout.unwrap_or(inner.context.invocation_timeout);
        tokio::select! {
            outcome = &mut receiver => return self.received_outcome(outcome),
            _ = invocation.cancellation.cancelled() => {
                if self.complete_invocation(&invocation_id, Err(InvocationError::Cancelled { invocation_id: invocation_id.clone() })) {
                    debug!(worker_id = inner.worker_id, invocation_id, "invocation cancelled");
                    self.send_invocation_cancel(&invocation_id);
                }
            },
            _ = sleep(invocation_timeout) => {
                let timed_out = self.complete_invocation(&invocation_id, Err(InvocationError::Timeout {
                    invocation_id: invocation_id.clone(),
                    timeout: invocation_timeout,
                }));
                if timed_out {
                    warn!(worker_id = inner.worker_id, invocation_id, "invocation timed out after {invocation_timeout:?}");
                    if self.is_heartbeat_lost() {
                        self.fault("worker stopped responding".to_owned(), true);
                    } else {
                        self.send_invocation_cancel(&invocation_id);
                    }
                }
            },
        }

        self.received_outcome(receiver.await)
    }

    fn received_outcome(&self, outcome: Result<InvocationOutcome, oneshot::error::RecvError>) -> InvocationOutcome {
        outcome.unwrap_or_else(|_| Err(InvocationError::WorkerDisconnected {
            worker_id: self.inner.worker_id.clone(),
            reason: "invocation was dropped".to_owned(),
        }))
    }

    fn send_invocation_cancel(&self, invocation_id: &str) {
        if !self.has_capability(capabilities::HANDLES_INVOCATION_CANCEL_MESSAGE) {
            return;
        }
        let cancel = StreamingMessage::new(InvocationCancel { invocation_id: invocation_id.to_owned() });
        if let Err(err) = self.send(cancel) {
            debug!(worker_id = self.worker_id(), invocation_id, "failed to send invocation cancel: {err}");
        }
    }

    /// Completes the pending invocation if it is still pending. Returns false if someone else
    /// completed it first.
    fn complete_invocation(&self, invocation_id: &str, outcome: InvocationOutcome) -> bool {
        match self.inner.pending.remove(invocation_id) {
            Some(pending) => {
                self.finish_invocation(invocation_id, pending, outcome);
                true
            },
            None => false,
        }
    }

    fn finish_invocation(&self, invocation_id: &str, pending: PendingInvocation, outcome: InvocationOutcome) {
        let context = &self.inner.context;
        if let Some(shared_memory) = &context.shared_memory {
            shared_memory.free_for_invocation(invocation_id);
        }

        let outcome_label = match &outcome {
            Ok(_) => "success",
            Err(InvocationError::UserCode { .. }) => "failure",
            Err(InvocationError::Cancelled { .. }) => "cancelled",
            Err(InvocationError::Timeout { .. }) => "timeout",
            Err(_) => "error",
        };
        trace!(worker_id = self.worker_id(), invocation_id, function = pending.function_name, outcome = outcome_label, "invocation finished");
        context.metrics.invocations_in_flight.dec();
        context.metrics.invocations_total.with_label_values(&[self.language(), outcome_label]).inc();

        pending.complete(outcome);
    }

    fn bind_inputs(&self, invocation_id: &str, inputs: &[InvocationInput]) -> Vec<ParameterBinding> {
        let mut handles = Vec::new();
        let bindings = inputs.iter()
            .map(|input| self.bind_input(invocation_id, input, &mut handles))
            .collect();
        let pending = self.inner.pending.update(invocation_id, move |pending| pending.cache_handles.extend(handles));
        if !pending {
            // completed while binding, maps tracked after completion would leak
            if let Some(shared_memory) = &self.inner.context.shared_memory {
                shared_memory.free_for_invocation(invocation_id);
            }
        }
        bindings
    }

    /// Places large values into shared memory, reusing cached maps when possible. Falls back
    /// to sending the value inline.
    fn bind_input(&self, invocation_id: &str, input: &InvocationInput, handles: &mut Vec<CacheHandle>) -> ParameterBinding {
        let context = &self.inner.context;
        let inline = || ParameterBinding::inline(&input.name, input.value.clone());

        let Some(shared_memory) = context.shared_memory.as_ref()
            .filter(|v| v.is_supported(&input.value))
            .filter(|_| self.has_capability(capabilities::SHARED_MEMORY_DATA_TRANSFER)) else {
            return inline();
        };
        let Some(bytes) = input.value.payload_bytes() else {
            return inline();
        };

        let cache_key = input.cache_key.as_ref()
            .filter(|_| context.data_cache.is_enabled() && self.has_capability(capabilities::FUNCTION_DATA_CACHE));
        let metadata = match cache_key {
            Some(key) => match context.data_cache.try_get(key) {
                Some(handle) => {
                    context.metrics.function_data_cache_hits.inc();
                    let metadata = handle.metadata().clone();
                    handles.push(handle);
                    Ok(metadata)
                },
                None => {
                    context.metrics.function_data_cache_misses.inc();
                    shared_memory.put(bytes).inspect(|metadata| {
                        match context.data_cache.try_put(key.clone(), metadata.clone(), false) {
                            Some(handle) => handles.push(handle),
                            None => shared_memory.track(invocation_id, &metadata.name),
                        }
                    })
                }
            },
            None => shared_memory.put_for_invocation(invocation_id, bytes),
        };

        match metadata.map(|metadata| (metadata.to_rpc(&input.value), metadata.count)) {
            Ok((Some(reference), count)) => {
                context.metrics.shared_memory_bytes_total.inc_by(count);
                ParameterBinding::shared_memory(&input.name, reference)
            },
            Ok((None, _)) => inline(),
            Err(err) => {
                warn!(worker_id = self.worker_id(), invocation_id, input = input.name, "sending input inline, shared memory failed: {err}");
                inline()
            }
        }
    }

    async fn read_inbound(self, inbound: flume::Receiver<StreamingMessage>) {
        while let Ok(message) = inbound.recv_async().await {
            *self.inner.last_activity.lock() = Instant::now();
            self.handle_message(message);
        }

        let reason = self.inner.pair.lock().as_ref()
            .and_then(|pair| pair.fault_reason())
            .unwrap_or_else(|| "worker stream closed".to_owned());
        self.fault(reason, true);
    }

    fn handle_message(&self, message: StreamingMessage) {
        let StreamingMessage { request_id, content } = message;
        match content {
            Content::InvocationResponse(response) => self.handle_invocation_response(response),
            Content::RpcLog(log) => self.handle_log(log),
            Content::WorkerHeartbeat(_) => {},
            content @ (Content::StartStream(_)
                | Content::WorkerInitResponse(_)
                | Content::FunctionLoadResponse(_)
                | Content::WorkerStatusResponse(_)
                | Content::CloseSharedMemoryResourcesResponse(_)) => {
                let key = ResponseKey { case: content.case(), request_id };
                let waiter = self.inner.responses.lock().remove(&key);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(StreamingMessage { request_id: key.request_id, content });
                    },
                    None => debug!(worker_id = self.worker_id(), "nobody waits for {} {}", key.case, key.request_id),
                }
            },
            other => warn!(worker_id = self.worker_id(), "unexpected message from worker: {}", other.case()),
        }
    }

    fn handle_invocation_response(&self, response: InvocationResponse) {
        let invocation_id = response.invocation_id.clone();
        let Some(pending) = self.inner.pending.remove(&invocation_id) else {
            debug!(worker_id = self.worker_id(), invocation_id, "response for invocation that is no longer pending");
            return;
        };

        let outcome = self.invocation_outcome(response);
        self.finish_invocation(&invocation_id, pending, outcome);
    }

    fn invocation_outcome(&self, response: InvocationResponse) -> InvocationOutcome {
        match response.result.status {
            Status::Success => {},
            Status::Failure => {
                let exception = response.result.exception.clone()
                    .unwrap_or_else(|| RpcException::new(response.result.failure_message()));
                return Err(InvocationError::UserCode { exception });
            },
            Status::Cancelled => return Err(InvocationError::Cancelled { invocation_id: response.invocation_id }),
        }

        let mut outputs = HashMap::new();
        let mut worker_maps = Vec::new();
        let mut failure = None;
        for binding in response.output_data {
            let value = match binding.data {
                ParameterData::Data(value) => value,
                ParameterData::SharedMemory(reference) => {
                    worker_maps.push(reference.name.clone());
                    match self.read_shared_memory(&reference) {
                        Ok(value) => value,
                        Err(reason) => {
                            failure = Some(InvocationError::OutputData { binding: binding.name, reason });
                            break;
                        }
                    }
                }
            };
            outputs.insert(binding.name, value);
        }
        self.close_worker_maps(worker_maps);

        match failure {
            Some(err) => Err(err),
            None => Ok(InvocationResult {
                return_value: response.return_value,
                outputs,
            }),
        }
    }

    fn read_shared_memory(&self, reference: &RpcSharedMemory) -> Result<TypedData, String> {
        let context = &self.inner.context;
        let shared_memory = context.shared_memory.as_ref()
            .ok_or_else(|| "shared memory transfer is disabled".to_owned())?;
        let value = shared_memory.get_typed(reference).map_err(|err| err.to_string())?;
        context.metrics.shared_memory_bytes_total.inc_by(reference.count);
        Ok(value)
    }

    /// The host is done with maps the worker produced, the worker may dispose of them.
    fn close_worker_maps(&self, map_names: Vec<String>) {
        if map_names.is_empty() {
            return;
        }
        if let Some(shared_memory) = &self.inner.context.shared_memory {
            for name in &map_names {
                shared_memory.close(name);
            }
        }
        let request = StreamingMessage::new(CloseSharedMemoryResourcesRequest { map_names })
            .with_request_id(uuid::Uuid::new_v4().to_string());
        if let Err(err) = self.send(request) {
            debug!(worker_id = self.worker_id(), "failed to ask worker to close shared memory: {err}");
        }
    }

    fn handle_log(&self, log: RpcLog) {
        let worker_id = self.worker_id();
        match log.log_category {
            RpcLogCategory::User => self.inner.context.logger.log(LogMessageEvent::from_rpc_log(worker_id, &log)),
            RpcLogCategory::System => {
                let message = log.message;
                match log.level {
                    RpcLogLevel::Trace => trace!(target: "worker", worker_id, "{message}"),
                    RpcLogLevel::Debug => debug!(target: "worker", worker_id, "{message}"),
                    RpcLogLevel::Information => info!(target: "worker", worker_id, "{message}"),
                    RpcLogLevel::Warning => warn!(target: "worker", worker_id, "{message}"),
                    RpcLogLevel::Error | RpcLogLevel::Critical => error!(target: "worker", worker_id, "{message}"),
                }
            }
        }
    }

    async fn watch_exit(self, exited: oneshot::Receiver<WorkerExit>) {
        let exit = exited.await.unwrap_or_default();
        self.inner.exited.cancel();

        self.inner.context.events.publish(ScriptEvent::new(SOURCE_WORKER_PROCESS, ScriptEventKind::WorkerProcessExited {
            language: self.inner.language.clone(),
            worker_id: self.inner.worker_id.clone(),
            pid: self.pid(),
            exit_code: exit.exit_code,
            stderr: exit.stderr.clone(),
        }));
        self.fault(exit.describe(), true);
    }

    /// While ready, asks the worker for its status every heartbeat interval and faults the
    /// channel if the worker went silent.
    async fn probe_status(self) {
        let inner = &self.inner;
        let interval = inner.config.heartbeat_interval();
        loop {
            tokio::select! {
                _ = inner.stopped.cancelled() => return,
                _ = sleep(interval) => {},
            }
            if self.state() != WorkerChannelState::Ready {
                return;
            }
            if self.is_heartbeat_lost() {
                self.fault(format!("worker sent nothing for {:?}", inner.config.heartbeat_deadline()), true);
                return;
            }

            let request_id = uuid::Uuid::new_v4().to_string();
            let (key, response) = self.expect_response(ContentCase::WorkerStatusResponse, &request_id);
            let sent_at = Instant::now();
            if self.send(StreamingMessage::new(WorkerStatusRequest {}).with_request_id(request_id)).is_err() {
                return;
            }

            tokio::select! {
                _ = inner.stopped.cancelled() => return,
                response = self.await_response(key, response, interval) => if response.is_ok() {
                    *inner.latency.lock() = Some(sent_at.elapsed());
                },
            }
        }
    }

    fn is_heartbeat_lost(&self) -> bool {
        self.has_capability(capabilities::WORKER_STATUS)
            && self.inner.last_activity.lock().elapsed() > self.inner.config.heartbeat_deadline()
    }

    fn expect_response(&self, case: ContentCase, request_id: &str) -> (ResponseKey, oneshot::Receiver<StreamingMessage>) {
        let key = ResponseKey { case, request_id: request_id.to_owned() };
        let (sender, receiver) = oneshot::channel();
        self.inner.responses.lock().insert(key.clone(), sender);
        (key, receiver)
    }

    async fn await_response(
        &self,
        key: ResponseKey,
        receiver: oneshot::Receiver<StreamingMessage>,
        wait: Duration,
    ) -> Result<StreamingMessage, ResponseError> {
        match timeout(wait, receiver).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(ResponseError::Closed),
            Err(_) => {
                self.inner.responses.lock().remove(&key);
                Err(ResponseError::Timeout)
            }
        }
    }

    fn send(&self, message: StreamingMessage) -> Result<(), ChannelError> {
        let pair = self.inner.pair.lock().clone();
        match pair {
            Some(pair) => pair.send_outbound(message),
            None => Err(ChannelError::Completed { worker_id: self.inner.worker_id.clone() }),
        }
    }

    /// Moves the channel to `Faulted`: pending invocations fail with `WorkerDisconnected`, the
    /// worker is stopped and a `WorkerError` event is published. No-op for final states.
    fn fault(&self, reason: String, recoverable: bool) {
        let inner = &self.inner;
        let mut previous = None;
        inner.state.send_if_modified(|state| {
            if state.is_final() {
                return false;
            }
            previous = Some(*state);
            *state = WorkerChannelState::Faulted;
            true
        });
        let Some(previous) = previous else {
            return;
        };

        inner.fault_reason.lock().get_or_insert_with(|| reason.clone());
        warn!(worker_id = inner.worker_id, language = inner.language, "worker channel faulted: {reason}");
        inner.context.metrics.worker_faults_total.with_label_values(&[inner.language.as_str()]).inc();

        for (invocation_id, pending) in inner.pending.drain() {
            self.finish_invocation(&invocation_id, pending, Err(InvocationError::WorkerDisconnected {
                worker_id: inner.worker_id.clone(),
                reason: reason.clone(),
            }));
        }
        inner.responses.lock().clear();
        self.release();

        // a channel being drained is already on its way out
        if previous != WorkerChannelState::Draining && !inner.error_reported.swap(true, Ordering::SeqCst) {
            inner.context.events.publish(ScriptEvent::new(SOURCE_WORKER_CHANNEL, ScriptEventKind::WorkerError {
                language: inner.language.clone(),
                worker_id: inner.worker_id.clone(),
                reason,
                recoverable,
            }));
        }
    }

    /// Stops accepting invocations, waits up to `grace` for in-flight ones, then terminates
    /// the worker. Invocations still pending fail with `WorkerShutdown`.
    pub async fn shutdown(&self, grace: Duration) {
        let inner = &self.inner;
        let draining = inner.state.send_if_modified(|state| match state {
            WorkerChannelState::Created | WorkerChannelState::Initializing | WorkerChannelState::Ready => {
                *state = WorkerChannelState::Draining;
                true
            },
            _ => false,
        });
        if !draining {
            return;
        }
        info!(worker_id = inner.worker_id, pending = inner.pending.len(), "draining worker channel");

        let _ = timeout(grace, inner.pending.wait_empty()).await;

        let terminated = inner.state.send_if_modified(|state| {
            if *state == WorkerChannelState::Draining {
                *state = WorkerChannelState::Terminated;
                true
            } else {
                false
            }
        });
        if !terminated {
            return;
        }

        for (invocation_id, pending) in inner.pending.drain() {
            self.finish_invocation(&invocation_id, pending, Err(InvocationError::WorkerShutdown {
                worker_id: inner.worker_id.clone(),
            }));
        }

        if self.has_capability(capabilities::HANDLES_WORKER_TERMINATE_MESSAGE) {
            let terminate = StreamingMessage::new(WorkerTerminate { grace_period_ms: grace.as_millis() as u64 });
            if self.send(terminate).is_ok() {
                let _ = timeout(grace, inner.exited.cancelled()).await;
            }
        }

        self.release();
        info!(worker_id = inner.worker_id, "worker channel terminated");
    }

    fn release(&self) {
        let inner = &self.inner;
        inner.stopped.cancel();
        inner.responses.lock().clear();
        inner.context.channels.remove_channels(&inner.worker_id);
        if let Some(handle) = inner.handle.lock().as_ref() {
            handle.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        std::time::Duration,
        fx_rpc::RpcDataType,
        crate::{
            config::SharedMemoryConfig,
            data_cache::{FunctionDataCacheKey, SharedFunctionDataCache},
            worker::testing::{FakeLauncher, FakeWorkerMode, fake_context, fake_functions},
        },
        super::*,
    };

    fn channel(launcher: &Arc<FakeLauncher>, config: WorkerConfig) -> (RpcWorkerChannel, Arc<WorkerChannelContext>) {
        let context = fake_context(launcher.clone(), None, None);
        let channel = RpcWorkerChannel::new(context.clone(), "fake", Arc::new(config), fake_functions());
        (channel, context)
    }

    fn test_config() -> WorkerConfig {
        let mut config = WorkerConfig::new("fake-worker");
        config.init_timeout_ms = 5_000;
        config.drain_grace_ms = 1_000;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn never_initializing_worker_faults_after_init_timeout() {
        let launcher = FakeLauncher::new(FakeWorkerMode::NeverInit);
        let (channel, context) = channel(&launcher, test_config());
        let errors = context.events.subscribe_filtered(|event| matches!(event.kind, ScriptEventKind::WorkerError { .. }));

        let started_at = Instant::now();
        let err = channel.start().await.unwrap_err();
        assert!(matches!(err, WorkerChannelError::InitTimeout { timeout } if timeout == Duration::from_secs(5)), "{err:?}");
        assert!(started_at.elapsed() >= Duration::from_secs(5));
        assert_eq!(channel.state(), WorkerChannelState::Faulted);

        let event = errors.recv().await.unwrap();
        assert!(matches!(event.kind, ScriptEventKind::WorkerError { recoverable: true, .. }));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(errors.try_recv().is_none());
        assert!(context.channels.try_get_channels(channel.worker_id()).is_none());
    }

    #[tokio::test]
    async fn response_is_correlated_by_invocation_id() {
        let launcher = FakeLauncher::new(FakeWorkerMode::Normal);
        let (channel, _context) = channel(&launcher, test_config());
        channel.start().await.unwrap();
        assert!(channel.is_ready());

        let result = channel.invoke(ScriptInvocationContext::new("echo")
            .with_invocation_id("abc123")
            .with_input("name", "fx")).await.unwrap();

        assert_eq!(result.output("result"), Some(&TypedData::from("ok")));
        assert_eq!(result.output("name"), Some(&TypedData::from("fx")));
        assert_eq!(channel.pending_count(), 0);
        assert_eq!(launcher.received()[0].invocation_id, "abc123");
    }

    #[tokio::test]
    async fn user_code_failure_keeps_worker_ready() {
        let launcher = FakeLauncher::new(FakeWorkerMode::Normal);
        let (channel, _context) = channel(&launcher, test_config());
        channel.start().await.unwrap();

        let err = channel.invoke(ScriptInvocationContext::new("fail")).await.unwrap_err();
        assert!(matches!(&err, InvocationError::UserCode { exception } if exception.message == "boom"), "{err:?}");
        assert!(!err.is_transient());
        assert!(channel.is_ready());
    }

    #[tokio::test]
    async fn duplicate_invocation_id_is_rejected() {
        let launcher = FakeLauncher::new(FakeWorkerMode::Normal);
        let (channel, _context) = channel(&launcher, test_config());
        channel.start().await.unwrap();

        let first = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel.invoke(ScriptInvocationContext::new("silent").with_invocation_id("same")).await
            })
        };
        while !channel.has_invocation("same") {
            tokio::task::yield_now().await;
        }

        let err = channel.invoke(ScriptInvocationContext::new("echo").with_invocation_id("same")).await.unwrap_err();
        assert_eq!(err, InvocationError::DuplicateInvocationId { invocation_id: "same".to_owned() });
        assert!(channel.has_invocation("same"));
        first.abort();
    }

    #[tokio::test]
    async fn cancellation_completes_locally_and_notifies_worker() {
        let launcher = FakeLauncher::new(FakeWorkerMode::Normal);
        let (channel, _context) = channel(&launcher, test_config());
        channel.start().await.unwrap();

        let cancellation = CancellationToken::new();
        let invocation = {
            let channel = channel.clone();
            let cancellation = cancellation.clone();
            tokio::spawn(async move {
                channel.invoke(ScriptInvocationContext::new("silent")
                    .with_invocation_id("to-cancel")
                    .with_cancellation(cancellation)).await
            })
        };
        while !channel.has_invocation("to-cancel") {
            tokio::task::yield_now().await;
        }

        cancellation.cancel();
        let err = invocation.await.unwrap().unwrap_err();
        assert_eq!(err, InvocationError::Cancelled { invocation_id: "to-cancel".to_owned() });
        assert_eq!(channel.pending_count(), 0);

        launcher.wait_for_cancel("to-cancel").await;
        assert!(channel.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_invocation_but_not_the_worker() {
        let launcher = FakeLauncher::new(FakeWorkerMode::Normal);
        let (channel, _context) = channel(&launcher, test_config());
        channel.start().await.unwrap();

        let err = channel.invoke(ScriptInvocationContext::new("silent")
            .with_invocation_id("slow")
            .with_timeout(Duration::from_secs(3))).await.unwrap_err();

        assert_eq!(err, InvocationError::Timeout { invocation_id: "slow".to_owned(), timeout: Duration::from_secs(3) });
        assert!(err.is_transient());
        assert!(channel.is_ready());
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn removing_channels_fails_in_flight_invocations() {
        let launcher = FakeLauncher::new(FakeWorkerMode::Normal);
        let (channel, context) = channel(&launcher, test_config());
        channel.start().await.unwrap();

        let invocation = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel.invoke(ScriptInvocationContext::new("silent").with_invocation_id("in-flight")).await
            })
        };
        while !channel.has_invocation("in-flight") {
            tokio::task::yield_now().await;
        }

        assert!(context.channels.remove_channels(channel.worker_id()));
        assert!(!context.channels.remove_channels(channel.worker_id()));

        let err = invocation.await.unwrap().unwrap_err();
        assert!(matches!(&err, InvocationError::WorkerDisconnected { worker_id, .. } if worker_id == channel.worker_id()), "{err:?}");
        assert_eq!(channel.state(), WorkerChannelState::Faulted);
    }

    #[tokio::test]
    async fn worker_exit_mid_invocation_disconnects() {
        let launcher = FakeLauncher::new(FakeWorkerMode::Normal);
        let (channel, context) = channel(&launcher, test_config());
        let exits = context.events.subscribe_filtered(|event| matches!(event.kind, ScriptEventKind::WorkerProcessExited { .. }));
        channel.start().await.unwrap();

        let err = channel.invoke(ScriptInvocationContext::new("crash")).await.unwrap_err();
        assert!(matches!(err, InvocationError::WorkerDisconnected { .. }), "{err:?}");
        assert!(err.is_transient());
        assert_eq!(channel.state(), WorkerChannelState::Faulted);

        let exit = exits.recv().await.unwrap();
        assert!(matches!(exit.kind, ScriptEventKind::WorkerProcessExited { exit_code: Some(1), .. }));
    }

    #[tokio::test]
    async fn missing_required_capability_is_a_protocol_fault() {
        let launcher = FakeLauncher::new(FakeWorkerMode::Normal);
        let mut config = test_config();
        config.required_capabilities = vec!["SomethingNew".to_owned()];
        let (channel, context) = channel(&launcher, config);
        let errors = context.events.subscribe_filtered(|event| matches!(event.kind, ScriptEventKind::WorkerError { .. }));

        let err = channel.start().await.unwrap_err();
        assert!(matches!(&err, WorkerChannelError::IncompatibleCapabilities { missing } if missing == &vec!["SomethingNew".to_owned()]));
        assert!(err.is_protocol_fault());

        let event = errors.recv().await.unwrap();
        assert!(matches!(event.kind, ScriptEventKind::WorkerError { recoverable: false, .. }), "{event:?}");
    }

    #[tokio::test]
    async fn function_that_failed_to_load_is_not_invoked() {
        let launcher = FakeLauncher::new(FakeWorkerMode::FailLoad);
        let (channel, _context) = channel(&launcher, test_config());
        channel.start().await.unwrap();

        let err = channel.invoke(ScriptInvocationContext::new("echo")).await.unwrap_err();
        assert!(matches!(err, InvocationError::FunctionLoad { .. }), "{err:?}");
        assert!(launcher.received().is_empty());

        let err = channel.invoke(ScriptInvocationContext::new("unknown")).await.unwrap_err();
        assert_eq!(err, InvocationError::FunctionNotFound { function: "unknown".to_owned() });
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_fails_invocations_left_after_grace() {
        let launcher = FakeLauncher::new(FakeWorkerMode::Normal);
        let (channel, context) = channel(&launcher, test_config());
        let errors = context.events.subscribe_filtered(|event| matches!(event.kind, ScriptEventKind::WorkerError { .. }));
        channel.start().await.unwrap();

        let invocation = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel.invoke(ScriptInvocationContext::new("silent").with_invocation_id("left-over")).await
            })
        };
        while !channel.has_invocation("left-over") {
            tokio::task::yield_now().await;
        }

        channel.shutdown(Duration::from_secs(1)).await;
        assert_eq!(channel.state(), WorkerChannelState::Terminated);
        assert_eq!(
            invocation.await.unwrap().unwrap_err(),
            InvocationError::WorkerShutdown { worker_id: channel.worker_id().to_owned() }
        );
        assert!(launcher.terminated());

        let err = channel.invoke(ScriptInvocationContext::new("echo")).await.unwrap_err();
        assert!(matches!(err, InvocationError::WorkerNotReady { state: WorkerChannelState::Terminated, .. }));
        assert!(errors.try_recv().is_none());
    }

    #[tokio::test]
    async fn inputs_bound_after_completion_are_freed() {
        let dir = tempfile::tempdir().unwrap();
        let shared_memory = Arc::new(SharedMemoryManager::new(&SharedMemoryConfig {
            directories: vec![dir.path().to_owned()],
            min_object_bytes: 16,
            ..SharedMemoryConfig::default()
        }).unwrap());
        let launcher = FakeLauncher::new(FakeWorkerMode::Normal).with_shared_memory(shared_memory.clone());
        let context = fake_context(launcher.clone(), Some(shared_memory.clone()), None);
        let channel = RpcWorkerChannel::new(context, "fake", Arc::new(test_config()), fake_functions());
        channel.start().await.unwrap();

        let invocation = ScriptInvocationContext::new("echo").with_input("blob", "y".repeat(64).as_str());
        let bindings = channel.bind_inputs("already-completed", &invocation.inputs);

        let ParameterData::SharedMemory(reference) = &bindings[0].data else {
            panic!("expected shared memory input, got {:?}", bindings[0].data);
        };
        assert!(shared_memory.get(&reference.name, 0, 1).is_err());
    }

    #[tokio::test]
    async fn large_inputs_travel_through_shared_memory_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let shared_memory = Arc::new(SharedMemoryManager::new(&SharedMemoryConfig {
            directories: vec![dir.path().to_owned()],
            min_object_bytes: 16,
            ..SharedMemoryConfig::default()
        }).unwrap());
        let cache = Arc::new(SharedFunctionDataCache::new(1024 * 1024, shared_memory.clone()));

        let launcher = FakeLauncher::new(FakeWorkerMode::Normal).with_shared_memory(shared_memory.clone());
        let context = fake_context(launcher.clone(), Some(shared_memory.clone()), Some(cache.clone()));
        let channel = RpcWorkerChannel::new(context, "fake", Arc::new(test_config()), fake_functions());
        channel.start().await.unwrap();

        let payload = "x".repeat(64);
        let key = FunctionDataCacheKey::new("blob", "1");
        for invocation_id in ["first", "second"] {
            let result = channel.invoke(ScriptInvocationContext::new("echo")
                .with_invocation_id(invocation_id)
                .with_cached_input("blob", payload.as_str(), key.clone())
                .with_input("small", "tiny")).await.unwrap();
            assert_eq!(result.output("blob"), Some(&TypedData::from(payload.as_str())));
        }

        let received = launcher.received();
        let names: Vec<_> = received.iter()
            .map(|request| match &request.input_data[0].data {
                ParameterData::SharedMemory(reference) => {
                    assert_eq!(reference.data_type, RpcDataType::String);
                    reference.name.clone()
                },
                other => panic!("expected shared memory input, got {other:?}"),
            })
            .collect();
        assert_eq!(names[0], names[1]);
        assert!(matches!(received[0].input_data[1].data, ParameterData::Data(_)));
        assert_eq!(cache.len(), 1);

        let uncached = channel.invoke(ScriptInvocationContext::new("echo")
            .with_invocation_id("third")
            .with_input("blob", payload.as_str())).await.unwrap();
        assert_eq!(uncached.output("blob"), Some(&TypedData::from(payload.as_str())));
        let third = &launcher.received()[2];
        let third_map = third.input_data[0].data.clone();
        let ParameterData::SharedMemory(reference) = third_map else {
            panic!("expected shared memory input");
        };
        assert!(shared_memory.get(&reference.name, 0, 1).is_err(), "invocation map must be freed");
    }
}
