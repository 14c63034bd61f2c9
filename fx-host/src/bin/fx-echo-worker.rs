//! Minimal language worker speaking the host protocol. Used to exercise the host end to end.
//!
//! Behavior of a function is chosen by its entry point: `echo` returns every input plus
//! `result = "ok"`, `sleep` waits for the `ms` input, `fail` throws, `crash` exits the process,
//! `log` writes a user log line. Functions with entry point `fail-load` fail to load.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

use {
    std::{collections::HashMap, env, path::PathBuf, process::exit, sync::Arc, time::Duration},
    tracing::{debug, info, warn},
    tracing_subscriber::FmtSubscriber,
    tokio::{net::TcpStream, task::AbortHandle},
    parking_lot::Mutex,
    clap::{Parser, ValueEnum},
    anyhow::Context,
    fx_rpc::{
        CloseSharedMemoryResourcesRequest,
        CloseSharedMemoryResourcesResponse,
        Content,
        FunctionLoadRequest,
        FunctionLoadResponse,
        InvocationRequest,
        InvocationResponse,
        ParameterBinding,
        ParameterData,
        RpcException,
        RpcLog,
        RpcLogCategory,
        RpcLogLevel,
        StartStream,
        StatusResult,
        StreamingMessage,
        TypedData,
        WorkerInitRequest,
        WorkerInitResponse,
        WorkerMetadata,
        WorkerStatusResponse,
        capabilities,
        read_message,
        write_message,
    },
    fx_host::{
        config::{ENV_SHARED_MEMORY_DIRECTORIES, SharedMemoryConfig},
        shared_memory::SharedMemoryManager,
    },
};

const WORKER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[arg(long)]
    host: String,

    #[arg(long)]
    port: u16,

    #[arg(long = "workerId")]
    worker_id: String,

    #[arg(long = "requestId")]
    request_id: String,

    #[arg(long, value_enum, default_value_t = Mode::Normal)]
    mode: Mode,
}

#[derive(ValueEnum, Debug, Clone, Copy, Eq, PartialEq)]
enum Mode {
    Normal,
    /// Connects but never answers the init request.
    NeverInit,
    /// Answers the init request with a failure.
    FailInit,
}

struct Worker {
    mode: Mode,
    outbound: flume::Sender<StreamingMessage>,
    shared_memory: Mutex<Option<Arc<SharedMemoryManager>>>,
    entry_points: Mutex<HashMap<String, String>>,
    invocations: Mutex<HashMap<String, AbortHandle>>,
}

#[tokio::main]
async fn main() {
    FmtSubscriber::builder().with_writer(std::io::stderr).init();
    let args = Args::parse();

    if let Err(err) = run(args).await {
        eprintln!("error: worker failed: {err:?}");
        exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let stream = TcpStream::connect((args.host.as_str(), args.port)).await
        .with_context(|| format!("failed to connect to host at {}:{}", args.host, args.port))?;
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    let (outbound, outbound_rx) = flume::unbounded::<StreamingMessage>();
    tokio::spawn(async move {
        while let Ok(message) = outbound_rx.recv_async().await {
            if let Err(err) = write_message(&mut writer, &message).await {
                warn!("failed to write to host: {err}");
                break;
            }
        }
    });

    let worker = Arc::new(Worker {
        mode: args.mode,
        outbound,
        shared_memory: Mutex::new(None),
        entry_points: Mutex::new(HashMap::new()),
        invocations: Mutex::new(HashMap::new()),
    });
    worker.send(StreamingMessage::new(StartStream { worker_id: args.worker_id.clone() }).with_request_id(args.request_id));
    info!(worker_id = args.worker_id, "connected to host");

    while let Some(message) = read_message(&mut reader).await? {
        let request_id = message.request_id;
        match message.content {
            Content::WorkerInitRequest(request) => worker.init(request_id, request),
            Content::FunctionLoadRequest(request) => worker.load(request_id, request),
            Content::InvocationRequest(request) => {
                let invocation_id = request.invocation_id.clone();
                let task = tokio::spawn(worker.clone().invoke(request));
                worker.invocations.lock().insert(invocation_id, task.abort_handle());
            },
            Content::InvocationCancel(cancel) => worker.cancel(&cancel.invocation_id),
            Content::WorkerStatusRequest(_) => {
                worker.send(StreamingMessage::new(WorkerStatusResponse {}).with_request_id(request_id));
            },
            Content::CloseSharedMemoryResourcesRequest(request) => worker.close_shared_memory(request_id, request),
            Content::WorkerTerminate(terminate) => {
                info!(grace_period_ms = terminate.grace_period_ms, "terminating");
                break;
            },
            other => debug!("ignoring {}", other.case()),
        }
    }

    // let the writer flush responses already queued
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}

impl Worker {
    fn send(&self, message: StreamingMessage) {
        let _ = self.outbound.send(message);
    }

    fn init(&self, request_id: String, request: WorkerInitRequest) {
        info!(host_version = request.host_version, "init requested");
        let result = match self.mode {
            Mode::NeverInit => return,
            Mode::FailInit => StatusResult::failure(RpcException::new("worker refuses to initialize")),
            Mode::Normal => StatusResult::success(),
        };

        let host_offers = |name: &str| request.capabilities.get(name).is_some_and(|v| capabilities::is_enabled(v));
        if host_offers(capabilities::SHARED_MEMORY_DATA_TRANSFER) {
            match shared_memory_from_env() {
                Ok(v) => *self.shared_memory.lock() = Some(Arc::new(v)),
                Err(err) => warn!("shared memory is not available: {err:?}"),
            }
        }

        let mut worker_capabilities: HashMap<String, String> = [
            capabilities::HANDLES_INVOCATION_CANCEL_MESSAGE,
            capabilities::HANDLES_WORKER_TERMINATE_MESSAGE,
            capabilities::WORKER_STATUS,
        ].into_iter().map(|v| (v.to_owned(), capabilities::ENABLED.to_owned())).collect();
        if self.shared_memory.lock().is_some() {
            worker_capabilities.insert(capabilities::SHARED_MEMORY_DATA_TRANSFER.to_owned(), capabilities::ENABLED.to_owned());
            if host_offers(capabilities::FUNCTION_DATA_CACHE) {
                worker_capabilities.insert(capabilities::FUNCTION_DATA_CACHE.to_owned(), capabilities::ENABLED.to_owned());
            }
        }

        self.send(StreamingMessage::new(WorkerInitResponse {
            worker_version: WORKER_VERSION.to_owned(),
            capabilities: worker_capabilities,
            worker_metadata: Some(WorkerMetadata {
                runtime_name: "echo".to_owned(),
                runtime_version: WORKER_VERSION.to_owned(),
                worker_version: WORKER_VERSION.to_owned(),
            }),
            result,
        }).with_request_id(request_id));
    }

    fn load(&self, request_id: String, request: FunctionLoadRequest) {
        let entry_point = request.metadata.entry_point.clone();
        let result = if entry_point == "fail-load" {
            StatusResult::failure(RpcException::new(format!("cannot load {}", request.metadata.name)))
        } else {
            self.entry_points.lock().insert(request.function_id.clone(), entry_point);
            StatusResult::success()
        };

        self.send(StreamingMessage::new(FunctionLoadResponse {
            function_id: request.function_id,
            result,
        }).with_request_id(request_id));
    }

    async fn invoke(self: Arc<Self>, request: InvocationRequest) {
        let invocation_id = request.invocation_id.clone();
        let entry_point = self.entry_points.lock().get(&request.function_id).cloned().unwrap_or_default();

        let inputs = match self.read_inputs(request.input_data) {
            Ok(v) => v,
            Err(err) => {
                self.respond(&invocation_id, StatusResult::failure(RpcException::new(err)), Vec::new());
                return;
            }
        };

        match entry_point.as_str() {
            "echo" => {
                let mut outputs = vec![("result".to_owned(), TypedData::from("ok"))];
                outputs.extend(inputs);
                let outputs = self.write_outputs(outputs);
                self.respond(&invocation_id, StatusResult::success(), outputs);
            },
            "sleep" => {
                let ms = inputs.iter()
                    .find(|(name, _)| name == "ms")
                    .and_then(|(_, value)| value.as_str())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60_000);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                self.respond(&invocation_id, StatusResult::success(), vec![ParameterBinding::inline("result", TypedData::from("ok"))]);
            },
            "fail" => {
                self.respond(&invocation_id, StatusResult::failure(RpcException::user("echo", "function failed on purpose")), Vec::new());
            },
            "log" => {
                self.send(StreamingMessage::new(RpcLog {
                    invocation_id: Some(invocation_id.clone()),
                    category: "echo".to_owned(),
                    level: RpcLogLevel::Information,
                    message: "hello from echo worker".to_owned(),
                    log_category: RpcLogCategory::User,
                    exception: None,
                }));
                self.respond(&invocation_id, StatusResult::success(), Vec::new());
            },
            "crash" => {
                eprintln!("error: crashing on purpose");
                exit(1);
            },
            other => {
                let exception = RpcException::new(format!("unknown entry point {other:?}"));
                self.respond(&invocation_id, StatusResult::failure(exception), Vec::new());
            },
        }
    }

    fn read_inputs(&self, input_data: Vec<ParameterBinding>) -> Result<Vec<(String, TypedData)>, String> {
        input_data.into_iter()
            .map(|binding| {
                let value = match binding.data {
                    ParameterData::Data(value) => value,
                    ParameterData::SharedMemory(reference) => {
                        let shared_memory = self.shared_memory.lock().clone()
                            .ok_or_else(|| "shared memory is not available".to_owned())?;
                        let value = shared_memory.get_typed(&reference).map_err(|err| err.to_string())?;
                        // the host owns input maps
                        shared_memory.close(&reference.name);
                        value
                    }
                };
                Ok((binding.name, value))
            })
            .collect()
    }

    fn write_outputs(&self, outputs: Vec<(String, TypedData)>) -> Vec<ParameterBinding> {
        let shared_memory = self.shared_memory.lock().clone();
        outputs.into_iter()
            .map(|(name, value)| {
                let Some(shared_memory) = shared_memory.as_ref().filter(|v| v.is_supported(&value)) else {
                    return ParameterBinding::inline(name, value);
                };
                let reference = value.payload_bytes()
                    .and_then(|bytes| shared_memory.put(bytes).ok())
                    .and_then(|metadata| metadata.to_rpc(&value));
                match reference {
                    Some(reference) => ParameterBinding::shared_memory(name, reference),
                    None => ParameterBinding::inline(name, value),
                }
            })
            .collect()
    }

    fn respond(&self, invocation_id: &str, result: StatusResult, output_data: Vec<ParameterBinding>) {
        self.invocations.lock().remove(invocation_id);
        self.send(StreamingMessage::new(InvocationResponse {
            invocation_id: invocation_id.to_owned(),
            output_data,
            return_value: None,
            result,
        }));
    }

    fn cancel(&self, invocation_id: &str) {
        let Some(task) = self.invocations.lock().remove(invocation_id) else {
            return;
        };
        task.abort();
        debug!(invocation_id, "invocation cancelled");
        self.send(StreamingMessage::new(InvocationResponse {
            invocation_id: invocation_id.to_owned(),
            output_data: Vec::new(),
            return_value: None,
            result: StatusResult::cancelled(),
        }));
    }

    fn close_shared_memory(&self, request_id: String, request: CloseSharedMemoryResourcesRequest) {
        let shared_memory = self.shared_memory.lock().clone();
        let close_map_results = request.map_names.into_iter()
            .map(|name| {
                let freed = shared_memory.as_ref().is_some_and(|v| v.free(&name));
                (name, freed)
            })
            .collect();
        self.send(StreamingMessage::new(CloseSharedMemoryResourcesResponse { close_map_results }).with_request_id(request_id));
    }
}

fn shared_memory_from_env() -> anyhow::Result<SharedMemoryManager> {
    let directories: Vec<PathBuf> = env::var(ENV_SHARED_MEMORY_DIRECTORIES)
        .with_context(|| format!("{ENV_SHARED_MEMORY_DIRECTORIES} is not set"))?
        .split(',')
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .collect();

    let manager = SharedMemoryManager::for_worker(&SharedMemoryConfig {
        directories,
        ..SharedMemoryConfig::default()
    })?;
    Ok(manager)
}
