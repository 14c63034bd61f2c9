use {
    std::{io, path::PathBuf, time::Duration},
    thiserror::Error,
    fx_rpc::{CodecError, RpcException},
    crate::worker::WorkerChannelState,
};

/// Error returned to the caller of a function invocation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvocationError {
    /// Dispatcher does not know a function with this name.
    #[error("function not found: {function}")]
    FunctionNotFound { function: String },

    /// No worker for the function language is ready. `permanent` is set when restart attempts
    /// were exhausted or the worker declared itself incompatible.
    #[error("no worker available for language {language}: {reason}")]
    NoWorkerAvailable { language: String, reason: String, permanent: bool },

    /// Worker died (or its stream broke) while the invocation was in flight.
    #[error("worker {worker_id} disconnected: {reason}")]
    WorkerDisconnected { worker_id: String, reason: String },

    /// Worker was drained and the invocation did not complete within the grace period.
    #[error("worker {worker_id} is shutting down")]
    WorkerShutdown { worker_id: String },

    #[error("invocation {invocation_id} timed out after {timeout:?}")]
    Timeout { invocation_id: String, timeout: Duration },

    #[error("invocation {invocation_id} was cancelled")]
    Cancelled { invocation_id: String },

    #[error("function {function} failed to load: {reason}")]
    FunctionLoad { function: String, reason: String },

    /// User code threw. The worker itself is fine.
    #[error("function failed: {}", exception.message)]
    UserCode { exception: RpcException },

    #[error("invocation {invocation_id} is already in flight")]
    DuplicateInvocationId { invocation_id: String },

    #[error("failed to read output {binding}: {reason}")]
    OutputData { binding: String, reason: String },

    /// Channel is not in the `Ready` state. The dispatcher retries on another worker.
    #[error("worker {worker_id} is not ready for invocations (state: {state:?})")]
    WorkerNotReady { worker_id: String, state: WorkerChannelState },
}

impl InvocationError {
    /// Infrastructure failure that may go away on retry, as opposed to a deterministic
    /// failure of the function itself.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::WorkerDisconnected { .. }
            | Self::WorkerShutdown { .. }
            | Self::Timeout { .. }
            | Self::WorkerNotReady { .. } => true,
            Self::NoWorkerAvailable { permanent, .. } => !permanent,
            Self::FunctionNotFound { .. }
            | Self::Cancelled { .. }
            | Self::FunctionLoad { .. }
            | Self::UserCode { .. }
            | Self::DuplicateInvocationId { .. }
            | Self::OutputData { .. } => false,
        }
    }
}

/// Failure to bring a worker channel to the `Ready` state.
#[derive(Error, Debug)]
pub enum WorkerChannelError {
    #[error("channel error: {0}")]
    Channels(#[from] ChannelError),

    #[error("failed to launch worker process: {0}")]
    Launch(#[from] WorkerProcessError),

    #[error("worker did not open a stream within {timeout:?}")]
    StartupTimeout { timeout: Duration },

    #[error("worker did not answer init request within {timeout:?}")]
    InitTimeout { timeout: Duration },

    #[error("worker failed to initialize: {reason}")]
    InitFailed { reason: String },

    #[error("worker does not support required capabilities: {missing:?}")]
    IncompatibleCapabilities { missing: Vec<String> },

    #[error("worker disconnected during startup: {reason}")]
    Disconnected { reason: String },

    #[error("worker channel can not start from state {state:?}")]
    InvalidState { state: WorkerChannelState },
}

impl WorkerChannelError {
    /// Worker answered, but with something the host can not work with. Retrying the same
    /// worker binary will not help.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(self, Self::InitFailed { .. } | Self::IncompatibleCapabilities { .. })
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ChannelError {
    #[error("channels for worker {worker_id} already exist")]
    DuplicateWorkerId { worker_id: String },

    #[error("channel for worker {worker_id} is completed")]
    Completed { worker_id: String },

    #[error("inbound reader for worker {worker_id} was already taken")]
    InboundReaderTaken { worker_id: String },
}

#[derive(Error, Debug)]
pub enum WorkerProcessError {
    #[error("failed to spawn {executable:?}: {source}")]
    Spawn { executable: PathBuf, source: io::Error },

    #[error("worker process has no {stream} pipe")]
    MissingPipe { stream: &'static str },

    #[error("worker process was already started")]
    AlreadyStarted,
}

#[derive(Error, Debug)]
pub enum SharedMemoryError {
    #[error("no shared memory directory has {required} bytes of free space")]
    NoSpace { required: u64 },

    #[error("invalid shared memory size: {size}")]
    InvalidSize { size: u64 },

    #[error("invalid shared memory map name: {name:?}")]
    InvalidName { name: String },

    #[error("shared memory map {name} already exists")]
    AlreadyExists { name: String },

    #[error("shared memory map {name} not found")]
    NotFound { name: String },

    #[error("range {offset}..{offset}+{count} is outside of map {name} with content length {length}")]
    OutOfBounds { name: String, offset: u64, count: u64, length: u64 },

    #[error("shared memory map {name} has invalid header")]
    InvalidHeader { name: String },

    #[error("shared memory map {name} is not readable yet")]
    NotReadable { name: String },

    #[error("shared memory i/o error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse config file {path:?}: {source}")]
    Parse { path: PathBuf, source: serde_yml::Error },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

#[derive(Error, Debug)]
pub enum FunctionMetadataError {
    #[error("failed to read functions directory {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse function metadata {path:?}: {source}")]
    Parse { path: PathBuf, source: serde_yml::Error },

    #[error("function {name} is defined more than once")]
    Duplicate { name: String },
}

#[derive(Error, Debug)]
pub enum HostError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to load functions: {0}")]
    Functions(#[from] FunctionMetadataError),

    #[error("failed to bind rpc listener on {address}: {source}")]
    Bind { address: String, source: io::Error },

    #[error("failed to create metrics: {0}")]
    Metrics(#[from] crate::metrics::MetricsError),

    #[error("failed to watch functions directory: {0}")]
    Watch(#[from] notify::Error),
}

/// Failure of a single stream between host and worker.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("stream did not start with StartStream, got {case}")]
    UnexpectedFirstMessage { case: String },

    #[error("no channels registered for worker {worker_id}")]
    UnknownWorker { worker_id: String },
}
