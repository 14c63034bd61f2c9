//! Capability names exchanged during worker initialization.
//!
//! The host advertises what it offers in `WorkerInitRequest::capabilities`, the worker
//! replies with what it supports in `WorkerInitResponse::capabilities`. Values are strings,
//! usually `"true"`.

pub const SHARED_MEMORY_DATA_TRANSFER: &str = "SharedMemoryDataTransfer";
pub const FUNCTION_DATA_CACHE: &str = "FunctionDataCache";
pub const MULTI_STREAM: &str = "MultiStream";
pub const HANDLES_INVOCATION_CANCEL_MESSAGE: &str = "HandlesInvocationCancelMessage";
pub const HANDLES_WORKER_TERMINATE_MESSAGE: &str = "HandlesWorkerTerminateMessage";
pub const WORKER_STATUS: &str = "WorkerStatus";
pub const RPC_HTTP_BODY_ONLY: &str = "RpcHttpBodyOnly";

pub const ENABLED: &str = "true";

/// Returns true if capability value means "enabled".
pub fn is_enabled(value: &str) -> bool {
    value.eq_ignore_ascii_case(ENABLED) || value == "1"
}
