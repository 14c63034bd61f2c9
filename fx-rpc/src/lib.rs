//! Wire protocol spoken between the fx host and out-of-process language workers.
//!
//! Every frame on the stream is a [`StreamingMessage`]: a request id plus one [`Content`]
//! variant. Frames are length-prefixed and MessagePack-encoded, see [`codec`].

pub use self::{
    codec::{CodecError, MAX_FRAME_SIZE, decode_message, encode_message, read_message, write_message},
    data::{DataError, ParameterBinding, ParameterData, RpcDataType, RpcSharedMemory, TypedData},
    messages::{
        BindingDirection,
        CloseSharedMemoryResourcesRequest,
        CloseSharedMemoryResourcesResponse,
        Content,
        ContentCase,
        FunctionLoadRequest,
        FunctionLoadResponse,
        InvocationCancel,
        InvocationRequest,
        InvocationResponse,
        RpcBindingInfo,
        RpcFunctionMetadata,
        RpcLog,
        RpcLogCategory,
        RpcLogLevel,
        StartStream,
        StreamingMessage,
        WorkerHeartbeat,
        WorkerInitRequest,
        WorkerInitResponse,
        WorkerMetadata,
        WorkerStatusRequest,
        WorkerStatusResponse,
        WorkerTerminate,
    },
    status::{RpcException, Status, StatusResult},
};

pub mod capabilities;
pub mod codec;
mod data;
mod messages;
mod status;
