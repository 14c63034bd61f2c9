use {
    std::{collections::HashMap, fmt},
    serde::{Serialize, Deserialize},
    crate::{
        data::{ParameterBinding, TypedData},
        status::{RpcException, StatusResult},
    },
};

/// One frame on the host <-> worker stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StreamingMessage {
    pub request_id: String,
    pub content: Content,
}

impl StreamingMessage {
    pub fn new(content: impl Into<Content>) -> Self {
        Self {
            request_id: String::new(),
            content: content.into(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn case(&self) -> ContentCase {
        self.content.case()
    }
}

macro_rules! content {
    ($($variant:ident),+ $(,)?) => {
        /// Closed set of message kinds. Decoding a frame produces exactly one of these.
        #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
        pub enum Content {
            $($variant($variant),)+
        }

        /// Tag of a [`Content`] variant, used for routing and logging.
        #[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
        pub enum ContentCase {
            $($variant,)+
        }

        impl Content {
            pub fn case(&self) -> ContentCase {
                match self {
                    $(Self::$variant(_) => ContentCase::$variant,)+
                }
            }
        }

        impl ContentCase {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => stringify!($variant),)+
                }
            }
        }

        $(
            impl From<$variant> for Content {
                fn from(value: $variant) -> Self {
                    Self::$variant(value)
                }
            }
        )+
    };
}

content! {
    StartStream,
    WorkerInitRequest,
    WorkerInitResponse,
    FunctionLoadRequest,
    FunctionLoadResponse,
    InvocationRequest,
    InvocationResponse,
    InvocationCancel,
    WorkerStatusRequest,
    WorkerStatusResponse,
    WorkerHeartbeat,
    WorkerTerminate,
    RpcLog,
    CloseSharedMemoryResourcesRequest,
    CloseSharedMemoryResourcesResponse,
}

impl fmt::Display for ContentCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First message a worker sends on every stream it opens.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StartStream {
    pub worker_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerInitRequest {
    pub host_version: String,
    pub capabilities: HashMap<String, String>,
    pub worker_directory: String,
    pub function_app_directory: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerInitResponse {
    pub worker_version: String,
    pub capabilities: HashMap<String, String>,
    pub worker_metadata: Option<WorkerMetadata>,
    pub result: StatusResult,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerMetadata {
    pub runtime_name: String,
    pub runtime_version: String,
    pub worker_version: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
pub enum BindingDirection {
    In,
    Out,
    InOut,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcBindingInfo {
    pub name: String,
    pub binding_type: String,
    pub direction: BindingDirection,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcFunctionMetadata {
    pub name: String,
    pub directory: String,
    pub script_file: String,
    pub entry_point: String,
    pub language: String,
    pub bindings: Vec<RpcBindingInfo>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FunctionLoadRequest {
    pub function_id: String,
    pub metadata: RpcFunctionMetadata,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FunctionLoadResponse {
    pub function_id: String,
    pub result: StatusResult,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    pub invocation_id: String,
    pub function_id: String,
    pub input_data: Vec<ParameterBinding>,
    pub trigger_metadata: HashMap<String, TypedData>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InvocationResponse {
    pub invocation_id: String,
    pub output_data: Vec<ParameterBinding>,
    pub return_value: Option<TypedData>,
    pub result: StatusResult,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InvocationCancel {
    pub invocation_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct WorkerStatusRequest {}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct WorkerStatusResponse {}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct WorkerHeartbeat {}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerTerminate {
    pub grace_period_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
pub enum RpcLogLevel {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
    Critical,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
pub enum RpcLogCategory {
    User,
    System,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcLog {
    pub invocation_id: Option<String>,
    pub category: String,
    pub level: RpcLogLevel,
    pub message: String,
    pub log_category: RpcLogCategory,
    pub exception: Option<RpcException>,
}

/// Asks the worker to drop its references to maps it produced as outputs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CloseSharedMemoryResourcesRequest {
    pub map_names: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CloseSharedMemoryResourcesResponse {
    pub close_map_results: HashMap<String, bool>,
}
