pub use crate::{
    dispatcher::FunctionInvocationDispatcher,
    error::{HostError, InvocationError},
    host::FxHost,
    invocation::{InvocationResult, ScriptInvocationContext},
};

pub mod channels;
pub mod config;
pub mod data_cache;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod functions;
pub mod host;
pub mod invocation;
pub mod logs;
pub mod metrics;
pub mod process;
pub mod rpc_server;
pub mod shared_memory;
pub mod worker;
