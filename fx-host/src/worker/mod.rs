pub use self::channel::{HOST_VERSION, RpcWorkerChannel, WorkerChannelContext, WorkerStatus};

mod channel;
mod pending;
#[cfg(test)]
pub(crate) mod testing;

/// Lifecycle of a worker channel.
///
/// `Created -> Initializing -> Ready -> Draining -> Terminated`, with `Faulted` reachable from
/// `Created`, `Initializing` and `Ready`. `Faulted` and `Terminated` are final.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum WorkerChannelState {
    Created,
    Initializing,
    Ready,
    Draining,
    Terminated,
    Faulted,
}

impl WorkerChannelState {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Terminated | Self::Faulted)
    }
}
