pub use self::{
    factory::{WorkerProcessContext, create_worker_process},
    launcher::{LaunchedWorker, ProcessWorkerLauncher, WorkerExit, WorkerHandle, WorkerLauncher},
    registry::{NoopProcessRegistry, PlatformProcessRegistry, ProcessRegistry},
};

mod factory;
mod launcher;
mod registry;
