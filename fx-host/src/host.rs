use {
    std::{net::SocketAddr, path::{Path, PathBuf}, sync::Arc, time::Duration},
    tracing::{debug, error, info, warn},
    tokio::time::timeout,
    tokio_util::sync::CancellationToken,
    notify::Watcher,
    crate::{
        channels::WorkerChannels,
        config::HostConfig,
        data_cache::{FunctionDataCache, NullFunctionDataCache, SharedFunctionDataCache},
        dispatcher::FunctionInvocationDispatcher,
        error::{HostError, InvocationError},
        events::{SOURCE_FILE_WATCHER, SOURCE_HOST, ScriptEvent, ScriptEventKind, ScriptEventManager},
        functions::load_functions,
        invocation::{InvocationResult, ScriptInvocationContext},
        logs::create_logger,
        metrics::{Metrics, run_metrics_server},
        process::{PlatformProcessRegistry, ProcessWorkerLauncher},
        rpc_server::RpcServer,
        shared_memory::SharedMemoryManager,
        worker::WorkerChannelContext,
    },
};

/// Quiet period after the last file system event before workers are restarted.
const FILE_CHANGE_DEBOUNCE: Duration = Duration::from_millis(500);

/// Running host: rpc listener, worker pools and the background tasks around them.
pub struct FxHost {
    dispatcher: FunctionInvocationDispatcher,
    events: Arc<ScriptEventManager>,
    metrics: Metrics,
    registry: Arc<PlatformProcessRegistry>,
    rpc_address: SocketAddr,
    cancel: CancellationToken,
    _watcher: Option<Box<dyn Watcher + Send>>,
}

impl FxHost {
    pub async fn start(config: HostConfig) -> Result<Self, HostError> {
        config.validate()?;
        let functions = load_functions(config.functions_dir()).await?;
        info!(functions = functions.len(), "loaded functions from {:?}", config.functions_dir());

        let cancel = CancellationToken::new();
        let events = Arc::new(ScriptEventManager::new());
        let channels = Arc::new(WorkerChannels::new());
        let metrics = Metrics::new()?;

        let shared_memory = if config.shared_memory.enabled {
            match SharedMemoryManager::new(&config.shared_memory) {
                Ok(v) => {
                    info!("shared memory transfer enabled in {:?}", v.directories());
                    Some(Arc::new(v))
                },
                Err(err) => {
                    warn!("shared memory transfer disabled: {err}");
                    None
                }
            }
        } else {
            None
        };

        let data_cache: Arc<dyn FunctionDataCache> = match (&shared_memory, config.function_data_cache.enabled) {
            (Some(shared_memory), true) => Arc::new(SharedFunctionDataCache::new(
                config.function_data_cache.maximum_size_bytes,
                shared_memory.clone(),
            )),
            (None, true) => {
                warn!("function data cache requires shared memory transfer, disabling it");
                Arc::new(NullFunctionDataCache)
            },
            (_, false) => Arc::new(NullFunctionDataCache),
        };

        let address = format!("{}:{}", config.rpc.host, config.rpc.port);
        let rpc_server = RpcServer::bind(&address, channels.clone()).await
            .map_err(|source| HostError::Bind { address: address.clone(), source })?;
        let rpc_address = rpc_server.local_addr()
            .map_err(|source| HostError::Bind { address, source })?;
        tokio::spawn(rpc_server.run(cancel.clone()));

        let registry = Arc::new(PlatformProcessRegistry::new());
        let context = Arc::new(WorkerChannelContext {
            channels,
            launcher: Arc::new(ProcessWorkerLauncher::new(registry.clone())),
            shared_memory,
            data_cache,
            events: events.clone(),
            logger: Arc::new(create_logger(config.logger.as_ref())),
            metrics: metrics.clone(),
            rpc_host: rpc_address.ip().to_string(),
            rpc_port: rpc_address.port(),
            functions_dir: config.functions_dir().to_owned(),
            invocation_timeout: config.invocation.timeout(),
        });

        let dispatcher = FunctionInvocationDispatcher::new(context, functions, &config);
        dispatcher.initialize();

        if let Some(port) = config.metrics_port {
            tokio::spawn(run_metrics_server(metrics.clone(), port, cancel.clone()));
        }

        Ok(Self {
            dispatcher,
            events,
            metrics,
            registry,
            rpc_address,
            cancel,
            _watcher: None,
        })
    }

    /// Restarts workers whenever something in the functions directory changes.
    pub fn watch_functions(&mut self, functions_dir: &Path) -> Result<(), HostError> {
        let (tx, rx) = flume::unbounded::<PathBuf>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(v) => v,
                Err(err) => {
                    error!("file watcher error: {err:?}");
                    return;
                }
            };

            match event.kind {
                notify::EventKind::Access(_) => {},
                _other => {
                    for changed_path in event.paths {
                        let _ = tx.send(changed_path);
                    }
                }
            }
        })?;
        watcher.watch(functions_dir, notify::RecursiveMode::Recursive)?;
        info!("watching {functions_dir:?} for changes");

        tokio::spawn(publish_file_changes(rx, self.events.clone(), self.cancel.clone()));
        self._watcher = Some(Box::new(watcher));
        Ok(())
    }

    pub fn dispatcher(&self) -> &FunctionInvocationDispatcher {
        &self.dispatcher
    }

    pub fn events(&self) -> &Arc<ScriptEventManager> {
        &self.events
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn rpc_address(&self) -> SocketAddr {
        self.rpc_address
    }

    pub async fn invoke(&self, invocation: ScriptInvocationContext) -> Result<InvocationResult, InvocationError> {
        self.dispatcher.invoke(invocation).await
    }

    /// Resolves once the host was asked to shut down through a `HostShutdown` event.
    pub async fn shutdown_requested(&self) {
        let shutdown = self.events.subscribe_filtered(|event| matches!(event.kind, ScriptEventKind::HostShutdown));
        tokio::select! {
            _ = shutdown.recv() => {},
            _ = self.cancel.cancelled() => {},
        }
    }

    pub fn request_shutdown(&self) {
        self.events.publish(ScriptEvent::new(SOURCE_HOST, ScriptEventKind::HostShutdown));
    }

    pub async fn shutdown(self) {
        info!("shutting down host");
        self.dispatcher.shutdown().await;
        self.cancel.cancel();
        self.events.dispose();

        let registry = self.registry.clone();
        let leftovers = timeout(Duration::from_secs(1), async move {
            while !registry.registered().is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }).await;
        if leftovers.is_err() {
            debug!("killing worker processes that did not exit");
            self.registry.terminate_all();
        }
    }
}

async fn publish_file_changes(rx: flume::Receiver<PathBuf>, events: Arc<ScriptEventManager>, cancel: CancellationToken) {
    loop {
        let path = tokio::select! {
            _ = cancel.cancelled() => return,
            path = rx.recv_async() => match path {
                Ok(v) => v,
                Err(_) => return,
            },
        };

        // editors produce bursts of events for a single save
        while let Ok(Ok(_)) = timeout(FILE_CHANGE_DEBOUNCE, rx.recv_async()).await {}

        debug!(?path, "functions directory changed");
        events.publish(ScriptEvent::new(SOURCE_FILE_WATCHER, ScriptEventKind::FileChanged { path }));
    }
}
