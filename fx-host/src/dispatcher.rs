use {
    std::{
        collections::{HashMap, VecDeque},
        sync::{Arc, atomic::{AtomicUsize, Ordering}},
        time::Duration,
    },
    tracing::{debug, info, warn},
    tokio::{
        sync::Notify,
        time::{Instant, sleep, sleep_until},
    },
    tokio_util::sync::CancellationToken,
    parking_lot::Mutex,
    futures::future::join_all,
    crate::{
        config::{HostConfig, RestartConfig, WorkerConfig},
        error::InvocationError,
        events::{EventSubscription, SOURCE_DISPATCHER, ScriptEvent, ScriptEventKind},
        functions::FunctionMetadata,
        invocation::{InvocationResult, ScriptInvocationContext},
        worker::{RpcWorkerChannel, WorkerChannelContext, WorkerStatus},
    },
};

/// Routes invocations to worker channels grouped by language and keeps those pools alive:
/// faulted workers are replaced until a language exceeds its restart budget.
#[derive(Clone)]
pub struct FunctionInvocationDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    context: Arc<WorkerChannelContext>,
    functions: HashMap<String, FunctionMetadata>,
    languages: HashMap<String, Arc<LanguageWorkers>>,
    restart: RestartConfig,
    worker_wait_timeout: Duration,
    stopped: CancellationToken,
    /// Cancelled once every channel finished draining after `stopped`.
    drained: CancellationToken,
}

struct LanguageWorkers {
    language: String,
    config: Option<Arc<WorkerConfig>>,
    functions: Vec<FunctionMetadata>,
    state: Mutex<LanguageState>,
    /// Notified when a channel becomes ready or the language becomes unavailable.
    changed: Notify,
    next: AtomicUsize,
}

#[derive(Default)]
struct LanguageState {
    channels: Vec<RpcWorkerChannel>,
    /// Fault times within the error window.
    errors: VecDeque<Instant>,
    restarts_scheduled: usize,
    unavailable: Option<String>,
}

enum Pick {
    Channel(RpcWorkerChannel),
    Wait,
    Unavailable { reason: String, permanent: bool },
}

impl FunctionInvocationDispatcher {
    pub fn new(context: Arc<WorkerChannelContext>, functions: Vec<FunctionMetadata>, config: &HostConfig) -> Self {
        let mut by_language: HashMap<String, Vec<FunctionMetadata>> = HashMap::new();
        for function in &functions {
            by_language.entry(function.language.clone()).or_default().push(function.clone());
        }

        let languages = by_language.into_iter()
            .map(|(language, functions)| {
                let workers = LanguageWorkers {
                    config: config.workers.get(&language).cloned().map(Arc::new),
                    language: language.clone(),
                    functions,
                    state: Mutex::new(LanguageState::default()),
                    changed: Notify::new(),
                    next: AtomicUsize::new(0),
                };
                (language, Arc::new(workers))
            })
            .collect();

        Self {
            inner: Arc::new(DispatcherInner {
                context,
                functions: functions.into_iter().map(|v| (v.name.clone(), v)).collect(),
                languages,
                restart: config.restart.clone(),
                worker_wait_timeout: config.invocation.worker_wait_timeout(),
                stopped: CancellationToken::new(),
                drained: CancellationToken::new(),
            }),
        }
    }

    /// Starts the configured number of workers for every language that has functions.
    /// Returns without waiting for them to become ready.
    pub fn initialize(&self) {
        let inner = &self.inner;
        tokio::spawn(inner.clone().handle_events(inner.context.events.subscribe()));

        for workers in inner.languages.values() {
            match &workers.config {
                Some(config) => {
                    info!(language = workers.language, process_count = config.process_count, "starting workers");
                    inner.start_language(workers.clone());
                },
                None => inner.mark_unavailable(workers, format!("no worker is configured for language {}", workers.language)),
            }
        }
    }

    pub fn functions(&self) -> impl Iterator<Item = &FunctionMetadata> {
        self.inner.functions.values()
    }

    pub async fn invoke(&self, invocation: ScriptInvocationContext) -> Result<InvocationResult, InvocationError> {
        let inner = &self.inner;
        let function = inner.functions.get(&invocation.function_name)
            .ok_or_else(|| InvocationError::FunctionNotFound { function: invocation.function_name.clone() })?;
        let Some(workers) = inner.languages.get(&function.language) else {
            return Err(InvocationError::NoWorkerAvailable {
                language: function.language.clone(),
                reason: "language has no workers".to_owned(),
                permanent: true,
            });
        };

        let deadline = Instant::now() + inner.worker_wait_timeout;
        loop {
            let changed = workers.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            match workers.pick() {
                Pick::Channel(channel) => match channel.invoke(invocation.clone()).await {
                    Err(InvocationError::WorkerNotReady { worker_id, state }) => {
                        debug!(worker_id, ?state, "worker left ready state, picking another one");
                        continue;
                    },
                    other => return other,
                },
                Pick::Unavailable { reason, permanent } => {
                    return Err(InvocationError::NoWorkerAvailable { language: workers.language.clone(), reason, permanent });
                },
                Pick::Wait => {},
            }

            tokio::select! {
                _ = &mut changed => {},
                _ = invocation.cancellation.cancelled() => {
                    return Err(InvocationError::Cancelled { invocation_id: invocation.invocation_id.clone() });
                },
                _ = sleep_until(deadline) => {
                    return Err(InvocationError::NoWorkerAvailable {
                        language: workers.language.clone(),
                        reason: format!("no worker became ready within {:?}", inner.worker_wait_timeout),
                        permanent: false,
                    });
                },
            }
        }
    }

    /// Replaces the worker running the invocation. The old worker is drained, so the
    /// invocation itself may still complete. Returns false if no worker runs it.
    pub fn restart_worker_with_invocation_id(&self, invocation_id: &str) -> bool {
        let inner = &self.inner;
        for workers in inner.languages.values() {
            let channel = {
                let mut state = workers.state.lock();
                let position = state.channels.iter().position(|v| v.has_invocation(invocation_id));
                position.map(|position| state.channels.remove(position))
            };
            let Some(channel) = channel else {
                continue;
            };

            info!(worker_id = channel.worker_id(), invocation_id, "restarting worker running invocation");
            inner.start_channel(workers);
            inner.drain(workers, vec![channel]);
            return true;
        }
        false
    }

    /// Drains every worker and starts fresh ones.
    pub fn restart_all(&self) {
        self.inner.restart_all();
    }

    pub fn worker_status(&self) -> HashMap<String, Vec<WorkerStatus>> {
        self.inner.languages.iter()
            .map(|(language, workers)| {
                let statuses = workers.state.lock().channels.iter().map(|v| v.status()).collect();
                (language.clone(), statuses)
            })
            .collect()
    }

    /// Drains all workers and stops restarting them. Invocations fail with
    /// `NoWorkerAvailable` afterwards. Resolves once draining is done, also when it was
    /// started by a `HostShutdown` event.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await
    }
}

impl DispatcherInner {
    async fn handle_events(self: Arc<Self>, events: EventSubscription) {
        loop {
            let event = tokio::select! {
                _ = self.stopped.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };

            match event.kind {
                ScriptEventKind::WorkerError { language, worker_id, reason, recoverable } => {
                    self.handle_worker_error(&language, &worker_id, reason, recoverable);
                },
                ScriptEventKind::HostRestart => {
                    info!("host restart requested");
                    self.restart_all();
                },
                ScriptEventKind::FileChanged { path } => {
                    info!(?path, "function files changed, restarting workers");
                    self.restart_all();
                },
                ScriptEventKind::HostShutdown => {
                    self.shutdown().await;
                    return;
                },
                _ => {},
            }
        }
    }

    fn handle_worker_error(self: &Arc<Self>, language: &str, worker_id: &str, reason: String, recoverable: bool) {
        let Some(workers) = self.languages.get(language) else {
            return;
        };
        let Some(config) = &workers.config else {
            return;
        };

        let attempt = {
            let mut state = workers.state.lock();
            let before = state.channels.len();
            state.channels.retain(|v| v.worker_id() != worker_id);
            if state.channels.len() == before || state.unavailable.is_some() || self.stopped.is_cancelled() {
                return;
            }

            let now = Instant::now();
            let window = self.restart.error_window();
            while state.errors.front().is_some_and(|v| now.duration_since(*v) > window) {
                state.errors.pop_front();
            }
            state.errors.push_back(now);

            let max_restarts = self.restart.max_restarts_for(config.process_count);
            if !recoverable || state.errors.len() > max_restarts {
                None
            } else {
                state.restarts_scheduled += 1;
                Some(state.errors.len())
            }
        };

        let Some(attempt) = attempt else {
            let reason = if recoverable {
                format!("worker restart limit exceeded, last error: {reason}")
            } else {
                reason
            };
            self.mark_unavailable(workers, reason);
            return;
        };

        let backoff = self.restart.backoff(attempt);
        warn!(language, worker_id, attempt, "restarting worker in {backoff:?}: {reason}");
        self.context.metrics.worker_restarts_total.with_label_values(&[language]).inc();
        self.context.events.publish(ScriptEvent::new(SOURCE_DISPATCHER, ScriptEventKind::WorkerRestart {
            language: language.to_owned(),
            worker_id: worker_id.to_owned(),
            attempt,
        }));

        let inner = self.clone();
        let workers = workers.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.stopped.cancelled() => {},
                _ = sleep(backoff) => {},
            }
            inner.start_channel(&workers);
            workers.state.lock().restarts_scheduled -= 1;
            workers.changed.notify_waiters();
        });
    }

    fn mark_unavailable(&self, workers: &Arc<LanguageWorkers>, reason: String) {
        let channels = {
            let mut state = workers.state.lock();
            if state.unavailable.is_some() {
                return;
            }
            state.unavailable = Some(reason.clone());
            std::mem::take(&mut state.channels)
        };

        warn!(language = workers.language, "language is unavailable: {reason}");
        self.context.events.publish(ScriptEvent::new(SOURCE_DISPATCHER, ScriptEventKind::WorkerUnavailable {
            language: workers.language.clone(),
            reason,
        }));
        workers.changed.notify_waiters();
        self.drain(workers, channels);
    }

    fn start_language(self: &Arc<Self>, workers: Arc<LanguageWorkers>) {
        let Some(config) = workers.config.clone() else {
            return;
        };

        let inner = self.clone();
        tokio::spawn(async move {
            for index in 0..config.process_count {
                if index > 0 {
                    tokio::select! {
                        _ = inner.stopped.cancelled() => return,
                        _ = sleep(config.process_startup_interval()) => {},
                    }
                }
                inner.start_channel(&workers);
            }
        });
    }

    fn start_channel(&self, workers: &Arc<LanguageWorkers>) {
        let Some(config) = workers.config.clone() else {
            return;
        };
        if self.stopped.is_cancelled() {
            return;
        }

        let channel = RpcWorkerChannel::new(self.context.clone(), &workers.language, config, workers.functions.clone());
        {
            let mut state = workers.state.lock();
            if state.unavailable.is_some() {
                return;
            }
            state.channels.push(channel.clone());
        }

        let workers = workers.clone();
        tokio::spawn(async move {
            match channel.start().await {
                Ok(()) => workers.changed.notify_waiters(),
                Err(err) => debug!(worker_id = channel.worker_id(), "worker failed to start: {err}"),
            }
        });
    }

    /// Shuts the channels down in the background.
    fn drain(&self, workers: &Arc<LanguageWorkers>, channels: Vec<RpcWorkerChannel>) {
        let Some(grace) = workers.config.as_ref().map(|v| v.drain_grace()) else {
            return;
        };
        for channel in channels {
            tokio::spawn(async move { channel.shutdown(grace).await });
        }
    }

    fn restart_all(self: &Arc<Self>) {
        for workers in self.languages.values() {
            let channels = {
                let mut state = workers.state.lock();
                if state.unavailable.is_some() {
                    continue;
                }
                std::mem::take(&mut state.channels)
            };
            self.start_language(workers.clone());
            self.drain(workers, channels);
        }
    }

    async fn shutdown(&self) {
        if self.stopped.is_cancelled() {
            self.drained.cancelled().await;
            return;
        }
        self.stopped.cancel();
        info!("shutting down workers");

        let mut shutdowns = Vec::new();
        for workers in self.languages.values() {
            let channels = {
                let mut state = workers.state.lock();
                state.unavailable.get_or_insert_with(|| "host is shutting down".to_owned());
                std::mem::take(&mut state.channels)
            };
            workers.changed.notify_waiters();

            let grace = workers.config.as_ref().map(|v| v.drain_grace()).unwrap_or_default();
            shutdowns.extend(channels.into_iter().map(move |channel| async move { channel.shutdown(grace).await }));
        }
        join_all(shutdowns).await;
        self.drained.cancel();
        debug!("all workers drained");
    }
}

impl LanguageWorkers {
    fn pick(&self) -> Pick {
        let state = self.state.lock();
        if let Some(reason) = &state.unavailable {
            return Pick::Unavailable { reason: reason.clone(), permanent: true };
        }

        let ready: Vec<_> = state.channels.iter().filter(|v| v.is_ready()).collect();
        if !ready.is_empty() {
            let index = self.next.fetch_add(1, Ordering::Relaxed) % ready.len();
            return Pick::Channel(ready[index].clone());
        }

        if state.channels.is_empty() && state.restarts_scheduled == 0 {
            return Pick::Unavailable { reason: "no worker is running".to_owned(), permanent: false };
        }
        Pick::Wait
    }
}

#[cfg(test)]
mod tests {
    use {
        fx_rpc::TypedData,
        crate::{
            worker::{
                WorkerChannelState,
                testing::{FakeLauncher, FakeWorkerMode, fake_context, fake_functions},
            },
        },
        super::*,
    };

    fn host_config(configure: impl FnOnce(&mut WorkerConfig)) -> HostConfig {
        let mut worker = WorkerConfig::new("fake-worker");
        worker.init_timeout_ms = 1_000;
        worker.drain_grace_ms = 1_000;
        configure(&mut worker);

        let mut config = HostConfig::new(".");
        config.workers.insert("fake".to_owned(), worker);
        config
    }

    fn dispatcher(launcher: &Arc<FakeLauncher>, config: &HostConfig) -> FunctionInvocationDispatcher {
        let context = fake_context(launcher.clone(), None, None);
        FunctionInvocationDispatcher::new(context, fake_functions(), config)
    }

    async fn wait_for_launches(launcher: &FakeLauncher, launches: usize) {
        while launcher.launches() < launches {
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn invocations_are_spread_over_ready_workers() {
        let launcher = FakeLauncher::new(FakeWorkerMode::Normal);
        let dispatcher = dispatcher(&launcher, &host_config(|worker| worker.process_count = 2));
        dispatcher.initialize();

        for _ in 0..4 {
            let result = dispatcher.invoke(ScriptInvocationContext::new("echo")).await.unwrap();
            assert_eq!(result.output("result"), Some(&TypedData::from("ok")));
        }
        assert_eq!(launcher.received().len(), 4);
        assert_eq!(launcher.launches(), 2);

        let statuses = dispatcher.worker_status();
        assert_eq!(statuses["fake"].len(), 2);
    }

    #[tokio::test]
    async fn unknown_function_is_not_found() {
        let launcher = FakeLauncher::new(FakeWorkerMode::Normal);
        let dispatcher = dispatcher(&launcher, &host_config(|_| {}));
        dispatcher.initialize();

        let err = dispatcher.invoke(ScriptInvocationContext::new("missing")).await.unwrap_err();
        assert_eq!(err, InvocationError::FunctionNotFound { function: "missing".to_owned() });
    }

    #[tokio::test]
    async fn language_without_worker_config_is_unavailable() {
        let launcher = FakeLauncher::new(FakeWorkerMode::Normal);
        let dispatcher = dispatcher(&launcher, &HostConfig::new("."));
        dispatcher.initialize();

        let err = dispatcher.invoke(ScriptInvocationContext::new("echo")).await.unwrap_err();
        assert!(matches!(err, InvocationError::NoWorkerAvailable { permanent: true, .. }), "{err:?}");
        assert_eq!(launcher.launches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_stop_once_budget_is_exhausted() {
        let launcher = FakeLauncher::new(FakeWorkerMode::NeverInit);
        let mut config = host_config(|_| {});
        config.restart.max_restarts = Some(1);
        let dispatcher = dispatcher(&launcher, &config);
        let events = dispatcher.inner.context.events.subscribe_filtered(|event| matches!(
            event.kind,
            ScriptEventKind::WorkerRestart { .. } | ScriptEventKind::WorkerUnavailable { .. }
        ));
        dispatcher.initialize();

        let restart = events.recv().await.unwrap();
        assert!(matches!(restart.kind, ScriptEventKind::WorkerRestart { attempt: 1, .. }), "{restart:?}");
        let unavailable = events.recv().await.unwrap();
        assert!(matches!(unavailable.kind, ScriptEventKind::WorkerUnavailable { .. }), "{unavailable:?}");

        let err = dispatcher.invoke(ScriptInvocationContext::new("echo")).await.unwrap_err();
        assert!(matches!(err, InvocationError::NoWorkerAvailable { permanent: true, .. }), "{err:?}");
        assert!(!err.is_transient());
        assert_eq!(launcher.launches(), 2);

        sleep(Duration::from_secs(120)).await;
        assert!(events.try_recv().is_none());
        assert_eq!(launcher.launches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_worker_is_replaced() {
        let launcher = FakeLauncher::new(FakeWorkerMode::Normal);
        let dispatcher = dispatcher(&launcher, &host_config(|_| {}));
        dispatcher.initialize();

        let err = dispatcher.invoke(ScriptInvocationContext::new("crash")).await.unwrap_err();
        assert!(matches!(err, InvocationError::WorkerDisconnected { .. }), "{err:?}");

        let result = dispatcher.invoke(ScriptInvocationContext::new("echo")).await.unwrap();
        assert_eq!(result.output("result"), Some(&TypedData::from("ok")));
        assert_eq!(launcher.launches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_running_invocation_can_be_restarted() {
        let launcher = FakeLauncher::new(FakeWorkerMode::Normal);
        let dispatcher = dispatcher(&launcher, &host_config(|_| {}));
        dispatcher.initialize();
        dispatcher.invoke(ScriptInvocationContext::new("echo")).await.unwrap();

        let stuck = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher.invoke(ScriptInvocationContext::new("silent").with_invocation_id("stuck")).await
            })
        };
        while !launcher.received().iter().any(|v| v.invocation_id == "stuck") {
            sleep(Duration::from_millis(10)).await;
        }

        assert!(!dispatcher.restart_worker_with_invocation_id("unknown"));
        assert!(dispatcher.restart_worker_with_invocation_id("stuck"));
        wait_for_launches(&launcher, 2).await;

        let err = stuck.await.unwrap().unwrap_err();
        assert!(matches!(err, InvocationError::WorkerShutdown { .. }), "{err:?}");
        dispatcher.invoke(ScriptInvocationContext::new("echo")).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn host_restart_event_replaces_all_workers() {
        let launcher = FakeLauncher::new(FakeWorkerMode::Normal);
        let dispatcher = dispatcher(&launcher, &host_config(|_| {}));
        dispatcher.initialize();
        dispatcher.invoke(ScriptInvocationContext::new("echo")).await.unwrap();

        dispatcher.inner.context.events.publish(ScriptEvent::new("test", ScriptEventKind::HostRestart));
        wait_for_launches(&launcher, 2).await;

        dispatcher.invoke(ScriptInvocationContext::new("echo")).await.unwrap();
        let statuses = dispatcher.worker_status();
        assert_eq!(statuses["fake"].len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_workers() {
        let launcher = FakeLauncher::new(FakeWorkerMode::Normal);
        let dispatcher = dispatcher(&launcher, &host_config(|_| {}));
        dispatcher.initialize();
        dispatcher.invoke(ScriptInvocationContext::new("echo")).await.unwrap();
        let channels: Vec<_> = dispatcher.inner.languages["fake"].state.lock().channels.clone();

        dispatcher.shutdown().await;
        assert!(channels.iter().all(|v| v.state() == WorkerChannelState::Terminated));
        assert!(launcher.terminated());

        let err = dispatcher.invoke(ScriptInvocationContext::new("echo")).await.unwrap_err();
        assert!(matches!(err, InvocationError::NoWorkerAvailable { .. }), "{err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_drain_started_by_host_shutdown_event() {
        let launcher = FakeLauncher::new(FakeWorkerMode::Normal);
        let dispatcher = dispatcher(&launcher, &host_config(|worker| worker.drain_grace_ms = 5_000));
        dispatcher.initialize();
        dispatcher.invoke(ScriptInvocationContext::new("echo")).await.unwrap();
        let channels: Vec<_> = dispatcher.inner.languages["fake"].state.lock().channels.clone();

        let stuck = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher.invoke(ScriptInvocationContext::new("silent").with_invocation_id("stuck")).await
            })
        };
        while !launcher.received().iter().any(|v| v.invocation_id == "stuck") {
            sleep(Duration::from_millis(10)).await;
        }

        let started_at = Instant::now();
        dispatcher.inner.context.events.publish(ScriptEvent::new("test", ScriptEventKind::HostShutdown));
        while !dispatcher.inner.stopped.is_cancelled() {
            sleep(Duration::from_millis(10)).await;
        }

        dispatcher.shutdown().await;
        assert!(started_at.elapsed() >= Duration::from_secs(5));
        assert!(channels.iter().all(|v| v.state() == WorkerChannelState::Terminated));

        let err = stuck.await.unwrap().unwrap_err();
        assert!(matches!(err, InvocationError::WorkerShutdown { .. }), "{err:?}");
    }
}
