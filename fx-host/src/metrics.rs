use {
    std::{convert::Infallible, net::SocketAddr, pin::Pin},
    tracing::{error, info},
    tokio::net::TcpListener,
    tokio_util::sync::CancellationToken,
    hyper::{Request, body::{Incoming, Bytes}, Response, server::conn::http1, http::StatusCode},
    hyper_util::rt::{TokioIo, TokioTimer},
    http_body_util::Full,
    thiserror::Error,
    prometheus::{
        TextEncoder,
        Registry,
        IntGauge,
        IntCounter,
        IntCounterVec,
        register_int_gauge_with_registry,
        register_int_counter_with_registry,
        register_int_counter_vec_with_registry,
    },
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    pub(crate) invocations_total: IntCounterVec,
    pub(crate) invocations_in_flight: IntGauge,
    pub(crate) worker_faults_total: IntCounterVec,
    pub(crate) worker_restarts_total: IntCounterVec,
    pub(crate) shared_memory_bytes_total: IntCounter,
    pub(crate) function_data_cache_hits: IntCounter,
    pub(crate) function_data_cache_misses: IntCounter,
}

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    FailedToRegister(#[from] prometheus::Error),

    #[error("failed to collect: {reason}")]
    FailedToCollect {
        reason: String
    },
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let invocations_total = register_int_counter_vec_with_registry!("invocations_total", "function invocations by outcome", &["language", "outcome"], registry)?;
        let invocations_in_flight = register_int_gauge_with_registry!("invocations_in_flight", "invocations waiting for a worker response", registry)?;
        let worker_faults_total = register_int_counter_vec_with_registry!("worker_faults_total", "worker channels that faulted", &["language"], registry)?;
        let worker_restarts_total = register_int_counter_vec_with_registry!("worker_restarts_total", "worker channels restarted after a fault", &["language"], registry)?;
        let shared_memory_bytes_total = register_int_counter_with_registry!("shared_memory_bytes_total", "bytes transferred through shared memory", registry)?;
        let function_data_cache_hits = register_int_counter_with_registry!("function_data_cache_hits", "function data cache hits", registry)?;
        let function_data_cache_misses = register_int_counter_with_registry!("function_data_cache_misses", "function data cache misses", registry)?;

        Ok(Self {
            invocations_total,
            invocations_in_flight,
            worker_faults_total,
            worker_restarts_total,
            shared_memory_bytes_total,
            function_data_cache_hits,
            function_data_cache_misses,

            registry,
        })
    }

    pub fn encode(&self) -> Result<String, MetricsError> {
        let metrics = self.registry.gather();
        let encoder = TextEncoder::new();
        encoder.encode_to_string(&metrics)
            .map_err(|err| MetricsError::FailedToCollect { reason: format!("{err:?}") })
    }
}

pub async fn run_metrics_server(metrics: Metrics, port: u16, cancel: CancellationToken) {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = match TcpListener::bind(addr).await {
        Ok(v) => v,
        Err(err) => {
            error!("failed to create TcpListener for metrics server: {err:?}");
            return;
        }
    };

    info!("running metrics server on {addr:?}");

    let metrics_server = MetricsServer::new(metrics);

    loop {
        let (tcp, _) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(v) => v,
                Err(err) => {
                    error!("failed to accept connection in metrics server: {err:?}");
                    continue;
                }
            },
        };
        let io = TokioIo::new(tcp);
        let metrics_server = metrics_server.clone();
        tokio::task::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .timer(TokioTimer::new())
                .serve_connection(io, metrics_server)
                .await {
                    error!("error while handling metrics request: {err:?}");
                }
        });
    }
}

#[derive(Clone)]
struct MetricsServer {
    metrics: Metrics,
}

impl MetricsServer {
    pub fn new(metrics: Metrics) -> Self {
        Self {
            metrics,
        }
    }
}

impl hyper::service::Service<Request<Incoming>> for MetricsServer {
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, _req: Request<Incoming>) -> Self::Future {
        let metrics = match self.metrics.encode() {
            Ok(v) => v,
            Err(err) => {
                error!("failed to encode metrics: {err:?}");
                return Box::pin(async move {
                    let mut response = Response::new(Full::new(Bytes::from("internal server error.\n")));
                    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                    Ok(response)
                });
            }
        };
        Box::pin(async move { Ok(Response::new(Full::new(Bytes::from(metrics)))) })
    }
}
