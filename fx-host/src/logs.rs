use {
    std::{collections::HashMap, sync::Arc},
    tracing::{debug, error, info, trace, warn},
    serde::Serialize,
    fx_rpc::{RpcLog, RpcLogLevel},
    crate::config::LoggerConfig,
};

/// Log line produced by a function (or by the host on behalf of one).
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct LogMessageEvent {
    pub source: LogSource,
    pub level: LogLevel,
    pub message: String,
    pub fields: HashMap<String, String>,
}

impl LogMessageEvent {
    pub fn new(source: LogSource, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            source,
            level,
            message: message.into(),
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn from_rpc_log(worker_id: &str, log: &RpcLog) -> Self {
        let source = match &log.invocation_id {
            Some(invocation_id) => LogSource::Function {
                category: log.category.clone(),
                invocation_id: invocation_id.clone(),
            },
            None => LogSource::Worker { worker_id: worker_id.to_owned() },
        };

        let mut event = Self::new(source, log.level.into(), log.message.clone())
            .with_field("worker_id", worker_id);
        if let Some(exception) = &log.exception {
            event = event.with_field("exception", exception.message.clone());
            if !exception.stack_trace.is_empty() {
                event = event.with_field("stack_trace", exception.stack_trace.clone());
            }
        }
        event
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub enum LogSource {
    Function {
        category: String,
        invocation_id: String,
    },
    Worker {
        worker_id: String,
    },
    FxHost,
}

#[derive(Serialize, Debug, Clone, Copy, Eq, PartialEq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<RpcLogLevel> for LogLevel {
    fn from(value: RpcLogLevel) -> Self {
        match value {
            RpcLogLevel::Trace => Self::Trace,
            RpcLogLevel::Debug => Self::Debug,
            RpcLogLevel::Information => Self::Info,
            RpcLogLevel::Warning => Self::Warn,
            RpcLogLevel::Error | RpcLogLevel::Critical => Self::Error,
        }
    }
}

pub trait Logger {
    fn log(&self, message: LogMessageEvent);
}

pub struct BoxLogger {
    inner: Box<dyn Logger + Send + Sync>,
}

impl BoxLogger {
    pub fn new<T: Logger + Send + Sync + 'static>(inner: T) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }
}

impl Logger for BoxLogger {
    fn log(&self, message: LogMessageEvent) {
        self.inner.log(message)
    }
}

pub struct StdoutLogger {}

impl StdoutLogger {
    pub fn new() -> Self {
        Self {}
    }
}

impl Logger for StdoutLogger {
    fn log(&self, message: LogMessageEvent) {
        let source = match message.source {
            LogSource::Function { category, .. } => category,
            LogSource::Worker { worker_id } => format!("worker/{worker_id}"),
            LogSource::FxHost => "fx".to_owned(),
        };
        println!("{source} | {:?} | {} {:?}", message.level, message.message, message.fields);
    }
}

pub struct NoopLogger {}

impl NoopLogger {
    pub fn new() -> Self {
        Self {}
    }
}

impl Logger for NoopLogger {
    fn log(&self, _message: LogMessageEvent) {}
}

/// Re-emits function logs as `tracing` events under the `function` target.
pub struct TracingLogger {}

impl TracingLogger {
    pub fn new() -> Self {
        Self {}
    }
}

impl Logger for TracingLogger {
    fn log(&self, message: LogMessageEvent) {
        let (category, invocation_id) = match &message.source {
            LogSource::Function { category, invocation_id } => (category.as_str(), invocation_id.as_str()),
            LogSource::Worker { worker_id } => (worker_id.as_str(), ""),
            LogSource::FxHost => ("fx", ""),
        };
        let text = message.message;
        match message.level {
            LogLevel::Trace => trace!(target: "function", category, invocation_id, "{text}"),
            LogLevel::Debug => debug!(target: "function", category, invocation_id, "{text}"),
            LogLevel::Info => info!(target: "function", category, invocation_id, "{text}"),
            LogLevel::Warn => warn!(target: "function", category, invocation_id, "{text}"),
            LogLevel::Error => error!(target: "function", category, invocation_id, "{text}"),
        }
    }
}

impl<T: Logger> Logger for Arc<T> {
    fn log(&self, message: LogMessageEvent) {
        self.as_ref().log(message);
    }
}

pub fn create_logger(config: Option<&LoggerConfig>) -> BoxLogger {
    match config {
        Some(LoggerConfig::Stdout) | None => BoxLogger::new(StdoutLogger::new()),
        Some(LoggerConfig::Noop) => BoxLogger::new(NoopLogger::new()),
        Some(LoggerConfig::Tracing) => BoxLogger::new(TracingLogger::new()),
    }
}
