use {
    std::{collections::HashMap, env, path::{Path, PathBuf}, time::Duration},
    tokio::fs,
    serde::Deserialize,
    crate::error::ConfigError,
};

pub const ENV_SHARED_MEMORY_DIRECTORIES: &str = "FUNCTIONS_UNIX_SHARED_MEMORY_DIRECTORIES";
pub const ENV_FUNCTION_DATA_CACHE_ENABLED: &str = "FUNCTION_DATA_CACHE_ENABLED";
pub const ENV_FUNCTION_DATA_CACHE_MAXIMUM_SIZE_BYTES: &str = "FUNCTION_DATA_CACHE_MAXIMUM_SIZE_BYTES";

const MIB: u64 = 1024 * 1024;

#[derive(Deserialize, Debug, Clone)]
pub struct HostConfig {
    #[serde(skip_deserializing)]
    pub config_path: Option<PathBuf>,

    pub functions_dir: PathBuf,

    #[serde(default)]
    pub rpc: RpcConfig,

    #[serde(default)]
    pub workers: HashMap<String, WorkerConfig>,

    #[serde(default)]
    pub restart: RestartConfig,

    #[serde(default)]
    pub shared_memory: SharedMemoryConfig,

    #[serde(default)]
    pub function_data_cache: FunctionDataCacheConfig,

    #[serde(default)]
    pub invocation: InvocationConfig,

    pub logger: Option<LoggerConfig>,

    pub metrics_port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_host")]
    pub host: String,
    /// `0` picks a free port.
    #[serde(default)]
    pub port: u16,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            host: default_rpc_host(),
            port: 0,
        }
    }
}

/// How to start the worker processes of one language.
#[derive(Deserialize, Debug, Clone)]
pub struct WorkerConfig {
    pub executable: PathBuf,
    #[serde(default)]
    pub executable_arguments: Vec<String>,
    pub worker_script: Option<PathBuf>,
    #[serde(default)]
    pub worker_arguments: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    pub working_directory: Option<PathBuf>,

    #[serde(default = "default_process_count")]
    pub process_count: usize,
    #[serde(default)]
    pub process_startup_interval_ms: u64,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats: u32,
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,

    /// Capabilities the worker must declare in its init response.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

impl WorkerConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            executable_arguments: Vec::new(),
            worker_script: None,
            worker_arguments: Vec::new(),
            environment: HashMap::new(),
            working_directory: None,
            process_count: default_process_count(),
            process_startup_interval_ms: 0,
            startup_timeout_ms: default_startup_timeout_ms(),
            init_timeout_ms: default_init_timeout_ms(),
            load_timeout_ms: default_load_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            missed_heartbeats: default_missed_heartbeats(),
            drain_grace_ms: default_drain_grace_ms(),
            required_capabilities: Vec::new(),
        }
    }

    pub fn process_startup_interval(&self) -> Duration {
        Duration::from_millis(self.process_startup_interval_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence longer than this means the worker is gone.
    pub fn heartbeat_deadline(&self) -> Duration {
        self.heartbeat_interval() * self.missed_heartbeats.max(1)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct RestartConfig {
    /// Restarts allowed per language within `error_window_secs`. Defaults to three times
    /// the process count of the language.
    pub max_restarts: Option<usize>,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_error_window_secs")]
    pub error_window_secs: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: None,
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            error_window_secs: default_error_window_secs(),
        }
    }
}

impl RestartConfig {
    pub fn max_restarts_for(&self, process_count: usize) -> usize {
        self.max_restarts.unwrap_or(3 * process_count.max(1))
    }

    /// Delay before the restart with the given 1-based attempt number.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        let backoff = self.initial_backoff_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(backoff.min(self.max_backoff_ms))
    }

    pub fn error_window(&self) -> Duration {
        Duration::from_secs(self.error_window_secs)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct SharedMemoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Falls back to `/dev/shm` and the system temp directory when empty.
    #[serde(default)]
    pub directories: Vec<PathBuf>,
    #[serde(default)]
    pub min_free_bytes: u64,
    #[serde(default = "default_min_object_bytes")]
    pub min_object_bytes: u64,
    #[serde(default = "default_max_object_bytes")]
    pub max_object_bytes: u64,
}

impl Default for SharedMemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directories: Vec::new(),
            min_free_bytes: 0,
            min_object_bytes: default_min_object_bytes(),
            max_object_bytes: default_max_object_bytes(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct FunctionDataCacheConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cache_maximum_size_bytes")]
    pub maximum_size_bytes: u64,
}

impl Default for FunctionDataCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            maximum_size_bytes: default_cache_maximum_size_bytes(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct InvocationConfig {
    #[serde(default = "default_invocation_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_worker_wait_timeout_ms")]
    pub worker_wait_timeout_ms: u64,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_invocation_timeout_ms(),
            worker_wait_timeout_ms: default_worker_wait_timeout_ms(),
        }
    }
}

impl InvocationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn worker_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_wait_timeout_ms)
    }
}

#[derive(Deserialize, Debug, Clone, Eq, PartialEq)]
#[serde(tag = "type")]
pub enum LoggerConfig {
    #[serde(rename = "stdout")]
    Stdout,
    #[serde(rename = "noop")]
    Noop,
    #[serde(rename = "tracing")]
    Tracing,
}

impl HostConfig {
    pub fn new(functions_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_path: None,
            functions_dir: functions_dir.into(),
            rpc: RpcConfig::default(),
            workers: HashMap::new(),
            restart: RestartConfig::default(),
            shared_memory: SharedMemoryConfig::default(),
            function_data_cache: FunctionDataCacheConfig::default(),
            invocation: InvocationConfig::default(),
            logger: None,
            metrics_port: None,
        }
    }

    /// Reads the config file, applies environment overrides and resolves `functions_dir`
    /// relative to the config file.
    pub async fn load(file_path: PathBuf) -> Result<Self, ConfigError> {
        let content = fs::read(&file_path).await
            .map_err(|source| ConfigError::Read { path: file_path.clone(), source })?;
        let mut config: Self = serde_yml::from_slice(&content)
            .map_err(|source| ConfigError::Parse { path: file_path.clone(), source })?;

        if config.functions_dir.is_relative() {
            if let Some(parent) = file_path.parent() {
                config.functions_dir = parent.join(&config.functions_dir);
            }
        }
        config.config_path = Some(file_path);
        config.apply_environment(|name| env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yml::from_str(content)
            .map_err(|source| ConfigError::Parse { path: PathBuf::from("<inline>"), source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_environment(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(directories) = lookup(ENV_SHARED_MEMORY_DIRECTORIES) {
            let directories: Vec<PathBuf> = directories.split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .collect();
            if !directories.is_empty() {
                self.shared_memory.directories = directories;
            }
        }

        if let Some(enabled) = lookup(ENV_FUNCTION_DATA_CACHE_ENABLED) {
            self.function_data_cache.enabled = fx_rpc::capabilities::is_enabled(&enabled);
        }

        if let Some(size) = lookup(ENV_FUNCTION_DATA_CACHE_MAXIMUM_SIZE_BYTES) {
            match size.trim().parse::<u64>() {
                Ok(v) => self.function_data_cache.maximum_size_bytes = v,
                Err(err) => tracing::warn!("ignoring invalid {ENV_FUNCTION_DATA_CACHE_MAXIMUM_SIZE_BYTES}={size:?}: {err}"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (language, worker) in &self.workers {
            if worker.process_count == 0 {
                return Err(ConfigError::Invalid { reason: format!("process_count for {language} must be at least 1") });
            }
            if worker.executable.as_os_str().is_empty() {
                return Err(ConfigError::Invalid { reason: format!("executable for {language} is empty") });
            }
            if worker.heartbeat_interval_ms == 0 {
                return Err(ConfigError::Invalid { reason: format!("heartbeat_interval_ms for {language} must be positive") });
            }
        }

        if self.shared_memory.min_object_bytes > self.shared_memory.max_object_bytes {
            return Err(ConfigError::Invalid {
                reason: "shared_memory.min_object_bytes is larger than max_object_bytes".to_owned(),
            });
        }

        if self.restart.initial_backoff_ms > self.restart.max_backoff_ms {
            return Err(ConfigError::Invalid {
                reason: "restart.initial_backoff_ms is larger than max_backoff_ms".to_owned(),
            });
        }

        Ok(())
    }

    pub fn functions_dir(&self) -> &Path {
        &self.functions_dir
    }
}

fn default_rpc_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_true() -> bool {
    true
}

fn default_process_count() -> usize {
    1
}

fn default_startup_timeout_ms() -> u64 {
    60_000
}

fn default_init_timeout_ms() -> u64 {
    30_000
}

fn default_load_timeout_ms() -> u64 {
    30_000
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_missed_heartbeats() -> u32 {
    3
}

fn default_drain_grace_ms() -> u64 {
    10_000
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_error_window_secs() -> u64 {
    10 * 60
}

fn default_min_object_bytes() -> u64 {
    MIB
}

fn default_max_object_bytes() -> u64 {
    2 * 1024 * MIB
}

fn default_cache_maximum_size_bytes() -> u64 {
    256 * MIB
}

fn default_invocation_timeout_ms() -> u64 {
    5 * 60 * 1000
}

fn default_worker_wait_timeout_ms() -> u64 {
    30_000
}
