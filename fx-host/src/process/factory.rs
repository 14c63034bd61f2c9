use {
    std::{path::PathBuf, process::Stdio},
    tokio::process::Command,
    crate::config::{ENV_SHARED_MEMORY_DIRECTORIES, WorkerConfig},
};

/// Everything needed to build the command line of one worker process.
#[derive(Debug, Clone)]
pub struct WorkerProcessContext {
    pub worker_id: String,
    pub request_id: String,
    pub language: String,
    pub config: WorkerConfig,
    pub host: String,
    pub port: u16,
    pub functions_dir: PathBuf,
    pub shared_memory_directories: Vec<PathBuf>,
}

/// Builds (without starting) the worker command:
/// `<executable> [executable args] [worker script] [worker args] --host h --port p --workerId id --requestId id`.
pub fn create_worker_process(context: &WorkerProcessContext) -> Command {
    let config = &context.config;

    let mut command = Command::new(&config.executable);
    command.args(&config.executable_arguments);
    if let Some(worker_script) = &config.worker_script {
        command.arg(worker_script);
    }
    command.args(&config.worker_arguments);
    command
        .arg("--host")
        .arg(&context.host)
        .arg("--port")
        .arg(context.port.to_string())
        .arg("--workerId")
        .arg(&context.worker_id)
        .arg("--requestId")
        .arg(&context.request_id);

    command.envs(&config.environment);
    if !context.shared_memory_directories.is_empty() {
        let directories = context.shared_memory_directories.iter()
            .map(|v| v.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(",");
        command.env(ENV_SHARED_MEMORY_DIRECTORIES, directories);
    }

    command.current_dir(config.working_directory.as_ref().unwrap_or(&context.functions_dir));
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(target_os = "linux")]
    set_parent_death_signal(&mut command);

    command
}

/// Worker gets SIGKILL when the host dies, even if the host had no chance to clean up.
#[cfg(target_os = "linux")]
fn set_parent_death_signal(command: &mut Command) {
    use nix::sys::{prctl, signal::Signal};

    // SAFETY: the closure only performs a single prctl syscall, which is async-signal-safe.
    unsafe {
        command.pre_exec(|| prctl::set_pdeathsig(Signal::SIGKILL).map_err(std::io::Error::from));
    }
}
