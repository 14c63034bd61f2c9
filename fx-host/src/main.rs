// host keeps worker processes alive, it should not crash on a bad frame
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

use {
    std::{path::PathBuf, process::exit, time::Duration},
    tracing::{error, info},
    tracing_subscriber::{EnvFilter, FmtSubscriber},
    clap::{Parser, Subcommand},
    anyhow::Context,
    fx_host::{
        FxHost,
        ScriptInvocationContext,
        config::HostConfig,
    },
};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Overrides `metrics_port` of the config file.
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Log filter, `RUST_LOG` syntax.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Starts workers and serves until interrupted.
    Serve {
        #[arg(long)]
        config: PathBuf,
    },
    /// Starts workers, invokes one function, prints the result as json and exits.
    Invoke {
        #[arg(long)]
        config: PathBuf,

        function: String,

        /// Input binding as `name=value`, may be repeated.
        #[arg(long = "input", value_parser = parse_input)]
        inputs: Vec<(String, String)>,

        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

fn parse_input(input: &str) -> Result<(String, String), String> {
    input.split_once('=')
        .map(|(name, value)| (name.to_owned(), value.to_owned()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected name=value, got {input:?}"))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    FmtSubscriber::builder().with_env_filter(filter).init();

    if let Err(err) = run_command(args).await {
        error!("{err:?}");
        exit(1);
    }
}

async fn run_command(args: Args) -> anyhow::Result<()> {
    match args.command {
        Command::Serve { config } => {
            let mut config = load_config(config).await?;
            if args.metrics_port.is_some() {
                config.metrics_port = args.metrics_port;
            }

            let functions_dir = config.functions_dir().to_owned();
            let mut host = FxHost::start(config).await.context("failed to start host")?;
            host.watch_functions(&functions_dir).context("failed to watch functions directory")?;
            info!("host is running, rpc address: {}", host.rpc_address());

            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result.context("failed to listen for ctrl-c")?;
                    info!("received ctrl-c");
                },
                _ = host.shutdown_requested() => {},
            }
            host.shutdown().await;
            Ok(())
        },
        Command::Invoke { config, function, inputs, timeout_secs } => {
            let mut config = load_config(config).await?;
            config.metrics_port = None;

            let host = FxHost::start(config).await.context("failed to start host")?;
            let mut invocation = ScriptInvocationContext::new(&function);
            for (name, value) in inputs {
                invocation = invocation.with_input(name, value);
            }
            if let Some(timeout_secs) = timeout_secs {
                invocation = invocation.with_timeout(Duration::from_secs(timeout_secs));
            }

            let result = host.invoke(invocation).await;
            host.shutdown().await;

            let result = result.with_context(|| format!("failed to invoke {function}"))?;
            println!("{}", serde_json::to_string_pretty(&result.to_json())?);
            Ok(())
        },
    }
}

async fn load_config(path: PathBuf) -> anyhow::Result<HostConfig> {
    let path = if path.is_relative() {
        std::env::current_dir().context("failed to get current directory")?.join(path)
    } else {
        path
    };
    info!("loading config from {path:?}");
    HostConfig::load(path.clone()).await.with_context(|| format!("failed to load config from {path:?}"))
}
