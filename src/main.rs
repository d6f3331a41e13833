use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use persistent_worker::config::{UpstreamConfig, WorkerConfig};
use persistent_worker::shutdown::install_shutdown_handler;
use persistent_worker::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "persistent-worker")]
#[command(version)]
#[command(about = "A CI worker that runs tasks in containers and cloned virtual machines")]
#[command(propagate_version = true)]
struct Args {
    /// Log output format
    #[arg(long, global = true, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Poll the configured upstreams and run tasks until shut down
    Run(ConfigArgs),

    /// Stop accepting new tasks on every upstream
    Pause {
        #[command(flatten)]
        config: ConfigArgs,

        /// Block until no upstream reports running tasks
        #[arg(long)]
        wait: bool,
    },

    /// Accept new tasks again on every upstream
    Resume(ConfigArgs),
}

// =============================================================================
// Configuration Arguments (shared by all commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ConfigArgs {
    /// Path to the YAML configuration file
    #[arg(long, short = 'f', env = "PERSISTENT_WORKER_CONFIG")]
    config: Option<PathBuf>,

    /// Worker name (defaults to the host name)
    #[arg(long)]
    name: Option<String>,

    /// Registration token for upstreams that don't set their own
    #[arg(long, env = "PERSISTENT_WORKER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Additional upstream URL (repeatable)
    #[arg(long = "upstream")]
    upstreams: Vec<String>,
}

#[derive(Debug, Clone, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_logging(format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn load_config(args: ConfigArgs) -> Result<WorkerConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => WorkerConfig::from_yaml_file(path)?,
        None => WorkerConfig::default(),
    };

    if let Some(name) = args.name {
        config = config.with_name(name);
    }
    if let Some(token) = args.token {
        config = config.with_token(token);
    }
    for (i, url) in args.upstreams.into_iter().enumerate() {
        config = config.with_upstream(UpstreamConfig::new(format!("cli-{}", i), url));
    }

    Ok(config)
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(&args.log_format);

    let shutdown = install_shutdown_handler()?;

    match args.command {
        Commands::Run(config_args) => {
            let config = load_config(config_args)?;
            let worker = Worker::from_config(&config).await?;

            tracing::info!(
                name = %config.worker_name(),
                upstreams = config.upstreams.len(),
                standby = config.standby.is_some(),
                "Starting persistent worker"
            );

            worker.run(shutdown).await?;
        }
        Commands::Pause { config, wait } => {
            let config = load_config(config)?;
            let worker = Worker::from_config(&config).await?;
            worker.pause(&shutdown, wait).await?;
        }
        Commands::Resume(config_args) => {
            let config = load_config(config_args)?;
            let worker = Worker::from_config(&config).await?;
            worker.resume().await?;
        }
    }

    Ok(())
}
