//! fitdeploy CLI: train a model, then deploy, probe and tear down the
//! endpoint serving it.

mod commands;
mod simulate;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// fitdeploy: train, deploy, probe and tear down inference endpoints
#[derive(Parser, Debug)]
#[command(name = "fitdeploy", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path (layered over workspace config)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Hosting control plane URL (simulated in-memory when unset)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show an endpoint's current status
    Status {
        /// Endpoint name
        name: String,
    },
    /// Delete any endpoint and configuration under a name
    EnsureAbsent {
        /// Endpoint name
        name: String,
    },
    /// Deploy the configured model and wait for provisioning to settle
    Deploy {
        /// Endpoint name (defaults to deployment.endpoint_name)
        #[arg(long)]
        endpoint: Option<String>,
    },
    /// Send one payload to an endpoint
    Predict {
        /// Endpoint name
        name: String,
        /// JSON payload
        #[arg(long)]
        payload: String,
    },
    /// Delete an endpoint, its configuration and its model
    Teardown {
        /// Endpoint name
        name: String,
    },
    /// Run the training entry point and persist its artifact
    Train,
    /// Train, deploy, send a sample prediction, then tear down
    Run {
        /// JSON payload for the sample prediction (defaults to deployment.sample_payload)
        #[arg(long)]
        payload: Option<String>,
        /// Deploy the last persisted artifact without training
        #[arg(long)]
        skip_training: bool,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create a default configuration file
    Init,
    /// Show current configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "fitdeploy", "fitdeploy")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "fitdeploy.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let options = commands::GlobalOptions {
        config_file: cli.config,
        base_url: cli.base_url,
    };
    commands::handle_command(cli.command, &workspace, &options).await
}
