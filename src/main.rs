//! Cluster agent - node admission API

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cluster_agent::config::{AgentConfig, StatePaths};
use cluster_agent::exec::{CommandRunner, RecordingCommandRunner, SystemCommandRunner};
use cluster_agent::join::SystemResolver;
use cluster_agent::server::{self, AppState};
use cluster_agent::{DEFAULT_BIND, DEFAULT_TIMEOUT_SECS};

/// Node listing served to worker joins in development mode
const DEVMODE_CONTROL_PLANE_NODES: &str = r#"{"items":[
  {"status":{"addresses":[{"type":"InternalIP","address":"10.0.0.1"}]}},
  {"status":{"addresses":[{"type":"InternalIP","address":"10.0.0.2"}]}}
]}"#;

/// Cluster agent - answers join, signing, configure and upgrade requests
#[derive(Parser, Debug)]
#[command(name = "cluster-agent", version, about, long_about = None)]
struct Cli {
    /// Listen address
    #[arg(long, default_value = DEFAULT_BIND)]
    bind: SocketAddr,

    /// TLS private key
    #[arg(long)]
    keyfile: PathBuf,

    /// TLS certificate
    #[arg(long)]
    certfile: PathBuf,

    /// Per-request deadline in seconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,

    /// Writable state directory
    #[arg(long, env = "SNAP_DATA", default_value = "/var/snap/microk8s/current")]
    data_dir: PathBuf,

    /// Install directory holding wrappers and upgrade scripts
    #[arg(long, env = "SNAP", default_value = "/snap/microk8s/current")]
    install_dir: PathBuf,

    /// Use ./data for all state and only log commands instead of running them
    #[arg(long)]
    devmode: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let (paths, runner): (StatePaths, Arc<dyn CommandRunner>) = if cli.devmode {
        info!("Running in development mode, commands are logged only");
        (
            StatePaths::new("data", "data"),
            Arc::new(
                RecordingCommandRunner::new().with_output("", DEVMODE_CONTROL_PLANE_NODES),
            ),
        )
    } else {
        (
            StatePaths::new(cli.data_dir.clone(), cli.install_dir.clone()),
            Arc::new(SystemCommandRunner),
        )
    };

    let config = AgentConfig::detect(paths, Duration::from_secs(cli.timeout));
    let state = AppState::new(config, runner, Arc::new(SystemResolver), cli.bind);
    let app = server::router(Arc::new(state));

    server::serve(cli.bind, &cli.certfile, &cli.keyfile, app)
        .await
        .with_context(|| format!("failed to serve on {}", cli.bind))?;

    Ok(())
}
