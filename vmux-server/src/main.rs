//! vmux-server: thin binary wrapper around `vmux-core`.
//!
//! Parses CLI flags, loads and validates configuration, initializes
//! tracing, builds [`AppState`] and the router, then runs the server to
//! completion (including graceful shutdown).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vmux_core::{router::build_router, AppState, Config, Server};

#[derive(Parser, Debug)]
#[command(name = "vmux-server", version, about = "Compute orchestration control plane")]
struct Cli {
    /// Path to the YAML config file. Missing file falls back to defaults +
    /// `VMUX_`-prefixed environment overrides.
    #[arg(long, short = 'c', default_value = "configs/config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load_from(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config);

    tracing::info!(
        config_path = %cli.config.display(),
        libvirt_uri = %config.libvirt.uri,
        "configuration loaded"
    );

    if let Err(err) = run(config).await {
        tracing::error!(error = %err, "server exited with error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn run(config: Config) -> vmux_core::Result<()> {
    let (state, client_commands) = AppState::build(config.clone()).await?;
    state.start(client_commands);

    let router = build_router(state.clone());
    let server = Server::new(config);

    let result = server.serve(router).await;
    state.shutdown().await;
    result
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    let registry = tracing_subscriber::registry().with(filter);

    if config.logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
