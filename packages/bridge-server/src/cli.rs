use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::BridgeConfig;
use crate::models::ModelRegistry;
use crate::router::{build_router, spawn_background_tasks, BridgeState};

const DEFAULT_CONFIG_FILE: &str = "config.jsonc";
const DEFAULT_MODELS_FILE: &str = "models.json";
const DEFAULT_ENDPOINTS_FILE: &str = "model_endpoint_map.json";

#[derive(Parser, Debug)]
#[command(name = "lmarena-bridge", bin_name = "lmarena-bridge")]
#[command(about = "OpenAI-compatible bridge to a browser-hosted LMArena agent")]
#[command(version)]
pub struct BridgeCli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding config.jsonc, models.json and model_endpoint_map.json.
    #[arg(long, short = 'd', global = true, default_value = ".")]
    data_dir: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge HTTP server.
    Server(ServerArgs),
    /// Validate the configuration and model maps, then exit.
    CheckConfig,
}

#[derive(Args, Debug)]
struct ServerArgs {
    #[arg(long, short = 'H')]
    host: Option<String>,

    #[arg(long, short = 'p')]
    port: Option<u16>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn run() -> Result<(), CliError> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = BridgeCli::parse();
    let config = load_config(&cli.data_dir)?;

    match cli.command {
        Command::CheckConfig => {
            let registry = ModelRegistry::load(
                &cli.data_dir.join(DEFAULT_MODELS_FILE),
                &cli.data_dir.join(DEFAULT_ENDPOINTS_FILE),
            );
            tracing::info!(models = registry.model_names().len(), "configuration is valid");
            Ok(())
        }
        Command::Server(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(serve(cli.data_dir, config, args))
        }
    }
}

fn load_config(data_dir: &std::path::Path) -> Result<BridgeConfig, CliError> {
    let path = data_dir.join(DEFAULT_CONFIG_FILE);
    if path.exists() {
        BridgeConfig::load(&path).map_err(|err| CliError::Config(err.to_string()))
    } else {
        tracing::warn!(path = %path.display(), "no configuration file, using defaults");
        Ok(BridgeConfig::default())
    }
}

async fn serve(data_dir: PathBuf, mut config: BridgeConfig, args: ServerArgs) -> Result<(), CliError> {
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let registry = ModelRegistry::load(
        &data_dir.join(DEFAULT_MODELS_FILE),
        &data_dir.join(DEFAULT_ENDPOINTS_FILE),
    );
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|err| CliError::Config(format!("invalid host/port: {err}")))?;

    let (state, pending_rx) = BridgeState::new(config, registry, &data_dir);
    spawn_background_tasks(state.clone(), pending_rx);
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "lmarena-bridge listening");
    tracing::info!("agent websocket endpoint: ws://{addr}/ws");
    axum::serve(listener, router).await?;
    Ok(())
}
