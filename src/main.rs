//! Switchboard Server
//!
//! Run with: cargo run -- serve
//!
//! # Configuration
//!
//! Settings come from a TOML file (see `switchboard config`), with
//! environment overrides:
//! - `SWITCHBOARD_HOST`: Host to bind to (default: 0.0.0.0)
//! - `SWITCHBOARD_PORT`: Port to listen on (default: 8090)
//! - `SWITCHBOARD_CAPACITY`: Connection cap, 0 for unbounded (default: 0)
//! - `SWITCHBOARD_LOG_LEVEL`: Log level (default: info)
//! - `SWITCHBOARD_LOG_FORMAT`: pretty or json (default: pretty)
//! - `RUST_LOG`: Takes precedence over the configured log level

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use switchboard::api::{serve, AppState};
use switchboard::config::{generate_default_config, Config, LoggingConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "WebSocket broadcast hub")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub server
    Serve {
        /// Config file (default: search standard locations)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Maximum simultaneous connections (0 = unbounded)
        #[arg(long)]
        capacity: Option<usize>,
    },

    /// Print a default config file
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config => {
            print!("{}", generate_default_config());
            Ok(())
        }
        Commands::Serve {
            config,
            host,
            port,
            capacity,
        } => {
            let mut config = match config {
                Some(path) => Config::load_with_env(&path)?,
                None => Config::load_default(),
            };

            // Command-line flags win over file and environment
            if let Some(host) = host {
                config.api.host = host;
            }
            if let Some(port) = port {
                config.api.port = port;
            }
            if let Some(capacity) = capacity {
                config.hub.capacity = capacity;
            }

            init_tracing(&config.logging);

            tracing::info!("Starting Switchboard v{}", env!("CARGO_PKG_VERSION"));
            tracing::info!(
                capacity = config.hub.capacity,
                outbound_buffer = config.hub.outbound_buffer,
                "Hub configured"
            );

            let state = AppState::with_hub_config(config.api.clone(), config.hub.clone());
            serve(state, &config.api).await?;

            Ok(())
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("switchboard={},tower_http=info", logging.level).into()
    });

    let registry = tracing_subscriber::registry().with(filter);

    if logging.is_json() {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
