use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};
use overlay_collab::{CollabConfig, ConfigError, RelayConfig, RelayServer};

#[derive(Parser, Debug)]
#[command(name = "overlay-relay", version, about = "Signaling relay for overlay layers")]
struct Args {
    /// JSON config file; its `relay` section is the starting point
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "OVERLAY_RELAY_ADDR", value_name = "ADDR")]
    bind: Option<String>,

    /// Peers admitted per layer
    #[arg(long, env = "OVERLAY_RELAY_MAX_PEERS", value_name = "N")]
    max_peers: Option<usize>,
}

impl Args {
    fn relay_config(&self) -> Result<RelayConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => CollabConfig::from_file(path)?.relay,
            None => RelayConfig::default(),
        };
        if let Some(addr) = &self.bind {
            config.bind_addr = addr.clone();
        }
        if let Some(n) = self.max_peers {
            config.max_peers_per_layer = n;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let config = match args.relay_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!("Starting overlay relay on {}...", config.bind_addr);
    let server = RelayServer::new(config);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down ({} connections served, {} frames relayed)",
                stats.total_connections, stats.frames_relayed
            );
        }
    }
    ExitCode::SUCCESS
}
