use clap::Parser;
use log::{error, info};
use server::config::{Config, DEFAULT_CONFIG_PATH};
use server::network::Server;
use std::path::PathBuf;

/// Main-method of the file server.
/// Loads the properties file, opens the archive and serves until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Properties file holding revision, port and cachePath
        #[clap(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        /// Overrides the port from the properties file
        #[clap(short, long)]
        port: Option<u16>,
    }

    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    info!(
        "Starting file server for revision {} with {} workers",
        config.revision, config.threads
    );

    let server = match Server::open(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start file server: {}", e);
            return Err(e.into());
        }
    };

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Received Ctrl+C, shutting down gracefully...");
        })
        .await?;

    Ok(())
}
