use anyhow::{Context, Result};
use clap::Parser;
use lanrelay::{Server, ServerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

/// LAN chat relay - broadcast chat and relayed file transfers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file; flags below override its values
    #[arg(short, long, env = "LANRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (default 0.0.0.0:12345)
    #[arg(short, long, env = "LANRELAY_BIND")]
    bind: Option<SocketAddr>,

    /// Directory for relayed files (default ./server_files)
    #[arg(short, long, env = "LANRELAY_STORAGE")]
    storage: Option<PathBuf>,

    /// Drop peers idle for this many seconds
    #[arg(long, env = "LANRELAY_IDLE_TIMEOUT")]
    idle_timeout: Option<u64>,

    /// Max seconds between data frames during an upload
    #[arg(long, env = "LANRELAY_TRANSFER_TIMEOUT")]
    transfer_timeout: Option<u64>,

    /// Seconds before a stalled send counts as failed
    #[arg(long, env = "LANRELAY_WRITE_TIMEOUT")]
    write_timeout: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(storage) = self.storage {
            config.storage_dir = storage;
        }
        if let Some(secs) = self.idle_timeout {
            config.idle_timeout_secs = Some(secs);
        }
        if let Some(secs) = self.transfer_timeout {
            config.transfer_timeout_secs = secs;
        }
        if let Some(secs) = self.write_timeout {
            config.write_timeout_secs = secs;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let config = args.into_config()?;
    let server = Server::bind(config.clone())
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            shutdown.trigger();
        }
    });

    server.run().await.context("Accept loop failed")?;
    info!("Relay stopped");
    Ok(())
}
