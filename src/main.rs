use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lora_relay::analytics::{AnalyticsClient, AnalyticsForwarder};
use lora_relay::config::Config;
use lora_relay::proxy::UdpProxy;

#[derive(Parser)]
#[command(name = "lora-relay")]
#[command(about = "Transparent Semtech UDP relay with an analytics sidecar")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        Config::default()
    });

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    // Missing required options are fatal
    config.validate()?;

    info!("lora-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Relaying {}:{} -> {}:{}",
        config.proxy.listen_host,
        config.proxy.listen_port_up,
        config.proxy.connect_host,
        config.proxy.connect_port_up
    );

    // The analytics client connects lazily from the forwarder task,
    // the collector might not be reachable right away
    let client = Arc::new(AnalyticsClient::new(config.client_config()));

    // Bind the relay sockets; an unbindable port is fatal
    let proxy = Arc::new(UdpProxy::new(config.proxy_config()?).await?);

    let forwarder = Arc::new(AnalyticsForwarder::new(
        config.forwarder_settings(),
        client,
        proxy.clone(),
    ));

    tokio::select! {
        _ = forwarder.start_and_wait() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    proxy.close().await;
    Ok(())
}
