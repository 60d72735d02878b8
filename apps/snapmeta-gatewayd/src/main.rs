mod config;

use std::sync::Arc;
use std::time::Duration;

use snapmeta_cluster::KubeCluster;
use snapmeta_gateway::{DriverConn, GatewayServer};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Parse CLI args for config file path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "snapmeta-gatewayd.yaml".to_string());

    // Load configuration (try file first, fall back to env)
    let config = if std::path::Path::new(&config_path).exists() {
        tracing::info!("loading configuration from: {}", config_path);
        config::GatewayConfig::load_from_file(&config_path)?
    } else {
        tracing::warn!("config file not found, loading from environment variables");
        config::GatewayConfig::load_from_env()?
    };

    tracing::info!("driver name: {}", config.driver_name);
    tracing::info!("listen address: {}", config.listen_addr);
    tracing::info!("driver socket: {}", config.csi_socket.display());

    let kube_client = kube::Client::try_default().await?;
    let cluster = Arc::new(KubeCluster::new(kube_client));

    let driver = Arc::new(DriverConn::connect_uds(&config.csi_socket)?);
    let probe = Arc::clone(&driver).spawn_probe(Duration::from_secs(config.probe_interval_secs));

    let mut server = GatewayServer::new(
        config.listen_addr(),
        cluster,
        Arc::clone(&driver),
        config.driver_name.clone(),
        config.audience.clone(),
    )
    .with_tls(&config.tls_cert, &config.tls_key);
    server.start().await?;

    tracing::info!("snapshot-metadata gateway is ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    tracing::info!("received shutdown signal, gracefully shutting down...");

    probe.abort();
    server.shutdown().await?;

    tracing::info!("shutdown complete");
    Ok(())
}
