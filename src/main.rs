use seergate::config::Config;
use seergate::discovery::ContainerInventory;
use seergate::logbuf::LogBuffer;
use seergate::server::{ProxyServer, ProxyState};
use seergate::store::MappingStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let logs = LogBuffer::new();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("seergate=debug".parse().expect("valid log directive")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(logs.layer())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("seergate.toml"));

    let config = Config::load(&config_path)?;
    info!(path = %config_path.display(), "configuration loaded");

    if config.api_key.is_empty() {
        warn!("no API key configured; unknown hostnames cannot be resolved until one is set");
    }

    let store = Arc::new(MappingStore::new(&config.cache_file));
    if let Err(e) = store.load() {
        warn!(error = %e, "failed to load mapping file, starting fresh");
    }
    info!(
        cache_file = %config.cache_file,
        mappings = store.len(),
        model = %config.model,
        "mapping store ready"
    );

    let containers = ContainerInventory::connect().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(ProxyState::new(config, store, containers, logs));
    let server = ProxyServer::bind(state, shutdown_rx).await?;
    info!(addr = %server.local_addr()?, "seergate starting");

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    server.run().await
}
