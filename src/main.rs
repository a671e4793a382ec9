use anyhow::Result;
use mqbridge::config::{self, BridgeConfig};
use mqbridge::driver::{self, Driver};
use mqbridge::host::MemoryHost;
use mqbridge::mux::MqttLink;
use mqbridge::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mqbridge=info".into()),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "mqbridge.toml".to_string());
    let config = match config::load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %config_path, error = %e, "Config not loaded, using defaults");
            BridgeConfig::default()
        }
    };

    info!("mqbridge starting...");

    let store = Arc::new(Store::open(&config.store.path)?);

    if !config.broker.is_configured() {
        warn!("No broker host configured; idle until shutdown");
        tokio::signal::ctrl_c().await?;
        return Ok(());
    }

    let (link, mut eventloop) = MqttLink::connect(&config.broker);
    let mut driver = Driver::new(store, link, MemoryHost::new(), true)?;
    driver.restore()?;

    driver::run(
        &mut driver,
        &mut eventloop,
        Duration::from_secs(config.broker.reconnect_delay_secs),
    )
    .await
}
