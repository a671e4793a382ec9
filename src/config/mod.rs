use serde::Deserialize;

/// Complete bridge configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Upstream broker connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Broker hostname; empty means "not configured" and no connection is
    /// attempted
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    /// Fixed delay between reconnect attempts; retried indefinitely, no
    /// backoff growth
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "mqbridge".to_string()
}

fn default_keepalive() -> u64 {
    60
}

fn default_reconnect_delay() -> u64 {
    30
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            client_id: default_client_id(),
            username: String::new(),
            password: String::new(),
            keepalive_secs: default_keepalive(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

impl BrokerConfig {
    pub fn is_configured(&self) -> bool {
        !self.host.trim().is_empty()
    }
}

/// Persistent store settings
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String {
    "mqbridge.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: BridgeConfig = toml::from_str(&contents)?;
    Ok(config)
}
