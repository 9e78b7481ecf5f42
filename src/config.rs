use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub peer: PeerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Relay the rendezvous channel connects to.
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Length of generated peer identifiers (4-10).
    #[serde(default = "default_id_length")]
    pub id_length: usize,
    /// STUN servers for NAT traversal.
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    /// Bound on how long a session may sit in a waiting negotiation state.
    #[serde(default = "default_negotiation_timeout_ms")]
    pub negotiation_timeout_ms: u64,
}

fn default_bind_address() -> String {
    "127.0.0.1:8081".to_string()
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:8081".to_string()
}

fn default_id_length() -> usize {
    4
}

fn default_stun_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun.cloudflare.com:3478".to_string(),
    ]
}

fn default_negotiation_timeout_ms() -> u64 {
    30_000
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            id_length: default_id_length(),
            stun_servers: default_stun_servers(),
            negotiation_timeout_ms: default_negotiation_timeout_ms(),
        }
    }
}

impl Config {
    /// Load config from file, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = get_config_path();

        if config_path.exists() {
            let content =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let config_path = get_config_path();

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&config_path, content)?;

        Ok(())
    }
}

/// Get the sidelink directory (~/.sidelink)
pub fn get_sidelink_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sidelink")
}

/// Get the config file path (~/.sidelink/config.toml)
pub fn get_config_path() -> PathBuf {
    get_sidelink_dir().join("config.toml")
}
