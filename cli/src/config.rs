// Configuration file handling for relayctl
//
// The service config lives as JSON in:
// - Linux:   ~/.config/circuit-relay/config.json
// - macOS:   ~/Library/Application Support/circuit-relay/config.json
// - Windows: %APPDATA%\circuit-relay\config.json

use anyhow::{Context, Result};
use circuit_relay_core::CircuitRelayConfig;
use std::path::{Path, PathBuf};

/// Get the config directory path, creating it if needed
pub fn config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Failed to determine config directory")?
        .join("circuit-relay");

    std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

    Ok(config_dir)
}

pub fn default_config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

/// Load the config at `path`, or the default file. A missing file yields defaults.
pub fn load(path: Option<&Path>) -> Result<CircuitRelayConfig> {
    let config_file = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_file()?,
    };

    if !config_file.exists() {
        if path.is_some() {
            anyhow::bail!("Config file not found: {}", config_file.display());
        }
        return Ok(CircuitRelayConfig::default());
    }

    read_from(&config_file)
}

pub fn read_from(path: &Path) -> Result<CircuitRelayConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: CircuitRelayConfig =
        serde_json::from_str(&contents).context("Failed to parse config file")?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

pub fn save_to(config: &CircuitRelayConfig, path: &Path) -> Result<()> {
    let contents = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(path, contents)
        .with_context(|| format!("Failed to write config file {}", path.display()))?;
    Ok(())
}

/// Flattened key/value view for `config show`
pub fn list(config: &CircuitRelayConfig) -> Vec<(String, String)> {
    vec![
        ("local_peer_id".to_string(), config.local_peer_id.clone()),
        ("max_relays".to_string(), config.max_relays.to_string()),
        (
            "enable_auto_relay".to_string(),
            config.enable_auto_relay.to_string(),
        ),
        ("auto_start".to_string(), config.auto_start.to_string()),
        (
            "reconnect_interval".to_string(),
            format!("{}ms", config.reconnect_interval.as_millis()),
        ),
        (
            "max_reconnect_attempts".to_string(),
            config.max_reconnect_attempts.to_string(),
        ),
        (
            "connect_timeout".to_string(),
            format!("{}ms", config.connect_timeout.as_millis()),
        ),
        (
            "reservation_timeout".to_string(),
            format!("{}ms", config.reservation_timeout.as_millis()),
        ),
        (
            "signal_endpoint".to_string(),
            config
                .signal_endpoint
                .clone()
                .unwrap_or_else(|| "(none)".to_string()),
        ),
        (
            "unique_relay_addresses".to_string(),
            config.unique_relay_addresses.to_string(),
        ),
        ("relays".to_string(), config.relays.len().to_string()),
    ]
}
