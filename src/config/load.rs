//! Config-file loading with env overrides.

use std::fs;
use std::path::Path;

use super::schema::{ConfigError, ServerConfig};

/// Load server configuration from a toml file.
pub fn load_from(path: &Path) -> Result<ServerConfig, ConfigError> {
    let contents = fs::read_to_string(path)?;
    let mut config: ServerConfig =
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Load configuration, falling back to defaults when the file is missing
/// or unparsable.
pub fn load_or_default(path: &Path) -> ServerConfig {
    if !path.exists() {
        let mut config = ServerConfig::default();
        apply_env_overrides(&mut config);
        return config;
    }
    match load_from(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("config load failed, using defaults: {e}");
            let mut config = ServerConfig::default();
            apply_env_overrides(&mut config);
            config
        }
    }
}

fn apply_env_overrides(config: &mut ServerConfig) {
    if let Ok(value) = std::env::var("ANNAL_HEARTBEAT_MS")
        && let Ok(ms) = value.parse()
    {
        config.heartbeat_ms = ms;
    }
    if let Ok(value) = std::env::var("ANNAL_MCAST") {
        config.multicast.enabled = matches!(value.as_str(), "1" | "true" | "on");
    }
}
