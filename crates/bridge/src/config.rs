use std::path::Path;

use anyhow::{Context, Result};
use bridge_protocol::BridgeConfig;

/// Load configuration from a TOML file at the given path, then overlay the
/// `API_KEY` environment variable (if set) on top of whatever the file
/// provided — the one required secret, so it always has an
/// environment-variable escape hatch independent of the file.
pub fn load_config(path: &Path) -> Result<BridgeConfig> {
    let mut config = if !path.exists() {
        tracing::warn!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        BridgeConfig::default()
    } else {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: BridgeConfig =
            toml::from_str(&contents).with_context(|| "Failed to parse config TOML")?;
        tracing::info!("Loaded config from {}", path.display());
        config
    };

    if let Ok(key) = std::env::var("API_KEY")
        && !key.is_empty()
    {
        config.api_key = key;
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_returns_defaults() {
        let config = load_config(Path::new("/nonexistent/doorbell.toml")).unwrap();
        assert_eq!(config.http.port, 8090);
        assert_eq!(config.sip.port, 5070);
    }
}
