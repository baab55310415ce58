//! CLI configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use courier_delivery::DeliveryConfig;

/// CLI configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Emit JSON log lines
    pub json_logs: bool,
    /// Delivery core settings
    pub delivery: DeliveryConfig,
}

impl CliConfig {
    /// Default location under the user's config directory
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("courier")
            .join("config.toml")
    }

    /// Load config from file or create default
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: CliConfig = toml::from_str(&content)?;
            config
                .delivery
                .validate()
                .map_err(|e| anyhow::anyhow!("invalid config {}: {}", path.display(), e))?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: CliConfig = toml::from_str(
            r#"
            [delivery]
            direct_timeout_ms = 1500

            [delivery.retry]
            max_retries = 5
            "#,
        )
        .unwrap();

        assert!(!config.json_logs);
        assert_eq!(config.delivery.direct_timeout_ms, 1500);
        assert_eq!(config.delivery.relay_timeout_ms, 8000);
        assert_eq!(config.delivery.retry.max_retries, 5);
    }

    #[test]
    fn test_default_roundtrips_through_toml() {
        let text = toml::to_string_pretty(&CliConfig::default()).unwrap();
        let parsed: CliConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.delivery.max_live_attempts, 3);
    }
}
