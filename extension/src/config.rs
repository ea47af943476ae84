use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::protocol::ProviderInfo;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle: IdleConfig,
    pub popup: PopupConfig,
    pub blacklist: BlacklistConfig,
    pub network: NetworkConfig,
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdleStrategy {
    /// Host idle API (chrome.idle); coarse, survives suspension
    System,
    /// Window-level input polling inside the extension
    App,
}

/// What the idle machine settles to when a transition handler fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    FailOpen,
    FailClosed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    pub strategy: IdleStrategy,
    pub threshold_ms: u64,
    pub lock_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub failure_policy: FailurePolicy,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            strategy: IdleStrategy::System,
            threshold_ms: 180_000,
            lock_delay_ms: 60_000,
            poll_interval_ms: 5_000,
            failure_policy: FailurePolicy::FailOpen,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PopupConfig {
    /// Extension page hosting every popup route
    pub base_url: String,
    pub width: i32,
    pub height: i32,
    /// Identical showRoute calls within this window focus once
    pub focus_debounce_ms: u64,
    /// Used when the host cannot report screen bounds
    pub fallback_screen_width: i32,
    pub fallback_screen_height: i32,
}

impl Default for PopupConfig {
    fn default() -> Self {
        Self {
            base_url: "index.html".to_string(),
            width: 428,
            height: 926,
            focus_debounce_ms: 500,
            fallback_screen_width: 1920,
            fallback_screen_height: 1080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlacklistConfig {
    pub warning_page: String,
    pub override_ttl_ms: u64,
}

impl Default for BlacklistConfig {
    fn default() -> Self {
        Self {
            warning_page: "phishing.html".to_string(),
            override_ttl_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Chain reported before the user has selected one
    pub default_chain_id: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            default_chain_id: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub uuid: String,
    pub name: String,
    pub icon: String,
    pub rdns: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            uuid: "6f2b3d5e-6a1c-4c8e-9a51-3f0d8b7c2e14".to_string(),
            name: "YAKKL Smart Wallet".to_string(),
            icon: "images/logoBullFav128x128.png".to_string(),
            rdns: "com.yakkl".to_string(),
        }
    }
}

impl ProviderConfig {
    pub fn info(&self) -> ProviderInfo {
        ProviderInfo {
            uuid: self.uuid.clone(),
            name: self.name.clone(),
            icon: self.icon.clone(),
            rdns: self.rdns.clone(),
        }
    }
}

impl SessionConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Load `path` if it exists, defaults otherwise
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.idle.threshold_ms == 0 {
            anyhow::bail!("idle.threshold_ms must be greater than zero");
        }
        if self.idle.strategy == IdleStrategy::App && self.idle.poll_interval_ms == 0 {
            anyhow::bail!("idle.poll_interval_ms must be greater than zero for the app strategy");
        }
        if self.popup.width <= 0 || self.popup.height <= 0 {
            anyhow::bail!(
                "Invalid popup size {}x{}",
                self.popup.width,
                self.popup.height
            );
        }
        if self.network.default_chain_id == 0 {
            anyhow::bail!("network.default_chain_id must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::from_toml_str("").unwrap();
        assert_eq!(config.idle.threshold_ms, 180_000);
        assert_eq!(config.idle.strategy, IdleStrategy::System);
        assert_eq!(config.idle.failure_policy, FailurePolicy::FailOpen);
        assert_eq!(config.network.default_chain_id, 1);
    }

    #[test]
    fn test_partial_sections() {
        let config = SessionConfig::from_toml_str(
            r#"
            [idle]
            strategy = "app"
            lock_delay_ms = 0
            failure_policy = "fail-closed"

            [popup]
            width = 400
            "#,
        )
        .unwrap();
        assert_eq!(config.idle.strategy, IdleStrategy::App);
        assert_eq!(config.idle.lock_delay_ms, 0);
        assert_eq!(config.idle.threshold_ms, 180_000);
        assert_eq!(config.idle.failure_policy, FailurePolicy::FailClosed);
        assert_eq!(config.popup.width, 400);
        assert_eq!(config.popup.height, 926);
    }

    #[test]
    fn test_invalid_threshold() {
        assert!(SessionConfig::from_toml_str("[idle]\nthreshold_ms = 0\n").is_err());
    }
}
