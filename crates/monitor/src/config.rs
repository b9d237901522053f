//! Monitor configuration management

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use common::{DeviceFilter, IdentityScope};
use serde::{Deserialize, Serialize};

use crate::usb::RetryPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Device filters (`[!]0xVID:0xPID`, `*` wildcard, `!` excludes)
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub polling: PollingSettings,
    #[serde(default)]
    pub open_retry: OpenRetrySettings,
    #[serde(default)]
    pub permission: PermissionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "MonitorSettings::default_log_level")]
    pub log_level: String,
    /// Which optional fields key the permission cache and registry
    #[serde(default)]
    pub identity_scope: IdentityScope,
    /// Install state file; defaults to the user's local data directory
    #[serde(default)]
    pub state_path: Option<String>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            identity_scope: IdentityScope::default(),
            state_path: None,
        }
    }
}

impl MonitorSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

/// How the poller decides which devices are newly attached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffPolicy {
    /// Report every matched device when the device count or the number of
    /// permitted devices grew. A swap with an unchanged count goes unseen.
    CountOnly,
    /// Report devices whose node name is new or whose permission flipped
    #[default]
    SetDifference,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingSettings {
    /// Delay before the first tick after registering
    #[serde(default = "PollingSettings::default_initial_delay")]
    pub initial_delay_ms: u64,
    /// Interval after a tick that saw a change
    #[serde(default = "PollingSettings::default_fast_interval")]
    pub fast_interval_ms: u64,
    /// Interval once the topology is stable
    #[serde(default = "PollingSettings::default_slow_interval")]
    pub slow_interval_ms: u64,
    #[serde(default)]
    pub diff_policy: DiffPolicy,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: Self::default_initial_delay(),
            fast_interval_ms: Self::default_fast_interval(),
            slow_interval_ms: Self::default_slow_interval(),
            diff_policy: DiffPolicy::default(),
        }
    }
}

impl PollingSettings {
    fn default_initial_delay() -> u64 {
        100
    }

    fn default_fast_interval() -> u64 {
        500
    }

    fn default_slow_interval() -> u64 {
        5000
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn fast_interval(&self) -> Duration {
        Duration::from_millis(self.fast_interval_ms)
    }

    pub fn slow_interval(&self) -> Duration {
        Duration::from_millis(self.slow_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRetrySettings {
    #[serde(default = "OpenRetrySettings::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "OpenRetrySettings::default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "OpenRetrySettings::default_backoff_step")]
    pub backoff_step_ms: u64,
}

impl Default for OpenRetrySettings {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            initial_backoff_ms: Self::default_initial_backoff(),
            backoff_step_ms: Self::default_backoff_step(),
        }
    }
}

impl OpenRetrySettings {
    fn default_max_retries() -> u32 {
        3
    }

    fn default_initial_backoff() -> u64 {
        500
    }

    fn default_backoff_step() -> u64 {
        200
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_backoff_ms),
            delay_step: Duration::from_millis(self.backoff_step_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionSettings {
    /// Delay before the single retry after a first-activation denial
    #[serde(default = "PermissionSettings::default_first_activation_retry")]
    pub first_activation_retry_ms: u64,
    /// Reset cached permission and close the block before the first request
    #[serde(default = "PermissionSettings::default_reset")]
    pub reset_on_first_activation: bool,
    /// Pause after such a reset before requesting
    #[serde(default = "PermissionSettings::default_reset_settle")]
    pub reset_settle_ms: u64,
}

impl Default for PermissionSettings {
    fn default() -> Self {
        Self {
            first_activation_retry_ms: Self::default_first_activation_retry(),
            reset_on_first_activation: Self::default_reset(),
            reset_settle_ms: Self::default_reset_settle(),
        }
    }
}

impl PermissionSettings {
    fn default_first_activation_retry() -> u64 {
        500
    }

    fn default_reset() -> bool {
        true
    }

    fn default_reset_settle() -> u64 {
        300
    }

    pub fn first_activation_retry(&self) -> Duration {
        Duration::from_millis(self.first_activation_retry_ms)
    }

    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }
}

impl MonitorConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-session/monitor.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: MonitorConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-session").join("monitor.toml")
        } else {
            PathBuf::from(".config/usb-session/monitor.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.monitor.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.monitor.log_level,
                valid_levels.join(", ")
            ));
        }

        self.parsed_filters()?;

        let polling = &self.polling;
        if polling.fast_interval_ms == 0 || polling.slow_interval_ms == 0 {
            return Err(anyhow!("Polling intervals must be greater than 0"));
        }
        if polling.fast_interval_ms > polling.slow_interval_ms {
            return Err(anyhow!(
                "fast_interval_ms ({}) must not exceed slow_interval_ms ({})",
                polling.fast_interval_ms,
                polling.slow_interval_ms
            ));
        }

        Ok(())
    }

    /// Parse the filter strings
    pub fn parsed_filters(&self) -> Result<Vec<DeviceFilter>> {
        self.filters
            .iter()
            .map(|f| f.parse::<DeviceFilter>().map_err(|e| anyhow!(e)))
            .collect()
    }

    /// Install state path with `~` expanded
    pub fn state_path(&self) -> PathBuf {
        match &self.monitor.state_path {
            Some(path) => PathBuf::from(shellexpand::tilde(path).as_ref()),
            None => crate::install_state::InstallState::default_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MonitorConfig::default();
        assert_eq!(config.monitor.log_level, "info");
        assert_eq!(config.monitor.identity_scope, IdentityScope::Extended);
        assert!(config.filters.is_empty());
        assert_eq!(config.polling.diff_policy, DiffPolicy::SetDifference);
        assert_eq!(config.open_retry.policy(), RetryPolicy::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_filters() {
        let mut config = MonitorConfig::default();
        config.filters = vec!["0x1234:*".into(), "!0x1234:0x0001".into()];
        assert!(config.validate().is_ok());
        assert_eq!(config.parsed_filters().unwrap().len(), 2);

        config.filters.push("1234:5678".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = MonitorConfig::default();
        config.monitor.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.monitor.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_intervals() {
        let mut config = MonitorConfig::default();
        config.polling.fast_interval_ms = 6000;
        assert!(config.validate().is_err());

        config.polling.fast_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = MonitorConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: MonitorConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.monitor.log_level, parsed.monitor.log_level);
        assert_eq!(config.polling.slow_interval_ms, parsed.polling.slow_interval_ms);
    }

    #[test]
    fn test_state_path_expands_tilde() {
        let mut config = MonitorConfig::default();
        config.monitor.state_path = Some("~/usb-state.json".into());

        let path = config.state_path();
        assert!(!path.to_string_lossy().starts_with('~'));
        assert!(path.ends_with("usb-state.json"));
    }
}
