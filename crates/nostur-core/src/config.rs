use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    ACCOUNT_SWITCH_DEBOUNCE, DEFAULT_RELAYS, DEFAULT_TASK_TIMEOUT, FOLLOWER_LOOKBACK_SECS,
    FOLLOWER_METADATA_PREFETCH, FOLLOWER_SCAN_INTERVAL, FOLLOWER_SCAN_STARTUP_DELAY,
    NEW_FOLLOWERS_DEBOUNCE,
};
use crate::relay::RelayDescriptor;

/// Timings and limits of the follower notifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifierConfig {
    pub new_followers_debounce: Duration,
    pub account_switch_debounce: Duration,
    pub startup_delay: Duration,
    pub rescan_interval: Duration,
    pub lookback_secs: u64,
    pub metadata_prefetch: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            new_followers_debounce: NEW_FOLLOWERS_DEBOUNCE,
            account_switch_debounce: ACCOUNT_SWITCH_DEBOUNCE,
            startup_delay: FOLLOWER_SCAN_STARTUP_DELAY,
            rescan_interval: FOLLOWER_SCAN_INTERVAL,
            lookback_secs: FOLLOWER_LOOKBACK_SECS,
            metadata_prefetch: FOLLOWER_METADATA_PREFETCH,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub data_dir: PathBuf,
    pub relays: Vec<RelayDescriptor>,
    pub task_timeout: Duration,
    pub notifier: NotifierConfig,
}

impl CoreConfig {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            relays: DEFAULT_RELAYS
                .iter()
                .map(|url| RelayDescriptor::new(url))
                .collect(),
            task_timeout: DEFAULT_TASK_TIMEOUT,
            notifier: NotifierConfig::default(),
        }
    }

    pub fn with_relays(mut self, relays: Vec<RelayDescriptor>) -> Self {
        if !relays.is_empty() {
            self.relays = relays;
        }
        self
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .map(|dir| dir.join("nostur"))
            .unwrap_or_else(|| PathBuf::from("nostur_data"));
        Self::new(data_dir)
    }
}

/// On-disk configuration file (JSON, camelCase keys)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub relays: Vec<RelayDescriptor>,

    /// Disables non-essential network fetching
    #[serde(default)]
    pub low_data_mode: bool,

    /// When set, new followers must be on `trusted_pubkeys` to be surfaced
    #[serde(default)]
    pub wot_filter_enabled: bool,

    #[serde(default)]
    pub trusted_pubkeys: HashSet<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_timeout_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize config")
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Resolve into the runtime config, falling back to defaults for unset fields
    pub fn core_config(&self) -> CoreConfig {
        let mut config = match &self.data_dir {
            Some(dir) => CoreConfig::new(dir),
            None => CoreConfig::default(),
        }
        .with_relays(self.relays.clone());
        if let Some(secs) = self.task_timeout_secs {
            config.task_timeout = Duration::from_secs(secs);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config_uses_defaults() {
        let config = FileConfig::from_json("{}").unwrap();
        assert!(config.relays.is_empty());
        assert!(!config.low_data_mode);

        let core = config.core_config();
        assert_eq!(core.relays.len(), DEFAULT_RELAYS.len());
        assert_eq!(core.task_timeout, DEFAULT_TASK_TIMEOUT);
    }

    #[test]
    fn test_parse_config_with_relays_and_flags() {
        let json = r#"{
            "dataDir": "/tmp/nostur-test",
            "relays": [
                {"url": "wss://Relay.Example.com", "read": true, "write": false},
                {"url": "wss://write.example.com", "read": false, "write": true, "search": true}
            ],
            "lowDataMode": true,
            "wotFilterEnabled": true,
            "trustedPubkeys": ["abc"],
            "taskTimeoutSecs": 8
        }"#;
        let config = FileConfig::from_json(json).unwrap();
        assert!(config.low_data_mode);
        assert!(config.wot_filter_enabled);
        assert!(config.trusted_pubkeys.contains("abc"));

        let core = config.core_config();
        assert_eq!(core.data_dir, PathBuf::from("/tmp/nostur-test"));
        assert_eq!(core.relays.len(), 2);
        assert_eq!(core.relays[0].url, "wss://relay.example.com");
        assert!(core.relays[0].read && !core.relays[0].write);
        assert!(core.relays[1].search);
        assert_eq!(core.task_timeout, Duration::from_secs(8));
    }

    #[test]
    fn test_notifier_defaults_match_constants() {
        let notifier = NotifierConfig::default();
        assert_eq!(notifier.lookback_secs, 259_200);
        assert_eq!(notifier.new_followers_debounce, Duration::from_secs(5));
        assert_eq!(notifier.account_switch_debounce, Duration::from_secs(20));
        assert_eq!(notifier.metadata_prefetch, 10);
    }
}
