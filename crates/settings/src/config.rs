//! Configuration types

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use sharecraft_core::PoolDescriptor;
use sharecraft_keystore::{default_data_dir, default_key_path};

use crate::{default_settings_path, Result, SettingsError};

/// Main settings structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub ledger: LedgerSettings,

    #[serde(default)]
    pub census: CensusSettings,

    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Pools the pipeline runs for
    #[serde(default)]
    pub pools: Vec<PoolDescriptor>,

    /// Custom settings file path (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

impl Settings {
    /// Load settings from the default path, or create defaults
    pub fn load_or_default() -> Result<Self> {
        Self::load_from(&default_settings_path())
    }

    /// Load settings from a specific path, or create defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path).map_err(SettingsError::ReadError)?;
            let mut settings: Settings =
                serde_json::from_str(&content).map_err(SettingsError::ParseError)?;
            settings.config_path = Some(path.to_path_buf());
            info!("Loaded settings from {:?}", path);
            Ok(settings)
        } else {
            Ok(Self {
                config_path: Some(path.to_path_buf()),
                ..Self::default()
            })
        }
    }

    /// Save settings to the configured path
    pub fn save(&self) -> Result<()> {
        let path = self.config_path.clone().unwrap_or_else(default_settings_path);
        self.save_to(&path)
    }

    /// Save settings to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(SettingsError::CreateDirError)?;
            }
        }

        let content = serde_json::to_string_pretty(self).map_err(SettingsError::ParseError)?;
        std::fs::write(path, content).map_err(SettingsError::WriteError)?;
        info!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(SettingsError::Invalid(msg));

        if self.pipeline.batch_size == 0 {
            return invalid("pipeline.batch_size must be at least 1".to_string());
        }
        if self.ledger.network_passphrase.trim().is_empty() {
            return invalid("ledger.network_passphrase must not be empty".to_string());
        }
        if self.pipeline.lease_timeout_secs == 0 {
            return invalid("pipeline.lease_timeout_secs must be at least 1".to_string());
        }
        if self.census.page_limit == 0 {
            return invalid("census.page_limit must be at least 1".to_string());
        }
        if self.pools.is_empty() {
            return invalid("no pools configured".to_string());
        }

        let mut seen = HashSet::new();
        for pool in &self.pools {
            if !seen.insert(pool.index) {
                return invalid(format!("pool index {} listed twice", pool.index));
            }
            if let Err(e) = pool.pool_id_bytes() {
                return invalid(format!("pool {}: {}", pool.index, e));
            }
        }
        Ok(())
    }

    pub fn pool(&self, index: u32) -> Option<&PoolDescriptor> {
        self.pools.iter().find(|p| p.index == index)
    }
}

/// Which ledger the settlement client talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LedgerMode {
    /// Local mock ledger persisted under the data directory
    #[default]
    Mock,
    /// Soroban RPC endpoint
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSettings {
    #[serde(default)]
    pub mode: LedgerMode,

    /// Transactions are signed for this network; a mock ledger keeps the
    /// passphrase it was created with
    #[serde(default = "default_passphrase")]
    pub network_passphrase: String,

    #[serde(default = "default_admin_key")]
    pub admin_key_path: String,

    #[serde(default = "default_submit_timeout")]
    pub submit_timeout_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Mock ledger state file; defaults to `<data_dir>/mock-ledger.bin`
    #[serde(default)]
    pub mock_state_path: Option<String>,
}

fn default_passphrase() -> String {
    "Test SDF Network ; September 2015".to_string()
}

fn default_admin_key() -> String {
    default_key_path().display().to_string()
}

fn default_submit_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    1000
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            mode: LedgerMode::default(),
            network_passphrase: default_passphrase(),
            admin_key_path: default_admin_key(),
            submit_timeout_secs: default_submit_timeout(),
            poll_interval_ms: default_poll_interval(),
            mock_state_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CensusSettings {
    #[serde(default = "default_explorer_url")]
    pub explorer_url: String,

    #[serde(default = "default_horizon_url")]
    pub horizon_url: String,

    #[serde(default = "default_page_limit")]
    pub page_limit: u32,

    #[serde(default = "default_request_delay")]
    pub request_delay_ms: u64,

    #[serde(default = "default_min_retry_after")]
    pub min_retry_after_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,

    /// Page cap for `pools discover`
    #[serde(default = "default_discovery_pages")]
    pub max_discovery_pages: u32,
}

fn default_explorer_url() -> String {
    "https://api.stellar.expert/explorer/public".to_string()
}

fn default_horizon_url() -> String {
    "https://horizon.stellar.org".to_string()
}

fn default_page_limit() -> u32 {
    50
}

fn default_request_delay() -> u64 {
    500
}

fn default_min_retry_after() -> u64 {
    5000
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    1000
}

fn default_max_backoff() -> u64 {
    10_000
}

fn default_http_timeout() -> u64 {
    30
}

fn default_discovery_pages() -> u32 {
    100
}

impl Default for CensusSettings {
    fn default() -> Self {
        Self {
            explorer_url: default_explorer_url(),
            horizon_url: default_horizon_url(),
            page_limit: default_page_limit(),
            request_delay_ms: default_request_delay(),
            min_retry_after_ms: default_min_retry_after(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            timeout_secs: default_http_timeout(),
            max_discovery_pages: default_discovery_pages(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Balance updates per ledger transaction
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_retries")]
    pub max_batch_retries: u32,

    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_root_submissions")]
    pub max_root_submissions: u32,

    /// Proofs, manifests, journals and the history log live here
    #[serde(default = "default_data_dir_string")]
    pub data_dir: String,

    /// A pool lease older than this is assumed abandoned by a crashed run
    #[serde(default = "default_lease_timeout")]
    pub lease_timeout_secs: u64,
}

fn default_batch_size() -> usize {
    25
}

fn default_batch_retries() -> u32 {
    5
}

fn default_retry_backoff() -> u64 {
    2000
}

fn default_root_submissions() -> u32 {
    3
}

fn default_lease_timeout() -> u64 {
    3600
}

fn default_data_dir_string() -> String {
    default_data_dir().display().to_string()
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_batch_retries: default_batch_retries(),
            retry_backoff_ms: default_retry_backoff(),
            max_root_submissions: default_root_submissions(),
            data_dir: default_data_dir_string(),
            lease_timeout_secs: default_lease_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pool(index: u32) -> PoolDescriptor {
        PoolDescriptor {
            index,
            pool_id: "ab".repeat(32),
            label: String::new(),
        }
    }

    fn valid() -> Settings {
        Settings {
            pools: vec![pool(0), pool(1)],
            ..Settings::default()
        }
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.ledger.mode, LedgerMode::Mock);
        assert_eq!(settings.census.page_limit, 50);
        assert_eq!(settings.pipeline.batch_size, 25);
        assert!(settings.pools.is_empty());
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let json = r#"{
            "ledger": { "mode": "live", "network_passphrase": "Site Net" },
            "pools": [ { "index": 3, "pool_id": "abababababababababababababababababababababababababababababababab" } ]
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.ledger.mode, LedgerMode::Live);
        assert_eq!(settings.ledger.network_passphrase, "Site Net");
        assert_eq!(settings.ledger.submit_timeout_secs, 30);
        assert_eq!(settings.pipeline.lease_timeout_secs, 3600);
        assert_eq!(settings.census.max_discovery_pages, 100);
        assert_eq!(settings.census.max_retries, 5);
        assert_eq!(settings.pools[0].index, 3);
        assert_eq!(settings.pools[0].name(), "pool-3");
        settings.validate().unwrap();
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = valid();
        settings.pipeline.batch_size = 10;
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.pipeline.batch_size, 10);
        assert_eq!(loaded.pools.len(), 2);
        assert_eq!(loaded.config_path(), Some(path.as_path()));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load_from(&dir.path().join("absent.json")).unwrap();
        assert!(settings.pools.is_empty());
    }

    #[test]
    fn test_validate_rejections() {
        assert!(valid().validate().is_ok());

        let mut zero_batch = valid();
        zero_batch.pipeline.batch_size = 0;
        assert!(matches!(zero_batch.validate(), Err(SettingsError::Invalid(_))));

        let no_pools = Settings::default();
        assert!(no_pools.validate().is_err());

        let mut duplicate = valid();
        duplicate.pools.push(pool(1));
        assert!(duplicate.validate().is_err());

        let mut no_network = valid();
        no_network.ledger.network_passphrase = " ".to_string();
        assert!(no_network.validate().is_err());

        let mut no_lease = valid();
        no_lease.pipeline.lease_timeout_secs = 0;
        assert!(no_lease.validate().is_err());

        let mut bad_id = valid();
        bad_id.pools[0].pool_id = "xyz".to_string();
        assert!(bad_id.validate().is_err());
    }
}
