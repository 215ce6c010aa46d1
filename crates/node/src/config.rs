use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const DAY_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Unused values kept per block after a replenish.
    pub pool_size: usize,
    /// Replenish once the unused count drops to this value or below.
    pub replenish_threshold: usize,
    /// How long a promoted value stays active.
    pub window_secs: u64,
    pub tick_secs: u64,
    pub response_timeout_secs: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            pool_size: 12,
            replenish_threshold: 6,
            window_secs: 14 * DAY_SECS,
            tick_secs: 600,
            response_timeout_secs: 120,
        }
    }
}

impl VerificationConfig {
    pub fn window_ms(&self) -> u64 {
        self.window_secs.saturating_mul(1000)
    }

    pub fn response_timeout_ms(&self) -> u64 {
        self.response_timeout_secs.saturating_mul(1000)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    pub tick_secs: u64,
    pub fetch_timeout_secs: u64,
    /// Upper bound on blocks requested per tick.
    pub batch_size: usize,
    /// Time allowed for index snapshots to arrive before one is selected.
    pub discovery_secs: u64,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            tick_secs: 60,
            fetch_timeout_secs: 120,
            batch_size: 1000,
            discovery_secs: 30,
        }
    }
}

impl RestoreConfig {
    pub fn fetch_timeout_ms(&self) -> u64 {
        self.fetch_timeout_secs.saturating_mul(1000)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub reconnect_secs: u64,
    pub max_message_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            reconnect_secs: 600,
            max_message_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub peer_id: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub allow_backup_data_from_user: bool,
    #[serde(default)]
    pub allow_backup_data_to_user: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub verification: VerificationConfig,
    pub restore: RestoreConfig,
    pub network: NetworkConfig,
    pub min_replicas: usize,
    pub users: Vec<UserConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            verification: VerificationConfig::default(),
            restore: RestoreConfig::default(),
            network: NetworkConfig::default(),
            min_replicas: 2,
            users: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// A missing file means defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read node config {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse node config {}", path.display()))?;
        cfg.validate()
            .with_context(|| format!("invalid node config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw)
            .with_context(|| format!("failed to write node config {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let v = &self.verification;
        anyhow::ensure!(v.pool_size > 0, "verification.pool_size must be positive");
        anyhow::ensure!(
            v.replenish_threshold < v.pool_size,
            "verification.replenish_threshold ({}) must be below pool_size ({})",
            v.replenish_threshold,
            v.pool_size
        );
        anyhow::ensure!(v.window_secs > 0, "verification.window_secs must be positive");
        anyhow::ensure!(self.restore.batch_size > 0, "restore.batch_size must be positive");
        Ok(())
    }
}
