use crate::keys::{KeyFormat, KeyPolicy};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Discord connection settings
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DiscordConfig {
    /// Bot token. Falls back to the `DISCORD_TOKEN` environment variable.
    #[serde(default)]
    pub token: Option<String>,
}

impl DiscordConfig {
    pub fn resolve_token(&self) -> Option<String> {
        self.token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| std::env::var("DISCORD_TOKEN").ok())
            .filter(|t| !t.trim().is_empty())
    }
}

/// Which storage backend holds the registry state
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Json,
    Sqlite,
}

/// Persistence settings
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// JSON state file, or SQLite database file
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    /// Keep a `.bak` copy of the previous JSON state
    #[serde(default = "default_true")]
    pub backup: bool,
    /// Interval between retries of a failed save
    #[serde(default = "default_retry_secs")]
    pub retry_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("realmkeeper.json")
}

fn default_true() -> bool {
    true
}

fn default_retry_secs() -> u64 {
    30
}

fn default_max_connections() -> u32 {
    5
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_storage_path(),
            backup: true,
            retry_secs: default_retry_secs(),
            max_connections: default_max_connections(),
        }
    }
}

/// Shape rules for plaintext keys
#[derive(Debug, Deserialize, Clone)]
pub struct KeysConfig {
    #[serde(default = "default_max_key_length")]
    pub max_length: usize,
    #[serde(default)]
    pub format: KeyFormat,
}

fn default_max_key_length() -> usize {
    256
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            max_length: default_max_key_length(),
            format: KeyFormat::default(),
        }
    }
}

impl KeysConfig {
    pub fn policy(&self) -> KeyPolicy {
        KeyPolicy::new(self.format, self.max_length)
    }
}

/// Member-facing claim settings
#[derive(Debug, Deserialize, Clone)]
pub struct ClaimsConfig {
    /// Seconds a member must wait between claim attempts
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Initial one-key-per-member policy for newly configured communities
    #[serde(default)]
    pub one_per_member_default: bool,
    #[serde(default = "default_role_grant_retries")]
    pub role_grant_retries: u32,
}

fn default_cooldown_secs() -> u64 {
    300
}

fn default_role_grant_retries() -> u32 {
    3
}

impl Default for ClaimsConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            one_per_member_default: false,
            role_grant_retries: default_role_grant_retries(),
        }
    }
}

/// Background maintenance settings
#[derive(Debug, Deserialize, Clone)]
pub struct MaintenanceConfig {
    /// How often expired keys are swept from every pool
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_sweep_interval() -> u64 {
    3600
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Root application configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub claims: ClaimsConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            // Start with default config file
            .add_source(File::with_name("config/default").required(false))
            // Override with local config if present
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (prefix: REALMKEEPER_)
            // e.g., REALMKEEPER_STORAGE__PATH, REALMKEEPER_CLAIMS__COOLDOWN_SECS
            .add_source(
                Environment::with_prefix("REALMKEEPER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Initialize the global config singleton
    pub fn init() -> Result<&'static Self, ConfigError> {
        let config = Self::load()?;
        Ok(CONFIG.get_or_init(|| config))
    }
}
