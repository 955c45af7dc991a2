//! Configuration for the notevault core.
//!
//! Layering, lowest priority first:
//!
//! 1. Compiled defaults (`Default` impls below).
//! 2. An optional `notevault.toml` next to the data root.
//! 3. Environment variables (the operator surface documented in the
//!    README) — these always win.
//!
//! Every section struct is `#[serde(default)]` so a partial TOML file
//! only overrides what it mentions.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Unrecoverable configuration problem. The binary maps this to exit
/// code 64.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
    #[error("missing required setting {0}")]
    Missing(String),
    #[error("config file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of all persistent state: store.db, vectors/, git/, tmp/, logs/.
    pub data_root: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_root: "data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub remote_url: String,
    pub branch: String,
    /// "token" or "installation".
    pub auth_mode: String,
    pub token: String,
    pub app_key_path: String,
    pub app_install_id: String,
    /// Endpoint for the installation token exchange. Empty means
    /// "derive from the remote host".
    pub token_exchange_url: String,
    /// Sibling instance directories kept during garbage collection.
    pub instance_retention: usize,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            remote_url: String::new(),
            branch: "main".to_string(),
            auth_mode: "token".to_string(),
            token: String::new(),
            app_key_path: String::new(),
            app_install_id: String::new(),
            token_exchange_url: String::new(),
            instance_retention: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub primary: String,
    pub secondary: String,
    pub monthly_token_limit: u64,
    pub embed_dim: usize,
    /// IANA zone name for the monthly usage window.
    pub usage_time_zone: String,
    /// Maximum accepted audio blob, in bytes.
    pub max_audio_bytes: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            primary: "openai".to_string(),
            secondary: String::new(),
            monthly_token_limit: 1_000_000,
            embed_dim: 1536,
            usage_time_zone: "UTC".to_string(),
            max_audio_bytes: 25 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub lease_duration_ms: u64,
    /// Soft cap on pending items; enqueue above this is refused.
    pub soft_cap: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            batch_size: 10,
            batch_timeout_ms: 5_000,
            lease_duration_ms: 60_000,
            soft_cap: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// "none", "low", "medium", or "high".
    pub default_level: String,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            default_level: "medium".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub worker_concurrency: usize,
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 1,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub git: GitConfig,
    pub ai: AiConfig,
    pub queue: QueueConfig,
    pub privacy: PrivacyConfig,
    pub runtime: RuntimeConfig,
}

impl AppConfig {
    /// Load the TOML file at `path` (missing file is fine), then apply
    /// environment overrides and validate.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw).map_err(|source| ConfigError::File {
                path: path.display().to_string(),
                source,
            })?;
        }
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `$DATA_ROOT/notevault.toml` (or the default data root).
    pub fn load() -> Result<Self, ConfigError> {
        let data_root = env::var("DATA_ROOT").unwrap_or_else(|_| "data".to_string());
        Self::load_from(Path::new(&data_root).join("notevault.toml"))
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self).expect("config serializes");
        fs::write(path, rendered)?;
        Ok(())
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        override_string("DATA_ROOT", &mut self.storage.data_root);
        override_string("GIT_REMOTE_URL", &mut self.git.remote_url);
        override_string("GIT_BRANCH", &mut self.git.branch);
        override_string("GIT_AUTH_MODE", &mut self.git.auth_mode);
        override_string("GIT_TOKEN", &mut self.git.token);
        override_string("GIT_APP_KEY_PATH", &mut self.git.app_key_path);
        override_string("GIT_APP_INSTALL_ID", &mut self.git.app_install_id);
        override_string("GIT_TOKEN_EXCHANGE_URL", &mut self.git.token_exchange_url);
        override_string("AI_PRIMARY", &mut self.ai.primary);
        override_string("AI_SECONDARY", &mut self.ai.secondary);
        override_parsed("AI_MONTHLY_TOKEN_LIMIT", &mut self.ai.monthly_token_limit)?;
        override_parsed("EMBED_DIM", &mut self.ai.embed_dim)?;
        override_string("USAGE_TIME_ZONE", &mut self.ai.usage_time_zone);
        override_parsed("MAX_AUDIO_BYTES", &mut self.ai.max_audio_bytes)?;
        override_parsed("QUEUE_MAX_ATTEMPTS", &mut self.queue.max_attempts)?;
        override_parsed("QUEUE_BATCH_SIZE", &mut self.queue.batch_size)?;
        override_parsed("QUEUE_BATCH_TIMEOUT_MS", &mut self.queue.batch_timeout_ms)?;
        override_parsed("LEASE_DURATION_MS", &mut self.queue.lease_duration_ms)?;
        override_parsed("QUEUE_SOFT_CAP", &mut self.queue.soft_cap)?;
        override_string("PRIVACY_DEFAULT_LEVEL", &mut self.privacy.default_level);
        override_parsed("WORKER_CONCURRENCY", &mut self.runtime.worker_concurrency)?;
        override_string("LOG_LEVEL", &mut self.runtime.log_level);
        Ok(())
    }

    /// Reject values the rest of the system would only trip over later.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.git.auth_mode.as_str() {
            "token" | "installation" => {}
            other => {
                return Err(ConfigError::Invalid {
                    key: "GIT_AUTH_MODE".to_string(),
                    reason: format!("expected token|installation, got {other:?}"),
                });
            }
        }
        match self.privacy.default_level.as_str() {
            "none" | "low" | "medium" | "high" => {}
            other => {
                return Err(ConfigError::Invalid {
                    key: "PRIVACY_DEFAULT_LEVEL".to_string(),
                    reason: format!("expected none|low|medium|high, got {other:?}"),
                });
            }
        }
        if self.ai.embed_dim == 0 {
            return Err(ConfigError::Invalid {
                key: "EMBED_DIM".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.queue.batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "QUEUE_BATCH_SIZE".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.queue.lease_duration_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "LEASE_DURATION_MS".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.runtime.worker_concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "WORKER_CONCURRENCY".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Git auth settings must be complete for the selected mode. Kept
    /// separate from [`validate`] so read-only commands (`migrate`,
    /// `reconcile`) work without git credentials.
    pub fn validate_git(&self) -> Result<(), ConfigError> {
        if self.git.remote_url.is_empty() {
            return Err(ConfigError::Missing("GIT_REMOTE_URL".to_string()));
        }
        match self.git.auth_mode.as_str() {
            "token" if self.git.token.is_empty() => {
                Err(ConfigError::Missing("GIT_TOKEN".to_string()))
            }
            "installation" if self.git.app_key_path.is_empty() => {
                Err(ConfigError::Missing("GIT_APP_KEY_PATH".to_string()))
            }
            "installation" if self.git.app_install_id.is_empty() => {
                Err(ConfigError::Missing("GIT_APP_INSTALL_ID".to_string()))
            }
            _ => Ok(()),
        }
    }

    // ── Derived paths ────────────────────────────────────────────────────────

    pub fn data_root(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_root)
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_root().join("store.db")
    }

    pub fn vectors_dir(&self) -> PathBuf {
        self.data_root().join("vectors")
    }

    pub fn git_dir(&self) -> PathBuf {
        self.data_root().join("git")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.data_root().join("tmp")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_root().join("logs")
    }
}

fn override_string(key: &str, slot: &mut String) {
    if let Ok(value) = env::var(key) {
        if !value.is_empty() {
            *slot = value;
        }
    }
}

fn override_parsed<T: std::str::FromStr>(key: &str, slot: &mut T) -> Result<(), ConfigError> {
    if let Ok(value) = env::var(key) {
        if !value.is_empty() {
            *slot = value.parse().map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                reason: format!("cannot parse {value:?}"),
            })?;
        }
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        AppConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notevault.toml");
        fs::write(&path, "[queue]\nbatch_size = 25\n").unwrap();
        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.queue.batch_size, 25);
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.git.branch, "main");
    }

    #[test]
    fn bad_privacy_level_is_rejected() {
        let mut config = AppConfig::default();
        config.privacy.default_level = "paranoid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn git_validation_requires_token_in_token_mode() {
        let mut config = AppConfig::default();
        config.git.remote_url = "https://example.com/vault.git".to_string();
        assert!(config.validate_git().is_err());
        config.git.token = "t".to_string();
        assert!(config.validate_git().is_ok());
    }

    #[test]
    fn installation_mode_requires_key_and_install_id() {
        let mut config = AppConfig::default();
        config.git.remote_url = "https://example.com/vault.git".to_string();
        config.git.auth_mode = "installation".to_string();
        assert!(config.validate_git().is_err());
        config.git.app_key_path = "/secrets/key.pem".to_string();
        config.git.app_install_id = "42".to_string();
        assert!(config.validate_git().is_ok());
    }

    #[test]
    fn derived_paths_hang_off_data_root() {
        let mut config = AppConfig::default();
        config.storage.data_root = "/var/lib/notevault".to_string();
        assert_eq!(config.store_path(), PathBuf::from("/var/lib/notevault/store.db"));
        assert_eq!(config.vectors_dir(), PathBuf::from("/var/lib/notevault/vectors"));
        assert_eq!(config.git_dir(), PathBuf::from("/var/lib/notevault/git"));
    }
}
