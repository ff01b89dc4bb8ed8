use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration file not found at {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Invalid(String),

    #[error("TOML deserialization error: {0}")]
    TomlDe(String),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),
}

/// Top-level configuration stored as TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NimbusConfig {
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub local: LocalSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Bus name the provider service registers under.
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Entries per generation of the peer credentials cache.
    #[serde(default = "default_credentials_cache_size")]
    pub credentials_cache_size: usize,
    /// Upper bound on a single peer credentials lookup.
    #[serde(default = "default_credentials_timeout_ms")]
    pub credentials_timeout_ms: u64,
    /// Upper bound on account authentication before queued calls are failed.
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    /// Chunk size for streaming channel reads and writes.
    #[serde(default = "default_transfer_chunk_size")]
    pub transfer_chunk_size: usize,
    /// Stop serving after this long without calls or transfers. Zero keeps
    /// the provider running.
    #[serde(default)]
    pub idle_timeout_ms: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            credentials_cache_size: default_credentials_cache_size(),
            credentials_timeout_ms: default_credentials_timeout_ms(),
            auth_timeout_ms: default_auth_timeout_ms(),
            transfer_chunk_size: default_transfer_chunk_size(),
            idle_timeout_ms: 0,
        }
    }
}

impl ProviderSettings {
    pub fn credentials_timeout(&self) -> Duration {
        Duration::from_millis(self.credentials_timeout_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalSettings {
    /// Root directory served by the local backend.
    #[serde(default)]
    pub root: Option<String>,
    /// Entries returned per `list` page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            root: None,
            page_size: default_page_size(),
        }
    }
}

fn default_service_name() -> String {
    "com.nimbus.Provider".to_string()
}

fn default_credentials_cache_size() -> usize {
    50
}

fn default_credentials_timeout_ms() -> u64 {
    5_000
}

fn default_auth_timeout_ms() -> u64 {
    30_000
}

fn default_transfer_chunk_size() -> usize {
    64 * 1024
}

fn default_page_size() -> usize {
    100
}

impl NimbusConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| ConfigError::TomlDe(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Save config to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::TomlSer(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Resolve the config file path: `<config_dir>/nimbus/nimbus.toml`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|d| d.join("nimbus").join("nimbus.toml"))
            .ok_or_else(|| ConfigError::Invalid("Cannot determine config directory".to_string()))
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.provider.credentials_cache_size == 0 {
            return Err(ConfigError::Invalid(
                "credentials_cache_size must be at least 1".to_string(),
            ));
        }
        if self.provider.transfer_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "transfer_chunk_size must be at least 1".to_string(),
            ));
        }
        if self.local.page_size == 0 {
            return Err(ConfigError::Invalid("page_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn roundtrip_config() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nimbus.toml");
        let mut config = NimbusConfig::default();
        config.local.root = Some("/srv/files".to_string());
        config.save(&path).unwrap();
        let loaded = NimbusConfig::load(&path).unwrap();
        assert_eq!(loaded.local.root.as_deref(), Some("/srv/files"));
        assert_eq!(loaded.provider.credentials_cache_size, 50);
    }

    #[test]
    fn missing_sections_use_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nimbus.toml");
        std::fs::write(&path, "[provider]\nauth_timeout_ms = 10\n").unwrap();
        let loaded = NimbusConfig::load(&path).unwrap();
        assert_eq!(loaded.provider.auth_timeout(), Duration::from_millis(10));
        assert_eq!(loaded.provider.transfer_chunk_size, 65536);
        assert_eq!(loaded.local.page_size, 100);
        assert_eq!(loaded.provider.idle_timeout(), None);
    }

    #[test]
    fn idle_timeout_is_read_in_milliseconds() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nimbus.toml");
        std::fs::write(&path, "[provider]\nidle_timeout_ms = 30000\n").unwrap();
        let loaded = NimbusConfig::load(&path).unwrap();
        assert_eq!(loaded.provider.idle_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn zero_cache_size_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nimbus.toml");
        std::fs::write(&path, "[provider]\ncredentials_cache_size = 0\n").unwrap();
        assert!(matches!(
            NimbusConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn load_nonexistent_returns_error() {
        let result = NimbusConfig::load(Path::new("/nonexistent/nimbus.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }
}
