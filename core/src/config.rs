//! Configuration management for Postbox

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PostboxError, PostboxResult};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where records and blobs live
    pub storage: StorageConfig,
    /// Sending domain and relay
    pub mail: MailConfig,
    /// Listing defaults
    pub query: QueryConfig,
    /// Presigned URL settings
    pub presign: PresignConfig,
    /// Caller identity settings
    pub auth: AuthConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory
    pub data_dir: PathBuf,
    /// SQLite file, relative to the data directory
    pub database_file: String,
    /// Blob root, relative to the data directory
    pub blob_dir: String,
}

/// Mail configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    /// Domain every mailbox lives under
    pub domain: String,
    /// Outbound relay
    pub smtp: SmtpConfig,
}

/// Transport security of the SMTP relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    /// Implicit TLS
    Tls,
    /// Plain connection upgraded with STARTTLS
    StartTls,
    /// Unencrypted, local relays only
    None,
}

/// SMTP relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub security: SmtpSecurity,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Query configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Page size when a request sets none
    pub default_page_size: usize,
}

/// Presigned URL configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresignConfig {
    /// Base URL blob keys are joined onto
    pub base_url: String,
    /// Signing secret
    pub secret: String,
    /// Lifetime of view/download URLs (seconds)
    pub ttl_seconds: u64,
}

/// Auth configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Identity cache lifetime (seconds)
    pub cache_ttl_seconds: u64,
    /// Identity cache size
    pub cache_capacity: usize,
    /// Phone number to mailbox prefixes, default first
    pub directory: HashMap<String, Vec<String>>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: crate::get_data_dir().unwrap_or_else(|_| PathBuf::from("~/.local/share/postbox")),
            database_file: crate::DB_FILENAME.to_string(),
            blob_dir: crate::BLOB_DIR_NAME.to_string(),
        }
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            smtp: SmtpConfig::default(),
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 587,
            security: SmtpSecurity::StartTls,
            username: None,
            password: None,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_page_size: crate::query::DEFAULT_PAGE_SIZE,
        }
    }
}

impl Default for PresignConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/blobs/".to_string(),
            secret: String::new(),
            ttl_seconds: 3600, // 1 hour
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 300,
            cache_capacity: 1024,
            directory: HashMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(config_path: &Path) -> PostboxResult<Self> {
        let content = std::fs::read_to_string(config_path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from file, or the defaults if there is none
    pub fn load_or_default(config_path: &Path) -> PostboxResult<Self> {
        if config_path.exists() {
            Self::load(config_path)
        } else {
            tracing::debug!("No configuration at {}, using defaults", config_path.display());
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, config_path: &Path) -> PostboxResult<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    /// Apply environment overrides on top of `self`
    pub fn with_env(mut self) -> Self {
        if let Ok(data_dir) = std::env::var("POSTBOX_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(domain) = std::env::var("POSTBOX_DOMAIN") {
            self.mail.domain = domain;
        }

        if let Ok(host) = std::env::var("POSTBOX_SMTP_HOST") {
            self.mail.smtp.host = host;
        }

        if let Ok(port) = std::env::var("POSTBOX_SMTP_PORT") {
            if let Ok(port) = port.parse() {
                self.mail.smtp.port = port;
            }
        }

        if let Ok(secret) = std::env::var("POSTBOX_PRESIGN_SECRET") {
            self.presign.secret = secret;
        }

        if let Ok(page_size) = std::env::var("POSTBOX_PAGE_SIZE") {
            if let Ok(size) = page_size.parse() {
                self.query.default_page_size = size;
            }
        }

        self
    }

    /// Get the default configuration file path
    pub fn default_path() -> PostboxResult<PathBuf> {
        Ok(crate::get_config_dir()?.join(crate::CONFIG_FILENAME))
    }

    /// Get the database file path
    pub fn database_file_path(&self) -> PathBuf {
        self.storage.data_dir.join(&self.storage.database_file)
    }

    /// Get the blob root directory
    pub fn blob_dir(&self) -> PathBuf {
        self.storage.data_dir.join(&self.storage.blob_dir)
    }

    pub fn url_ttl(&self) -> Duration {
        Duration::from_secs(self.presign.ttl_seconds)
    }

    pub fn auth_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.auth.cache_ttl_seconds)
    }

    /// Validate the configuration
    pub fn validate(&self) -> PostboxResult<()> {
        if !self.storage.data_dir.exists() {
            std::fs::create_dir_all(&self.storage.data_dir)
                .map_err(|_| PostboxError::DataDirCreateFailed(self.storage.data_dir.clone()))?;
        }

        if self.mail.domain.is_empty() || self.mail.domain.contains('@') {
            return Err(PostboxError::config("Mail domain must be a bare domain"));
        }

        if self.query.default_page_size == 0 {
            return Err(PostboxError::config("Default page size cannot be zero"));
        }

        if self.presign.secret.is_empty() {
            return Err(PostboxError::config("Presign secret must be set"));
        }

        if self.presign.ttl_seconds == 0 {
            return Err(PostboxError::config("Presigned URL lifetime cannot be zero"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn valid(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.storage.data_dir = dir.path().join("data");
        config.mail.domain = "x.org".to_string();
        config.presign.secret = "s3cret".to_string();
        config
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.query.default_page_size, 50);
        assert_eq!(config.presign.ttl_seconds, 3600);
        assert_eq!(config.mail.smtp.security, SmtpSecurity::StartTls);
        assert!(config.auth.directory.is_empty());
    }

    #[test]
    fn test_config_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let mut config = valid(&temp_dir);
        config.auth.directory.insert("+15550001".to_string(), vec!["jane".to_string()]);
        config.mail.smtp.security = SmtpSecurity::Tls;

        config.save(&config_path).unwrap();
        assert!(config_path.exists());

        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(loaded.mail.domain, "x.org");
        assert_eq!(loaded.mail.smtp.security, SmtpSecurity::Tls);
        assert_eq!(loaded.auth.directory["+15550001"], vec!["jane".to_string()]);
    }

    #[test]
    fn test_partial_file_and_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let defaults = Config::load_or_default(&config_path).unwrap();
        assert_eq!(defaults.mail.domain, "localhost");

        std::fs::write(&config_path, "[mail]\ndomain = \"y.org\"\n").unwrap();
        let partial = Config::load_or_default(&config_path).unwrap();
        assert_eq!(partial.mail.domain, "y.org");
        assert_eq!(partial.mail.smtp.port, 587);
    }

    #[test]
    fn test_config_validation() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = valid(&temp_dir);
        assert!(config.validate().is_ok());
        assert!(config.storage.data_dir.exists());

        config.presign.secret.clear();
        assert!(config.validate().is_err());

        let mut config = valid(&temp_dir);
        config.mail.domain = "me@x.org".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_from_env() {
        std::env::set_var("POSTBOX_DOMAIN", "env.org");
        std::env::set_var("POSTBOX_PAGE_SIZE", "25");

        let config = Config::default().with_env();
        assert_eq!(config.mail.domain, "env.org");
        assert_eq!(config.query.default_page_size, 25);

        std::env::remove_var("POSTBOX_DOMAIN");
        std::env::remove_var("POSTBOX_PAGE_SIZE");
    }
}
