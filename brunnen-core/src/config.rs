//! Configuration management for the Brunnen server
//!
//! The config file is JSON (or TOML, picked by the `.toml` extension) and is
//! looked up in this order:
//! - the path given on the command line / `BRUNNEN_CONFIG`
//! - `./config.json`
//! - `./defaults/config.json`
//! - `<platform config dir>/brunnen/config.json`
//!
//! Missing files fall through to built-in defaults. Secrets never live in
//! the file; they come from the environment.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{SettingKey, Settings};
use crate::sync::SyncSettings;

/// Environment variable holding the InfluxDB API token
pub const ENV_DATABASE_TOKEN: &str = "INFLUXDB_TOKEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Failed to parse config: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    /// Settings served to the device until an operator or the device
    /// stores its own
    #[serde(default = "default_brunnen")]
    pub brunnen: Settings,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Browser session lifetime in seconds
    #[serde(default = "default_session_ttl")]
    pub session_ttl: u64,

    /// Where uploaded firmware images are kept
    #[serde(default = "default_firmware_dir")]
    pub firmware_dir: PathBuf,

    /// Largest accepted request body in bytes
    #[serde(default = "default_max_upload")]
    pub max_upload_bytes: usize,
}

/// Which storage backend to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Influx,
    Memory,
}

/// Time-series database connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: Backend,

    /// Base URL including scheme, e.g. `http://localhost`
    #[serde(default = "default_db_host")]
    pub host: String,

    #[serde(default = "default_db_port")]
    pub port: u16,

    #[serde(default = "default_organization")]
    pub organization: String,

    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Request timeout in seconds
    #[serde(default = "default_db_timeout")]
    pub timeout: u64,

    /// API token, only ever read from `INFLUXDB_TOKEN`
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    crate::DEFAULT_PORT
}
fn default_session_ttl() -> u64 {
    43_200 // 12 hours
}
fn default_firmware_dir() -> PathBuf {
    PathBuf::from("firmware")
}
fn default_max_upload() -> usize {
    16 * 1024 * 1024
}
fn default_db_host() -> String {
    "http://localhost".to_string()
}
fn default_db_port() -> u16 {
    8086
}
fn default_organization() -> String {
    "Private".to_string()
}
fn default_bucket() -> String {
    "Brunnen".to_string()
}
fn default_db_timeout() -> u64 {
    40
}
fn default_brunnen() -> Settings {
    let mut settings = Settings::new();
    settings.insert(SettingKey::Sync, SyncSettings::default().to_value());
    settings.insert(SettingKey::Intervals, serde_json::json!({}));
    settings.insert(SettingKey::Thresholds, serde_json::json!({}));
    settings
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_port(),
            session_ttl: default_session_ttl(),
            firmware_dir: default_firmware_dir(),
            max_upload_bytes: default_max_upload(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            host: default_db_host(),
            port: default_db_port(),
            organization: default_organization(),
            bucket: default_bucket(),
            timeout: default_db_timeout(),
            token: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            brunnen: default_brunnen(),
        }
    }
}

impl DatabaseConfig {
    /// Full base URL of the database API
    pub fn url(&self) -> String {
        format!("{}:{}", self.host.trim_end_matches('/'), self.port)
    }
}

impl Config {
    /// Files tried when no explicit path is given
    pub fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from("config.json"),
            PathBuf::from("defaults").join("config.json"),
        ];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("brunnen").join("config.json"));
        }
        paths
    }

    /// Load config from the first existing candidate, or defaults
    ///
    /// Returns the path that was used, if any.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        if let Some(path) = explicit {
            return Ok((Self::load_from(path)?, Some(path.to_path_buf())));
        }

        for path in Self::candidate_paths() {
            if path.exists() {
                return Ok((Self::load_from(&path)?, Some(path)));
            }
        }

        Ok((Self::default(), None))
    }

    /// Load config from specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = if is_toml(path) {
            toml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };

        // A partial `brunnen` section keeps the built-in defaults for the
        // keys it does not mention.
        for (key, value) in default_brunnen() {
            config.brunnen.entry(key).or_insert(value);
        }

        config.validate()?;
        Ok(config)
    }

    /// Fill secrets from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup(ENV_DATABASE_TOKEN).filter(|t| !t.is_empty()) {
            self.database.token = Some(token);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must not be 0".to_string()));
        }
        if self.server.session_ttl == 0 {
            return Err(ConfigError::Invalid(
                "server.session_ttl must not be 0".to_string(),
            ));
        }
        if let Some(sync) = self.brunnen.get(&SettingKey::Sync) {
            SyncSettings::from_value(sync)
                .map_err(|e| ConfigError::Invalid(format!("brunnen.sync: {e}")))?;
        }
        Ok(())
    }

    /// Default `sync` setting, falling back to built-in thresholds
    pub fn default_sync(&self) -> SyncSettings {
        self.brunnen
            .get(&SettingKey::Sync)
            .and_then(|v| SyncSettings::from_value(v).ok())
            .unwrap_or_default()
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncMode;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, crate::DEFAULT_PORT);
        assert_eq!(config.database.url(), "http://localhost:8086");
        assert_eq!(config.default_sync(), SyncSettings::default());
    }

    #[test]
    fn test_load_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "server": { "port": 5000 },
                "database": { "host": "https://db.example.org", "port": 443, "organization": "Well" },
                "brunnen": { "sync": { "mode": "medium", "medium": 120, "long": 900 } }
            }"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.listen_addr, "127.0.0.1");
        assert_eq!(config.database.url(), "https://db.example.org:443");
        assert_eq!(config.database.bucket, "Brunnen");

        let sync = config.default_sync();
        assert_eq!(sync.mode, SyncMode::Medium);
        assert_eq!(sync.medium, 120);
        assert_eq!(config.brunnen[&SettingKey::Intervals], serde_json::json!({}));
        assert!(!config.brunnen.contains_key(&SettingKey::Pump));
    }

    #[test]
    fn test_load_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("brunnen.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 8080

[database]
backend = "memory"
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.database.backend, Backend::Memory);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.default_sync(), SyncSettings::default());
    }

    #[test]
    fn test_invalid_sync_defaults_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "brunnen": { "sync": { "medium": 10, "long": 5 } } }"#).unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(Some(&dir.path().join("nope.json")));
        assert!(matches!(result, Err(ConfigError::ReadError(_))));
    }

    #[test]
    fn test_token_from_env_only() {
        let mut config = Config::default();
        config.apply_env_with(|key| (key == ENV_DATABASE_TOKEN).then(|| "secret".to_string()));
        assert_eq!(config.database.token.as_deref(), Some("secret"));

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }
}
