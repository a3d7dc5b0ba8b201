//! Configuration loader and validator for the feed reloader.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::model::RetentionSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub connection: Connection,
    pub retention: RetentionSettings,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub reload_interval_secs: u64,
    /// Number of bookmarks reloaded concurrently.
    pub workers: usize,
}

/// Network settings shared by all protocol handlers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Connection {
    pub timeout_secs: u64,
    pub user_agent: String,
    #[serde(default)]
    pub proxy: Option<Proxy>,
    #[serde(default)]
    pub credentials: Vec<Credential>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Proxy {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Basic-auth credentials applied to every feed link starting with
/// `link_prefix`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    pub link_prefix: String,
    pub username: String,
    pub password: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/feeds.db", self.app.data_dir))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.reload_interval_secs == 0 {
        return Err(ConfigError::Invalid("app.reload_interval_secs must be > 0"));
    }
    if cfg.app.workers == 0 {
        return Err(ConfigError::Invalid("app.workers must be > 0"));
    }

    if cfg.connection.timeout_secs == 0 {
        return Err(ConfigError::Invalid("connection.timeout_secs must be > 0"));
    }
    if cfg.connection.user_agent.trim().is_empty() {
        return Err(ConfigError::Invalid("connection.user_agent must be non-empty"));
    }
    if let Some(proxy) = &cfg.connection.proxy {
        if proxy.url.trim().is_empty() {
            return Err(ConfigError::Invalid("connection.proxy.url must be non-empty"));
        }
        if proxy.password.is_some() && proxy.username.is_none() {
            return Err(ConfigError::Invalid(
                "connection.proxy.password requires connection.proxy.username",
            ));
        }
    }
    for cred in &cfg.connection.credentials {
        if cred.link_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "connection.credentials[].link_prefix must be non-empty",
            ));
        }
        if cred.username.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "connection.credentials[].username must be non-empty",
            ));
        }
    }

    Ok(())
}

/// Returns a complete sample configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  reload_interval_secs: 1800
  workers: 4

connection:
  timeout_secs: 30
  user_agent: "feed-reload/0.1"
  proxy: null
  credentials:
    - link_prefix: "https://private.example.com/"
      username: "reader"
      password: "secret"

retention:
  max_count: 200
  max_age_days: 30
  keep_unread: true
  keep_flagged: true
  keep_labeled: true
  delete_read: false
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.retention.max_count, 200);
        assert!(cfg.retention.keep_unread);
        assert!(cfg.connection.proxy.is_none());
    }

    #[test]
    fn invalid_workers() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.workers = 0;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("app.workers")), _ => panic!("wrong error") }
    }

    #[test]
    fn invalid_connection_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.connection.timeout_secs = 0;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("timeout_secs")), _ => panic!("wrong error") }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.connection.user_agent = " ".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.connection.proxy = Some(Proxy {
            url: "http://proxy:3128".into(),
            username: None,
            password: Some("pw".into()),
        });
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.connection.credentials[0].link_prefix = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.app.workers, 4);
        assert_eq!(cfg.connection.credentials[0].username, "reader");
    }
}
