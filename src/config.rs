use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// SQLite connection string. Overridden by DATABASE_URL if set.
    #[serde(default = "Config::default_database_url")]
    pub database_url: String,
    pub feeds: FeedPaths,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

/// Locations of the three snapshot files produced by the scraper.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedPaths {
    pub stops: PathBuf,
    pub schedule: PathBuf,
    pub routes: PathBuf,
}

/// Configuration for the deploy webhook endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Address the listener binds to (default: 0.0.0.0:8081)
    #[serde(default = "WebhookConfig::default_bind_addr")]
    pub bind_addr: String,
    /// Shared secret for request signatures. Overridden by WEBHOOK_SECRET
    /// if set. When absent, signature verification is skipped.
    #[serde(default)]
    pub secret: Option<String>,
    /// Command launched (detached) after a verified notification.
    #[serde(default = "WebhookConfig::default_refresh_command")]
    pub refresh_command: PathBuf,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            bind_addr: Self::default_bind_addr(),
            secret: None,
            refresh_command: Self::default_refresh_command(),
        }
    }
}

impl WebhookConfig {
    fn default_bind_addr() -> String {
        "0.0.0.0:8081".to_string()
    }
    fn default_refresh_command() -> PathBuf {
        PathBuf::from("./refresh.sh")
    }
}

impl Config {
    fn default_database_url() -> String {
        "sqlite:data/marprom.db?mode=rwc".to_string()
    }

    /// Load configuration from a YAML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        let mut config: Config =
            serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(secret) = std::env::var("WEBHOOK_SECRET") {
            config.webhook.secret = Some(secret);
        }

        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file {0}: {1}")]
    Parse(PathBuf, #[source] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let yaml = r#"
feeds:
  stops: "data/stops.json"
  schedule: "data/schedule.json"
  routes: "data/routes.json"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.database_url, "sqlite:data/marprom.db?mode=rwc");
        assert_eq!(config.webhook.bind_addr, "0.0.0.0:8081");
        assert!(config.webhook.secret.is_none());
    }

    #[test]
    fn parses_full_webhook_section() {
        let yaml = r#"
database_url: "sqlite::memory:"
feeds:
  stops: "a.json"
  schedule: "b.json"
  routes: "c.json"
webhook:
  bind_addr: "127.0.0.1:9000"
  secret: "s3cret"
  refresh_command: "/opt/app/refresh.sh"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.webhook.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.webhook.secret.as_deref(), Some("s3cret"));
        assert_eq!(
            config.webhook.refresh_command,
            PathBuf::from("/opt/app/refresh.sh")
        );
    }
}
