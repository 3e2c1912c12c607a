//! Agent configuration

use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable overriding the registration URL
pub const REGISTRATION_URL_ENV: &str = "REMOTECTL_REGISTRATION_URL";

/// Production registration endpoint
pub const DEFAULT_REGISTRATION_URL: &str = "https://app.remotectl.io/api/v1/remote/register";

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Enrollment configuration
    #[serde(default)]
    pub registration: RegistrationConfig,

    /// Remote connection configuration
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Local web service that tunnelled commands are replayed against
    #[serde(default)]
    pub webservice: WebServiceConfig,

    /// Path of the credential settings file
    #[serde(default = "default_settings_file")]
    pub settings_file: PathBuf,
}

impl AgentConfig {
    /// Load configuration from file
    ///
    /// A missing file yields the defaults. Environment overrides are
    /// applied last.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = match tokio::fs::read_to_string(path).await {
            Ok(content) => Self::from_toml(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No configuration at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => return Err(e.into()),
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(url) = std::env::var(REGISTRATION_URL_ENV)
            .ok()
            .filter(|url| !url.trim().is_empty())
        {
            debug!("Registration URL overridden by {}", REGISTRATION_URL_ENV);
            self.registration.url = url;
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            registration: RegistrationConfig::default(),
            connection: ConnectionConfig::default(),
            webservice: WebServiceConfig::default(),
            settings_file: default_settings_file(),
        }
    }
}

fn default_settings_file() -> PathBuf {
    PathBuf::from("remotectl-agent.json")
}

/// Enrollment configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationConfig {
    /// Registration endpoint
    #[serde(default = "default_registration_url")]
    pub url: String,

    /// Attempts for the registration request
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between registration attempts (seconds)
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
}

fn default_registration_url() -> String {
    DEFAULT_REGISTRATION_URL.to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_interval() -> u64 {
    5
}

impl RegistrationConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            url: default_registration_url(),
            max_retries: default_max_retries(),
            retry_interval_secs: default_retry_interval(),
        }
    }
}

/// Remote connection timing
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Ping interval; twice this without traffic drops the socket (seconds)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Minimum delay between reconnect attempts (seconds)
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,

    /// Certificate refresh ceiling (seconds)
    #[serde(default = "default_certificate_refresh_interval")]
    pub certificate_refresh_interval_secs: u64,

    /// Minimum delay between certificate refreshes (seconds)
    #[serde(default = "default_certificate_refresh_min")]
    pub certificate_refresh_min_secs: u64,

    /// Socket connect timeout (seconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_reconnect_interval() -> u64 {
    30
}

fn default_certificate_refresh_interval() -> u64 {
    7 * 24 * 60 * 60
}

fn default_certificate_refresh_min() -> u64 {
    5 * 60
}

fn default_connect_timeout() -> u64 {
    30
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            reconnect_interval_secs: default_reconnect_interval(),
            certificate_refresh_interval_secs: default_certificate_refresh_interval(),
            certificate_refresh_min_secs: default_certificate_refresh_min(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Local web service
#[derive(Debug, Clone, Deserialize)]
pub struct WebServiceConfig {
    /// Base URL tunnelled request paths are resolved against
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token added to every replayed request
    #[serde(default)]
    pub bearer_token: Option<String>,

    /// Value of the `PreSharedKey` header added to every replayed request
    #[serde(default)]
    pub pre_shared_key: Option<String>,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8200".to_string()
}

impl Default for WebServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            bearer_token: None,
            pre_shared_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.registration.url, DEFAULT_REGISTRATION_URL);
        assert_eq!(config.registration.max_retries, 5);
        assert_eq!(config.connection.heartbeat_interval_secs, 60);
        assert_eq!(config.connection.reconnect_interval_secs, 30);
        assert_eq!(config.connection.certificate_refresh_interval_secs, 604_800);
        assert_eq!(config.connection.certificate_refresh_min_secs, 300);
        assert_eq!(config.webservice.base_url, "http://127.0.0.1:8200");
        assert_eq!(config.settings_file, PathBuf::from("remotectl-agent.json"));
    }

    #[test]
    fn test_partial_toml() {
        let config = AgentConfig::from_toml(
            r#"
            settings_file = "/var/lib/remotectl/settings.json"

            [connection]
            heartbeat_interval_secs = 15

            [webservice]
            pre_shared_key = "abc123"
            "#,
        )
        .unwrap();

        assert_eq!(config.connection.heartbeat_interval_secs, 15);
        assert_eq!(config.connection.reconnect_interval_secs, 30);
        assert_eq!(config.webservice.pre_shared_key.as_deref(), Some("abc123"));
        assert_eq!(config.webservice.base_url, "http://127.0.0.1:8200");
        assert_eq!(config.registration.url, DEFAULT_REGISTRATION_URL);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(AgentConfig::from_toml("[connection\nheartbeat = ").is_err());
    }

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::load(dir.path().join("absent.toml"))
            .await
            .unwrap();
        assert_eq!(config.connection.connect_timeout_secs, 30);
    }
}
