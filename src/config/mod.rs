use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::github::app_jwt::{AssertionPolicy, MAX_ASSERTION_LIFETIME_SECS};
use crate::github::exchange::RetryPolicy;
use crate::github::transport::ApiSettings;
use crate::github::BrokerSettings;

/// Installation tokens live for one hour.
const INSTALLATION_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Longest owner -> installation lookup reuse (one day).
pub const MAX_INSTALLATION_CACHE_SECS: u64 = 86_400;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub github_app: GitHubAppConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubAppConfig {
    /// Numeric GitHub App ID, used as the assertion issuer
    #[serde(default)]
    pub app_id: String,
    /// PEM private key downloaded from the App settings page
    #[serde(default = "default_private_key_path")]
    pub private_key_path: PathBuf,
    /// How far `iat` is backdated to tolerate clock drift
    #[serde(default = "default_clock_skew_allowance")]
    pub clock_skew_allowance_seconds: i64,
    /// Assertion validity measured from `iat` (GitHub allows at most 600)
    #[serde(default = "default_assertion_lifetime")]
    pub assertion_lifetime_seconds: i64,
    /// Cached tokens this close to expiry are refreshed instead of served
    #[serde(default = "default_token_refresh_margin")]
    pub token_refresh_margin_seconds: i64,
    /// Retries after the first token exchange attempt
    #[serde(default = "default_max_exchange_retries")]
    pub max_exchange_retries: u32,
    /// How long an owner -> installation lookup is reused
    #[serde(default = "default_installation_cache")]
    pub installation_cache_seconds: u64,
}

impl Default for GitHubAppConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            private_key_path: default_private_key_path(),
            clock_skew_allowance_seconds: default_clock_skew_allowance(),
            assertion_lifetime_seconds: default_assertion_lifetime(),
            token_refresh_margin_seconds: default_token_refresh_margin(),
            max_exchange_retries: default_max_exchange_retries(),
            installation_cache_seconds: default_installation_cache(),
        }
    }
}

fn default_private_key_path() -> PathBuf {
    PathBuf::from("./keys/app.private-key.pem")
}

fn default_clock_skew_allowance() -> i64 {
    60
}

fn default_assertion_lifetime() -> i64 {
    MAX_ASSERTION_LIFETIME_SECS
}

fn default_token_refresh_margin() -> i64 {
    120
}

fn default_max_exchange_retries() -> u32 {
    3
}

fn default_installation_cache() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_retry_initial_backoff")]
    pub retry_initial_backoff_ms: u64,
    #[serde(default = "default_retry_max_backoff")]
    pub retry_max_backoff_ms: u64,
    /// Rate limit resets further away than this fail immediately
    #[serde(default = "default_max_rate_limit_wait")]
    pub max_rate_limit_wait_seconds: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            request_timeout_seconds: default_request_timeout(),
            retry_initial_backoff_ms: default_retry_initial_backoff(),
            retry_max_backoff_ms: default_retry_max_backoff(),
            max_rate_limit_wait_seconds: default_max_rate_limit_wait(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_api_base_url() -> String {
    "https://api.github.com".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_retry_initial_backoff() -> u64 {
    500
}

fn default_retry_max_backoff() -> u64 {
    8000
}

fn default_max_rate_limit_wait() -> u64 {
    60
}

fn default_user_agent() -> String {
    format!("ghapp-broker/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| "Failed to parse configuration file")?;
            Ok(config)
        } else {
            info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }

    /// Apply command line / environment overrides on top of the file.
    pub fn with_overrides(mut self, app_id: Option<String>, private_key_path: Option<PathBuf>) -> Self {
        if let Some(app_id) = app_id {
            self.github_app.app_id = app_id;
        }
        if let Some(path) = private_key_path {
            self.github_app.private_key_path = path;
        }
        self
    }

    /// Reject settings that can never produce a working credential.
    pub fn validate(&self) -> Result<()> {
        let app = &self.github_app;
        if app.app_id.trim().is_empty() {
            bail!("github_app.app_id is required");
        }
        if app.clock_skew_allowance_seconds < 0 {
            bail!("github_app.clock_skew_allowance_seconds must not be negative");
        }
        if app.assertion_lifetime_seconds > MAX_ASSERTION_LIFETIME_SECS {
            bail!(
                "github_app.assertion_lifetime_seconds must be at most {} (GitHub's limit)",
                MAX_ASSERTION_LIFETIME_SECS
            );
        }
        if app.assertion_lifetime_seconds <= app.clock_skew_allowance_seconds {
            bail!("github_app.assertion_lifetime_seconds must exceed clock_skew_allowance_seconds");
        }
        if app.token_refresh_margin_seconds < 0
            || app.token_refresh_margin_seconds >= INSTALLATION_TOKEN_LIFETIME_SECS - 60
        {
            bail!(
                "github_app.token_refresh_margin_seconds must be between 0 and {}",
                INSTALLATION_TOKEN_LIFETIME_SECS - 61
            );
        }
        if app.installation_cache_seconds > MAX_INSTALLATION_CACHE_SECS {
            bail!(
                "github_app.installation_cache_seconds must be at most {}",
                MAX_INSTALLATION_CACHE_SECS
            );
        }
        if self.http.request_timeout_seconds == 0 {
            bail!("http.request_timeout_seconds must be greater than 0");
        }
        if self.http.retry_max_backoff_ms < self.http.retry_initial_backoff_ms {
            bail!("http.retry_max_backoff_ms must not be smaller than retry_initial_backoff_ms");
        }
        if self.http.api_base_url.trim().is_empty() {
            bail!("http.api_base_url is required");
        }
        Ok(())
    }

    /// Non-fatal observations for `config check`.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.github_app.private_key_path.exists() {
            warnings.push(format!(
                "Private key file {} does not exist",
                self.github_app.private_key_path.display()
            ));
        }
        if !self.http.api_base_url.starts_with("https://") {
            warnings.push(format!(
                "API base URL {} is not HTTPS; tokens would travel in clear text",
                self.http.api_base_url
            ));
        }
        if self.github_app.max_exchange_retries == 0 {
            warnings.push("Token exchange retries are disabled".to_string());
        }
        warnings
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        let app = &self.github_app;
        let http = &self.http;
        BrokerSettings {
            api: ApiSettings {
                base_url: http.api_base_url.clone(),
                user_agent: http.user_agent.clone(),
                request_timeout: Duration::from_secs(http.request_timeout_seconds),
            },
            assertion: AssertionPolicy {
                clock_skew_allowance: chrono::Duration::seconds(app.clock_skew_allowance_seconds),
                lifetime: chrono::Duration::seconds(app.assertion_lifetime_seconds),
            },
            retry: RetryPolicy {
                max_retries: app.max_exchange_retries,
                initial_backoff: Duration::from_millis(http.retry_initial_backoff_ms),
                max_backoff: Duration::from_millis(http.retry_max_backoff_ms),
                max_rate_limit_wait: Duration::from_secs(http.max_rate_limit_wait_seconds),
            },
            refresh_margin: chrono::Duration::seconds(app.token_refresh_margin_seconds),
            installation_cache_ttl: chrono::Duration::seconds(
                app.installation_cache_seconds.min(MAX_INSTALLATION_CACHE_SECS) as i64,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    fn valid() -> Config {
        Config::default().with_overrides(Some("2244732".to_string()), None)
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.github_app.assertion_lifetime_seconds, 600);
        assert_eq!(config.github_app.clock_skew_allowance_seconds, 60);
        assert_eq!(config.github_app.token_refresh_margin_seconds, 120);
        assert_eq!(config.github_app.max_exchange_retries, 3);
        assert_eq!(config.http.api_base_url, "https://api.github.com");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ghapp-broker.toml");
        std::fs::write(
            &path,
            r#"
[github_app]
app_id = "2244732"
private_key_path = "/etc/ghapp/key.pem"
token_refresh_margin_seconds = 300

[http]
retry_initial_backoff_ms = 250
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.github_app.app_id, "2244732");
        assert_eq!(config.github_app.private_key_path, PathBuf::from("/etc/ghapp/key.pem"));
        assert_eq!(config.github_app.token_refresh_margin_seconds, 300);
        assert_eq!(config.github_app.assertion_lifetime_seconds, 600);
        assert_eq!(config.http.retry_initial_backoff_ms, 250);
        assert_eq!(config.http.retry_max_backoff_ms, 8000);
        assert_ok!(config.validate());
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[github_app\napp_id = 1").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_overrides_win() {
        let config = Config::default()
            .with_overrides(Some("42".to_string()), Some(PathBuf::from("/tmp/key.pem")));
        assert_eq!(config.github_app.app_id, "42");
        assert_eq!(config.github_app.private_key_path, PathBuf::from("/tmp/key.pem"));

        let untouched = config.clone().with_overrides(None, None);
        assert_eq!(untouched.github_app.app_id, "42");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert_ok!(valid().validate());
        assert_err!(Config::default().validate());

        let mut config = valid();
        config.github_app.assertion_lifetime_seconds = 601;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.github_app.assertion_lifetime_seconds = 60;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.github_app.clock_skew_allowance_seconds = -1;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.github_app.token_refresh_margin_seconds = 3540;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.http.request_timeout_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.http.retry_max_backoff_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_broker_settings() {
        let settings = valid().broker_settings();
        assert_eq!(settings.assertion, AssertionPolicy::default());
        assert_eq!(settings.retry, RetryPolicy::default());
        assert_eq!(settings.refresh_margin, chrono::Duration::seconds(120));
        assert_eq!(settings.installation_cache_ttl, chrono::Duration::seconds(300));
        assert_eq!(settings.api.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_oversized_installation_cache_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ghapp-broker.toml");
        std::fs::write(
            &path,
            "[github_app]\napp_id = \"2244732\"\ninstallation_cache_seconds = 9223372036854775807\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("installation_cache_seconds"));

        // clamped rather than overflowing when validation is skipped
        assert_eq!(
            config.broker_settings().installation_cache_ttl,
            chrono::Duration::seconds(MAX_INSTALLATION_CACHE_SECS as i64)
        );

        let mut config = valid();
        config.github_app.installation_cache_seconds = MAX_INSTALLATION_CACHE_SECS;
        assert_ok!(config.validate());
    }

    #[test]
    fn test_warnings() {
        let mut config = valid();
        config.github_app.private_key_path = PathBuf::from("/nonexistent/key.pem");
        config.http.api_base_url = "http://localhost:8080".to_string();
        let warnings = config.warnings();
        assert_eq!(warnings.len(), 2);
    }
}
