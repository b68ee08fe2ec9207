//! Configuration management for the relay service.
//!
//! Configuration is assembled from defaults, an optional config file and
//! environment variables (`ESTUARY__` prefix with `__` as the section
//! separator), then validated before the server starts. A couple of
//! well-known variables (`OPENROUTER_API_KEY`, `PORT`) are honored
//! without the prefix.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::llm::UpstreamSettings;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Upstream aggregator configuration.
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Model allow-list configuration.
    #[serde(default)]
    pub models: ModelsConfig,
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Identity resolution configuration.
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from defaults, config files and environment.
    ///
    /// Sources are applied in order: built-in defaults, `config/estuary`
    /// (any supported format, optional), then `ESTUARY__*` environment
    /// variables. The result is validated; use [`Self::load_unchecked`]
    /// to skip validation.
    pub fn load() -> anyhow::Result<Self> {
        let config = Self::load_unchecked()?;
        config
            .validate()
            .context("Configuration validation failed")?;
        Ok(config)
    }

    /// Load configuration without validation.
    pub fn load_unchecked() -> anyhow::Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let raw = config::Config::builder()
            .add_source(config::File::with_name("config/estuary").required(false))
            .add_source(
                config::Environment::with_prefix("ESTUARY")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("models.allowed"),
            )
            .build()?;

        let mut config: AppConfig = raw
            .try_deserialize()
            .context("Failed to parse configuration")?;

        // Well-known variables without the ESTUARY prefix.
        if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
            if !key.is_empty() {
                config.upstream.api_key = Some(key);
            }
        }
        if let Ok(port) = std::env::var("PORT") {
            config.server.port = port
                .parse()
                .with_context(|| format!("PORT is not a valid port number: {port}"))?;
        }

        Ok(config)
    }

    /// Validate cross-field constraints.
    ///
    /// A missing upstream API key is deliberately not an error here: the
    /// server boots without one and relay requests fail closed instead.
    pub fn validate(&self) -> anyhow::Result<()> {
        let base = Url::parse(&self.upstream.base_url)
            .with_context(|| format!("upstream.base_url is not a URL: {}", self.upstream.base_url))?;
        if !matches!(base.scheme(), "http" | "https") {
            anyhow::bail!(
                "upstream.base_url must use http or https, got {}",
                base.scheme()
            );
        }

        if let Some(endpoint) = &self.identity.endpoint {
            Url::parse(endpoint)
                .with_context(|| format!("identity.endpoint is not a URL: {endpoint}"))?;
        }

        if self.models.default_model.trim().is_empty() {
            anyhow::bail!("models.default_model must not be empty");
        }
        if self.server.request_timeout_secs == 0 {
            anyhow::bail!("server.request_timeout_secs must be greater than zero");
        }
        if self.database.path.as_os_str().is_empty() {
            anyhow::bail!("database.path must not be empty");
        }

        Ok(())
    }

    /// Upstream connection settings, or `None` when no API key is set.
    pub fn upstream_settings(&self) -> Option<UpstreamSettings> {
        let api_key = self.upstream.api_key.clone().filter(|k| !k.is_empty())?;
        Some(UpstreamSettings {
            base_url: self.upstream.base_url.clone(),
            api_key,
            referer: self.upstream.referer.clone(),
            title: self.upstream.title.clone(),
            connect_timeout_secs: self.upstream.connect_timeout_secs,
        })
    }

    /// Socket address string the server binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Timeout for non-streaming requests, in seconds. Relay streams are
    /// exempt so long generations are never cut off.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Upstream aggregator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Bearer key for the aggregator. Usually set via `OPENROUTER_API_KEY`.
    pub api_key: Option<String>,
    /// Aggregator base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Optional `HTTP-Referer` attribution header.
    pub referer: Option<String>,
    /// Optional `X-Title` attribution header.
    pub title: Option<String>,
    /// Connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://openrouter.ai/api".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            referer: None,
            title: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Model allow-list configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Models clients may request. The default model is always included.
    #[serde(default = "default_allowed_models")]
    pub allowed: Vec<String>,
    /// Model substituted for unknown or missing requests.
    #[serde(default = "default_model")]
    pub default_model: String,
}

fn default_allowed_models() -> Vec<String> {
    vec![
        "openai/gpt-4o-mini".to_string(),
        "anthropic/claude-sonnet-4".to_string(),
        "google/gemini-2.5-flash".to_string(),
        "deepseek/deepseek-r1".to_string(),
    ]
}

fn default_model() -> String {
    "openai/gpt-4o-mini".to_string()
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            allowed: default_allowed_models(),
            default_model: default_model(),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file path. Parent directories are created on init.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/estuary.sqlite")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Identity resolution configuration.
///
/// When `endpoint` is set, bearer tokens are resolved by that external
/// service. Otherwise `static_tokens` maps tokens to identities, which is
/// intended for development and tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Identity service URL receiving the bearer token.
    pub endpoint: Option<String>,
    /// Identity service request timeout in seconds.
    #[serde(default = "default_identity_timeout")]
    pub timeout_secs: u64,
    /// Static token table used when no endpoint is configured.
    #[serde(default)]
    pub static_tokens: HashMap<String, StaticIdentity>,
}

fn default_identity_timeout() -> u64 {
    5
}

/// One entry of the static token table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticIdentity {
    /// User the token authenticates as.
    pub user_id: String,
    /// Role granted to the token.
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "user".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "OPENROUTER_API_KEY",
            "PORT",
            "ESTUARY__SERVER__PORT",
            "ESTUARY__UPSTREAM__BASE_URL",
            "ESTUARY__MODELS__ALLOWED",
        ] {
            // SAFETY: tests touching process env are serialized.
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    #[serial]
    fn defaults_are_valid() {
        clear_env();
        let config = AppConfig::load().unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.upstream.base_url, "https://openrouter.ai/api");
        assert!(config.upstream_settings().is_none());
        assert!(config.models.allowed.contains(&config.models.default_model));
    }

    #[test]
    #[serial]
    fn well_known_env_vars_override() {
        clear_env();
        // SAFETY: tests touching process env are serialized.
        unsafe {
            std::env::set_var("OPENROUTER_API_KEY", "sk-or-test");
            std::env::set_var("PORT", "9099");
        }
        let config = AppConfig::load().unwrap();
        assert_eq!(config.server.port, 9099);
        let settings = config.upstream_settings().unwrap();
        assert_eq!(settings.api_key, "sk-or-test");
        clear_env();
    }

    #[test]
    #[serial]
    fn prefixed_env_vars_parse_lists() {
        clear_env();
        // SAFETY: tests touching process env are serialized.
        unsafe {
            std::env::set_var("ESTUARY__MODELS__ALLOWED", "a/one,b/two");
            std::env::set_var("ESTUARY__SERVER__PORT", "7070");
        }
        let config = AppConfig::load().unwrap();
        assert_eq!(config.server.port, 7070);
        assert_eq!(config.models.allowed, vec!["a/one", "b/two"]);
        clear_env();
    }

    #[test]
    #[serial]
    fn invalid_base_url_fails_validation() {
        clear_env();
        let mut config = AppConfig::load_unchecked().unwrap();
        config.upstream.base_url = "not a url".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_key_yields_no_upstream_settings() {
        let config = AppConfig {
            upstream: UpstreamConfig {
                api_key: Some(String::new()),
                ..UpstreamConfig::default()
            },
            ..AppConfig::default()
        };
        assert!(config.upstream_settings().is_none());
    }
}
