//! Configuration types and loading
//!
//! Config precedence: env vars > config file > defaults. Secrets
//! (internal key, OAuth client credentials) come from the environment or a
//! key file, never from the TOML directly.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub broker: BrokerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Shared secret for the internal endpoints. `MELI_INTERNAL_KEY` env var
    /// or `broker.internal_key_file`.
    #[serde(skip)]
    pub internal_key: Option<Secret<String>>,
    /// OAuth application id, `MELI_CLIENT_ID` env var.
    #[serde(skip)]
    pub client_id: Option<String>,
    /// OAuth application secret, `MELI_CLIENT_SECRET` env var.
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
}

/// Broker behaviour and OAuth endpoints
#[derive(Debug, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Callback URL registered with the marketplace application.
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub internal_key_file: Option<PathBuf>,
    #[serde(default = "default_state_ttl")]
    pub state_ttl_secs: i64,
    #[serde(default = "default_token_skew")]
    pub token_skew_secs: i64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_state_retention")]
    pub state_retention_days: i64,
}

/// MySQL connection settings
#[derive(Debug, Default, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL, `DATABASE_URL` env var overlay.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_db_connections")]
    pub max_connections: u32,
}

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().expect("static addr")
}

fn default_scope() -> String {
    "offline_access read write".into()
}

fn default_auth_url() -> String {
    "https://auth.mercadolivre.com.br/authorization".into()
}

fn default_api_base() -> String {
    meli_auth::DEFAULT_API_BASE.into()
}

fn default_state_ttl() -> i64 {
    600
}

fn default_token_skew() -> i64 {
    60
}

fn default_max_connections() -> usize {
    256
}

fn default_cleanup_interval() -> u64 {
    3600
}

fn default_state_retention() -> i64 {
    30
}

fn default_db_connections() -> u32 {
    5
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment
    /// variables. Every missing required setting is reported at once so an
    /// operator fixes the deployment in one pass.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if config.broker.state_ttl_secs <= 0 {
            return Err(common::Error::Config(
                "state_ttl_secs must be greater than 0".into(),
            ));
        }
        if config.broker.token_skew_secs < 0 {
            return Err(common::Error::Config(
                "token_skew_secs must not be negative".into(),
            ));
        }
        if config.broker.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if !config.broker.auth_url.starts_with("http://")
            && !config.broker.auth_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "auth_url must start with http:// or https://, got: {}",
                config.broker.auth_url
            )));
        }

        if let Ok(key) = std::env::var("MELI_INTERNAL_KEY") {
            config.internal_key = Some(Secret::new(key));
        } else if let Some(ref key_file) = config.broker.internal_key_file {
            let key = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read internal_key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.internal_key = Some(Secret::new(key));
            }
        }

        if let Ok(id) = std::env::var("MELI_CLIENT_ID") {
            config.client_id = Some(id);
        }
        if let Ok(secret) = std::env::var("MELI_CLIENT_SECRET") {
            config.client_secret = Some(Secret::new(secret));
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = Some(url);
        }

        let mut missing = Vec::new();
        if config.internal_key.as_ref().is_none_or(Secret::is_empty) {
            missing.push("internal_key (MELI_INTERNAL_KEY)".to_owned());
        }
        if config.client_id.as_deref().unwrap_or("").is_empty() {
            missing.push("client_id (MELI_CLIENT_ID)".to_owned());
        }
        if config.client_secret.as_ref().is_none_or(Secret::is_empty) {
            missing.push("client_secret (MELI_CLIENT_SECRET)".to_owned());
        }
        if config.broker.redirect_uri.is_empty() {
            missing.push("broker.redirect_uri".to_owned());
        }
        if config.database.url.as_deref().unwrap_or("").is_empty() {
            missing.push("database.url (DATABASE_URL)".to_owned());
        }
        if !missing.is_empty() {
            return Err(common::Error::ConfigMissing(missing));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("token-broker.toml")
    }
}
