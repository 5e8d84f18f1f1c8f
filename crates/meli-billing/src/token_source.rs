//! Access tokens via the internal token broker
//!
//! The billing side never talks to the OAuth endpoints itself: it asks the
//! broker for a ready-to-use access token and lets the broker worry about
//! refresh and locking. The bundle is cached in memory; `force_refresh`
//! bypasses the cache after an upstream 401/403.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

const TOKEN_FETCH_TIMEOUT: Duration = Duration::from_secs(20);

/// Token bundle as served by the broker.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenBundle {
    pub seller_id: String,
    pub access_token: String,
    #[serde(default)]
    pub expires_at: i64,
}

/// Fetches and caches access tokens from the token broker.
pub struct BrokerTokenSource {
    http: reqwest::Client,
    broker_url: String,
    internal_key: String,
    seller_id: String,
    cached: Mutex<Option<TokenBundle>>,
}

impl BrokerTokenSource {
    pub fn new(
        http: reqwest::Client,
        broker_url: impl Into<String>,
        internal_key: impl Into<String>,
        seller_id: impl Into<String>,
    ) -> Self {
        Self {
            http,
            broker_url: broker_url.into().trim_end_matches('/').to_owned(),
            internal_key: internal_key.into(),
            seller_id: seller_id.into(),
            cached: Mutex::new(None),
        }
    }

    /// Current bundle, fetching from the broker when the cache is cold or a
    /// refresh is forced.
    pub async fn get(&self, force_refresh: bool) -> Result<TokenBundle> {
        let mut cached = self.cached.lock().await;
        if !force_refresh {
            if let Some(bundle) = cached.as_ref() {
                return Ok(bundle.clone());
            }
        }
        let bundle = self.fetch().await?;
        *cached = Some(bundle.clone());
        Ok(bundle)
    }

    async fn fetch(&self) -> Result<TokenBundle> {
        let url = format!("{}/internal/meli/token", self.broker_url);
        debug!(seller_id = %self.seller_id, "fetching token from broker");
        let response = self
            .http
            .get(&url)
            .query(&[("seller_id", self.seller_id.as_str())])
            .header("X-Internal-Key", &self.internal_key)
            .timeout(TOKEN_FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Network(format!("reading broker response: {e}")))?;
        let payload: Value = serde_json::from_str(&text)
            .unwrap_or_else(|_| serde_json::json!({"raw": text.chars().take(200).collect::<String>()}));

        match status {
            400 => Err(Error::NotConnected(payload)),
            409 => Err(Error::ReauthRequired),
            200 => {
                let bundle: TokenBundle = serde_json::from_value(payload)
                    .map_err(|e| Error::Format(format!("unexpected broker payload: {e}")))?;
                if bundle.access_token.is_empty() {
                    return Err(Error::Format("broker returned an empty access token".into()));
                }
                info!(
                    seller_id = %bundle.seller_id,
                    token_prefix = %token_prefix(&bundle.access_token),
                    expires_at = bundle.expires_at,
                    "token fetched from broker"
                );
                Ok(bundle)
            }
            _ => Err(Error::Api { status, payload }),
        }
    }
}

/// First 12 characters of an access token, the only form that may be logged.
pub fn token_prefix(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(12)
        .map_or(token.len(), |(i, _)| i);
    &token[..end]
}

/// Whether an upstream status means the cached token went stale and one
/// forced re-fetch is warranted.
pub fn should_refresh_on(status: u16) -> bool {
    status == 401 || status == 403
}
