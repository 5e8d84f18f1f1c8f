//! Core authorization flows
//!
//! Generic over the store so every test runs against the in-memory backend
//! while production uses MySQL. Three operations:
//!
//! - `init`: mint state + PKCE verifier, persist the hashed state, return
//!   the authorization URL for the seller to visit.
//! - `consume`: exchange the callback code for tokens. The state is popped
//!   atomically first, so a replayed or forged callback never reaches the
//!   upstream.
//! - `token`: hand out a usable access token, refreshing under the row
//!   lease when the stored one is inside the expiry skew window.

use common::{Secret, unix_now};
use meli_auth::{
    AuthorizationUrlParams, DEFAULT_VERIFIER_LEN, MeliClient, build_authorization_url,
    make_challenge, make_state, make_verifier, sha256_hex, validate_state,
};
use meli_store::{BrokerStore, SellerProfile, TokenUpdate};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::BrokerError;
use crate::metrics;

const REQUESTER_MAX: usize = 255;

/// Lifetime used when the upstream reports a zero or negative `expires_in`.
const EXPIRES_FLOOR_SECS: i64 = 3600;

fn effective_expires_in(expires_in: i64) -> i64 {
    if expires_in > 0 {
        expires_in
    } else {
        EXPIRES_FLOOR_SECS
    }
}

/// Everything the flows need besides the store.
pub struct BrokerSettings {
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub redirect_uri: String,
    pub scope: String,
    pub auth_url: String,
    pub state_ttl_secs: i64,
    pub token_skew_secs: i64,
}

/// Token bundle as served to internal callers.
#[derive(Debug, Clone, Serialize)]
pub struct TokenBundle {
    pub seller_id: String,
    pub access_token: String,
    pub expires_at: i64,
}

/// Result of a successful code exchange.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumeOutcome {
    pub ok: bool,
    pub seller_id: String,
    pub expires_at: i64,
}

pub struct Broker<S> {
    store: S,
    client: MeliClient,
    settings: BrokerSettings,
}

impl<S: BrokerStore> Broker<S> {
    pub fn new(store: S, client: MeliClient, settings: BrokerSettings) -> Self {
        Self {
            store,
            client,
            settings,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Start an authorization flow: persist the hashed state with its PKCE
    /// verifier and return the URL the seller must visit.
    pub async fn init(&self, requester: Option<String>) -> Result<String, BrokerError> {
        let state = make_state();
        let verifier = make_verifier(DEFAULT_VERIFIER_LEN);
        let challenge =
            make_challenge(&verifier).map_err(|e| BrokerError::Internal(e.to_string()))?;
        let state_hash = sha256_hex(&state);
        let expires_at = unix_now() + self.settings.state_ttl_secs;
        let requester = requester.map(|r| truncate(&r, REQUESTER_MAX));

        self.store
            .save_state(&state_hash, &verifier, expires_at, requester.as_deref())
            .await?;

        let url = build_authorization_url(&AuthorizationUrlParams {
            auth_base: &self.settings.auth_url,
            client_id: &self.settings.client_id,
            redirect_uri: &self.settings.redirect_uri,
            scope: &self.settings.scope,
            state: &state,
            challenge: &challenge,
        })
        .map_err(|e| BrokerError::Internal(e.to_string()))?;

        metrics::record_init();
        info!(%state_hash, expires_at, "authorization flow initialized");
        Ok(url)
    }

    /// Consume an authorization callback: pop the state, exchange the code,
    /// snapshot the seller identity, persist the tokens.
    pub async fn consume(&self, code: &str, state: &str) -> Result<ConsumeOutcome, BrokerError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(BrokerError::InvalidRequest("code must not be empty".into()));
        }
        if validate_state(state).is_err() {
            metrics::record_consume("rejected_state");
            return Err(BrokerError::InvalidState);
        }

        let state_hash = sha256_hex(state);
        let verifier = match self.store.pop_state(&state_hash).await {
            Ok(v) => v,
            Err(e) => {
                warn!(%state_hash, error = %e, "state rejected");
                metrics::record_consume("rejected_state");
                return Err(e.into());
            }
        };

        let started = std::time::Instant::now();
        let exchanged = self
            .client
            .exchange_code(
                &self.settings.client_id,
                self.settings.client_secret.expose(),
                &self.settings.redirect_uri,
                code,
                &verifier,
            )
            .await;
        metrics::record_upstream("exchange", started.elapsed().as_secs_f64());
        let payload = exchanged.map_err(|e| {
            metrics::record_consume("exchange_failed");
            match e {
                meli_auth::Error::Api { status, payload } => {
                    warn!(status, "token exchange failed");
                    BrokerError::ExchangeFailed {
                        status,
                        detail: payload,
                    }
                }
                other => BrokerError::Internal(other.to_string()),
            }
        })?;

        let refresh_token = payload
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(BrokerError::TokenPayloadInvalid)?
            .to_owned();

        let started = std::time::Instant::now();
        let fetched = self.client.fetch_identity(&payload.access_token).await;
        metrics::record_upstream("identity", started.elapsed().as_secs_f64());
        let identity = fetched.map_err(|e| match e {
            meli_auth::Error::Api { status, payload } => {
                warn!(status, "identity lookup failed");
                BrokerError::IdentityFailed {
                    status,
                    detail: payload,
                }
            }
            other => BrokerError::Internal(other.to_string()),
        })?;

        let seller_id = identity.id.to_string();
        self.store
            .upsert_seller(SellerProfile {
                seller_id: seller_id.clone(),
                nickname: identity.nickname,
                site_id: identity.site_id,
                email: identity.email,
                raw_payload: identity.raw,
            })
            .await?;

        let record = self
            .store
            .upsert_tokens(
                &seller_id,
                TokenUpdate {
                    access_token: payload.access_token,
                    refresh_token,
                    token_type: payload.token_type,
                    scope: payload.scope,
                    expires_at: unix_now() + effective_expires_in(payload.expires_in),
                },
            )
            .await?;

        metrics::record_consume("ok");
        info!(
            %seller_id,
            token_prefix = token_prefix(&record.access_token),
            expires_at = record.expires_at,
            "seller connected"
        );
        Ok(ConsumeOutcome {
            ok: true,
            seller_id,
            expires_at: record.expires_at,
        })
    }

    /// Serve an access token for one seller, refreshing if the stored one
    /// is within the skew window of expiry. The row lease is held across
    /// the refresh so concurrent callers cause exactly one upstream call.
    pub async fn token(&self, seller_id: &str) -> Result<TokenBundle, BrokerError> {
        let seller_id: String = seller_id
            .trim()
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect();
        if seller_id.is_empty() {
            return Err(BrokerError::MissingSellerId);
        }

        let Some(lease) = self.store.lock_tokens(&seller_id).await? else {
            metrics::record_token_request("not_connected");
            return Err(BrokerError::NotConnected);
        };
        let record = lease.record().clone();

        if record.revoked_at.is_some() || record.refresh_token.is_empty() {
            lease.release().await?;
            metrics::record_token_request("not_connected");
            return Err(BrokerError::NotConnected);
        }

        let now = unix_now();
        if record.is_fresh(now, self.settings.token_skew_secs) {
            lease.release().await?;
            metrics::record_token_request("cached");
            return Ok(TokenBundle {
                seller_id,
                access_token: record.access_token,
                expires_at: record.expires_at,
            });
        }

        let started = std::time::Instant::now();
        let refreshed = self
            .client
            .refresh(
                &self.settings.client_id,
                self.settings.client_secret.expose(),
                &record.refresh_token,
            )
            .await;
        metrics::record_upstream("refresh", started.elapsed().as_secs_f64());
        let payload = match refreshed {
            Ok(payload) => payload,
            Err(err) => {
                // dropping the lease rolls back the row lock
                drop(lease);
                return Err(match err {
                    e if e.is_invalid_grant() => {
                        warn!(%seller_id, "refresh token rejected, reauthorization required");
                        metrics::record_refresh("reauth_required");
                        BrokerError::ReauthRequired
                    }
                    meli_auth::Error::Api { status, payload } => {
                        warn!(%seller_id, status, "token refresh failed");
                        metrics::record_refresh("failed");
                        BrokerError::RefreshFailed {
                            status,
                            detail: payload,
                        }
                    }
                    other => {
                        metrics::record_refresh("failed");
                        BrokerError::Internal(other.to_string())
                    }
                });
            }
        };

        let update = TokenUpdate {
            access_token: payload.access_token,
            // the upstream may omit the rotated refresh token; keep the old one
            refresh_token: payload
                .refresh_token
                .filter(|t| !t.is_empty())
                .unwrap_or(record.refresh_token),
            token_type: payload.token_type.or(record.token_type),
            scope: payload.scope.or(record.scope),
            expires_at: now + effective_expires_in(payload.expires_in),
        };
        let record = lease.commit_update(update).await?;

        metrics::record_refresh("ok");
        metrics::record_token_request("refreshed");
        info!(
            %seller_id,
            token_prefix = token_prefix(&record.access_token),
            expires_at = record.expires_at,
            "token refreshed"
        );
        Ok(TokenBundle {
            seller_id,
            access_token: record.access_token,
            expires_at: record.expires_at,
        })
    }
}

fn truncate(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

/// First 12 characters only; full tokens never reach the logs.
fn token_prefix(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(12)
        .map_or(token.len(), |(i, _)| i);
    &token[..end]
}
