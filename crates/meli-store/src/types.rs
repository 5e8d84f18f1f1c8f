//! Row types shared by both backends
//!
//! All timestamps are unix seconds (`i64`), written through
//! [`common::unix_now`]. Keeping them as plain integers sidesteps driver
//! time-type mapping and makes skew arithmetic in the broker trivial.

use serde_json::Value;

use crate::error::{Error, Result};

/// One pending authorization flow. `state_hash` is the SHA-256 hex of the
/// raw state; the raw value never touches the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuthorizationState {
    pub state_hash: String,
    pub code_verifier: String,
    pub expires_at: i64,
    pub used_at: Option<i64>,
    pub requester: Option<String>,
}

/// Stored token bundle for one seller. `revoked_at` is a soft flag: revoked
/// rows stay in place and the broker reports the seller as not connected.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TokenRecord {
    pub seller_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: Option<String>,
    pub scope: Option<String>,
    pub obtained_at: i64,
    pub expires_at: i64,
    pub last_refresh_at: Option<i64>,
    pub revoked_at: Option<i64>,
}

impl TokenRecord {
    /// Whether the access token is still usable at `now`, with `skew`
    /// seconds of safety margin.
    pub fn is_fresh(&self, now: i64, skew: i64) -> bool {
        self.expires_at > now + skew
    }
}

/// Fields written on exchange and refresh.
#[derive(Debug, Clone)]
pub struct TokenUpdate {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: Option<String>,
    pub scope: Option<String>,
    pub expires_at: i64,
}

impl TokenUpdate {
    /// Reject empty credentials before they can clobber a good row.
    pub fn validate(&self) -> Result<()> {
        if self.access_token.is_empty() {
            return Err(Error::InvalidPayload("access_token is empty".into()));
        }
        if self.refresh_token.is_empty() {
            return Err(Error::InvalidPayload("refresh_token is empty".into()));
        }
        Ok(())
    }
}

/// Seller identity snapshot captured at consume time.
#[derive(Debug, Clone)]
pub struct SellerProfile {
    pub seller_id: String,
    pub nickname: Option<String>,
    pub site_id: Option<String>,
    pub email: Option<String>,
    pub raw_payload: Value,
}
