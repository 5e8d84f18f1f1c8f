//! Broker error taxonomy and HTTP mapping
//!
//! Every failure renders as `{"error": <kind>, ...detail}` with a status the
//! callers key on: 400 for caller mistakes and upstream rejections, 401 for
//! a bad internal key, 409 when the seller must reauthorize, 500 otherwise.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Malformed request input other than the state token.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown or forged state")]
    InvalidState,

    #[error("state already used")]
    StateAlreadyUsed,

    #[error("state expired")]
    StateExpired,

    #[error("missing seller_id")]
    MissingSellerId,

    /// Seller has no usable tokens: never connected, revoked, or the stored
    /// row lacks a refresh token.
    #[error("seller not connected")]
    NotConnected,

    /// Exchange or refresh answered 2xx but without usable credentials.
    #[error("token payload invalid")]
    TokenPayloadInvalid,

    #[error("token exchange failed (status {status})")]
    ExchangeFailed { status: u16, detail: Value },

    #[error("identity lookup failed (status {status})")]
    IdentityFailed { status: u16, detail: Value },

    #[error("token refresh failed (status {status})")]
    RefreshFailed { status: u16, detail: Value },

    /// Refresh token is dead; the seller must go through authorization again.
    #[error("reauthorization required")]
    ReauthRequired,

    #[error("unauthorized")]
    Unauthorized,

    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::ReauthRequired => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    fn body(&self) -> Value {
        match self {
            Self::InvalidRequest(detail) => json!({"error": "invalid_request", "detail": detail}),
            Self::InvalidState => json!({"error": "invalid_state"}),
            Self::StateAlreadyUsed => json!({"error": "state_already_used"}),
            Self::StateExpired => json!({"error": "state_expired"}),
            Self::MissingSellerId => json!({"error": "missing_seller_id"}),
            Self::NotConnected => json!({"error": "not_connected"}),
            Self::TokenPayloadInvalid => json!({"error": "token_payload_invalid"}),
            Self::ExchangeFailed { status, detail } => {
                json!({"error": "token_exchange_failed", "status": status, "detail": detail})
            }
            Self::IdentityFailed { status, detail } => {
                json!({"error": "users_me_failed", "status": status, "detail": detail})
            }
            Self::RefreshFailed { status, detail } => {
                json!({"error": "refresh_failed", "status": status, "detail": detail})
            }
            Self::ReauthRequired => json!({"error": "reauth_required"}),
            Self::Unauthorized => json!({"error": "unauthorized"}),
            Self::Internal(_) => json!({"error": "internal"}),
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

impl From<meli_store::Error> for BrokerError {
    fn from(err: meli_store::Error) -> Self {
        match err {
            meli_store::Error::InvalidState => Self::InvalidState,
            meli_store::Error::StateAlreadyUsed => Self::StateAlreadyUsed,
            meli_store::Error::StateExpired => Self::StateExpired,
            meli_store::Error::NotFound => Self::NotConnected,
            meli_store::Error::InvalidPayload(_) => Self::TokenPayloadInvalid,
            meli_store::Error::Conflict => Self::Internal("state collision".into()),
            meli_store::Error::Database(e) => Self::Internal(e.to_string()),
        }
    }
}
