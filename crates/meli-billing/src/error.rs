//! Billing pipeline errors

use serde_json::Value;

/// Errors from the token source, the billing API, and the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input (empty group, document type, period key).
    #[error("format error: {0}")]
    Format(String),

    /// The broker reported the seller never completed authorization.
    #[error("seller not connected: {0}")]
    NotConnected(Value),

    /// The broker requires a fresh authorization (dead refresh token).
    #[error("reauthorization required")]
    ReauthRequired,

    /// The periods listing came back empty or without a usable key.
    #[error("no usable billing period: {0}")]
    EmptyResult(String),

    /// The report reached a terminal failure status upstream.
    #[error("report failed with status {status}: {payload}")]
    ReportFailed { status: String, payload: Value },

    /// The report never became ready within the polling deadline.
    #[error("report not ready before deadline; last status payload: {last_payload}")]
    Timeout { last_payload: Value },

    /// Terminal HTTP failure from the billing API or the broker.
    #[error("billing API error (status {status}): {payload}")]
    Api { status: u16, payload: Value },

    #[error("network error: {0}")]
    Network(String),
}

/// Result alias for billing operations.
pub type Result<T> = std::result::Result<T, Error>;
