//! Error types for PKCE and marketplace API operations

/// Errors from PKCE validation and marketplace API calls.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input (state, verifier, URL). Never retried; the caller
    /// must fix the input.
    #[error("format error: {0}")]
    Format(String),

    /// Terminal upstream failure after the retry budget is exhausted.
    /// Carries the HTTP status and the response body for diagnostics.
    #[error("marketplace API error (status {status}): {payload}")]
    Api {
        status: u16,
        payload: serde_json::Value,
    },

    /// Network-level failure (timeout, connection refused) after retries.
    #[error("network error: {0}")]
    Network(String),
}

impl Error {
    /// Whether this is the `invalid_grant` refresh rejection, which signals
    /// the stored refresh token is dead and the seller must reauthorize.
    pub fn is_invalid_grant(&self) -> bool {
        match self {
            Error::Api { status: 400, payload } => {
                let matches = |key: &str| {
                    payload
                        .get(key)
                        .and_then(|v| v.as_str())
                        .is_some_and(|s| s == "invalid_grant")
                };
                matches("error") || matches("message")
            }
            _ => false,
        }
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invalid_grant_detected_in_error_field() {
        let err = Error::Api {
            status: 400,
            payload: json!({"error": "invalid_grant"}),
        };
        assert!(err.is_invalid_grant());
    }

    #[test]
    fn invalid_grant_detected_in_message_field() {
        let err = Error::Api {
            status: 400,
            payload: json!({"message": "invalid_grant"}),
        };
        assert!(err.is_invalid_grant());
    }

    #[test]
    fn other_400_is_not_invalid_grant() {
        let err = Error::Api {
            status: 400,
            payload: json!({"error": "invalid_client"}),
        };
        assert!(!err.is_invalid_grant());
    }

    #[test]
    fn invalid_grant_requires_status_400() {
        let err = Error::Api {
            status: 401,
            payload: json!({"error": "invalid_grant"}),
        };
        assert!(!err.is_invalid_grant());
    }
}
