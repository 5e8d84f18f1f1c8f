//! PKCE (Proof Key for Code Exchange) per RFC 7636
//!
//! Generates the anti-CSRF state, the code verifier, and the S256 challenge
//! used during the authorization flow. The verifier is stored server-side
//! (keyed by the state hash) and sent during token exchange; the challenge is
//! embedded in the authorization URL so the authorization server can verify
//! the exchange request came from the party that initiated the flow.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{Error, Result};

/// RFC 7636 bounds for the code verifier length.
const VERIFIER_MIN: usize = 43;
const VERIFIER_MAX: usize = 128;

/// Default verifier length. Comfortable margin above the RFC minimum.
pub const DEFAULT_VERIFIER_LEN: usize = 64;

/// Unreserved characters allowed in a code verifier (RFC 7636 section 4.1).
const VERIFIER_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// Generate an anti-CSRF state token: 16 random bytes hex-encoded,
/// giving 32 lowercase hex characters (128 bits of entropy).
pub fn make_state() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes[..]);
    hex::encode(bytes)
}

/// Generate a cryptographically random PKCE code verifier.
///
/// Characters are drawn uniformly from the RFC 7636 unreserved set; the
/// requested length is clamped to the [43, 128] range so the output is
/// always valid.
pub fn make_verifier(length: usize) -> String {
    let length = length.clamp(VERIFIER_MIN, VERIFIER_MAX);
    let mut rng = rand::rng();
    (0..length)
        .map(|_| {
            let idx = rng.random_range(0..VERIFIER_CHARSET.len());
            VERIFIER_CHARSET[idx] as char
        })
        .collect()
}

/// Compute the S256 code challenge from a verifier:
/// `challenge = BASE64URL(SHA256(verifier))`, no padding.
///
/// Validates the verifier first so a malformed value can never produce a
/// challenge that the authorization server would later reject.
pub fn make_challenge(verifier: &str) -> Result<String> {
    validate_verifier(verifier)?;
    let hash = Sha256::digest(verifier.as_bytes());
    Ok(URL_SAFE_NO_PAD.encode(hash))
}

/// SHA-256 of a string, lowercase hex. Used to derive the stored state hash
/// so the raw state value never reaches the database.
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Validate a code verifier per RFC 7636: length in [43, 128] and only
/// unreserved characters.
pub fn validate_verifier(verifier: &str) -> Result<()> {
    let len = verifier.len();
    if !(VERIFIER_MIN..=VERIFIER_MAX).contains(&len) {
        return Err(Error::Format(format!(
            "code_verifier length {len} outside [{VERIFIER_MIN}, {VERIFIER_MAX}]"
        )));
    }
    if let Some(ch) = verifier
        .bytes()
        .find(|b| !VERIFIER_CHARSET.contains(b))
    {
        return Err(Error::Format(format!(
            "code_verifier contains character outside the PKCE charset: {:?}",
            ch as char
        )));
    }
    Ok(())
}

/// Validate an anti-CSRF state token: lowercase hex, at least 32 characters
/// (128 bits).
pub fn validate_state(state: &str) -> Result<()> {
    if state.len() < 32 {
        return Err(Error::Format(format!(
            "state too short: {} chars (minimum 32)",
            state.len()
        )));
    }
    if !state
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Err(Error::Format("state is not lowercase hex".into()));
    }
    Ok(())
}

/// Parameters for building the external authorization URL.
pub struct AuthorizationUrlParams<'a> {
    pub auth_base: &'a str,
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub scope: &'a str,
    pub state: &'a str,
    pub challenge: &'a str,
}

/// Build the full authorization URL with all required OAuth parameters.
///
/// The state is returned unchanged by the authorization server in the
/// callback; the challenge binds the later token exchange to this flow.
pub fn build_authorization_url(params: &AuthorizationUrlParams<'_>) -> Result<String> {
    let url = Url::parse_with_params(
        params.auth_base,
        &[
            ("response_type", "code"),
            ("client_id", params.client_id),
            ("redirect_uri", params.redirect_uri),
            ("state", params.state),
            ("code_challenge", params.challenge),
            ("code_challenge_method", "S256"),
            ("scope", params.scope),
        ],
    )
    .map_err(|e| Error::Format(format!("invalid authorization base URL: {e}")))?;
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_params<'a>(state: &'a str, challenge: &'a str) -> AuthorizationUrlParams<'a> {
        AuthorizationUrlParams {
            auth_base: "https://auth.mercadolivre.com.br/authorization",
            client_id: "12345",
            redirect_uri: "https://example.com/callback",
            scope: "offline_access read write",
            state,
            challenge,
        }
    }

    #[test]
    fn state_is_32_lowercase_hex_chars() {
        let state = make_state();
        assert_eq!(state.len(), 32);
        assert!(validate_state(&state).is_ok());
    }

    #[test]
    fn states_are_unique() {
        assert_ne!(make_state(), make_state(), "two states must not collide");
    }

    #[test]
    fn verifier_roundtrips_validation() {
        // every freshly made verifier must be accepted by the validator
        let verifier = make_verifier(DEFAULT_VERIFIER_LEN);
        assert_eq!(verifier.len(), 64);
        assert!(validate_verifier(&verifier).is_ok());
    }

    #[test]
    fn verifier_length_is_clamped() {
        assert_eq!(make_verifier(5).len(), 43);
        assert_eq!(make_verifier(1000).len(), 128);
    }

    #[test]
    fn challenge_is_deterministic_and_distinct() {
        let a = make_verifier(64);
        let b = make_verifier(64);
        assert_eq!(make_challenge(&a).unwrap(), make_challenge(&a).unwrap());
        assert_ne!(make_challenge(&a).unwrap(), make_challenge(&b).unwrap());
    }

    #[test]
    fn challenge_matches_known_value() {
        // SHA256 of 43 'v' characters, base64url without padding.
        let verifier = "v".repeat(43);
        let challenge = make_challenge(&verifier).unwrap();
        assert_eq!(challenge.len(), 43);
        assert!(
            challenge
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
            "challenge must be URL-safe base64 without padding: {challenge}"
        );
    }

    #[test]
    fn short_verifier_rejected() {
        let err = validate_verifier("short").unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn verifier_with_bad_charset_rejected() {
        let bad = format!("{}+", "a".repeat(42));
        assert!(validate_verifier(&bad).is_err());
    }

    #[test]
    fn uppercase_hex_state_rejected() {
        let state = "A".repeat(32);
        assert!(validate_state(&state).is_err());
    }

    #[test]
    fn short_state_rejected() {
        assert!(validate_state("abcdef").is_err());
    }

    #[test]
    fn sha256_hex_is_64_chars() {
        let hash = sha256_hex(&make_state());
        assert_eq!(hash.len(), 64);
        assert!(hash.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn authorization_url_contains_required_params() {
        let state = make_state();
        let verifier = make_verifier(64);
        let challenge = make_challenge(&verifier).unwrap();
        let url = build_authorization_url(&test_params(&state, &challenge)).unwrap();

        assert!(url.starts_with("https://auth.mercadolivre.com.br/authorization?"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("client_id=12345"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains(&format!("state={state}")));
        assert!(url.contains("scope=offline_access"));
        // The space-separated scope must be encoded, never raw
        assert!(!url.contains(' '));
    }

    #[test]
    fn authorization_url_rejects_bad_base() {
        let params = AuthorizationUrlParams {
            auth_base: "not a url",
            ..test_params("s", "c")
        };
        assert!(build_authorization_url(&params).is_err());
    }
}
