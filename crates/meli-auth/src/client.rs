//! Mercado Livre API client: token exchange, refresh, and identity lookup
//!
//! The client is stateless. It holds a shared `reqwest::Client` and the API
//! base URL (overridable for tests). Retries follow the bounded policy in
//! [`RetryPolicy`]; terminal upstream failures surface as [`Error::Api`] with
//! the status and decoded body attached.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Production API base. Token and identity endpoints hang off this host.
pub const DEFAULT_API_BASE: &str = "https://api.mercadolibre.com";

/// Token endpoint timeout. Exchange can be slow right after authorization.
const TOKEN_TIMEOUT: Duration = Duration::from_secs(25);

/// Identity endpoint timeout.
const READ_TIMEOUT: Duration = Duration::from_secs(20);

/// Cap on how much of a non-JSON error body we keep for diagnostics.
const BODY_SNIPPET_MAX: usize = 2048;

/// Response of the token endpoint for both grant types.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenPayload {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    pub expires_in: i64,
}

/// Seller identity from `/users/me`, plus the raw JSON snapshot.
#[derive(Debug, Clone)]
pub struct IdentityPayload {
    pub id: i64,
    pub nickname: Option<String>,
    pub site_id: Option<String>,
    pub email: Option<String>,
    pub raw: Value,
}

impl IdentityPayload {
    fn from_value(raw: Value) -> Result<Self> {
        let id = raw
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::Format("identity response missing numeric id".into()))?;
        let text = |key: &str| raw.get(key).and_then(Value::as_str).map(str::to_owned);
        Ok(Self {
            id,
            nickname: text("nickname"),
            site_id: text("site_id"),
            email: text("email"),
            raw,
        })
    }
}

/// Client for the marketplace token and identity endpoints.
#[derive(Clone)]
pub struct MeliClient {
    http: reqwest::Client,
    api_base: String,
}

impl MeliClient {
    /// Client against the production API base.
    pub fn new() -> Result<Self> {
        Self::with_base(DEFAULT_API_BASE)
    }

    /// Client against an explicit base URL. Tests point this at a local
    /// mock server.
    pub fn with_base(api_base: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Network(format!("building HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_owned(),
        })
    }

    /// Exchange an authorization code for tokens (PKCE verifier included).
    ///
    /// Uses the exchange retry preset: codes are single-use, so the budget
    /// is deliberately short.
    pub async fn exchange_code(
        &self,
        client_id: &str,
        client_secret: &str,
        redirect_uri: &str,
        code: &str,
        verifier: &str,
    ) -> Result<TokenPayload> {
        let form = [
            ("grant_type", "authorization_code"),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", verifier),
        ];
        self.token_request(&form).await
    }

    /// Trade a refresh token for a fresh access token.
    pub async fn refresh(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<TokenPayload> {
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("refresh_token", refresh_token),
        ];
        self.token_request(&form).await
    }

    /// Fetch the authenticated seller's identity from `/users/me`.
    pub async fn fetch_identity(&self, access_token: &str) -> Result<IdentityPayload> {
        let policy = RetryPolicy::read();
        let url = format!("{}/users/me", self.api_base);
        let raw = self
            .request_json(policy, READ_TIMEOUT, || {
                self.http.get(&url).bearer_auth(access_token)
            })
            .await?;
        IdentityPayload::from_value(raw)
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenPayload> {
        let policy = RetryPolicy::exchange();
        let url = format!("{}/oauth/token", self.api_base);
        let raw = self
            .request_json(policy, TOKEN_TIMEOUT, || {
                self.http
                    .post(&url)
                    .header(reqwest::header::ACCEPT, "application/json")
                    .form(form)
            })
            .await?;
        serde_json::from_value(raw)
            .map_err(|e| Error::Format(format!("malformed token response: {e}")))
    }

    /// Send a request with the given retry policy, returning the decoded
    /// JSON body on success.
    async fn request_json<F>(
        &self,
        policy: RetryPolicy,
        timeout: Duration,
        build: F,
    ) -> Result<Value>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            let outcome = build().timeout(timeout).send().await;
            let response = match outcome {
                Ok(r) => r,
                Err(e) => {
                    if attempt >= policy.max_retries {
                        return Err(Error::Network(e.to_string()));
                    }
                    let delay = policy.delay(attempt, None);
                    warn!(attempt, error = %e, "marketplace request failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
            };

            let status = response.status().as_u16();
            if response.status().is_success() {
                let text = response
                    .text()
                    .await
                    .map_err(|e| Error::Network(format!("reading response body: {e}")))?;
                return serde_json::from_str(&text)
                    .map_err(|e| Error::Format(format!("non-JSON success body: {e}")));
            }

            if RetryPolicy::is_retryable_status(status) && attempt < policy.max_retries {
                let retry_after = retry_after_secs(&response);
                let delay = policy.delay(attempt, retry_after);
                debug!(status, attempt, delay_ms = delay.as_millis() as u64, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            let text = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status,
                payload: decode_error_body(&text),
            });
        }
    }
}

fn retry_after_secs(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Decode an error body as JSON, falling back to `{"raw": <truncated>}` for
/// HTML error pages and other non-JSON noise.
fn decode_error_body(text: &str) -> Value {
    match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            let snippet: String = text.chars().take(BODY_SNIPPET_MAX).collect();
            serde_json::json!({ "raw": snippet })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use serde_json::json;

    use super::*;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve mock");
        });
        format!("http://{addr}")
    }

    fn token_json() -> Value {
        json!({
            "access_token": "APP_USR-test-access",
            "refresh_token": "TG-test-refresh",
            "token_type": "Bearer",
            "scope": "offline_access read write",
            "expires_in": 21600
        })
    }

    #[tokio::test]
    async fn exchange_parses_token_payload() {
        let router = Router::new().route(
            "/oauth/token",
            post(|| async { axum::Json(token_json()) }),
        );
        let base = serve(router).await;

        let client = MeliClient::with_base(&base).unwrap();
        let payload = client
            .exchange_code("id", "secret", "https://cb.example/", "CODE", &"v".repeat(43))
            .await
            .unwrap();

        assert_eq!(payload.access_token, "APP_USR-test-access");
        assert_eq!(payload.refresh_token.as_deref(), Some("TG-test-refresh"));
        assert_eq!(payload.expires_in, 21600);
    }

    #[tokio::test]
    async fn terminal_400_is_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/oauth/token",
                post(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::BAD_REQUEST, axum::Json(json!({"error": "invalid_grant"})))
                }),
            )
            .with_state(hits.clone());
        let base = serve(router).await;

        let client = MeliClient::with_base(&base).unwrap();
        let err = client.refresh("id", "secret", "TG-dead").await.unwrap_err();

        assert!(err.is_invalid_grant(), "got: {err}");
        assert_eq!(hits.load(Ordering::SeqCst), 1, "400 must not be retried");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_500_is_retried_then_succeeds() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/oauth/token",
                post(|State(hits): State<Arc<AtomicUsize>>| async move {
                    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                        StatusCode::INTERNAL_SERVER_ERROR.into_response()
                    } else {
                        axum::Json(token_json()).into_response()
                    }
                }),
            )
            .with_state(hits.clone());
        let base = serve(router).await;

        let client = MeliClient::with_base(&base).unwrap();
        let payload = client.refresh("id", "secret", "TG-ok").await.unwrap();

        assert_eq!(payload.access_token, "APP_USR-test-access");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rate_limit_honors_retry_after() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/oauth/token",
                post(|State(hits): State<Arc<AtomicUsize>>| async move {
                    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                        let mut headers = HeaderMap::new();
                        headers.insert("retry-after", "0".parse().unwrap());
                        (StatusCode::TOO_MANY_REQUESTS, headers).into_response()
                    } else {
                        axum::Json(token_json()).into_response()
                    }
                }),
            )
            .with_state(hits.clone());
        let base = serve(router).await;

        let client = MeliClient::with_base(&base).unwrap();
        let payload = client.refresh("id", "secret", "TG-ok").await.unwrap();

        assert_eq!(payload.access_token, "APP_USR-test-access");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn identity_parses_and_keeps_raw_snapshot() {
        let router = Router::new().route(
            "/users/me",
            get(|headers: HeaderMap| async move {
                assert!(
                    headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .is_some_and(|v| v.starts_with("Bearer ")),
                    "identity call must be bearer-authenticated"
                );
                axum::Json(json!({
                    "id": 123456789,
                    "nickname": "LOJA_TESTE",
                    "site_id": "MLB",
                    "email": "seller@example.com",
                    "country_id": "BR"
                }))
            }),
        );
        let base = serve(router).await;

        let client = MeliClient::with_base(&base).unwrap();
        let identity = client.fetch_identity("APP_USR-access").await.unwrap();

        assert_eq!(identity.id, 123456789);
        assert_eq!(identity.nickname.as_deref(), Some("LOJA_TESTE"));
        assert_eq!(identity.site_id.as_deref(), Some("MLB"));
        assert_eq!(identity.raw["country_id"], "BR");
    }

    #[tokio::test]
    async fn non_json_error_body_is_captured_as_raw() {
        let router = Router::new().route(
            "/users/me",
            get(|| async { (StatusCode::FORBIDDEN, "<html>blocked</html>") }),
        );
        let base = serve(router).await;

        let client = MeliClient::with_base(&base).unwrap();
        let err = client.fetch_identity("APP_USR-access").await.unwrap_err();

        match err {
            Error::Api { status, payload } => {
                assert_eq!(status, 403);
                assert_eq!(payload["raw"], "<html>blocked</html>");
            }
            other => panic!("expected Api error, got {other}"),
        }
    }

    #[tokio::test]
    async fn identity_without_id_is_a_format_error() {
        let router = Router::new().route(
            "/users/me",
            get(|| async { axum::Json(json!({"nickname": "NO_ID"})) }),
        );
        let base = serve(router).await;

        let client = MeliClient::with_base(&base).unwrap();
        let err = client.fetch_identity("APP_USR-access").await.unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }
}
