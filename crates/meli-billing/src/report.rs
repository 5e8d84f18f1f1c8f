//! Billing report API: periods, report creation, polling, download
//!
//! Every authenticated call carries the broker-issued bearer token. A 401 or
//! 403 (stale cached token) forces exactly one token re-fetch; 429 and 5xx
//! responses retry within the bounded read policy. Other failures surface
//! as-is.

use std::time::Duration;

use meli_auth::RetryPolicy;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::periods::{Period, parse_periods};
use crate::token_source::{BrokerTokenSource, should_refresh_on};

const LIST_TIMEOUT: Duration = Duration::from_secs(30);
const CREATE_TIMEOUT: Duration = Duration::from_secs(45);
const STATUS_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const LINK_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_POLL_DEADLINE: Duration = Duration::from_secs(600);

/// Client for the marketplace billing integration endpoints.
pub struct BillingClient {
    http: reqwest::Client,
    api_base: String,
    tokens: BrokerTokenSource,
    poll_interval: Duration,
    poll_deadline: Duration,
}

impl BillingClient {
    pub fn new(
        http: reqwest::Client,
        api_base: impl Into<String>,
        tokens: BrokerTokenSource,
    ) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_owned(),
            tokens,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_deadline: DEFAULT_POLL_DEADLINE,
        }
    }

    /// Override the polling cadence. Tests use millisecond values.
    pub fn with_polling(mut self, interval: Duration, deadline: Duration) -> Self {
        self.poll_interval = interval;
        self.poll_deadline = deadline;
        self
    }

    /// List available billing periods. Both parameters are mandatory; the
    /// upstream rejects a missing document type with a 422.
    pub async fn list_periods(&self, group: &str, document_type: &str) -> Result<Vec<Period>> {
        let group = require("group", group)?;
        let document_type = require("document_type", document_type)?;

        let url = format!("{}/billing/integration/periods", self.api_base);
        let response = self
            .authed(|token| {
                self.http
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[("group", group.as_str()), ("document_type", document_type.as_str())])
                    .header(reqwest::header::ACCEPT, "application/json")
                    .timeout(LIST_TIMEOUT)
            })
            .await?;

        let payload = expect_json(response).await?;
        Ok(parse_periods(&payload))
    }

    /// Request generation of a report for one period. Returns the file id.
    pub async fn create_report(
        &self,
        period_key: &str,
        group: &str,
        document_type: &str,
        report_format: &str,
    ) -> Result<String> {
        let period_key = require("period_key", period_key)?;
        let url = format!(
            "{}/billing/integration/periods/key/{period_key}/reports",
            self.api_base
        );
        let body = serde_json::json!({
            "group": group,
            "document_type": document_type,
            "report_format": report_format,
        });

        let response = self
            .authed(|token| {
                self.http
                    .post(&url)
                    .bearer_auth(token)
                    .json(&body)
                    .header(reqwest::header::ACCEPT, "application/json")
                    .timeout(CREATE_TIMEOUT)
            })
            .await?;

        let payload = expect_json(response).await?;
        // the id field spelling varies by report type
        let file_id = ["fileId", "file_id", "id", "file"]
            .iter()
            .find_map(|k| scalar_string(payload.get(*k)))
            .ok_or_else(|| Error::Format(format!("report creation payload has no file id: {payload}")))?;
        info!(%file_id, %period_key, "report creation accepted");
        Ok(file_id)
    }

    /// Poll the report status until READY, a terminal failure status, or
    /// the deadline.
    pub async fn poll_until_ready(&self, file_id: &str, document_type: &str) -> Result<Value> {
        let url = format!(
            "{}/billing/integration/reports/{file_id}/status",
            self.api_base
        );
        let deadline = Instant::now() + self.poll_deadline;

        loop {
            let response = self
                .authed(|token| {
                    self.http
                        .get(&url)
                        .bearer_auth(token)
                        .query(&[("document_type", document_type)])
                        .header(reqwest::header::ACCEPT, "application/json")
                        .timeout(STATUS_TIMEOUT)
                })
                .await?;
            let payload = expect_json(response).await?;

            let status = ["status", "state", "report_status"]
                .iter()
                .find_map(|k| scalar_string(payload.get(*k)))
                .unwrap_or_default()
                .to_uppercase();
            debug!(%file_id, %status, "report status");

            match status.as_str() {
                "READY" => return Ok(payload),
                "ERROR" | "FAILED" | "CANCELLED" => {
                    return Err(Error::ReportFailed { status, payload });
                }
                _ => {}
            }

            if Instant::now() >= deadline {
                return Err(Error::Timeout { last_payload: payload });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Download the finished report. The endpoint either streams the file
    /// directly or returns a JSON envelope with a signed link, fetched
    /// without authentication.
    pub async fn download(&self, file_id: &str, document_type: &str) -> Result<(Vec<u8>, String)> {
        let url = format!("{}/billing/integration/reports/{file_id}", self.api_base);
        let response = self
            .authed(|token| {
                self.http
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[("document_type", document_type)])
                    .header(reqwest::header::ACCEPT, "*/*")
                    .timeout(DOWNLOAD_TIMEOUT)
            })
            .await?;

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(api_error(status, response).await);
        }

        let content_type = header_lower(&response, reqwest::header::CONTENT_TYPE);
        if !content_type.contains("application/json") {
            let bytes = read_body(response).await?;
            return Ok((bytes, content_type));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| Error::Network(format!("reading download envelope: {e}")))?;
        let link = ["url", "download_url", "link"]
            .iter()
            .find_map(|k| scalar_string(payload.get(*k)))
            .ok_or_else(|| Error::Format(format!("download envelope has no link: {payload}")))?;

        debug!(%file_id, "following signed download link");
        let linked = self
            .http
            .get(&link)
            .timeout(LINK_DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        let status = linked.status().as_u16();
        if status >= 400 {
            return Err(api_error(status, linked).await);
        }
        let content_type = header_lower(&linked, reqwest::header::CONTENT_TYPE);
        let bytes = read_body(linked).await?;
        Ok((bytes, content_type))
    }

    /// Send an authenticated request. A 401/403 forces one token re-fetch;
    /// transient failures (429, 5xx, network errors) retry within the read
    /// policy budget.
    async fn authed<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let policy = RetryPolicy::read();
        let mut bundle = self.tokens.get(false).await?;
        let mut refreshed = false;
        let mut attempt = 0u32;
        loop {
            let response = match build(&bundle.access_token).send().await {
                Ok(r) => r,
                Err(e) => {
                    if attempt >= policy.max_retries {
                        return Err(Error::Network(e.to_string()));
                    }
                    let delay = policy.delay(attempt, None);
                    warn!(attempt, error = %e, "billing request failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
            };

            let status = response.status().as_u16();
            if should_refresh_on(status) && !refreshed {
                warn!(status, "stale token, forcing refresh");
                bundle = self.tokens.get(true).await?;
                refreshed = true;
                continue;
            }
            if RetryPolicy::is_retryable_status(status) && attempt < policy.max_retries {
                let delay = policy.delay(attempt, retry_after_secs(&response));
                debug!(status, attempt, delay_ms = delay.as_millis() as u64, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            return Ok(response);
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

fn require(name: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::Format(format!("{name} must not be empty")));
    }
    Ok(trimmed.to_owned())
}

fn scalar_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn header_lower(response: &reqwest::Response, name: reqwest::header::HeaderName) -> String {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_lowercase()
}

async fn read_body(response: reqwest::Response) -> Result<Vec<u8>> {
    Ok(response
        .bytes()
        .await
        .map_err(|e| Error::Network(format!("reading response body: {e}")))?
        .to_vec())
}

async fn expect_json(response: reqwest::Response) -> Result<Value> {
    let status = response.status().as_u16();
    if status >= 400 {
        return Err(api_error(status, response).await);
    }
    response
        .json()
        .await
        .map_err(|e| Error::Network(format!("decoding response body: {e}")))
}

async fn api_error(status: u16, response: reqwest::Response) -> Error {
    let text = response.text().await.unwrap_or_default();
    let payload = serde_json::from_str(&text).unwrap_or_else(|_| {
        serde_json::json!({"raw": text.chars().take(1200).collect::<String>()})
    });
    Error::Api { status, payload }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use serde_json::json;

    use super::*;
    use crate::periods::choose_period;

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

    /// Broker stub that hands out `tok-0`, `tok-1`, ... per fetch.
    fn broker_router(fetches: Arc<AtomicUsize>) -> Router {
        Router::new()
            .route(
                "/internal/meli/token",
                get(|State(fetches): State<Arc<AtomicUsize>>| async move {
                    let n = fetches.fetch_add(1, Ordering::SeqCst);
                    axum::Json(json!({
                        "seller_id": "123",
                        "access_token": format!("tok-{n}"),
                        "expires_at": 2_000_000_000i64
                    }))
                }),
            )
            .with_state(fetches)
    }

    async fn client_against(billing: Router) -> (BillingClient, Arc<AtomicUsize>) {
        let fetches = Arc::new(AtomicUsize::new(0));
        let broker = serve(broker_router(fetches.clone())).await;
        let billing = serve(billing).await;
        let http = reqwest::Client::new();
        let tokens = BrokerTokenSource::new(http.clone(), broker, "test-key", "123");
        (BillingClient::new(http, billing, tokens), fetches)
    }

    fn bearer(headers: &HeaderMap) -> String {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or_default()
            .to_owned()
    }

    #[tokio::test]
    async fn lists_and_chooses_periods() {
        let billing = Router::new().route(
            "/billing/integration/periods",
            get(|| async {
                axum::Json(json!({"periods": [
                    {"key": "2025-07", "to": "2025-07-31"},
                    {"key": "2025-08", "to": "2025-08-31"},
                ]}))
            }),
        );
        let (client, _) = client_against(billing).await;

        let periods = client.list_periods("ML", "BILL").await.unwrap();
        assert_eq!(periods.len(), 2);
        assert_eq!(choose_period(&periods).unwrap(), "2025-08");
    }

    #[tokio::test]
    async fn empty_group_is_rejected_locally() {
        let (client, fetches) = client_against(Router::new()).await;
        let err = client.list_periods("  ", "BILL").await.unwrap_err();
        assert!(matches!(err, Error::Format(_)));
        assert_eq!(fetches.load(Ordering::SeqCst), 0, "no network call");
    }

    #[tokio::test]
    async fn stale_token_is_refreshed_once() {
        // first token (tok-0) is rejected with 401, refreshed tok-1 works
        let billing = Router::new().route(
            "/billing/integration/periods",
            get(|headers: HeaderMap| async move {
                if bearer(&headers) == "tok-0" {
                    StatusCode::UNAUTHORIZED.into_response()
                } else {
                    axum::Json(json!([{"key": "P", "to": "2025-08-31"}])).into_response()
                }
            }),
        );
        let (client, fetches) = client_against(billing).await;

        let periods = client.list_periods("ML", "BILL").await.unwrap();
        assert_eq!(periods.len(), 1);
        assert_eq!(fetches.load(Ordering::SeqCst), 2, "one refresh, no loop");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_500_is_retried_then_succeeds() {
        let hits = Arc::new(AtomicUsize::new(0));
        let billing = Router::new()
            .route(
                "/billing/integration/periods",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                        StatusCode::INTERNAL_SERVER_ERROR.into_response()
                    } else {
                        axum::Json(json!([{"key": "P", "to": "2025-08-31"}])).into_response()
                    }
                }),
            )
            .with_state(hits.clone());
        let (client, fetches) = client_against(billing).await;

        let periods = client.list_periods("ML", "BILL").await.unwrap();
        assert_eq!(periods.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(fetches.load(Ordering::SeqCst), 1, "5xx must not refresh the token");
    }

    #[tokio::test]
    async fn create_report_accepts_id_spellings() {
        let billing = Router::new().route(
            "/billing/integration/periods/key/{key}/reports",
            post(|Path(key): Path<String>| async move {
                assert_eq!(key, "2025-08");
                axum::Json(json!({"file_id": 987654}))
            }),
        );
        let (client, _) = client_against(billing).await;

        let file_id = client
            .create_report("2025-08", "ML", "BILL", "CSV")
            .await
            .unwrap();
        assert_eq!(file_id, "987654");
    }

    #[tokio::test]
    async fn poll_waits_for_ready() {
        let polls = Arc::new(AtomicUsize::new(0));
        let billing = Router::new()
            .route(
                "/billing/integration/reports/{id}/status",
                get(|State(polls): State<Arc<AtomicUsize>>| async move {
                    if polls.fetch_add(1, Ordering::SeqCst) < 2 {
                        axum::Json(json!({"status": "processing"}))
                    } else {
                        axum::Json(json!({"status": "READY", "file_id": "F-1"}))
                    }
                }),
            )
            .with_state(polls.clone());
        let (client, _) = client_against(billing).await;
        let client =
            client.with_polling(Duration::from_millis(10), Duration::from_secs(5));

        let payload = client.poll_until_ready("F-1", "BILL").await.unwrap();
        assert_eq!(payload["status"], "READY");
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn poll_fails_fast_on_terminal_status() {
        let billing = Router::new().route(
            "/billing/integration/reports/{id}/status",
            get(|| async { axum::Json(json!({"state": "failed", "cause": "upstream"})) }),
        );
        let (client, _) = client_against(billing).await;

        let err = client.poll_until_ready("F-1", "BILL").await.unwrap_err();
        match err {
            Error::ReportFailed { status, payload } => {
                assert_eq!(status, "FAILED");
                assert_eq!(payload["cause"], "upstream");
            }
            other => panic!("expected ReportFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn poll_times_out_at_deadline() {
        let billing = Router::new().route(
            "/billing/integration/reports/{id}/status",
            get(|| async { axum::Json(json!({"status": "PROCESSING"})) }),
        );
        let (client, _) = client_against(billing).await;
        let client =
            client.with_polling(Duration::from_millis(10), Duration::from_millis(50));

        let err = client.poll_until_ready("F-1", "BILL").await.unwrap_err();
        match err {
            Error::Timeout { last_payload } => {
                assert_eq!(last_payload["status"], "PROCESSING");
            }
            other => panic!("expected Timeout, got {other}"),
        }
    }

    #[tokio::test]
    async fn download_direct_body() {
        let billing = Router::new().route(
            "/billing/integration/reports/{id}",
            get(|| async {
                ([("content-type", "text/csv")], "col_a,col_b\n1,2\n")
            }),
        );
        let (client, _) = client_against(billing).await;

        let (bytes, content_type) = client.download("F-1", "BILL").await.unwrap();
        assert_eq!(bytes, b"col_a,col_b\n1,2\n");
        assert_eq!(content_type, "text/csv");
    }

    #[tokio::test]
    async fn download_follows_json_envelope_link() {
        // bind first so the envelope handler can point back at this server
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let link = format!("{base}/signed/file.csv");

        let billing = Router::new()
            .route(
                "/billing/integration/reports/{id}",
                get(move || {
                    let link = link.clone();
                    async move { axum::Json(json!({"download_url": link})) }
                }),
            )
            .route(
                "/signed/file.csv",
                get(|headers: HeaderMap| async move {
                    assert!(bearer(&headers).is_empty(), "signed link is unauthenticated");
                    ([("content-type", "text/csv")], "a,b\n")
                }),
            );
        tokio::spawn(async move {
            axum::serve(listener, billing).await.expect("serve mock");
        });

        let fetches = Arc::new(AtomicUsize::new(0));
        let broker = serve(broker_router(fetches)).await;
        let http = reqwest::Client::new();
        let tokens = BrokerTokenSource::new(http.clone(), broker, "test-key", "123");
        let client = BillingClient::new(http, base, tokens);

        let (bytes, content_type) = client.download("F-1", "BILL").await.unwrap();
        assert_eq!(bytes, b"a,b\n");
        assert_eq!(content_type, "text/csv");
    }
}
