//! Batch delivery to the ingestion API.
//!
//! One batch is one `POST` of the envelope
//! `{"customer_id", "log_type", "entries"}` with a bearer token. Transient
//! failures are retried according to the client's [`RetryPolicy`]; anything
//! else comes back to the caller as a [`DeliveryError`].

pub mod auth;
pub mod retry;

pub use auth::{
    AccessToken, MetadataServerTokenProvider, StaticTokenProvider, TokenCache, TokenProvider,
    provider_from_config,
};
pub use retry::RetryPolicy;

use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use snafu::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::batch::{Batch, Envelope};
use crate::config::IngestionConfig;
use crate::emit;
use crate::error::{AuthSnafu, DeliveryError, SerializeSnafu, TransportSnafu};
use crate::metrics::events::{BatchFailed, BatchSent, DeliveryRetried, RecordsDelivered};

/// Longest response body kept in an error.
const MAX_ERROR_BODY: usize = 512;

/// Shared handle to a delivery client.
pub type DeliveryClientRef = Arc<DeliveryClient>;

/// Sends batches to the ingestion endpoint.
pub struct DeliveryClient {
    http: reqwest::Client,
    endpoint: String,
    customer_id: String,
    tokens: TokenCache,
    retry: RetryPolicy,
}

impl DeliveryClient {
    pub fn new(
        http: reqwest::Client,
        endpoint: impl Into<String>,
        customer_id: impl Into<String>,
        tokens: TokenCache,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            customer_id: customer_id.into(),
            tokens,
            retry,
        }
    }

    /// Build the HTTP client, token provider and retry policy from config.
    pub fn from_config(config: &IngestionConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        let provider = provider_from_config(&config.auth, http.clone());

        Ok(Self::new(
            http,
            &config.endpoint,
            &config.customer_id,
            TokenCache::new(provider),
            RetryPolicy::from(&config.retry),
        ))
    }

    pub fn customer_id(&self) -> &str {
        &self.customer_id
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Deliver one batch, retrying transient failures.
    ///
    /// Returns the last error wrapped in `RetriesExhausted` once the policy
    /// gives up on a transient failure; permanent failures are returned as-is.
    pub async fn deliver(&self, log_type: &str, batch: &Batch) -> Result<(), DeliveryError> {
        if batch.is_empty() {
            return Ok(());
        }

        let body = Envelope {
            customer_id: &self.customer_id,
            log_type,
            entries: batch.entries(),
        }
        .to_body()
        .context(SerializeSnafu)?;

        let mut attempt = 1;
        loop {
            match self.send(&body).await {
                Ok(()) => {
                    emit!(BatchSent {
                        bytes: body.len(),
                        log_type: log_type.to_string(),
                    });
                    emit!(RecordsDelivered {
                        count: batch.len() as u64,
                        log_type: log_type.to_string(),
                    });
                    debug!(
                        log_type,
                        entries = batch.len(),
                        bytes = body.len(),
                        attempt,
                        "Batch delivered"
                    );
                    return Ok(());
                }
                Err(err) if self.retry.should_retry(attempt, &err) => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        log_type,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Delivery attempt failed, retrying"
                    );
                    emit!(DeliveryRetried {
                        kind: err.kind(),
                        log_type: log_type.to_string(),
                    });
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    emit!(BatchFailed {
                        kind: err.kind(),
                        log_type: log_type.to_string(),
                    });
                    if attempt > 1 && self.retry.is_retryable(&err) {
                        return Err(DeliveryError::RetriesExhausted {
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn send(&self, body: &[u8]) -> Result<(), DeliveryError> {
        let token = self.tokens.token().await.context(AuthSnafu)?;

        let response = self
            .http
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await
            .context(TransportSnafu)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        if status == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
        }

        let mut body = response.text().await.unwrap_or_default();
        truncate_utf8(&mut body, MAX_ERROR_BODY);

        Err(DeliveryError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

fn truncate_utf8(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BoundedBatcher;
    use crate::config::RetryConfig;
    use mockito::Matcher;
    use serde_json::json;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::from(&RetryConfig {
            max_attempts,
            initial_backoff_ms: 1,
            backoff_multiplier: 2.0,
            max_backoff_ms: 5,
        })
    }

    fn client(url: String, retry: RetryPolicy) -> DeliveryClient {
        DeliveryClient::new(
            reqwest::Client::new(),
            url,
            "cust-1",
            TokenCache::new(Arc::new(StaticTokenProvider::new("tok"))),
            retry,
        )
    }

    fn batch(records: Vec<serde_json::Value>) -> Batch {
        let mut batcher = BoundedBatcher::new("cust-1", "APP", 1_000_000);
        for record in records {
            assert!(batcher.push(record).unwrap().is_none());
        }
        batcher.finish().unwrap()
    }

    #[tokio::test]
    async fn test_deliver_sends_envelope() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/ingest")
            .match_header("authorization", "Bearer tok")
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(json!({
                "customer_id": "cust-1",
                "log_type": "APP",
                "entries": [{"a": 1}, {"b": 2}]
            })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let client = client(format!("{}/ingest", server.url()), fast_retry(3));
        client
            .deliver("APP", &batch(vec![json!({"a": 1}), json!({"b": 2})]))
            .await
            .unwrap();

        mock.assert_async().await;
    }

    /// Answers 503 to the first `failures` requests, then 200.
    async fn flaky_server(failures: usize) -> (String, Arc<std::sync::atomic::AtomicUsize>) {
        use axum::{Router, http::StatusCode, routing::post};
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new().route(
            "/ingest",
            post({
                let hits = hits.clone();
                move || {
                    let n = hits.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < failures {
                            StatusCode::SERVICE_UNAVAILABLE
                        } else {
                            StatusCode::OK
                        }
                    }
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        (format!("http://{addr}/ingest"), hits)
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let (url, hits) = flaky_server(2).await;
        let client = client(url, fast_retry(3));

        client
            .deliver("APP", &batch(vec![json!({"a": 1})]))
            .await
            .unwrap();
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/ingest")
            .with_status(503)
            .with_body("busy")
            .expect(3)
            .create_async()
            .await;

        let client = client(format!("{}/ingest", server.url()), fast_retry(3));
        let err = client
            .deliver("APP", &batch(vec![json!({"a": 1})]))
            .await
            .unwrap_err();

        mock.assert_async().await;
        match err {
            DeliveryError::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, DeliveryError::Status { status: 503, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_exhausted_retries_with_custom_status_predicate() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/ingest")
            .with_status(409)
            .expect(2)
            .create_async()
            .await;

        let retry = fast_retry(2).with_retryable_status(|s| s == 409);
        let client = client(format!("{}/ingest", server.url()), retry);
        let err = client
            .deliver("APP", &batch(vec![json!({"a": 1})]))
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(matches!(
            err,
            DeliveryError::RetriesExhausted { attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/ingest")
            .with_status(400)
            .with_body("bad request")
            .expect(1)
            .create_async()
            .await;

        let client = client(format!("{}/ingest", server.url()), fast_retry(3));
        let err = client
            .deliver("APP", &batch(vec![json!({"a": 1})]))
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(matches!(
            err,
            DeliveryError::Status { status: 400, ref body } if body == "bad request"
        ));
    }

    #[tokio::test]
    async fn test_unauthorized_invalidates_token() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/ingest")
            .with_status(401)
            .create_async()
            .await;

        let provider = Arc::new(CountingProvider::default());
        let client = DeliveryClient::new(
            reqwest::Client::new(),
            format!("{}/ingest", server.url()),
            "cust-1",
            TokenCache::new(provider.clone()),
            fast_retry(3),
        );

        let records = batch(vec![json!({"a": 1})]);
        assert!(client.deliver("APP", &records).await.is_err());
        assert!(client.deliver("APP", &records).await.is_err());
        assert_eq!(provider.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let client = client("http://127.0.0.1:1/ingest".to_string(), fast_retry(2));
        let err = client
            .deliver("APP", &batch(vec![json!({"a": 1})]))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::RetriesExhausted { attempts: 2, .. }));
    }

    #[test]
    fn test_truncate_utf8() {
        let mut text = "héllo".to_string();
        truncate_utf8(&mut text, 2);
        assert_eq!(text, "h");
    }

    #[derive(Default)]
    struct CountingProvider {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TokenProvider for CountingProvider {
        async fn fetch(&self) -> Result<AccessToken, crate::error::AuthError> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(AccessToken::new("tok", None))
        }
    }
}
