//! Client for the remote scraping service.
//!
//! One outbound call per ingestion record: the primary transport goes
//! through the scraper platform's actor endpoint; if and only if that call
//! times out, a single fallback POST is made directly with the same body
//! and bearer credential, bounded by the same timeout. Failures are never
//! retried here — the retry unit is a fresh ingestion record.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

const DEFAULT_API_BASE: &str = "https://api.apify.com/v2";
const DEFAULT_ACTOR_ID: &str = "tri_angle~airbnb-rooms-urls-scraper";

#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("scrape timed out after {secs}s on both transports")]
    Timeout { secs: u64 },
    #[error("{0}")]
    Upstream(String),
    #[error("malformed scrape response: {0}")]
    MalformedResponse(String),
}

/// Transport seam for the orchestrator; lets tests swap the remote service
/// for a canned implementation.
#[async_trait]
pub trait ListingFetcher: Send + Sync {
    /// Fetch the raw platform-shaped snapshot for one listing locator.
    async fn fetch_listing(&self, locator: &str) -> Result<Value, ScrapeError>;
}

/// Endpoints and credential for [`ScraperClient`]. Passed explicitly so no
/// credential lives in process-wide state.
#[derive(Debug, Clone)]
pub struct ScraperConfig {
    pub api_base: String,
    /// Full URL for the direct fallback transport.
    pub fallback_url: String,
    pub actor_id: String,
    pub token: String,
    pub timeout: Duration,
}

impl ScraperConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            fallback_url: format!("{}/acts/{}/run-sync", DEFAULT_API_BASE, DEFAULT_ACTOR_ID),
            actor_id: DEFAULT_ACTOR_ID.to_string(),
            token: token.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScraperClient {
    client: Client,
    config: ScraperConfig,
}

impl ScraperClient {
    pub fn new(config: ScraperConfig) -> Result<Self, ScrapeError> {
        // The per-transport bound is the outer tokio::time::timeout in
        // fetch_listing; the client timeout is a strictly longer backstop,
        // so a primary timeout always surfaces as elapsed and can reach
        // the fallback.
        let client = Client::builder()
            .timeout(config.timeout + Duration::from_secs(1))
            .user_agent(format!(
                "{}/{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ))
            .build()?;

        Ok(Self { client, config })
    }

    async fn call_primary(&self, body: &Value) -> Result<Value, ScrapeError> {
        let url = format!(
            "{}/acts/{}/run-sync",
            self.config.api_base, self.config.actor_id
        );
        log::info!("Invoking scraper actor: {}", url);
        self.post(&url, body).await
    }

    async fn call_fallback(&self, body: &Value) -> Result<Value, ScrapeError> {
        log::info!("Invoking fallback transport: {}", self.config.fallback_url);
        self.post(&self.config.fallback_url, body).await
    }

    async fn post(&self, url: &str, body: &Value) -> Result<Value, ScrapeError> {
        let text = self
            .client
            .post(url)
            .bearer_auth(&self.config.token)
            .json(body)
            .send()
            .await
            .inspect_err(|e| log::error!("HTTP error: {e:?}"))?
            .error_for_status()?
            .text()
            .await
            .inspect_err(|e| log::error!("Decode error: {e:?}"))?;

        classify_response(&text)
    }
}

#[async_trait]
impl ListingFetcher for ScraperClient {
    async fn fetch_listing(&self, locator: &str) -> Result<Value, ScrapeError> {
        let body = serde_json::json!({ "url": locator });
        let secs = self.config.timeout.as_secs();

        match tokio::time::timeout(self.config.timeout, self.call_primary(&body)).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!(
                    "Primary scrape transport timed out after {}s for '{}', trying fallback",
                    secs,
                    locator
                );
                match tokio::time::timeout(self.config.timeout, self.call_fallback(&body)).await {
                    Ok(result) => result,
                    Err(_) => Err(ScrapeError::Timeout { secs }),
                }
            }
        }
    }
}

/// Classify a scrape response body. Well-formed means: JSON object with
/// `success: true` and an object `data` field. A failure-flagged body keeps
/// the upstream error text verbatim.
pub fn classify_response(body: &str) -> Result<Value, ScrapeError> {
    let parsed: Value = serde_json::from_str(body)
        .map_err(|e| ScrapeError::MalformedResponse(format!("not JSON: {e}")))?;

    let success = parsed
        .get("success")
        .and_then(Value::as_bool)
        .ok_or_else(|| ScrapeError::MalformedResponse("missing success flag".to_string()))?;

    if !success {
        let message = parsed
            .get("error")
            .or_else(|| parsed.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("scrape failed without an error message");
        return Err(ScrapeError::Upstream(message.to_string()));
    }

    match parsed.get("data") {
        Some(data @ Value::Object(_)) => Ok(data.clone()),
        Some(other) => Err(ScrapeError::MalformedResponse(format!(
            "data field is not a document (got {})",
            match other {
                Value::Null => "null",
                Value::Bool(_) => "boolean",
                Value::Number(_) => "number",
                Value::String(_) => "string",
                Value::Array(_) => "array",
                Value::Object(_) => "object",
            }
        ))),
        None => Err(ScrapeError::MalformedResponse(
            "missing data field".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Local HTTP stub answering every request with `body`, counting hits.
    async fn stub_server(body: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_counter = hits.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                hits_counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let mut request = Vec::new();
                    loop {
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        request.extend_from_slice(&buf[..n]);
                        if request.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });

        (format!("http://{}", addr), hits)
    }

    /// Local server that accepts connections and never answers.
    async fn stalling_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");

        tokio::spawn(async move {
            let mut parked = Vec::new();
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                parked.push(socket);
            }
        });

        format!("http://{}", addr)
    }

    fn stub_config(api_base: String, fallback_url: String, timeout_ms: u64) -> ScraperConfig {
        let mut config = ScraperConfig::new("test-token");
        config.api_base = api_base;
        config.fallback_url = fallback_url;
        config.timeout = Duration::from_millis(timeout_ms);
        config
    }

    #[tokio::test]
    async fn primary_timeout_reaches_the_fallback_transport() {
        let primary = stalling_server().await;
        let (fallback, fallback_hits) =
            stub_server(r#"{ "success": true, "data": { "id": "42" } }"#).await;

        let client =
            ScraperClient::new(stub_config(primary, fallback, 200)).expect("client");
        let data = client
            .fetch_listing("listing-42")
            .await
            .expect("fallback should answer after the primary stalls");

        assert_eq!(data["id"], "42");
        assert_eq!(fallback_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_timeout_primary_error_skips_the_fallback() {
        let (primary, _) =
            stub_server(r#"{ "success": false, "error": "Listing is gone." }"#).await;
        let (fallback, fallback_hits) = stub_server(r#"{ "success": true, "data": {} }"#).await;

        let client =
            ScraperClient::new(stub_config(primary, fallback, 5_000)).expect("client");
        let err = client
            .fetch_listing("listing-42")
            .await
            .expect_err("failure-flagged body is a scrape failure");

        assert!(matches!(
            err,
            ScrapeError::Upstream(ref message) if message == "Listing is gone."
        ));
        assert_eq!(fallback_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn both_transports_stalling_is_a_terminal_timeout() {
        let primary = stalling_server().await;
        let fallback = stalling_server().await;

        let client =
            ScraperClient::new(stub_config(primary, fallback, 100)).expect("client");
        let err = client
            .fetch_listing("listing-42")
            .await
            .expect_err("both transports stalled");

        assert!(matches!(err, ScrapeError::Timeout { .. }));
    }

    #[test]
    fn well_formed_success_yields_data() {
        let body = r#"{ "success": true, "data": { "id": "42", "title": "Loft" } }"#;
        let data = classify_response(body).expect("should classify as success");
        assert_eq!(data["id"], "42");
    }

    #[test]
    fn failure_flag_preserves_upstream_text_verbatim() {
        let body = r#"{ "success": false, "error": "Listing is no longer available." }"#;
        let err = classify_response(body).expect_err("should be a scrape failure");
        assert!(matches!(
            err,
            ScrapeError::Upstream(ref message) if message == "Listing is no longer available."
        ));
    }

    #[test]
    fn failure_without_message_gets_a_placeholder() {
        let err = classify_response(r#"{ "success": false }"#).expect_err("failure");
        assert!(err.to_string().contains("without an error message"));
    }

    #[test]
    fn non_json_body_is_malformed() {
        let err = classify_response("<html>502 Bad Gateway</html>").expect_err("malformed");
        assert!(matches!(err, ScrapeError::MalformedResponse(_)));
    }

    #[test]
    fn missing_or_non_document_data_is_malformed() {
        assert!(matches!(
            classify_response(r#"{ "success": true }"#),
            Err(ScrapeError::MalformedResponse(_))
        ));
        assert!(matches!(
            classify_response(r#"{ "success": true, "data": [1, 2] }"#),
            Err(ScrapeError::MalformedResponse(_))
        ));
    }

    #[test]
    fn config_defaults_are_bounded() {
        let config = ScraperConfig::new("secret-token");
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert!(config.fallback_url.starts_with(DEFAULT_API_BASE));
    }
}
