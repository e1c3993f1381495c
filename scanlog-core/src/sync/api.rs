//! Logistics API client
//!
//! Wire protocol:
//!
//! - `POST {base}/scans/batch` with a JSON array of [`ScanSubmission`]; the
//!   server answers with one [`RecordResult`] per record it processed.
//!   Submissions are idempotent on `id`.
//! - `GET {base}/health` answers 2xx when the API is reachable.
//!
//! Every request carries the `X-Device-ID` header.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::config::ApiConfig;
use crate::conflict::ConflictInfo;
use crate::connectivity::ConnectivityProbe;
use crate::error::{Error, Result};
use crate::types::ScanRecord;

/// One record as sent to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSubmission {
    /// Idempotency key
    pub id: String,
    pub payload: SubmissionPayload,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionPayload {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbology: Option<String>,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub fingerprint: String,
}

impl From<&ScanRecord> for ScanSubmission {
    fn from(record: &ScanRecord) -> Self {
        Self {
            id: record.id.clone(),
            payload: SubmissionPayload {
                content: record.payload.content.clone(),
                symbology: record.payload.symbology.map(|s| s.as_str().to_string()),
                device_id: record.payload.device_id.clone(),
                session_id: record.payload.session_id.clone(),
                fingerprint: record.fingerprint.clone(),
            },
            captured_at: record.payload.captured_at,
        }
    }
}

/// Server verdict for one record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordOutcome {
    Confirmed,
    Conflict,
    Rejected,
}

/// Per-record entry of a batch response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordResult {
    pub id: String,
    pub outcome: RecordOutcome,
    /// Rejection reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictInfo>,
}

impl RecordResult {
    pub fn confirmed(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            outcome: RecordOutcome::Confirmed,
            reason: None,
            conflict: None,
        }
    }

    pub fn rejected(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            outcome: RecordOutcome::Rejected,
            reason: Some(reason.into()),
            conflict: None,
        }
    }

    pub fn conflict(id: impl Into<String>, info: ConflictInfo) -> Self {
        Self {
            id: id.into(),
            outcome: RecordOutcome::Conflict,
            reason: None,
            conflict: Some(info),
        }
    }
}

/// Remote endpoint that accepts scan batches
///
/// Implementations report network-layer problems as transient errors
/// (see [`Error::is_transient`]); any answered batch is `Ok`, whatever the
/// per-record outcomes are.
#[async_trait]
pub trait ScanApi: Send + Sync {
    async fn submit_batch(&self, scans: &[ScanSubmission]) -> Result<Vec<RecordResult>>;
}

/// HTTP implementation of [`ScanApi`]
pub struct HttpScanApi {
    http_client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpScanApi {
    /// Build a client for the configured server.
    ///
    /// Fails if `api.base_url` is unset.
    pub fn new(config: &ApiConfig, device_id: &str) -> Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| Error::Config("api.base_url is required".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "X-Device-ID",
            HeaderValue::from_str(device_id)
                .map_err(|e| Error::Config(format!("invalid device id: {}", e)))?,
        );

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url,
            timeout: config.timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout(self.timeout)
        } else {
            Error::Network(format!("HTTP request failed: {}", e))
        }
    }

    /// `GET /health`
    pub async fn health(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::Api {
                status: status.as_u16(),
                body: String::new(),
            })
        }
    }
}

#[async_trait]
impl ScanApi for HttpScanApi {
    async fn submit_batch(&self, scans: &[ScanSubmission]) -> Result<Vec<RecordResult>> {
        let url = format!("{}/scans/batch", self.base_url);

        let response = self
            .http_client
            .post(&url)
            .json(scans)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status();

        if status.is_success() {
            // A 2xx body we cannot read tells us nothing about what was applied
            response
                .json()
                .await
                .map_err(|e| Error::Network(format!("failed to parse response: {}", e)))
        } else {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(Error::Api {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl ConnectivityProbe for HttpScanApi {
    async fn is_reachable(&self) -> bool {
        match self.health().await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, "Health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictKind;
    use crate::types::{ScanPayload, Symbology};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn test_new_requires_base_url() {
        let config = ApiConfig::default();
        assert!(matches!(
            HttpScanApi::new(&config, "dock-1"),
            Err(Error::Config(_))
        ));

        let config = ApiConfig {
            base_url: Some("https://logistics.example.com/api/".to_string()),
            ..Default::default()
        };
        let api = HttpScanApi::new(&config, "dock-1").unwrap();
        assert_eq!(api.base_url(), "https://logistics.example.com/api");
    }

    #[test]
    fn test_submission_wire_format() {
        let mut record = ScanRecord::new(ScanPayload {
            content: "3017620422003".to_string(),
            symbology: Some(Symbology::Ean13),
            device_id: "dock-1".to_string(),
            session_id: None,
            captured_at: Utc::now(),
        });
        record.id = "b7f0c1e2-0000-4000-8000-000000000001".to_string();

        let json = serde_json::to_value(ScanSubmission::from(&record)).unwrap();
        assert_eq!(json["id"], "b7f0c1e2-0000-4000-8000-000000000001");
        assert_eq!(json["payload"]["content"], "3017620422003");
        assert_eq!(json["payload"]["symbology"], "ean_13");
        assert_eq!(json["payload"]["deviceId"], "dock-1");
        assert!(json["payload"].get("sessionId").is_none());
        assert!(json.get("capturedAt").is_some());
    }

    #[test]
    fn test_parse_batch_response() {
        let body = r#"[
            {"id": "a", "outcome": "Confirmed"},
            {"id": "b", "outcome": "Rejected", "reason": "unknown parcel"},
            {"id": "c", "outcome": "Conflict",
             "conflict": {"kind": "Stale", "serverUpdatedAt": "2026-03-01T08:00:00Z"}}
        ]"#;
        let results: Vec<RecordResult> = serde_json::from_str(body).unwrap();

        assert_eq!(results[0], RecordResult::confirmed("a"));
        assert_eq!(results[1], RecordResult::rejected("b", "unknown parcel"));
        let conflict = results[2].conflict.as_ref().unwrap();
        assert_eq!(conflict.kind, ConflictKind::Stale);
        assert!(conflict.server_updated_at.is_some());
        assert!(conflict.existing_id.is_none());
    }

    // ============================================
    // HTTP status mapping against a local socket
    // ============================================

    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let body_len = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|value| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + body_len {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Answer one request with `reply`, or hold the connection open when `None`.
    async fn serve_once(reply: Option<String>) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_request(&mut stream).await;
            match reply {
                Some(reply) => {
                    stream.write_all(reply.as_bytes()).await.unwrap();
                    let _ = stream.shutdown().await;
                }
                None => tokio::time::sleep(Duration::from_secs(10)).await,
            }
            request
        });
        (format!("http://{}", addr), handle)
    }

    fn http_response(status: &str, body: &str) -> Option<String> {
        Some(format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        ))
    }

    fn client(base_url: &str) -> HttpScanApi {
        let config = ApiConfig {
            base_url: Some(base_url.to_string()),
            timeout_secs: 1,
            ..Default::default()
        };
        HttpScanApi::new(&config, "dock-1").unwrap()
    }

    fn submission() -> ScanSubmission {
        let mut record = ScanRecord::new(ScanPayload {
            content: "PKG-0001".to_string(),
            symbology: None,
            device_id: "dock-1".to_string(),
            session_id: None,
            captured_at: Utc::now(),
        });
        record.id = "rec-1".to_string();
        ScanSubmission::from(&record)
    }

    #[tokio::test]
    async fn test_submit_batch_posts_json_with_device_header() {
        let (url, server) =
            serve_once(http_response("200 OK", r#"[{"id": "rec-1", "outcome": "Confirmed"}]"#)).await;

        let results = client(&url).submit_batch(&[submission()]).await.unwrap();
        assert_eq!(results, vec![RecordResult::confirmed("rec-1")]);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /scans/batch HTTP/1.1"));
        assert!(request.to_lowercase().contains("x-device-id: dock-1"));
        assert!(request.contains(r#""id":"rec-1""#));
    }

    #[tokio::test]
    async fn test_non_2xx_fails_whole_batch_as_api_error() {
        let (url, _server) = serve_once(http_response("503 Service Unavailable", "maintenance")).await;

        let err = client(&url).submit_batch(&[submission()]).await.unwrap_err();
        match &err {
            Error::Api { status, body } => {
                assert_eq!(*status, 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unreadable_2xx_body_is_network_error() {
        let (url, _server) = serve_once(http_response("200 OK", "<html>proxy login</html>")).await;

        let err = client(&url).submit_batch(&[submission()]).await.unwrap_err();
        assert!(
            matches!(&err, Error::Network(msg) if msg.contains("failed to parse response")),
            "unexpected error {err:?}"
        );
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let (url, _server) = serve_once(None).await;

        let err = client(&url).submit_batch(&[submission()]).await.unwrap_err();
        assert!(
            matches!(&err, Error::Timeout(t) if *t == Duration::from_secs(1)),
            "unexpected error {err:?}"
        );
    }

    #[tokio::test]
    async fn test_health_reports_reachability() {
        let (url, _server) = serve_once(http_response("204 No Content", "")).await;
        assert!(client(&url).is_reachable().await);

        let (url, _server) = serve_once(http_response("500 Internal Server Error", "")).await;
        assert!(!client(&url).is_reachable().await);
    }
}
