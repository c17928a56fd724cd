//! Transport seam for remote inference backends.
//!
//! [`InferenceTransport`] performs exactly one outbound attempt. Retry,
//! backoff and health bookkeeping live in the client on top of it, which
//! keeps the transport swappable (HTTP in production, scripted in tests).

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::types::{InferenceRequest, InferenceResponse, MediaArtifact};
use crate::config::BackendConfig;
use crate::error::{ConfigError, InferenceError, TimeoutPhase};
use crate::scheduler::JobKind;

/// Performs a single call to a backend.
#[async_trait]
pub trait InferenceTransport: Send + Sync {
    /// Sends one request under the given backend policy.
    async fn send(
        &self,
        backend: &str,
        config: &BackendConfig,
        request: &InferenceRequest,
    ) -> Result<InferenceResponse, InferenceError>;
}

/// Wire request for the prediction endpoint.
#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    id: String,
    kind: JobKind,
    prompt: &'a str,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    parameters: &'a serde_json::Value,
}

/// Wire response from the prediction endpoint.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    output: serde_json::Value,
    #[serde(default)]
    artifacts: Vec<MediaArtifact>,
}

/// Error document returned by backends on failure.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    #[serde(alias = "detail", alias = "message")]
    error: String,
}

/// JSON-over-HTTP transport.
///
/// Four deadlines apply independently to each attempt:
/// - connect: configured on the per-backend `reqwest` client
/// - write: sending the request until response headers arrive. Backends
///   answer predictions synchronously, so this is the time-to-first-byte
///   deadline and includes generation time.
/// - read: receiving the response body
/// - request: the whole attempt
pub struct HttpTransport {
    /// Clients keyed by backend, rebuilt when the connect timeout changes.
    clients: Mutex<HashMap<String, (Duration, Client)>>,
}

impl HttpTransport {
    /// Creates the transport. Builds a throwaway client so TLS/system setup
    /// problems surface at startup.
    pub fn new() -> Result<Self, ConfigError> {
        build_client(Duration::from_secs(5))?;
        Ok(Self {
            clients: Mutex::new(HashMap::new()),
        })
    }

    fn client_for(&self, backend: &str, config: &BackendConfig) -> Result<Client, InferenceError> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some((timeout, client)) = clients.get(backend) {
            if *timeout == config.connect_timeout {
                return Ok(client.clone());
            }
        }

        let client =
            build_client(config.connect_timeout).map_err(|e| InferenceError::RequestFailed {
                backend: backend.to_string(),
                message: e.to_string(),
            })?;
        clients.insert(
            backend.to_string(),
            (config.connect_timeout, client.clone()),
        );
        Ok(client)
    }

    async fn send_inner(
        &self,
        backend: &str,
        config: &BackendConfig,
        request: &InferenceRequest,
        started: Instant,
    ) -> Result<InferenceResponse, InferenceError> {
        let client = self.client_for(backend, config)?;
        let url = format!("{}/predictions", config.base_url.trim_end_matches('/'));

        let body = ApiRequest {
            id: request.job_id.to_string(),
            kind: request.kind,
            prompt: &request.prompt,
            parameters: &request.parameters,
        };

        let mut http_request = client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body);

        if let Some(ref api_key) = config.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {}", api_key));
        }

        // Time to first byte: upload plus the backend's processing time.
        let http_response = tokio::time::timeout(config.write_timeout, http_request.send())
            .await
            .map_err(|_| timeout(backend, TimeoutPhase::Write, started))?
            .map_err(|e| classify_reqwest_error(backend, e, started))?;

        let status = http_response.status();

        let bytes = tokio::time::timeout(config.read_timeout, http_response.bytes())
            .await
            .map_err(|_| timeout(backend, TimeoutPhase::Read, started))?
            .map_err(|e| classify_reqwest_error(backend, e, started))?;

        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes).to_string();
            let message = serde_json::from_str::<ApiErrorResponse>(&text)
                .map(|e| e.error)
                .unwrap_or(text);

            return Err(InferenceError::Rejected {
                backend: backend.to_string(),
                status: status.as_u16(),
                message,
                retryable: is_retryable_status(status),
            });
        }

        let api_response: ApiResponse =
            serde_json::from_slice(&bytes).map_err(|e| InferenceError::ParseError {
                backend: backend.to_string(),
                message: e.to_string(),
            })?;

        Ok(InferenceResponse {
            backend: backend.to_string(),
            prediction_id: api_response.id,
            output: api_response.output,
            artifacts: api_response.artifacts,
            attempts: 0,
        })
    }
}

#[async_trait]
impl InferenceTransport for HttpTransport {
    async fn send(
        &self,
        backend: &str,
        config: &BackendConfig,
        request: &InferenceRequest,
    ) -> Result<InferenceResponse, InferenceError> {
        let started = Instant::now();
        tokio::time::timeout(
            config.request_timeout,
            self.send_inner(backend, config, request, started),
        )
        .await
        .map_err(|_| timeout(backend, TimeoutPhase::Request, started))?
    }
}

fn build_client(connect_timeout: Duration) -> Result<Client, ConfigError> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| ConfigError::ValidationFailed(format!("failed to build HTTP client: {}", e)))
}

fn timeout(backend: &str, phase: TimeoutPhase, started: Instant) -> InferenceError {
    InferenceError::Timeout {
        backend: backend.to_string(),
        phase,
        elapsed: started.elapsed(),
    }
}

fn classify_reqwest_error(backend: &str, err: reqwest::Error, started: Instant) -> InferenceError {
    if err.is_timeout() {
        let phase = if err.is_connect() {
            TimeoutPhase::Connect
        } else {
            TimeoutPhase::Request
        };
        return timeout(backend, phase, started);
    }

    InferenceError::RequestFailed {
        backend: backend.to_string(),
        message: err.to_string(),
    }
}

/// Throttling, request timeouts and server errors are transient.
fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_status() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::UNPROCESSABLE_ENTITY));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn test_api_response_parsing() {
        let json = r#"{
            "id": "pred-123",
            "output": {"seed": 42},
            "artifacts": [{"uri": "s3://bucket/out.png", "content_type": "image/png"}]
        }"#;

        let parsed: ApiResponse = serde_json::from_str(json).expect("parses");
        assert_eq!(parsed.id.as_deref(), Some("pred-123"));
        assert_eq!(parsed.output["seed"], 42);
        assert_eq!(parsed.artifacts.len(), 1);
        assert_eq!(
            parsed.artifacts[0].content_type.as_deref(),
            Some("image/png")
        );
    }

    #[test]
    fn test_api_error_aliases() {
        let parsed: ApiErrorResponse =
            serde_json::from_str(r#"{"detail": "prompt rejected"}"#).expect("parses");
        assert_eq!(parsed.error, "prompt rejected");
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_retryable() {
        let transport = HttpTransport::new().expect("client builds");
        // Port 9 (discard) on localhost is almost never listening.
        let config = BackendConfig::new("http://127.0.0.1:9").with_timeouts(
            Duration::from_millis(200),
            Duration::from_millis(500),
            Duration::from_millis(500),
            Duration::from_secs(1),
        );
        let request = InferenceRequest::new(uuid::Uuid::new_v4(), JobKind::Image, "test");

        let err = transport
            .send("local", &config, &request)
            .await
            .expect_err("nothing listens on port 9");
        assert!(err.is_retryable(), "unexpected error: {}", err);
    }

    #[tokio::test]
    async fn test_slow_generation_hits_first_byte_deadline() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accepts and reads the request, then "generates" without answering.
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(socket);
        });

        let transport = HttpTransport::new().expect("client builds");
        let config = BackendConfig::new(format!("http://{}", addr)).with_timeouts(
            Duration::from_millis(500),
            Duration::from_millis(150),
            Duration::from_secs(1),
            Duration::from_secs(3),
        );
        let request = InferenceRequest::new(uuid::Uuid::new_v4(), JobKind::Video, "slow");

        let err = transport
            .send("local", &config, &request)
            .await
            .expect_err("backend never answers");
        assert!(
            matches!(
                err,
                InferenceError::Timeout {
                    phase: TimeoutPhase::Write,
                    ..
                }
            ),
            "unexpected error: {}",
            err
        );
        assert!(err.is_retryable());
        server.abort();
    }
}
