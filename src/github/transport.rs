//! HTTP seam between the credential layer and the GitHub REST API.
//!
//! The broker never talks to `reqwest` directly: every call goes through
//! [`HttpTransport`], which performs exactly one request with no retry of its
//! own. Retry, pagination and status classification live above this seam.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::error::CallError;

pub const GITHUB_ACCEPT: &str = "application/vnd.github+json";
pub const GITHUB_API_VERSION: &str = "2022-11-28";

/// Where and how to reach the GitHub REST API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiSettings {
    pub base_url: String,
    pub user_agent: String,
    pub request_timeout: Duration,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.github.com".to_string(),
            user_agent: concat!("ghapp-broker/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ApiSettings {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// A single outgoing request.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    /// Request carrying the standard GitHub REST headers.
    pub fn github(method: Method, url: impl Into<String>, user_agent: &str) -> Self {
        Self {
            method,
            url: url.into(),
            headers: vec![
                ("Accept".to_string(), GITHUB_ACCEPT.to_string()),
                ("User-Agent".to_string(), user_agent.to_string()),
                (
                    "X-GitHub-Api-Version".to_string(),
                    GITHUB_API_VERSION.to_string(),
                ),
            ],
            body: None,
        }
    }

    pub fn bearer(mut self, token: &str) -> Self {
        self.headers
            .push(("Authorization".to_string(), format!("Bearer {}", token)));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// A response as seen by the credential layer. Header names are lower-case.
#[derive(Debug, Clone, Default)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, CallError> {
        serde_json::from_str(&self.body)
            .map_err(|e| CallError::MalformedResponse(format!("invalid JSON body: {}", e)))
    }
}

/// Failure to obtain any HTTP response at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// Production transport backed by a shared `reqwest::Client`.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(request_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let mut builder = self.client.request(request.method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(map_reqwest_error)?;

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

/// Why a dispatched request produced no usable response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SendError {
    Cancelled,
    Call(CallError),
}

/// Send one request with a hard deadline, abandoning it on cancellation.
///
/// Transport failures and timeouts come back as
/// [`CallError::TransientTransport`]. The response status is not inspected.
pub(crate) async fn dispatch(
    transport: &dyn HttpTransport,
    request: ApiRequest,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ApiResponse, SendError> {
    let method = request.method.clone();
    let url = request.url.clone();

    let outcome = tokio::select! {
        _ = cancel.cancelled() => return Err(SendError::Cancelled),
        outcome = tokio::time::timeout(timeout, transport.send(request)) => outcome,
    };

    match outcome {
        Ok(Ok(response)) => {
            tracing::debug!(%method, %url, status = response.status, "GitHub API response");
            Ok(response)
        }
        Ok(Err(err)) => {
            tracing::debug!(%method, %url, error = %err, "GitHub API transport failure");
            Err(SendError::Call(CallError::TransientTransport(err.to_string())))
        }
        Err(_) => Err(SendError::Call(CallError::TransientTransport(format!(
            "request timed out after {}s",
            timeout.as_secs_f64()
        )))),
    }
}

#[derive(Deserialize)]
struct GitHubErrorBody {
    message: String,
}

/// Message from a GitHub error body, falling back to the raw text.
fn error_message(response: &ApiResponse) -> String {
    match serde_json::from_str::<GitHubErrorBody>(&response.body) {
        Ok(body) => body.message,
        Err(_) => {
            let text = response.body.trim();
            if text.is_empty() {
                "<empty body>".to_string()
            } else {
                text.chars().take(200).collect()
            }
        }
    }
}

/// Map a non-success response onto a [`CallError`].
///
/// `now` is used to turn an `x-ratelimit-reset` epoch into a wait.
pub fn classify(response: &ApiResponse, now: DateTime<Utc>) -> Result<(), CallError> {
    if response.is_success() {
        return Ok(());
    }

    let status = response.status;
    let retry_after = response
        .header("retry-after")
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let exhausted = response.header("x-ratelimit-remaining").map(str::trim) == Some("0");

    if status == 429 || (status == 403 && (exhausted || retry_after.is_some())) {
        let retry_after = retry_after.or_else(|| {
            response
                .header("x-ratelimit-reset")
                .and_then(|value| value.trim().parse::<i64>().ok())
                .map(|reset| Duration::from_secs((reset - now.timestamp()).max(0) as u64))
        });
        return Err(CallError::RateLimited { retry_after });
    }

    let message = error_message(response);
    match status {
        401 => Err(CallError::AuthenticationRejected { status, message }),
        500..=599 => Err(CallError::TransientTransport(format!(
            "GitHub API error: {} - {}",
            status, message
        ))),
        _ => Err(CallError::Rejected { status, message }),
    }
}
