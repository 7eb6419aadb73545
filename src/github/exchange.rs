//! Installation access token exchange with bounded retry.
//!
//! `POST /app/installations/{id}/access_tokens` trades an app assertion for
//! an installation-scoped token. Transient failures (network errors,
//! timeouts, 5xx) and rate limiting are retried with exponential backoff;
//! everything else fails on the first attempt.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::app_jwt::AssertionSigner;
use super::clock::Clock;
use super::error::{AuthError, CallError};
use super::transport::{classify, dispatch, ApiRequest, ApiResponse, ApiSettings, HttpTransport, SendError};

const OPERATION: &str = "token exchange";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Longest server-demanded wait honored before giving up
    pub max_rate_limit_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            max_rate_limit_wait: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): doubles each time, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// An installation access token as issued by GitHub.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct InstallationToken {
    pub installation_id: u64,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub permissions: BTreeMap<String, String>,
    pub repository_selection: Option<String>,
}

impl InstallationToken {
    /// Usable for at least `margin` past `now`.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        self.expires_at > now + margin
    }
}

impl fmt::Debug for InstallationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallationToken")
            .field("installation_id", &self.installation_id)
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("permissions", &self.permissions)
            .field("repository_selection", &self.repository_selection)
            .finish()
    }
}

/// Response from GitHub's installation access token endpoint.
#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
    #[serde(default)]
    permissions: BTreeMap<String, String>,
    repository_selection: Option<String>,
}

fn parse_token(response: &ApiResponse, installation_id: u64) -> Result<InstallationToken, CallError> {
    let body: InstallationTokenResponse = response.json()?;
    if body.token.is_empty() {
        return Err(CallError::MalformedResponse("empty token".to_string()));
    }
    let expires_at = DateTime::parse_from_rfc3339(&body.expires_at)
        .map_err(|e| {
            CallError::MalformedResponse(format!("invalid expires_at '{}': {}", body.expires_at, e))
        })?
        .with_timezone(&Utc);

    Ok(InstallationToken {
        installation_id,
        token: body.token,
        expires_at,
        permissions: body.permissions,
        repository_selection: body.repository_selection,
    })
}

pub struct ExchangeClient {
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    api: ApiSettings,
    retry: RetryPolicy,
    min_lifetime: chrono::Duration,
    attempts: AtomicU64,
}

impl ExchangeClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
        api: ApiSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            clock,
            api,
            retry,
            min_lifetime: chrono::Duration::zero(),
            attempts: AtomicU64::new(0),
        }
    }

    /// Treat tokens that expire within `margin` of issuance as malformed.
    pub fn with_min_lifetime(mut self, margin: chrono::Duration) -> Self {
        self.min_lifetime = margin;
        self
    }

    fn check_lifetime(&self, token: InstallationToken) -> Result<InstallationToken, CallError> {
        if token.is_fresh_at(self.clock.now(), self.min_lifetime) {
            Ok(token)
        } else {
            Err(CallError::MalformedResponse(format!(
                "token already expires at {}",
                token.expires_at
            )))
        }
    }

    /// Total exchange attempts made by this client.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Exchange an app assertion for an installation token.
    ///
    /// Each attempt takes the signer's current assertion, so a slow retry
    /// sequence never outlives the assertion it started with.
    pub async fn exchange(
        &self,
        signer: &AssertionSigner,
        installation_id: u64,
        cancel: &CancellationToken,
    ) -> Result<InstallationToken, AuthError> {
        let url = self
            .api
            .url(&format!("/app/installations/{}/access_tokens", installation_id));
        let max_attempts = self.retry.max_retries.saturating_add(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let assertion = signer.current(self.clock.now())?;
            self.attempts.fetch_add(1, Ordering::Relaxed);

            let request = ApiRequest::github(Method::POST, url.as_str(), &self.api.user_agent)
                .bearer(&assertion.token);
            let result = match dispatch(
                self.transport.as_ref(),
                request,
                self.api.request_timeout,
                cancel,
            )
            .await
            {
                Err(SendError::Cancelled) => {
                    return Err(AuthError::Cancelled {
                        operation: OPERATION,
                    })
                }
                Err(SendError::Call(err)) => Err(err),
                Ok(response) => classify(&response, self.clock.now())
                    .and_then(|_| parse_token(&response, installation_id))
                    .and_then(|token| self.check_lifetime(token)),
            };

            let err = match result {
                Ok(token) => {
                    tracing::info!(
                        installation_id,
                        attempt,
                        expires_at = %token.expires_at,
                        "Issued installation access token"
                    );
                    return Ok(token);
                }
                Err(err) => err,
            };

            let exhausted = AuthError::TokenExchange {
                installation_id,
                attempts: attempt,
                source: err.clone(),
            };
            if !err.is_retryable() || attempt >= max_attempts {
                tracing::warn!(installation_id, attempt, error = %err, "Token exchange failed");
                return Err(exhausted);
            }

            let delay = match &err {
                CallError::RateLimited {
                    retry_after: Some(wait),
                } => {
                    if *wait > self.retry.max_rate_limit_wait {
                        tracing::warn!(
                            installation_id,
                            wait_secs = wait.as_secs(),
                            "Rate limit reset too far away, giving up"
                        );
                        return Err(exhausted);
                    }
                    *wait
                }
                _ => self.retry.backoff(attempt - 1),
            };

            tracing::warn!(
                installation_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Token exchange failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(AuthError::Cancelled { operation: OPERATION });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
