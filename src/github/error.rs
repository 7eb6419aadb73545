//! Error types for credential issuance.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::crypto::KeyFormatError;

/// Classified outcome of a failed GitHub API call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("transient transport failure: {0}")]
    TransientTransport(String),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("authentication rejected ({status}): {message}")]
    AuthenticationRejected { status: u16, message: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl CallError {
    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CallError::TransientTransport(_) | CallError::RateLimited { .. }
        )
    }
}

/// Errors surfaced by the credential broker.
///
/// Cloneable so that one failed exchange can be handed to every caller
/// waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid private key: {0}")]
    KeyFormat(#[from] KeyFormatError),

    #[error("failed to sign app assertion: {0}")]
    Signing(String),

    #[error("No GitHub App installation found for account '{account}'")]
    InstallationNotFound { account: String },

    #[error("token exchange for installation {installation_id} failed after {attempts} attempt(s): {source}")]
    TokenExchange {
        installation_id: u64,
        attempts: u32,
        #[source]
        source: CallError,
    },

    #[error("{operation} failed: {source}")]
    Directory {
        operation: &'static str,
        #[source]
        source: CallError,
    },

    #[error("app assertion expired at {expired_at}")]
    AssertionExpired { expired_at: DateTime<Utc> },

    #[error("{operation} cancelled")]
    Cancelled { operation: &'static str },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl AuthError {
    pub(crate) fn directory(operation: &'static str, source: CallError) -> Self {
        AuthError::Directory { operation, source }
    }
}
