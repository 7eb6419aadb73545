//! App assertion signing.
//!
//! A GitHub App proves its identity with a short-lived RS256 JWT whose
//! issuer is the App ID. The assertion is then used as a bearer token for
//! app-level endpoints (installation listing, token exchange).

use std::fmt;

use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::error::AuthError;
use crate::crypto::SigningKey;

/// GitHub rejects assertions valid for longer than this.
pub const MAX_ASSERTION_LIFETIME_SECS: i64 = 600;

/// JWT claims for GitHub App authentication.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AppClaims {
    /// Issued at (Unix timestamp), backdated by the skew allowance
    pub iat: i64,
    /// Expiration (Unix timestamp)
    pub exp: i64,
    /// Issuer, the GitHub App ID
    pub iss: String,
}

/// The App's identity: its ID and normalized private key.
#[derive(Clone)]
pub struct AppIdentity {
    app_id: String,
    key: SigningKey,
    encoding_key: EncodingKey,
}

impl AppIdentity {
    pub fn new(app_id: impl Into<String>, key: SigningKey) -> Self {
        let encoding_key = EncodingKey::from_rsa_der(key.pkcs1_der());
        Self {
            app_id: app_id.into(),
            key,
            encoding_key,
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn key(&self) -> &SigningKey {
        &self.key
    }
}

impl fmt::Debug for AppIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppIdentity")
            .field("app_id", &self.app_id)
            .field("key", &self.key)
            .finish()
    }
}

/// Timing rules for assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssertionPolicy {
    pub clock_skew_allowance: Duration,
    pub lifetime: Duration,
}

impl Default for AssertionPolicy {
    fn default() -> Self {
        Self {
            clock_skew_allowance: Duration::seconds(60),
            lifetime: Duration::seconds(MAX_ASSERTION_LIFETIME_SECS),
        }
    }
}

impl AssertionPolicy {
    /// Minimum remaining validity for a cached assertion to be reused.
    fn reuse_floor(&self) -> Duration {
        std::cmp::min(Duration::seconds(120), self.lifetime / 2)
    }
}

/// A signed compact JWT with its validity window.
#[derive(Clone, PartialEq, Eq)]
pub struct SignedAssertion {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SignedAssertion {
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Fail with [`AuthError::AssertionExpired`] if the assertion is no longer usable.
    pub(crate) fn ensure_usable(&self, now: DateTime<Utc>) -> Result<(), AuthError> {
        if self.is_usable_at(now) {
            Ok(())
        } else {
            Err(AuthError::AssertionExpired {
                expired_at: self.expires_at,
            })
        }
    }
}

impl fmt::Debug for SignedAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedAssertion")
            .field("token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Signs app assertions and keeps the most recent one for reuse.
pub struct AssertionSigner {
    identity: AppIdentity,
    policy: AssertionPolicy,
    current: Mutex<Option<SignedAssertion>>,
}

impl AssertionSigner {
    pub fn new(identity: AppIdentity, policy: AssertionPolicy) -> Self {
        Self {
            identity,
            policy,
            current: Mutex::new(None),
        }
    }

    pub fn app_id(&self) -> &str {
        self.identity.app_id()
    }

    /// Sign a fresh assertion valid from `now - skew` for the policy lifetime.
    pub fn sign(&self, now: DateTime<Utc>) -> Result<SignedAssertion, AuthError> {
        let issued_at = now - self.policy.clock_skew_allowance;
        let expires_at = issued_at + self.policy.lifetime;
        if expires_at <= now || expires_at <= issued_at {
            return Err(AuthError::Signing(format!(
                "assertion lifetime of {}s does not outlast the {}s skew allowance",
                self.policy.lifetime.num_seconds(),
                self.policy.clock_skew_allowance.num_seconds()
            )));
        }

        let claims = AppClaims {
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
            iss: self.identity.app_id.clone(),
        };
        let token = encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &self.identity.encoding_key,
        )
        .map_err(|e| AuthError::Signing(e.to_string()))?;

        tracing::debug!(app_id = %self.identity.app_id, expires_at = %expires_at, "Signed app assertion");

        // Claims carry whole seconds; keep the struct consistent with them.
        Ok(SignedAssertion {
            token,
            issued_at: from_timestamp(claims.iat)?,
            expires_at: from_timestamp(claims.exp)?,
        })
    }

    /// Return the cached assertion while it has enough validity left,
    /// otherwise sign and cache a new one.
    pub fn current(&self, now: DateTime<Utc>) -> Result<SignedAssertion, AuthError> {
        let mut current = self.current.lock();
        if let Some(assertion) = current.as_ref() {
            if assertion.expires_at - now > self.policy.reuse_floor() {
                return Ok(assertion.clone());
            }
        }
        let fresh = self.sign(now)?;
        *current = Some(fresh.clone());
        Ok(fresh)
    }
}

fn from_timestamp(secs: i64) -> Result<DateTime<Utc>, AuthError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| AuthError::Signing(format!("timestamp {} out of range", secs)))
}
