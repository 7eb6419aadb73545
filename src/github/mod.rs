//! GitHub App credential issuance.
//!
//! This module provides:
//! - App assertion (JWT) signing
//! - Installation discovery and repository listing
//! - Installation access token exchange with retry
//! - A per-installation token cache with single-flight refresh
//! - [`CredentialBroker`], the entry point for report tools

pub mod app_jwt;
pub mod broker;
pub mod clock;
pub mod error;
pub mod exchange;
pub mod installations;
pub mod page_links;
pub mod token_manager;
pub mod transport;

pub use app_jwt::{AppIdentity, AssertionPolicy, AssertionSigner, SignedAssertion};
pub use broker::{BrokerSettings, Credential, CredentialBroker};
pub use clock::{Clock, SystemClock};
pub use error::{AuthError, CallError};
pub use exchange::{ExchangeClient, InstallationToken, RetryPolicy};
pub use installations::{AccountType, Installation, InstallationDirectory, RateLimitStatus, RepositoryRef};
pub use token_manager::{TokenManager, TokenStats};
pub use transport::{ApiRequest, ApiResponse, ApiSettings, HttpTransport, ReqwestTransport};
