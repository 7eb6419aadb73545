//! Installation directory: which accounts the App is installed on, and
//! which repositories each installation can see.

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::app_jwt::SignedAssertion;
use super::clock::Clock;
use super::error::{AuthError, CallError};
use super::page_links;
use super::transport::{classify, dispatch, ApiRequest, ApiSettings, HttpTransport, SendError};

pub const PER_PAGE: u32 = 100;

/// Upper bound on pages followed for a single listing.
pub const MAX_PAGES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountType {
    User,
    Organization,
    Enterprise,
    /// Any account type GitHub adds later
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Installation {
    pub id: u64,
    pub account_login: String,
    pub account_type: AccountType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryRef {
    pub full_name: String,
    pub language: Option<String>,
    pub is_private: bool,
    pub html_url: Option<String>,
    pub default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstallationPayload {
    id: u64,
    account: AccountPayload,
}

#[derive(Debug, Deserialize)]
struct AccountPayload {
    // enterprise accounts carry a slug instead of a login
    login: Option<String>,
    slug: Option<String>,
    #[serde(rename = "type", default = "default_account_type")]
    account_type: AccountType,
}

fn default_account_type() -> AccountType {
    AccountType::Enterprise
}

impl InstallationPayload {
    fn into_installation(self) -> Result<Installation, CallError> {
        let account_login = self.account.login.or(self.account.slug).ok_or_else(|| {
            CallError::MalformedResponse(format!("installation {} has no account login", self.id))
        })?;
        Ok(Installation {
            id: self.id,
            account_login,
            account_type: self.account.account_type,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RepositoriesPage {
    repositories: Vec<RepositoryPayload>,
}

#[derive(Debug, Deserialize)]
struct RepositoryPayload {
    full_name: String,
    language: Option<String>,
    private: bool,
    html_url: Option<String>,
    default_branch: Option<String>,
}

impl From<RepositoryPayload> for RepositoryRef {
    fn from(repo: RepositoryPayload) -> Self {
        Self {
            full_name: repo.full_name,
            language: repo.language,
            is_private: repo.private,
            html_url: repo.html_url,
            default_branch: repo.default_branch,
        }
    }
}

/// Core rate limit bucket reported by `GET /rate_limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub limit: u64,
    pub remaining: u64,
    pub reset: i64,
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    rate: RateLimitStatus,
}

/// Bearer used for a directory listing.
#[derive(Clone, Copy)]
enum Bearer<'a> {
    /// App assertion; re-checked for validity before every page
    Assertion(&'a SignedAssertion),
    /// Installation access token
    Installation(&'a str),
}

impl Bearer<'_> {
    fn token(&self) -> &str {
        match self {
            Bearer::Assertion(assertion) => &assertion.token,
            Bearer::Installation(token) => token,
        }
    }
}

pub struct InstallationDirectory {
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    api: ApiSettings,
}

impl InstallationDirectory {
    pub fn new(transport: Arc<dyn HttpTransport>, clock: Arc<dyn Clock>, api: ApiSettings) -> Self {
        Self {
            transport,
            clock,
            api,
        }
    }

    /// All installations of the App, across every page.
    pub async fn list_installations(
        &self,
        assertion: &SignedAssertion,
        cancel: &CancellationToken,
    ) -> Result<Vec<Installation>, AuthError> {
        const OPERATION: &str = "list installations";
        let mut installations = Vec::new();
        self.paged::<Vec<InstallationPayload>, _>(
            OPERATION,
            self.installations_url(),
            Bearer::Assertion(assertion),
            cancel,
            |page| {
                for payload in page {
                    installations.push(payload.into_installation()?);
                }
                Ok(ControlFlow::Continue(()))
            },
        )
        .await?;
        Ok(installations)
    }

    /// The installation whose account login equals `account_login` exactly.
    ///
    /// Stops paging at the first match.
    pub async fn find_installation(
        &self,
        assertion: &SignedAssertion,
        account_login: &str,
        cancel: &CancellationToken,
    ) -> Result<Installation, AuthError> {
        const OPERATION: &str = "find installation";
        let mut found = None;
        self.paged::<Vec<InstallationPayload>, _>(
            OPERATION,
            self.installations_url(),
            Bearer::Assertion(assertion),
            cancel,
            |page| {
                for payload in page {
                    let installation = payload.into_installation()?;
                    if installation.account_login == account_login {
                        found = Some(installation);
                        return Ok(ControlFlow::Break(()));
                    }
                }
                Ok(ControlFlow::Continue(()))
            },
        )
        .await?;

        match found {
            Some(installation) => {
                tracing::debug!(
                    account = %account_login,
                    installation_id = installation.id,
                    "Resolved installation"
                );
                Ok(installation)
            }
            None => Err(AuthError::InstallationNotFound {
                account: account_login.to_string(),
            }),
        }
    }

    /// Repositories visible to the installation owning `installation_token`.
    pub async fn list_repositories(
        &self,
        installation_token: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<RepositoryRef>, AuthError> {
        const OPERATION: &str = "list repositories";
        let mut repositories = Vec::new();
        self.paged::<RepositoriesPage, _>(
            OPERATION,
            self.api
                .url(&format!("/installation/repositories?per_page={}", PER_PAGE)),
            Bearer::Installation(installation_token),
            cancel,
            |page| {
                repositories.extend(page.repositories.into_iter().map(RepositoryRef::from));
                Ok(ControlFlow::Continue(()))
            },
        )
        .await?;
        Ok(repositories)
    }

    /// Unauthenticated `GET /rate_limit`, used as a reachability probe.
    pub async fn rate_limit(&self, cancel: &CancellationToken) -> Result<RateLimitStatus, AuthError> {
        const OPERATION: &str = "check rate limit";
        let request = ApiRequest::github(Method::GET, self.api.url("/rate_limit"), &self.api.user_agent);
        let response = dispatch(
            self.transport.as_ref(),
            request,
            self.api.request_timeout,
            cancel,
        )
        .await
        .map_err(|e| send_error(OPERATION, e))?;
        classify(&response, self.clock.now()).map_err(|e| AuthError::directory(OPERATION, e))?;
        let body: RateLimitBody = response
            .json()
            .map_err(|e| AuthError::directory(OPERATION, e))?;
        Ok(body.rate)
    }

    fn installations_url(&self) -> String {
        self.api
            .url(&format!("/app/installations?per_page={}", PER_PAGE))
    }

    /// Follow `Link: rel="next"` from `first_url`, handing each decoded page
    /// to `visit` until it breaks or the pages run out.
    async fn paged<P, F>(
        &self,
        operation: &'static str,
        first_url: String,
        bearer: Bearer<'_>,
        cancel: &CancellationToken,
        mut visit: F,
    ) -> Result<(), AuthError>
    where
        P: DeserializeOwned,
        F: FnMut(P) -> Result<ControlFlow<()>, CallError>,
    {
        let mut seen = HashSet::new();
        let mut next_page_url = Some(first_url);

        while let Some(url) = next_page_url.take() {
            if seen.len() >= MAX_PAGES {
                return Err(AuthError::directory(
                    operation,
                    CallError::MalformedResponse(format!("more than {} pages", MAX_PAGES)),
                ));
            }
            if !seen.insert(url.clone()) {
                return Err(AuthError::directory(
                    operation,
                    CallError::MalformedResponse(format!("pagination revisits {}", url)),
                ));
            }
            if let Bearer::Assertion(assertion) = bearer {
                assertion.ensure_usable(self.clock.now())?;
            }

            let request = ApiRequest::github(Method::GET, url, &self.api.user_agent)
                .bearer(bearer.token());
            let response = dispatch(
                self.transport.as_ref(),
                request,
                self.api.request_timeout,
                cancel,
            )
            .await
            .map_err(|e| send_error(operation, e))?;

            classify(&response, self.clock.now())
                .map_err(|e| AuthError::directory(operation, e))?;
            let page: P = response
                .json()
                .map_err(|e| AuthError::directory(operation, e))?;

            if visit(page).map_err(|e| AuthError::directory(operation, e))?.is_break() {
                break;
            }

            next_page_url = response
                .header("link")
                .and_then(|link| page_links::parse(link).next)
                .map(str::to_string);
        }

        tracing::debug!(operation, pages = seen.len(), "Listing complete");
        Ok(())
    }
}

fn send_error(operation: &'static str, err: SendError) -> AuthError {
    match err {
        SendError::Cancelled => AuthError::Cancelled { operation },
        SendError::Call(source) => AuthError::directory(operation, source),
    }
}
