//! Source-control provider API.
//!
//! Provides the [`ProviderApi`] trait that encapsulates every call the
//! service makes to the provider's REST and OAuth endpoints.  Handlers
//! dispatch through this trait so that no provider-specific URL construction
//! or response parsing leaks outside this module, and so tests can swap in a
//! fake.

pub mod github;

use serde::{Deserialize, Serialize};

use crate::credentials::TokenData;

pub use github::GitHubProvider;

/// OAuth scopes requested from the provider.
pub const OAUTH_SCOPES: &[&str] = &["repo", "read:org", "admin:repo_hook"];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider answered with a non-2xx status.
    #[error("provider returned HTTP {status}")]
    Status { status: u16, body: String },
    /// The OAuth endpoint answered 200 with an `error` field.
    #[error("OAuth exchange rejected: {0}")]
    OAuth(String),
    /// The request never produced a usable response.
    #[error("provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl ProviderError {
    /// HTTP status reported by the provider, if it answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            Self::OAuth(_) => None,
        }
    }

    /// The token was rejected; the operator needs to authorise again.
    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: u64,
    pub name: String,
    pub full_name: String,
    pub owner: Account,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hook {
    pub id: u64,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub events: Vec<String>,
    pub config: HookConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
}

/// Parameters for creating a push webhook.
#[derive(Clone)]
pub struct NewHook {
    pub url: String,
    pub secret: Option<String>,
}

impl std::fmt::Debug for NewHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewHook")
            .field("url", &self.url)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Abstraction over the provider's OAuth and REST endpoints.
#[async_trait::async_trait]
pub trait ProviderApi: Send + Sync {
    /// URL the browser is sent to for authorisation.
    fn authorize_url(&self, state: &str) -> String;

    /// Exchange an authorisation code for a token payload.
    async fn exchange_code(&self, code: &str) -> Result<TokenData, ProviderError>;

    /// Repositories the token's user can see.
    async fn list_repos(&self, token: &str) -> Result<Vec<Repository>, ProviderError>;

    /// Organisations the token's user belongs to.
    async fn list_orgs(&self, token: &str) -> Result<Vec<Organization>, ProviderError>;

    async fn list_org_repos(&self, token: &str, org: &str)
        -> Result<Vec<Repository>, ProviderError>;

    async fn list_hooks(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<Hook>, ProviderError>;

    async fn add_hook(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        hook: &NewHook,
    ) -> Result<Hook, ProviderError>;

    async fn delete_hook(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        hook_id: u64,
    ) -> Result<(), ProviderError>;

    async fn list_branches(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<Branch>, ProviderError>;

    /// Unauthenticated reachability probe used by the health check.
    async fn ping(&self) -> Result<(), ProviderError>;
}

/// Merge org repositories into the user's list, dropping duplicates by id
/// while keeping first-seen order.
pub fn merge_repos(mut repos: Vec<Repository>, more: Vec<Repository>) -> Vec<Repository> {
    let mut seen: std::collections::HashSet<u64> = repos.iter().map(|r| r.id).collect();
    for repo in more {
        if seen.insert(repo.id) {
            repos.push(repo);
        }
    }
    repos
}
