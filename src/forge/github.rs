//! GitHub / GitHub Enterprise implementation of [`ProviderApi`].

use anyhow::Context as _;
use chrono::Utc;
use reqwest::{header, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::config::ProviderConfig;
use crate::credentials::TokenData;
use crate::metrics::MetricsRegistry;

use super::{Branch, Hook, NewHook, Organization, ProviderApi, ProviderError, Repository, OAUTH_SCOPES};

const ACCEPT: &str = "application/vnd.github+json";
const API_VERSION: &str = "2022-11-28";
const PER_PAGE: u32 = 100;
/// Upper bound on pages fetched for one listing.
const MAX_PAGES: u32 = 10;

// ---------------------------------------------------------------------------
// Provider struct
// ---------------------------------------------------------------------------

pub struct GitHubProvider {
    http: reqwest::Client,
    api_url: url::Url,
    authorize_url: url::Url,
    access_token_url: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    metrics: MetricsRegistry,
}

impl GitHubProvider {
    pub fn new(
        http: reqwest::Client,
        config: &ProviderConfig,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
        metrics: MetricsRegistry,
    ) -> anyhow::Result<Self> {
        let api_url = url::Url::parse(&config.api_url)
            .context("provider.api_url is not a valid URL")?;
        anyhow::ensure!(
            !api_url.cannot_be_a_base(),
            "provider.api_url must be a hierarchical URL"
        );
        let oauth_url = config.oauth_url.trim_end_matches('/');
        let authorize_url = url::Url::parse(&format!("{oauth_url}/authorize"))
            .context("provider.oauth_url is not a valid URL")?;
        Ok(Self {
            http,
            api_url,
            authorize_url,
            access_token_url: format!("{oauth_url}/access_token"),
            client_id: config.client_id.clone(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
            metrics,
        })
    }

    /// API URL for `segments`, each percent-encoded as a single path segment.
    fn endpoint(&self, segments: &[&str]) -> url::Url {
        let mut url = self.api_url.clone();
        // Cannot fail: `new` rejects cannot-be-a-base URLs.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str], token: &str) -> RequestBuilder {
        self.http
            .request(method, self.endpoint(segments))
            .bearer_auth(token)
            .header(header::ACCEPT, ACCEPT)
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    /// Record the call and turn a non-2xx answer into [`ProviderError::Status`].
    async fn check(
        &self,
        endpoint: &'static str,
        sent: Result<Response, reqwest::Error>,
    ) -> Result<Response, ProviderError> {
        let resp = match sent {
            Ok(resp) => resp,
            Err(e) => {
                self.metrics.metrics.observe_provider_call(endpoint, 0);
                warn!(endpoint, error = %e, "provider request failed");
                return Err(e.into());
            }
        };

        let status = resp.status();
        self.metrics
            .metrics
            .observe_provider_call(endpoint, status.as_u16());
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unreadable>"));
        warn!(endpoint, status = status.as_u16(), %body, "provider returned non-success");
        Err(ProviderError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        builder: RequestBuilder,
    ) -> Result<T, ProviderError> {
        let resp = self.check(endpoint, builder.send().await).await?;
        Ok(resp.json().await?)
    }

    /// Follow `page=N` until a short page comes back.
    async fn get_paginated<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        token: &str,
        segments: &[&str],
        extra_query: &[(&str, &str)],
    ) -> Result<Vec<T>, ProviderError> {
        let mut items = Vec::new();
        for page in 1..=MAX_PAGES {
            let builder = self
                .request(Method::GET, segments, token)
                .query(extra_query)
                .query(&[("per_page", PER_PAGE), ("page", page)]);
            let batch: Vec<T> = self.get_json(endpoint, builder).await?;
            let len = batch.len();
            items.extend(batch);
            if len < PER_PAGE as usize {
                break;
            }
            if page == MAX_PAGES {
                warn!(endpoint, pages = MAX_PAGES, "listing truncated");
            }
        }
        Ok(items)
    }
}

// ---------------------------------------------------------------------------
// Trait implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl ProviderApi for GitHubProvider {
    fn authorize_url(&self, state: &str) -> String {
        let mut url = self.authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("scope", &OAUTH_SCOPES.join(" "))
            .append_pair("state", state);
        url.into()
    }

    #[instrument(skip_all)]
    async fn exchange_code(&self, code: &str) -> Result<TokenData, ProviderError> {
        let sent = self
            .http
            .post(&self.access_token_url)
            .header(header::ACCEPT, "application/json")
            .json(&serde_json::json!({
                "client_id": self.client_id,
                "client_secret": self.client_secret,
                "code": code,
                "redirect_uri": self.redirect_uri,
            }))
            .send()
            .await;
        let resp = self.check("exchange_code", sent).await?;
        let body: serde_json::Value = resp.json().await?;
        parse_token_response(body)
    }

    async fn list_repos(&self, token: &str) -> Result<Vec<Repository>, ProviderError> {
        self.get_paginated(
            "list_repos",
            token,
            &["user", "repos"],
            &[("affiliation", "owner,collaborator,organization_member")],
        )
        .await
    }

    async fn list_orgs(&self, token: &str) -> Result<Vec<Organization>, ProviderError> {
        self.get_paginated("list_orgs", token, &["user", "orgs"], &[])
            .await
    }

    #[instrument(skip(self, token))]
    async fn list_org_repos(
        &self,
        token: &str,
        org: &str,
    ) -> Result<Vec<Repository>, ProviderError> {
        self.get_paginated("list_org_repos", token, &["orgs", org, "repos"], &[])
            .await
    }

    #[instrument(skip(self, token))]
    async fn list_hooks(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<Hook>, ProviderError> {
        self.get_paginated(
            "list_hooks",
            token,
            &["repos", owner, repo, "hooks"],
            &[],
        )
        .await
    }

    #[instrument(skip(self, token))]
    async fn add_hook(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        hook: &NewHook,
    ) -> Result<Hook, ProviderError> {
        let builder = self
            .request(Method::POST, &["repos", owner, repo, "hooks"], token)
            .json(&hook_body(hook));
        let created: Hook = self.get_json("add_hook", builder).await?;
        debug!(hook_id = created.id, "webhook created");
        Ok(created)
    }

    #[instrument(skip(self, token))]
    async fn delete_hook(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        hook_id: u64,
    ) -> Result<(), ProviderError> {
        let sent = self
            .request(
                Method::DELETE,
                &["repos", owner, repo, "hooks", &hook_id.to_string()],
                token,
            )
            .send()
            .await;
        self.check("delete_hook", sent).await?;
        Ok(())
    }

    #[instrument(skip(self, token))]
    async fn list_branches(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<Branch>, ProviderError> {
        self.get_paginated(
            "list_branches",
            token,
            &["repos", owner, repo, "branches"],
            &[],
        )
        .await
    }

    async fn ping(&self) -> Result<(), ProviderError> {
        let sent = self
            .http
            .head(self.endpoint(&["meta"]))
            .header(header::ACCEPT, ACCEPT)
            .send()
            .await;
        let resp = sent?;
        let status = resp.status();
        if status.is_success() || status.is_redirection() {
            Ok(())
        } else {
            Err(ProviderError::Status {
                status: status.as_u16(),
                body: String::new(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn hook_body(hook: &NewHook) -> serde_json::Value {
    let mut config = serde_json::json!({
        "url": hook.url,
        "content_type": "json",
        "insecure_ssl": "0",
    });
    if let Some(secret) = &hook.secret {
        config["secret"] = serde_json::Value::String(secret.clone());
    }
    serde_json::json!({
        "name": "web",
        "active": true,
        "events": ["push"],
        "config": config,
    })
}

/// The token endpoint reports failures as 200 with an `error` field.
fn parse_token_response(body: serde_json::Value) -> Result<TokenData, ProviderError> {
    if let Some(error) = body.get("error").and_then(|e| e.as_str()) {
        let detail = body
            .get("error_description")
            .and_then(|d| d.as_str())
            .unwrap_or(error);
        return Err(ProviderError::OAuth(detail.to_string()));
    }
    let mut token: TokenData = serde_json::from_value(body)
        .map_err(|e| ProviderError::OAuth(format!("malformed token response: {e}")))?;
    if token.access_token.is_empty() {
        return Err(ProviderError::OAuth("token response carried no access_token".into()));
    }
    token.acquired_at = Some(Utc::now());
    Ok(token)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
