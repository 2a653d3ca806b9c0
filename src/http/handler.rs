//! Main axum router and HTTP request handlers.
//!
//! Routes:
//! - `GET    /auth/github`                        - Start OAuth (`?org=` for an org tenant)
//! - `GET    /github/callback`                    - OAuth redirect target
//! - `POST   /reauthorize`                        - Forget the stored token
//! - `GET    /auth-status`                        - `{isAuthorized}`
//! - `GET    /repos`                              - User + org repositories
//! - `GET    /repos/:owner/:repo/hooks`           - List webhooks
//! - `DELETE /repos/:owner/:repo/hooks/:hook_id`  - Remove a webhook
//! - `GET    /repos/:owner/:repo/branches`        - List branches
//! - `POST   /add-webhook`                        - Point a push webhook at this service
//! - `GET|POST /repos/:owner/:repo/script`        - Deployment script
//! - `GET|POST /repos/:owner/:repo/config`        - Deployment config
//! - `POST   /repos/:owner/:repo/run-script`      - Manual deployment (buffered JSON)
//! - `POST   /webhook`                            - Push-event gateway (streamed text)
//! - `GET    /healthz`                            - Health check
//! - `GET    /metrics`                            - Prometheus metrics

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::error::AppError;
use crate::credentials::Tenant;
use crate::deploy::{resolve_work_dir, DeployRequest, RunReport, RunState, Trigger};
use crate::forge::{merge_repos, NewHook, ProviderError};
use crate::git::validate_branch;
use crate::registry::{validate_owner, ConfigInput, RepoId};
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // OAuth
        .route("/auth/github", get(handle_auth_start))
        .route("/github/callback", get(handle_auth_callback))
        .route("/reauthorize", post(handle_reauthorize))
        .route("/auth-status", get(handle_auth_status))
        // Provider proxy
        .route("/repos", get(handle_list_repos))
        .route("/repos/{owner}/{repo}/hooks", get(handle_list_hooks))
        .route(
            "/repos/{owner}/{repo}/hooks/{hook_id}",
            delete(handle_delete_hook),
        )
        .route("/repos/{owner}/{repo}/branches", get(handle_list_branches))
        .route("/add-webhook", post(handle_add_webhook))
        // Script registry
        .route(
            "/repos/{owner}/{repo}/script",
            get(handle_get_script).post(handle_save_script),
        )
        .route(
            "/repos/{owner}/{repo}/config",
            get(handle_get_config).post(handle_save_config),
        )
        // Deployments
        .route("/repos/{owner}/{repo}/run-script", post(handle_run_script))
        .route("/webhook", post(super::webhook::handle_webhook))
        // Health, metrics
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct OrgQuery {
    org: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddWebhookBody {
    owner: Option<String>,
    #[serde(alias = "name")]
    repo: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScriptBody {
    script: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunScriptBody {
    #[serde(default)]
    branch: Option<String>,
    #[serde(default)]
    working_dir: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    state: RunState,
    exit_code: Option<i32>,
    output: String,
    report: RunReport,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Unwrap a JSON body, reporting malformed input as a validation error.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| AppError::Validation(e.body_text()))
}

fn required(value: Option<String>, field: &str) -> Result<String, AppError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(AppError::Validation(format!("{field} is required"))),
    }
}

/// Bearer token to use for calls about `owner` (or the global one).
async fn require_token(state: &AppState, owner: Option<&str>) -> Result<String, AppError> {
    let token = match owner {
        Some(owner) => state.credentials.token_for_owner(owner).await,
        None => state.credentials.get_token(&Tenant::Global).await,
    };
    token
        .map(|t| t.access_token)
        .ok_or_else(|| AppError::Unauthorized("not authorized with the provider".into()))
}

// ---------------------------------------------------------------------------
// OAuth
// ---------------------------------------------------------------------------

/// `GET /auth/github`
async fn handle_auth_start(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrgQuery>,
) -> Redirect {
    let tenant = Tenant::from_org(query.org.as_deref());
    let login_state = state.pending_logins.begin(tenant);
    Redirect::to(&state.provider.authorize_url(&login_state))
}

/// `GET /github/callback`
#[instrument(skip_all)]
async fn handle_auth_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
) -> Result<Redirect, AppError> {
    let code = required(query.code, "code")?;
    let login_state = required(query.state, "state")?;
    let tenant = state
        .pending_logins
        .complete(&login_state)
        .ok_or_else(|| AppError::Validation("unknown or expired OAuth state".into()))?;

    let token = state
        .provider
        .exchange_code(&code)
        .await
        .map_err(|e| match e {
            ProviderError::OAuth(msg) => AppError::Validation(msg),
            other => AppError::Provider(other),
        })?;
    state.credentials.set_token(&tenant, token).await?;
    info!(%tenant, "provider authorization completed");

    Ok(Redirect::to(&state.config.server.dashboard_url))
}

/// `POST /reauthorize`
async fn handle_reauthorize(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrgQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let tenant = Tenant::from_org(query.org.as_deref());
    state.credentials.clear_token(&tenant).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

/// `GET /auth-status`
async fn handle_auth_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrgQuery>,
) -> Json<serde_json::Value> {
    let tenant = Tenant::from_org(query.org.as_deref());
    let authorized = state.credentials.is_authorized(&tenant).await;
    Json(serde_json::json!({ "isAuthorized": authorized }))
}

// ---------------------------------------------------------------------------
// Provider proxy
// ---------------------------------------------------------------------------

/// `GET /repos`
///
/// Without `?org=` this is the user's repositories plus those of every org
/// they belong to; an org whose listing fails is skipped.
#[instrument(skip(state))]
async fn handle_list_repos(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrgQuery>,
) -> Result<Response, AppError> {
    if let Some(org) = query.org.as_deref().filter(|o| !o.trim().is_empty()) {
        validate_owner(org)?;
        let token = require_token(&state, Some(org)).await?;
        let repos = state.provider.list_org_repos(&token, org).await?;
        return Ok(Json(repos).into_response());
    }

    let token = require_token(&state, None).await?;
    let mut repos = state.provider.list_repos(&token).await?;
    for org in state.provider.list_orgs(&token).await? {
        let org_token = require_token(&state, Some(&org.login)).await?;
        match state.provider.list_org_repos(&org_token, &org.login).await {
            Ok(more) => repos = merge_repos(repos, more),
            Err(e) => warn!(org = %org.login, error = %e, "skipping org repositories"),
        }
    }
    Ok(Json(repos).into_response())
}

/// `GET /repos/:owner/:repo/hooks`
#[instrument(skip(state), fields(%owner, %repo))]
async fn handle_list_hooks(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let id = RepoId::new(owner, repo)?;
    let token = require_token(&state, Some(id.owner())).await?;
    let hooks = state
        .provider
        .list_hooks(&token, id.owner(), id.name())
        .await?;
    Ok(Json(hooks).into_response())
}

/// `DELETE /repos/:owner/:repo/hooks/:hook_id`
#[instrument(skip(state), fields(%owner, %repo))]
async fn handle_delete_hook(
    State(state): State<Arc<AppState>>,
    Path((owner, repo, hook_id)): Path<(String, String, u64)>,
) -> Result<Response, AppError> {
    let id = RepoId::new(owner, repo)?;
    let token = require_token(&state, Some(id.owner())).await?;
    match state
        .provider
        .delete_hook(&token, id.owner(), id.name(), hook_id)
        .await
    {
        Ok(()) => {}
        Err(e) if e.status() == Some(404) => {
            return Err(AppError::NotFound(format!("hook {hook_id} not found on {id}")));
        }
        Err(e) => return Err(e.into()),
    }
    info!(hook_id, "webhook deleted");
    Ok(Json(serde_json::json!({ "success": true })).into_response())
}

/// `GET /repos/:owner/:repo/branches`
#[instrument(skip(state), fields(%owner, %repo))]
async fn handle_list_branches(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let id = RepoId::new(owner, repo)?;
    let token = require_token(&state, Some(id.owner())).await?;
    let branches = state
        .provider
        .list_branches(&token, id.owner(), id.name())
        .await?;
    Ok(Json(branches).into_response())
}

/// `POST /add-webhook`
///
/// Reuses an existing hook that already targets this service.
#[instrument(skip_all)]
async fn handle_add_webhook(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<AddWebhookBody>, JsonRejection>,
) -> Result<Response, AppError> {
    let body = json_body(payload)?;
    let id = RepoId::new(required(body.owner, "owner")?, required(body.repo, "repo")?)?;
    let token = require_token(&state, Some(id.owner())).await?;
    let url = state.config.webhook_url();

    let existing = state
        .provider
        .list_hooks(&token, id.owner(), id.name())
        .await?
        .into_iter()
        .find(|h| h.config.url.as_deref() == Some(url.as_str()));
    if let Some(hook) = existing {
        info!(repo = %id, hook_id = hook.id, "webhook already present");
        return Ok(Json(serde_json::json!({ "created": false, "hook": hook })).into_response());
    }

    let hook = state
        .provider
        .add_hook(
            &token,
            id.owner(),
            id.name(),
            &NewHook {
                url,
                secret: state.secrets.webhook_secret.clone(),
            },
        )
        .await?;
    info!(repo = %id, hook_id = hook.id, "webhook created");
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "created": true, "hook": hook })),
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Script registry
// ---------------------------------------------------------------------------

/// `GET /repos/:owner/:repo/script`
async fn handle_get_script(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let id = RepoId::new(owner, repo)?;
    let script = state.registry.get_script(&id).await?;
    Ok(Json(serde_json::json!({ "script": script })).into_response())
}

/// `POST /repos/:owner/:repo/script`
#[instrument(skip(state, payload), fields(%owner, %repo))]
async fn handle_save_script(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    payload: Result<Json<ScriptBody>, JsonRejection>,
) -> Result<Response, AppError> {
    let id = RepoId::new(owner, repo)?;
    let script = json_body(payload)?
        .script
        .ok_or_else(|| AppError::Validation("script is required".into()))?;
    state.registry.save_script(&id, &script).await?;
    Ok(Json(serde_json::json!({ "success": true })).into_response())
}

/// `GET /repos/:owner/:repo/config`
async fn handle_get_config(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let id = RepoId::new(owner, repo)?;
    match state.registry.get_config(&id).await? {
        Some(config) => Ok(Json(config).into_response()),
        None => Err(AppError::NotFound(format!("no deployment config for {id}"))),
    }
}

/// `POST /repos/:owner/:repo/config`
#[instrument(skip(state, payload), fields(%owner, %repo))]
async fn handle_save_config(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    payload: Result<Json<ConfigInput>, JsonRejection>,
) -> Result<Response, AppError> {
    let id = RepoId::new(owner, repo)?;
    let input = json_body(payload)?;

    // Reject what a later webhook could not use.
    if let Some(branch) = input.branch.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
        validate_branch(branch)?;
        // Pushes are matched on the last segment of the ref only.
        if branch.contains('/') {
            return Err(AppError::Validation(format!(
                "branch {branch:?} contains '/'; webhook pushes are matched on the final ref segment"
            )));
        }
    }
    if let Some(dir) = input.working_dir.as_deref().filter(|d| !d.trim().is_empty()) {
        resolve_work_dir(
            dir,
            state.registry.root(),
            &state.config.deploy.allowed_workdir_roots,
        )?;
    }

    let config = state.registry.save_config(&id, input).await?;
    Ok(Json(config).into_response())
}

// ---------------------------------------------------------------------------
// Manual deployment
// ---------------------------------------------------------------------------

/// `POST /repos/:owner/:repo/run-script`
///
/// Buffers the whole run and answers with conventional status codes:
/// 200 on success, 404 when no script is registered, 500 when the sync or
/// the script fails.
#[instrument(skip(state, payload), fields(%owner, %repo))]
async fn handle_run_script(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    payload: Result<Json<RunScriptBody>, JsonRejection>,
) -> Result<Response, AppError> {
    let id = RepoId::new(owner, repo)?;
    let body = json_body(payload)?;
    let branch = required(body.branch, "branch")?;
    let working_dir = required(body.working_dir, "workingDir")?;
    validate_branch(&branch)?;
    let work_dir = resolve_work_dir(
        &working_dir,
        state.registry.root(),
        &state.config.deploy.allowed_workdir_roots,
    )?;

    let token = state
        .credentials
        .token_for_owner(id.owner())
        .await
        .map(|t| t.access_token);
    let (report, output) = state
        .executor
        .execute(DeployRequest {
            repo: id,
            branch,
            work_dir,
            token,
            trigger: Trigger::Manual,
        })
        .collect()
        .await
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("deployment task ended without a report")))?;

    let status = match report.state {
        RunState::Succeeded => StatusCode::OK,
        RunState::ScriptNotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let response = RunResponse {
        success: report.succeeded(),
        error: (!report.succeeded()).then(|| report.summary()),
        state: report.state,
        exit_code: report.exit_code(),
        output,
        report,
    };
    Ok((status, Json(response)).into_response())
}

// ---------------------------------------------------------------------------
// Health, metrics
// ---------------------------------------------------------------------------

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    crate::health::health_handler(&state).await
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the service.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::deploy::executor::tests::SpyRunner;
    use crate::forge::Organization;
    use crate::http::testing::{
        harness, harness_with, repository, send, send_json, FakeProvider, Harness,
    };

    fn json_post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    // ── OAuth ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn oauth_round_trip_stores_token_for_requested_tenant() {
        let h = harness();

        let resp = create_router(h.state.clone())
            .oneshot(get_req("/auth/github?org=acme"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        let location = resp.headers()[header::LOCATION].to_str().unwrap();
        let login_state = location.split("state=").nth(1).unwrap().to_string();

        let (status, _) = send(
            &h,
            get_req(&format!("/github/callback?code=good-code&state={login_state}")),
        )
        .await;
        assert_eq!(status, StatusCode::SEE_OTHER);

        let org = Tenant::Org("acme".into());
        assert_eq!(
            h.state.credentials.get_token(&org).await.unwrap().access_token,
            "gho_from_code"
        );
        assert!(!h.state.credentials.is_authorized(&Tenant::Global).await);
    }

    #[tokio::test]
    async fn callback_with_unknown_state_is_rejected() {
        let h = harness();
        let (status, body) =
            send_json(&h, get_req("/github/callback?code=good-code&state=forged")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("state"));
        assert!(!h.state.credentials.is_authorized(&Tenant::Global).await);
    }

    #[tokio::test]
    async fn reauthorize_is_idempotent() {
        let h = harness();
        h.authorize(Tenant::Global, "gho_abc").await;

        for _ in 0..2 {
            let (status, body) = send_json(&h, json_post("/reauthorize", serde_json::json!({}))).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["success"], true);
        }
        assert!(!h.state.config.storage.token_path.exists());
        assert!(!h.state.credentials.is_authorized(&Tenant::Global).await);
    }

    #[tokio::test]
    async fn auth_status_never_exposes_token() {
        let h = harness();
        let (_, body) = send_json(&h, get_req("/auth-status")).await;
        assert_eq!(body, serde_json::json!({ "isAuthorized": false }));

        h.authorize(Tenant::Global, "gho_very_secret").await;
        let (status, text) = send(&h, get_req("/auth-status")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(text.contains("\"isAuthorized\":true"));
        assert!(!text.contains("gho_very_secret"));
    }

    // ── Provider proxy ──────────────────────────────────────────────────

    #[tokio::test]
    async fn repos_requires_authorization() {
        let h = harness();
        let (status, _) = send(&h, get_req("/repos")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn repos_merges_org_repositories_with_org_tokens() {
        let mut provider = FakeProvider {
            repos: vec![repository(1, "me/dotfiles"), repository(2, "acme/widgets")],
            orgs: vec![Organization {
                login: "acme".into(),
            }],
            ..Default::default()
        };
        provider.org_repos.insert(
            "acme".into(),
            vec![repository(2, "acme/widgets"), repository(3, "acme/gadgets")],
        );
        let h = Harness::build(None, SpyRunner::new(0, 0), provider);
        h.authorize(Tenant::Global, "gho_user").await;
        h.authorize(Tenant::Org("acme".into()), "gho_acme").await;

        let (status, body) = send_json(&h, get_req("/repos")).await;

        assert_eq!(status, StatusCode::OK);
        let names: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["full_name"].as_str().unwrap())
            .collect();
        assert_eq!(names, ["me/dotfiles", "acme/widgets", "acme/gadgets"]);
        let tokens = h.provider.tokens_seen.lock().unwrap().clone();
        assert_eq!(tokens, ["gho_user", "gho_user", "gho_acme"]);
    }

    #[tokio::test]
    async fn org_filter_with_path_separator_is_400() {
        let h = harness();
        h.authorize(Tenant::Global, "gho_user").await;

        let (status, _) = send(&h, get_req("/repos?org=acme%2F..%2Fusers")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(h.provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn provider_failure_is_502_without_upstream_body() {
        let provider = FakeProvider {
            fail_with: Some(500),
            ..Default::default()
        };
        let h = Harness::build(None, SpyRunner::new(0, 0), provider);
        h.authorize(Tenant::Global, "gho_abc").await;

        let (status, text) = send(&h, get_req("/repos/acme/widgets/hooks")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(!text.contains("upstream says no"));
    }

    #[tokio::test]
    async fn provider_401_asks_caller_to_reauthorize() {
        let provider = FakeProvider {
            fail_with: Some(401),
            ..Default::default()
        };
        let h = Harness::build(None, SpyRunner::new(0, 0), provider);
        h.authorize(Tenant::Global, "gho_stale").await;

        let (status, body) = send_json(&h, get_req("/repos/acme/widgets/branches")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["reauthorize"], true);
    }

    #[tokio::test]
    async fn add_webhook_targets_this_service_once() {
        let h = harness();
        h.authorize(Tenant::Global, "gho_abc").await;
        let body = serde_json::json!({ "owner": "acme", "repo": "widgets" });

        let (status, first) = send_json(&h, json_post("/add-webhook", body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(
            first["hook"]["config"]["url"],
            "https://deploy.example.com/webhook"
        );

        let (status, second) = send_json(&h, json_post("/add-webhook", body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["created"], false);
        assert_eq!(h.provider.hooks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_unknown_hook_is_404() {
        let h = harness();
        h.authorize(Tenant::Global, "gho_abc").await;
        let req = Request::delete("/repos/acme/widgets/hooks/42")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&h, req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // ── Registry ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn script_round_trips_through_http() {
        let h = harness();
        let (_, body) = send_json(&h, get_req("/repos/acme/widgets/script")).await;
        assert_eq!(body["script"], "");

        let script = "#!/bin/sh\nmake deploy\n";
        let (status, _) = send(
            &h,
            json_post(
                "/repos/acme/widgets/script",
                serde_json::json!({ "script": script }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send_json(&h, get_req("/repos/acme/widgets/script")).await;
        assert_eq!(body["script"], script);
    }

    #[tokio::test]
    async fn config_requires_branch_and_working_dir() {
        let h = harness();
        for body in [
            serde_json::json!({ "workingDir": "widgets" }),
            serde_json::json!({ "branch": "main", "workingDir": "  " }),
        ] {
            let (status, _) = send(&h, json_post("/repos/acme/widgets/config", body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }
        let (status, _) = send(&h, get_req("/repos/acme/widgets/config")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn config_outside_allowed_roots_is_rejected() {
        let h = harness();
        let (status, _) = send(
            &h,
            json_post(
                "/repos/acme/widgets/config",
                serde_json::json!({ "branch": "main", "workingDir": "/etc" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let dir = h.allowed_root().join("widgets");
        let (status, body) = send_json(
            &h,
            json_post(
                "/repos/acme/widgets/config",
                serde_json::json!({ "branch": "main", "workingDir": dir }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["branch"], "main");
    }

    #[tokio::test]
    async fn config_with_slashed_branch_is_rejected() {
        let h = harness();
        let (status, body) = send_json(
            &h,
            json_post(
                "/repos/acme/widgets/config",
                serde_json::json!({ "branch": "release/v2", "workingDir": "sites/w" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("release/v2"));
        let (status, _) = send(&h, get_req("/repos/acme/widgets/config")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // ── Manual deployment ───────────────────────────────────────────────

    #[tokio::test]
    async fn manual_run_with_empty_branch_is_400_and_touches_nothing() {
        let h = harness();
        h.save_script("acme", "widgets", "make deploy").await;
        let dir = h.scripts_root().join("manual-wd");

        for body in [
            serde_json::json!({ "branch": "", "workingDir": "manual-wd" }),
            serde_json::json!({ "branch": "main", "workingDir": "" }),
            serde_json::json!({ "workingDir": "manual-wd" }),
        ] {
            let (status, _) = send(&h, json_post("/repos/acme/widgets/run-script", body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }
        assert!(!dir.exists());
        assert_eq!(h.spy.syncs.load(Ordering::SeqCst), 0);
        assert_eq!(h.spy.scripts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn manual_run_success_is_200_json() {
        let h = harness();
        h.save_script("acme", "widgets", "make deploy").await;

        let (status, body) = send_json(
            &h,
            json_post(
                "/repos/acme/widgets/run-script",
                serde_json::json!({ "branch": "main", "workingDir": "acme_widgets" }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["state"], "SUCCEEDED");
        assert_eq!(body["output"], "sync main\nscript output\n");
    }

    #[tokio::test]
    async fn manual_run_script_failure_is_500_json() {
        let h = harness_with(None, SpyRunner::new(0, 3));
        h.save_script("acme", "widgets", "exit 3").await;

        let (status, body) = send_json(
            &h,
            json_post(
                "/repos/acme/widgets/run-script",
                serde_json::json!({ "branch": "main", "workingDir": "acme_widgets" }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["state"], "SCRIPT_FAILED");
        assert_eq!(body["exitCode"], 3);
        assert!(body["error"].as_str().unwrap().starts_with("DEPLOY FAILED"));
    }

    #[tokio::test]
    async fn manual_run_without_script_is_404() {
        let h = harness();
        let (status, body) = send_json(
            &h,
            json_post(
                "/repos/acme/widgets/run-script",
                serde_json::json!({ "branch": "main", "workingDir": "acme_widgets" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["state"], "SCRIPT_NOT_FOUND");
        assert_eq!(h.spy.syncs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn manual_run_outside_allowed_roots_is_400() {
        let h = harness();
        h.save_script("acme", "widgets", "make deploy").await;
        for dir in ["/tmp/elsewhere", "../escape"] {
            let (status, _) = send(
                &h,
                json_post(
                    "/repos/acme/widgets/run-script",
                    serde_json::json!({ "branch": "main", "workingDir": dir }),
                ),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }
        assert_eq!(h.spy.syncs.load(Ordering::SeqCst), 0);
    }

    // ── Metrics ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn metrics_endpoint_reports_runs() {
        let h = harness();
        h.save_script("acme", "widgets", "make deploy").await;
        send(
            &h,
            json_post(
                "/repos/acme/widgets/run-script",
                serde_json::json!({ "branch": "main", "workingDir": "acme_widgets" }),
            ),
        )
        .await;

        let (status, text) = send(&h, get_req("/metrics")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(
            text.contains("pushdeploy_deploy_runs_total{trigger=\"Manual\",outcome=\"Succeeded\"} 1"),
            "{text}"
        );
    }
}
