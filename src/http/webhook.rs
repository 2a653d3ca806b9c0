//! Push-event gateway.
//!
//! Verifies the HMAC-SHA256 signature when a secret is configured, filters
//! event types, validates the push payload and hands the run to the
//! executor.  Once a payload is accepted the response is always `200` and
//! its body streams the run's output, closing with one summary line; the
//! outcome is in the text, not the status code.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info, instrument, warn};

use super::error::AppError;
use crate::deploy::{resolve_work_dir, DeployRequest, RunEvent, Trigger};
use crate::git::{validate_branch, BranchError};
use crate::metrics::WebhookResult;
use crate::registry::{RepoId, RepoIdError};
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

const BRANCH_REF_PREFIX: &str = "refs/heads/";

// ---------------------------------------------------------------------------
// Payload parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: Option<String>,
    repository: Option<PayloadRepository>,
}

#[derive(Debug, Deserialize)]
struct PayloadRepository {
    name: Option<String>,
    owner: Option<PayloadOwner>,
}

#[derive(Debug, Deserialize)]
struct PayloadOwner {
    login: Option<String>,
}

/// A validated push: which repository, which branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    pub repo: RepoId,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PushEventError {
    #[error("payload is not valid JSON: {0}")]
    MalformedJson(String),
    #[error("payload is missing {0}")]
    MissingField(&'static str),
    #[error("ref {0:?} does not name a branch (expected refs/heads/<branch>)")]
    NotABranch(String),
    #[error(transparent)]
    Repository(#[from] RepoIdError),
    #[error(transparent)]
    Branch(#[from] BranchError),
}

/// Branch named by a `refs/heads/...` ref: the text after the final `/`.
pub fn branch_from_ref(git_ref: &str) -> Option<&str> {
    let rest = git_ref.strip_prefix(BRANCH_REF_PREFIX)?;
    let branch = rest.rsplit('/').next().unwrap_or(rest);
    (!branch.is_empty()).then_some(branch)
}

fn non_empty(value: Option<String>, field: &'static str) -> Result<String, PushEventError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(PushEventError::MissingField(field)),
    }
}

pub fn parse_push_event(body: &[u8]) -> Result<PushEvent, PushEventError> {
    let payload: PushPayload =
        serde_json::from_slice(body).map_err(|e| PushEventError::MalformedJson(e.to_string()))?;

    let repository = payload
        .repository
        .ok_or(PushEventError::MissingField("repository"))?;
    let owner = non_empty(
        repository.owner.and_then(|o| o.login),
        "repository.owner.login",
    )?;
    let name = non_empty(repository.name, "repository.name")?;
    let git_ref = non_empty(payload.git_ref, "ref")?;

    let branch = branch_from_ref(&git_ref)
        .ok_or_else(|| PushEventError::NotABranch(git_ref.clone()))?
        .to_string();
    validate_branch(&branch)?;

    Ok(PushEvent {
        repo: RepoId::new(owner, name)?,
        branch,
    })
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum EventKind {
    Push,
    Ping,
    Other(String),
}

/// An absent event header is treated as a push so plain `curl` triggers work.
fn event_kind(headers: &HeaderMap) -> EventKind {
    let name = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    match name {
        None | Some("push") => EventKind::Push,
        Some("ping") => EventKind::Ping,
        Some(other) => EventKind::Other(other.to_string()),
    }
}

/// Check `X-Hub-Signature-256: sha256=<hex>` against the body.
pub fn verify_signature(headers: &HeaderMap, body: &[u8], secret: &str) -> anyhow::Result<()> {
    let sig_header = headers
        .get("X-Hub-Signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| anyhow::anyhow!("missing X-Hub-Signature-256 header"))?;

    let sig_hex = sig_header
        .strip_prefix("sha256=")
        .ok_or_else(|| anyhow::anyhow!("signature does not start with sha256="))?;

    let sig_bytes =
        hex::decode(sig_hex).map_err(|e| anyhow::anyhow!("invalid hex in signature: {e}"))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("HMAC key error: {e}"))?;
    mac.update(body);

    mac.verify_slice(&sig_bytes)
        .map_err(|_| anyhow::anyhow!("HMAC signature mismatch"))
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

fn plain_text(text: impl Into<String>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        text.into(),
    )
        .into_response()
}

/// `POST /webhook`
#[instrument(skip_all)]
pub async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let metrics = &state.metrics.metrics;

    // 1. Verify HMAC signature.
    if let Some(secret) = &state.secrets.webhook_secret {
        if let Err(e) = verify_signature(&headers, &body, secret) {
            warn!(error = %e, "webhook signature verification failed");
            metrics.observe_webhook(WebhookResult::Unauthorized);
            return Err(AppError::Unauthorized("invalid webhook signature".into()));
        }
    }

    // 2. Only pushes deploy.
    match event_kind(&headers) {
        EventKind::Push => {}
        EventKind::Ping => {
            info!("webhook ping received");
            metrics.observe_webhook(WebhookResult::Ignored);
            return Ok(plain_text("pong\n"));
        }
        EventKind::Other(event) => {
            debug!(%event, "ignoring non-push webhook event");
            metrics.observe_webhook(WebhookResult::Ignored);
            return Ok(plain_text(format!("ignored: {event} event\n")));
        }
    }

    // 3. Validate the payload.
    let push = parse_push_event(&body).map_err(|e| {
        warn!(error = %e, "rejecting push payload");
        metrics.observe_webhook(WebhookResult::Invalid);
        AppError::Validation(e.to_string())
    })?;

    // 4. A stored config narrows the branch and may move the checkout.
    let work_dir = match state.registry.get_config(&push.repo).await? {
        Some(config) => {
            if config.branch != push.branch {
                info!(
                    repo = %push.repo,
                    pushed = %push.branch,
                    configured = %config.branch,
                    "push to unconfigured branch ignored"
                );
                metrics.observe_webhook(WebhookResult::Ignored);
                return Ok(plain_text(format!(
                    "ignored: {} deploys branch {}, not {}\n",
                    push.repo, config.branch, push.branch
                )));
            }
            resolve_work_dir(
                &config.working_dir,
                state.registry.root(),
                &state.config.deploy.allowed_workdir_roots,
            )
            .map_err(|e| {
                AppError::Internal(anyhow::anyhow!(
                    "stored config for {} has an unusable workingDir: {e}",
                    push.repo
                ))
            })?
        }
        None => state.registry.default_work_dir(&push.repo),
    };

    // 5. Run and stream.
    let token = state
        .credentials
        .token_for_owner(push.repo.owner())
        .await
        .map(|t| t.access_token);
    info!(repo = %push.repo, branch = %push.branch, work_dir = %work_dir.display(), "push accepted");
    metrics.observe_webhook(WebhookResult::Accepted);

    let handle = state.executor.execute(DeployRequest {
        repo: push.repo,
        branch: push.branch,
        work_dir,
        token,
        trigger: Trigger::Webhook,
    });

    let stream = handle.into_stream().filter_map(|event| {
        let chunk = match event {
            RunEvent::Output(text) => Some(Bytes::from(text)),
            RunEvent::Finished(report) => Some(Bytes::from(format!("{}\n", report.summary()))),
            RunEvent::State(_) => None,
        };
        futures::future::ready(chunk.map(Ok::<_, Infallible>))
    });

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
