use std::path::{Path, PathBuf};

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::forge::ProviderApi;
use crate::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub scripts_root: CheckResult,
    pub git: CheckResult,
    pub provider: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn healthy_with(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: Some(detail.into()),
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

/// The scripts root must exist and accept new files.
async fn check_scripts_root(root: &Path) -> CheckResult {
    let root: PathBuf = root.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        tempfile::Builder::new()
            .prefix(".healthz")
            .tempfile_in(&root)
            .map(drop)
    })
    .await;

    match result {
        Ok(Ok(())) => CheckResult::healthy(),
        Ok(Err(e)) => CheckResult::unhealthy(format!("scripts root is not writable: {e}")),
        Err(e) => CheckResult::unhealthy(format!("scripts root check task failed: {e}")),
    }
}

async fn check_git() -> CheckResult {
    match crate::git::git_version().await {
        Ok(version) => CheckResult::healthy_with(version),
        Err(e) => CheckResult::unhealthy(format!("{e:#}")),
    }
}

async fn check_provider(provider: &dyn ProviderApi) -> CheckResult {
    match provider.ping().await {
        Ok(()) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    let all_ok = checks.scripts_root.ok && checks.git.ok && checks.provider.ok;
    // Scripts and checkouts live under the scripts root.
    let any_critical = !checks.scripts_root.ok;

    if all_ok {
        HealthStatus::Ok
    } else if any_critical {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Degraded
    }
}

// ---------------------------------------------------------------------------
// Handler body
// ---------------------------------------------------------------------------

/// `GET /healthz`.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(state: &AppState) -> impl IntoResponse {
    let (scripts_root, git, provider) = tokio::join!(
        check_scripts_root(state.registry.root()),
        check_git(),
        check_provider(state.provider.as_ref()),
    );

    let checks = HealthChecks {
        scripts_root,
        git,
        provider,
    };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;

    use super::*;
    use crate::http::testing::{harness, send_json};

    fn checks(scripts_root: bool, git: bool, provider: bool) -> HealthChecks {
        let result = |ok| if ok { CheckResult::healthy() } else { CheckResult::unhealthy("x") };
        HealthChecks {
            scripts_root: result(scripts_root),
            git: result(git),
            provider: result(provider),
        }
    }

    #[test]
    fn scripts_root_failure_is_unhealthy() {
        assert_eq!(aggregate_status(&checks(false, true, true)), HealthStatus::Unhealthy);
    }

    #[test]
    fn provider_or_git_failure_is_degraded() {
        assert_eq!(aggregate_status(&checks(true, true, false)), HealthStatus::Degraded);
        assert_eq!(aggregate_status(&checks(true, false, true)), HealthStatus::Degraded);
        assert_eq!(aggregate_status(&checks(true, true, true)), HealthStatus::Ok);
    }

    #[tokio::test]
    async fn missing_scripts_root_reports_503() {
        let h = harness();
        // The harness never creates the scripts root.
        let (status, body) = send_json(&h, Request::get("/healthz").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["checks"]["scripts_root"]["ok"], false);
        assert_eq!(body["checks"]["provider"]["ok"], true);
    }

    #[tokio::test]
    async fn writable_scripts_root_is_healthy_enough() {
        let h = harness();
        tokio::fs::create_dir_all(h.scripts_root()).await.unwrap();
        let (status, body) = send_json(&h, Request::get("/healthz").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checks"]["scripts_root"]["ok"], true);
        assert_ne!(body["status"], "unhealthy");
    }
}
