//! Router test fixtures: an [`AppState`] wired to a spy step runner and an
//! in-memory provider.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use crate::config::{
    Config, DeployConfig, ProviderConfig, Secrets, ServerConfig, StorageConfig, WebhookConfig,
};
use crate::credentials::{CredentialStore, PendingLogins, Tenant, TokenData};
use crate::deploy::executor::tests::SpyRunner;
use crate::deploy::DeployExecutor;
use crate::forge::{
    Account, Branch, Hook, HookConfig, NewHook, Organization, ProviderApi, ProviderError,
    Repository,
};
use crate::metrics::MetricsRegistry;
use crate::registry::{RepoId, ScriptRegistry};
use crate::AppState;

// ---------------------------------------------------------------------------
// Fake provider
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct FakeProvider {
    pub repos: Vec<Repository>,
    pub orgs: Vec<Organization>,
    pub org_repos: HashMap<String, Vec<Repository>>,
    pub hooks: Mutex<Vec<Hook>>,
    /// When set, every REST call fails with this status.
    pub fail_with: Option<u16>,
    pub calls: AtomicUsize,
    pub tokens_seen: Mutex<Vec<String>>,
}

pub(crate) fn repository(id: u64, full_name: &str) -> Repository {
    let (owner, name) = full_name.split_once('/').unwrap();
    Repository {
        id,
        name: name.into(),
        full_name: full_name.into(),
        owner: Account {
            login: owner.into(),
        },
        private: false,
        default_branch: Some("main".into()),
        html_url: None,
    }
}

impl FakeProvider {
    fn record(&self, token: &str) -> Result<(), ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tokens_seen.lock().unwrap().push(token.to_string());
        match self.fail_with {
            Some(status) => Err(ProviderError::Status {
                status,
                body: "upstream says no".into(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl ProviderApi for FakeProvider {
    fn authorize_url(&self, state: &str) -> String {
        format!("https://provider.example/login/oauth/authorize?state={state}")
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenData, ProviderError> {
        if code == "good-code" {
            Ok(TokenData::bearer("gho_from_code"))
        } else {
            Err(ProviderError::OAuth("bad_verification_code".into()))
        }
    }

    async fn list_repos(&self, token: &str) -> Result<Vec<Repository>, ProviderError> {
        self.record(token)?;
        Ok(self.repos.clone())
    }

    async fn list_orgs(&self, token: &str) -> Result<Vec<Organization>, ProviderError> {
        self.record(token)?;
        Ok(self.orgs.clone())
    }

    async fn list_org_repos(
        &self,
        token: &str,
        org: &str,
    ) -> Result<Vec<Repository>, ProviderError> {
        self.record(token)?;
        Ok(self.org_repos.get(org).cloned().unwrap_or_default())
    }

    async fn list_hooks(
        &self,
        token: &str,
        _owner: &str,
        _repo: &str,
    ) -> Result<Vec<Hook>, ProviderError> {
        self.record(token)?;
        Ok(self.hooks.lock().unwrap().clone())
    }

    async fn add_hook(
        &self,
        token: &str,
        _owner: &str,
        _repo: &str,
        hook: &NewHook,
    ) -> Result<Hook, ProviderError> {
        self.record(token)?;
        let mut hooks = self.hooks.lock().unwrap();
        let created = Hook {
            id: hooks.len() as u64 + 1,
            active: true,
            events: vec!["push".into()],
            config: HookConfig {
                url: Some(hook.url.clone()),
                content_type: Some("json".into()),
            },
        };
        hooks.push(created.clone());
        Ok(created)
    }

    async fn delete_hook(
        &self,
        token: &str,
        _owner: &str,
        _repo: &str,
        hook_id: u64,
    ) -> Result<(), ProviderError> {
        self.record(token)?;
        let mut hooks = self.hooks.lock().unwrap();
        let before = hooks.len();
        hooks.retain(|h| h.id != hook_id);
        if hooks.len() == before {
            return Err(ProviderError::Status {
                status: 404,
                body: "Not Found".into(),
            });
        }
        Ok(())
    }

    async fn list_branches(
        &self,
        token: &str,
        _owner: &str,
        _repo: &str,
    ) -> Result<Vec<Branch>, ProviderError> {
        self.record(token)?;
        Ok(vec![Branch {
            name: "main".into(),
        }])
    }

    async fn ping(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub(crate) struct Harness {
    pub state: Arc<AppState>,
    pub spy: Arc<SpyRunner>,
    pub provider: Arc<FakeProvider>,
    _tmp: tempfile::TempDir,
}

impl Harness {
    pub fn build(webhook_secret: Option<&str>, spy: SpyRunner, provider: FakeProvider) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let base = "http://provider.invalid".to_string();
        let config = Config {
            provider: ProviderConfig {
                client_id: "client-1".into(),
                client_secret_env: "UNUSED".into(),
                api_url: base.clone(),
                oauth_url: format!("{base}/login/oauth"),
                git_url: base,
            },
            server: ServerConfig {
                http_listen: "127.0.0.1:0".into(),
                external_url: "https://deploy.example.com".into(),
                dashboard_url: "/dashboard".into(),
            },
            storage: StorageConfig {
                token_path: tmp.path().join("token.json"),
                scripts_root: tmp.path().join("scripts"),
            },
            deploy: DeployConfig {
                shell: "/bin/sh".into(),
                allowed_workdir_roots: vec![tmp.path().join("srv")],
            },
            webhook: WebhookConfig {
                secret_env: webhook_secret.map(|_| "WEBHOOK_SECRET".into()),
            },
        };
        let secrets = Secrets {
            client_secret: "shh".into(),
            webhook_secret: webhook_secret.map(str::to_string),
        };

        let spy = Arc::new(spy);
        let provider = Arc::new(provider);
        let metrics = MetricsRegistry::new();
        let registry = ScriptRegistry::new(&config.storage.scripts_root);
        let executor = DeployExecutor::new(registry.clone(), spy.clone(), metrics.clone());

        let state = AppState {
            credentials: CredentialStore::new(&config.storage.token_path),
            config: Arc::new(config),
            secrets: Arc::new(secrets),
            metrics,
            registry,
            executor,
            provider: provider.clone(),
            pending_logins: PendingLogins::new(),
        };

        Self {
            state: Arc::new(state),
            spy,
            provider,
            _tmp: tmp,
        }
    }

    pub fn scripts_root(&self) -> &Path {
        &self.state.config.storage.scripts_root
    }

    /// The extra root a manual `workingDir` may point into.
    pub fn allowed_root(&self) -> PathBuf {
        self.state.config.deploy.allowed_workdir_roots[0].clone()
    }

    pub async fn save_script(&self, owner: &str, name: &str, text: &str) {
        self.state
            .registry
            .save_script(&RepoId::new(owner, name).unwrap(), text)
            .await
            .unwrap();
    }

    pub async fn authorize(&self, tenant: Tenant, token: &str) {
        self.state
            .credentials
            .set_token(&tenant, TokenData::bearer(token))
            .await
            .unwrap();
    }
}

pub(crate) fn harness() -> Harness {
    Harness::build(None, SpyRunner::new(0, 0), FakeProvider::default())
}

pub(crate) fn harness_with(webhook_secret: Option<&str>, spy: SpyRunner) -> Harness {
    Harness::build(webhook_secret, spy, FakeProvider::default())
}

/// Drive one request through the full router and collect the body.
pub(crate) async fn send(h: &Harness, req: Request<Body>) -> (StatusCode, String) {
    let router = super::handler::create_router(h.state.clone());
    let resp = router.oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

/// Like [`send`] but parses the body as JSON.
pub(crate) async fn send_json(h: &Harness, req: Request<Body>) -> (StatusCode, serde_json::Value) {
    let (status, text) = send(h, req).await;
    let value = serde_json::from_str(&text)
        .unwrap_or_else(|e| panic!("body is not JSON ({e}): {text}"));
    (status, value)
}
