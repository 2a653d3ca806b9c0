use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub provider: ProviderConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

// ---------------------------------------------------------------------------
// Provider (OAuth app + API endpoints)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// OAuth application client id.
    pub client_id: String,
    /// Name of the environment variable that holds the OAuth client secret.
    #[serde(default = "default_client_secret_env")]
    pub client_secret_env: String,
    /// REST API root (e.g. `https://api.github.com`).
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// OAuth endpoint root; `/authorize` and `/access_token` live below it.
    #[serde(default = "default_oauth_url")]
    pub oauth_url: String,
    /// Base URL repositories are cloned from (e.g. `https://github.com`).
    #[serde(default = "default_git_url")]
    pub git_url: String,
}

fn default_client_secret_env() -> String {
    "PUSHDEPLOY_CLIENT_SECRET".to_string()
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_oauth_url() -> String {
    "https://github.com/login/oauth".to_string()
}

fn default_git_url() -> String {
    "https://github.com".to_string()
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:3000`).
    pub http_listen: String,
    /// Public base URL of this service.  Used for the OAuth redirect URI and
    /// for the webhook URL registered with the provider.
    pub external_url: String,
    /// Where the browser lands after a successful OAuth exchange.
    #[serde(default = "default_dashboard_url")]
    pub dashboard_url: String,
}

fn default_dashboard_url() -> String {
    "/".to_string()
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// JSON file holding the global OAuth token payload.  Org tokens are
    /// stored next to it as `<stem>_<org>.json`.
    pub token_path: PathBuf,
    /// Root directory for scripts, configs and working copies.
    pub scripts_root: PathBuf,
}

// ---------------------------------------------------------------------------
// Deploy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct DeployConfig {
    /// Interpreter used to run deployment scripts.
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Extra absolute directories a manually supplied working directory may
    /// live under.  The scripts root is always allowed.
    #[serde(default)]
    pub allowed_workdir_roots: Vec<PathBuf>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            allowed_workdir_roots: Vec::new(),
        }
    }
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

// ---------------------------------------------------------------------------
// Webhook
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookConfig {
    /// Name of the environment variable that holds the webhook HMAC secret.
    /// When unset, deliveries are accepted without signature verification.
    #[serde(default)]
    pub secret_env: Option<String>,
}

// ---------------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------------

/// Secret material resolved from the environment once at startup.
#[derive(Clone, Default)]
pub struct Secrets {
    pub client_secret: String,
    pub webhook_secret: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("client_secret", &"<redacted>")
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Secrets {
    /// Read every secret named by `config`.  The OAuth client secret is
    /// mandatory; the webhook secret is only read when configured, and must
    /// then be non-empty.
    pub fn from_env(config: &Config) -> Result<Self> {
        Self::resolve(config, |name| std::env::var(name).ok())
    }

    fn resolve(config: &Config, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let client_secret = required_secret(
            &lookup,
            "OAuth client secret",
            &config.provider.client_secret_env,
        )?;
        let webhook_secret = config
            .webhook
            .secret_env
            .as_deref()
            .map(|name| required_secret(&lookup, "webhook secret", name))
            .transpose()?;

        Ok(Self {
            client_secret,
            webhook_secret,
        })
    }
}

fn required_secret(
    lookup: &impl Fn(&str) -> Option<String>,
    what: &str,
    name: &str,
) -> Result<String> {
    let value = lookup(name).with_context(|| format!("{what} env var {name} is not set"))?;
    anyhow::ensure!(!value.trim().is_empty(), "{what} env var {name} is empty");
    Ok(value)
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("invalid config file: {}", path.display()))
}

fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("failed to parse YAML")?;
    validate_config(&config)?;
    Ok(config)
}

/// Checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.provider.client_id.trim().is_empty(),
        "provider.client_id must not be empty"
    );
    anyhow::ensure!(
        !config.server.http_listen.trim().is_empty(),
        "server.http_listen must not be empty"
    );

    let external = url::Url::parse(&config.server.external_url)
        .context("server.external_url is not a valid URL")?;
    anyhow::ensure!(
        matches!(external.scheme(), "http" | "https"),
        "server.external_url must be an http(s) URL"
    );

    anyhow::ensure!(
        config.storage.token_path.is_absolute(),
        "storage.token_path must be an absolute path"
    );
    anyhow::ensure!(
        config.storage.scripts_root.is_absolute(),
        "storage.scripts_root must be an absolute path"
    );
    for root in &config.deploy.allowed_workdir_roots {
        anyhow::ensure!(
            root.is_absolute(),
            "deploy.allowed_workdir_roots entries must be absolute: {}",
            root.display()
        );
    }
    anyhow::ensure!(
        !config.deploy.shell.trim().is_empty(),
        "deploy.shell must not be empty"
    );
    Ok(())
}

impl Config {
    /// URL the provider should deliver push events to.
    pub fn webhook_url(&self) -> String {
        format!("{}/webhook", self.server.external_url.trim_end_matches('/'))
    }

    /// OAuth redirect URI registered with the provider.
    pub fn oauth_callback_url(&self) -> String {
        format!(
            "{}/github/callback",
            self.server.external_url.trim_end_matches('/')
        )
    }
}
