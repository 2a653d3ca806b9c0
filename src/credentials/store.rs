use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::registry::sanitize_segment;
use crate::storage;

const TOKEN_FILE_MODE: u32 = 0o600;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Authorisation boundary a token belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Tenant {
    Global,
    Org(String),
}

impl Tenant {
    /// `None` or a blank name selects the global tenant.
    pub fn from_org(org: Option<&str>) -> Self {
        match org.map(str::trim) {
            Some(name) if !name.is_empty() => Self::Org(name.to_string()),
            _ => Self::Global,
        }
    }
}

impl fmt::Display for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Org(org) => write!(f, "org:{org}"),
        }
    }
}

/// Full token payload returned by the provider's OAuth exchange.
///
/// Unknown fields are kept in `extra` so the durable copy is the complete
/// payload rather than only the bearer string.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenData {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub acquired_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TokenData {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: "bearer".to_string(),
            scope: String::new(),
            acquired_at: Some(Utc::now()),
            extra: serde_json::Map::new(),
        }
    }
}

impl fmt::Debug for TokenData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenData")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("acquired_at", &self.acquired_at)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// In-memory token cache backed by one JSON file per tenant.
///
/// All mutations (set, clear, and the lazy fill from disk) take the write
/// half of a single lock, so a reader never observes a half-applied update.
#[derive(Clone)]
pub struct CredentialStore {
    token_path: PathBuf,
    tokens: Arc<RwLock<HashMap<Tenant, TokenData>>>,
}

impl CredentialStore {
    /// `token_path` is the global tenant's file; org files live beside it.
    pub fn new(token_path: impl Into<PathBuf>) -> Self {
        Self {
            token_path: token_path.into(),
            tokens: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Durable file for `tenant`.
    pub fn path_for(&self, tenant: &Tenant) -> PathBuf {
        match tenant {
            Tenant::Global => self.token_path.clone(),
            Tenant::Org(org) => {
                let stem = self
                    .token_path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("token");
                let name = format!("{stem}_{}.json", sanitize_segment(org));
                match self.token_path.parent() {
                    Some(dir) => dir.join(name),
                    None => PathBuf::from(name),
                }
            }
        }
    }

    /// Return the token for `tenant`, filling the cache from disk on a miss.
    ///
    /// Read or parse failures of the durable copy are logged and reported as
    /// "no token".
    #[instrument(skip(self), fields(%tenant))]
    pub async fn get_token(&self, tenant: &Tenant) -> Option<TokenData> {
        if let Some(token) = self.tokens.read().await.get(tenant) {
            return Some(token.clone());
        }

        let mut tokens = self.tokens.write().await;
        // Another task may have filled the slot while we waited.
        if let Some(token) = tokens.get(tenant) {
            return Some(token.clone());
        }

        let path = self.path_for(tenant);
        match load_token_file(&path).await {
            Ok(Some(token)) => {
                debug!(path = %path.display(), "token loaded from durable storage");
                tokens.insert(tenant.clone(), token.clone());
                Some(token)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "ignoring unreadable token file");
                None
            }
        }
    }

    /// Token to use for calls about repositories under `owner`: that org's
    /// own token when one exists, otherwise the global token.
    pub async fn token_for_owner(&self, owner: &str) -> Option<TokenData> {
        let org = Tenant::Org(owner.to_string());
        match self.get_token(&org).await {
            Some(token) => Some(token),
            None => self.get_token(&Tenant::Global).await,
        }
    }

    pub async fn is_authorized(&self, tenant: &Tenant) -> bool {
        self.get_token(tenant).await.is_some()
    }

    /// Store `token` in memory and overwrite the durable copy.
    #[instrument(skip(self, token), fields(%tenant))]
    pub async fn set_token(&self, tenant: &Tenant, token: TokenData) -> Result<()> {
        let mut tokens = self.tokens.write().await;
        let json = serde_json::to_vec_pretty(&token).context("failed to encode token")?;
        storage::write_atomic(&self.path_for(tenant), json, TOKEN_FILE_MODE)
            .await
            .context("failed to persist token")?;
        tokens.insert(tenant.clone(), token);
        info!("token stored");
        Ok(())
    }

    /// Drop the in-memory token and delete the durable copy.  Clearing a
    /// tenant that has no token succeeds.
    #[instrument(skip(self), fields(%tenant))]
    pub async fn clear_token(&self, tenant: &Tenant) -> Result<()> {
        let mut tokens = self.tokens.write().await;
        tokens.remove(tenant);
        let removed = storage::remove_if_exists(&self.path_for(tenant))
            .await
            .context("failed to delete token file")?;
        info!(file_removed = removed, "token cleared");
        Ok(())
    }
}

async fn load_token_file(path: &Path) -> Result<Option<TokenData>> {
    let Some(bytes) = storage::read_optional(path).await? else {
        return Ok(None);
    };
    let token: TokenData = serde_json::from_slice(&bytes)
        .with_context(|| format!("token file {} is not valid JSON", path.display()))?;
    anyhow::ensure!(
        !token.access_token.is_empty(),
        "token file {} has an empty access_token",
        path.display()
    );
    Ok(Some(token))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &Path) -> CredentialStore {
        CredentialStore::new(dir.join("token.json"))
    }

    #[tokio::test]
    async fn empty_store_has_no_token() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        assert!(store.get_token(&Tenant::Global).await.is_none());
        assert!(!store.is_authorized(&Tenant::Global).await);
    }

    #[tokio::test]
    async fn token_survives_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let mut token = TokenData::bearer("gho_abc");
        token
            .extra
            .insert("refresh_token".into(), serde_json::json!("r-1"));

        store_in(tmp.path())
            .set_token(&Tenant::Global, token.clone())
            .await
            .unwrap();

        // A fresh store simulates a process restart.
        let restarted = store_in(tmp.path());
        let loaded = restarted.get_token(&Tenant::Global).await.unwrap();
        assert_eq!(loaded, token);
        assert_eq!(loaded.extra["refresh_token"], "r-1");
    }

    #[tokio::test]
    async fn set_overwrites_previous_token() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store
            .set_token(&Tenant::Global, TokenData::bearer("old"))
            .await
            .unwrap();
        store
            .set_token(&Tenant::Global, TokenData::bearer("new"))
            .await
            .unwrap();

        let restarted = store_in(tmp.path());
        assert_eq!(
            restarted.get_token(&Tenant::Global).await.unwrap().access_token,
            "new"
        );
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());

        // Never had a token.
        store.clear_token(&Tenant::Global).await.unwrap();
        assert!(store.get_token(&Tenant::Global).await.is_none());

        store
            .set_token(&Tenant::Global, TokenData::bearer("gho_abc"))
            .await
            .unwrap();
        store.clear_token(&Tenant::Global).await.unwrap();
        store.clear_token(&Tenant::Global).await.unwrap();

        assert!(store.get_token(&Tenant::Global).await.is_none());
        assert!(!tmp.path().join("token.json").exists());
    }

    #[tokio::test]
    async fn corrupt_file_reads_as_absent() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("token.json"), "not json").unwrap();
        let store = store_in(tmp.path());
        assert!(store.get_token(&Tenant::Global).await.is_none());
    }

    #[tokio::test]
    async fn org_tokens_are_separate_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let acme = Tenant::Org("acme".into());

        store
            .set_token(&acme, TokenData::bearer("org-token"))
            .await
            .unwrap();

        assert!(tmp.path().join("token_acme.json").is_file());
        assert!(store.get_token(&Tenant::Global).await.is_none());
        assert_eq!(
            store.token_for_owner("acme").await.unwrap().access_token,
            "org-token"
        );
        assert!(store.token_for_owner("other").await.is_none());
    }

    #[tokio::test]
    async fn owner_falls_back_to_global_token() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store
            .set_token(&Tenant::Global, TokenData::bearer("global"))
            .await
            .unwrap();
        assert_eq!(
            store.token_for_owner("anyone").await.unwrap().access_token,
            "global"
        );
    }

    #[test]
    fn org_path_is_sanitised() {
        let store = CredentialStore::new("/var/lib/pushdeploy/token.json");
        assert_eq!(
            store.path_for(&Tenant::Org("../evil".into())),
            PathBuf::from("/var/lib/pushdeploy/token__.-evil.json")
        );
    }

    #[test]
    fn tenant_from_blank_org_is_global() {
        assert_eq!(Tenant::from_org(None), Tenant::Global);
        assert_eq!(Tenant::from_org(Some("  ")), Tenant::Global);
        assert_eq!(Tenant::from_org(Some("acme")), Tenant::Org("acme".into()));
    }

    #[test]
    fn debug_hides_access_token() {
        let debug = format!("{:?}", TokenData::bearer("gho_secret"));
        assert!(!debug.contains("gho_secret"));
    }
}
