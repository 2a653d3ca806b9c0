use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use super::RepoId;
use crate::storage;

const SCRIPT_MODE: u32 = 0o755;
const CONFIG_MODE: u32 = 0o644;
const CHECKOUTS_DIR: &str = "checkouts";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Structured deployment configuration stored next to the script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    pub branch: String,
    pub working_dir: String,
    pub updated_at: DateTime<Utc>,
}

/// Request body for a config save.  Every field is optional at the type
/// level so that a missing field is reported as a validation error rather
/// than a deserialisation failure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInput {
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// File-backed map from [`RepoId`] to deployment script and config.
#[derive(Debug, Clone)]
pub struct ScriptRegistry {
    root: PathBuf,
}

impl ScriptRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn script_path(&self, repo: &RepoId) -> PathBuf {
        self.root.join(format!("{}.sh", repo.slug()))
    }

    pub fn config_path(&self, repo: &RepoId) -> PathBuf {
        self.root.join(format!("{}_config.json", repo.slug()))
    }

    /// Working directory used when nothing more specific is configured.
    ///
    /// Checkouts live in their own subdirectory so that no repository name
    /// can land on another repository's script or config file.
    pub fn default_work_dir(&self, repo: &RepoId) -> PathBuf {
        self.root.join(CHECKOUTS_DIR).join(repo.slug())
    }

    /// Stored script text, or an empty string when none was ever saved.
    pub async fn get_script(&self, repo: &RepoId) -> anyhow::Result<String> {
        Ok(self.lookup_script(repo).await?.unwrap_or_default())
    }

    /// Stored script text, distinguishing "never saved" (`None`) from an
    /// empty script (`Some("")`).
    pub async fn lookup_script(&self, repo: &RepoId) -> anyhow::Result<Option<String>> {
        let bytes = storage::read_optional(&self.script_path(repo)).await?;
        bytes
            .map(|b| String::from_utf8(b).context("stored script is not valid UTF-8"))
            .transpose()
    }

    /// Overwrite the script for `repo`.  The file is always executable.
    #[instrument(skip(self, text), fields(%repo, len = text.len()))]
    pub async fn save_script(&self, repo: &RepoId, text: &str) -> anyhow::Result<()> {
        storage::write_atomic(&self.script_path(repo), text.as_bytes().to_vec(), SCRIPT_MODE)
            .await
            .with_context(|| format!("failed to save script for {repo}"))?;
        info!("deployment script saved");
        Ok(())
    }

    pub async fn get_config(&self, repo: &RepoId) -> anyhow::Result<Option<DeploymentConfig>> {
        let Some(bytes) = storage::read_optional(&self.config_path(repo)).await? else {
            return Ok(None);
        };
        let config = serde_json::from_slice(&bytes)
            .with_context(|| format!("stored config for {repo} is not valid JSON"))?;
        Ok(Some(config))
    }

    /// Validate and persist a deployment config.
    ///
    /// `branch` and `workingDir` must be present and non-blank.  When the
    /// input carries a script it is also written as the repository's script
    /// file, since that file is what runs execute.
    #[instrument(skip(self, input), fields(%repo))]
    pub async fn save_config(
        &self,
        repo: &RepoId,
        input: ConfigInput,
    ) -> Result<DeploymentConfig, RegistryError> {
        let branch = required(input.branch, "branch")?;
        let working_dir = required(input.working_dir, "workingDir")?;

        let config = DeploymentConfig {
            script: input.script,
            branch,
            working_dir,
            updated_at: Utc::now(),
        };

        let json = serde_json::to_vec_pretty(&config).context("failed to encode config")?;
        storage::write_atomic(&self.config_path(repo), json, CONFIG_MODE)
            .await
            .with_context(|| format!("failed to save config for {repo}"))?;

        if let Some(script) = &config.script {
            self.save_script(repo, script).await?;
        }

        info!(branch = %config.branch, working_dir = %config.working_dir, "deployment config saved");
        Ok(config)
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, RegistryError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(RegistryError::Validation(format!("{field} is required"))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
