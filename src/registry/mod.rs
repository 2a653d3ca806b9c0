//! Per-repository deployment scripts and configs.
//!
//! Layout under the scripts root:
//!
//! | Path                          | Content                              |
//! |-------------------------------|--------------------------------------|
//! | `<owner>_<repo>.sh`           | deployment script, mode `0755`       |
//! | `<owner>_<repo>_config.json`  | optional [`DeploymentConfig`]        |
//! | `checkouts/<owner>_<repo>/`   | default working-directory checkout   |

pub mod repo_id;
pub mod store;

pub use repo_id::{sanitize_segment, validate_owner, RepoId, RepoIdError};
pub use store::{ConfigInput, DeploymentConfig, RegistryError, ScriptRegistry};
