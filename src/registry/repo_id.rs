use std::fmt;

use serde::{Deserialize, Serialize};

/// Upper bound on either half of a repository identity.  GitHub caps owners
/// at 39 characters and repository names at 100.
const MAX_SEGMENT_LEN: usize = 100;

/// Rejection reasons for an `(owner, name)` pair.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepoIdError {
    #[error("repository {0} must not be empty")]
    Empty(&'static str),
    #[error("repository {0} is longer than {MAX_SEGMENT_LEN} characters")]
    TooLong(&'static str),
    #[error("repository {0} contains a path separator or control character")]
    InvalidCharacter(&'static str),
    #[error("repository {0} must not be `.` or `..`")]
    DotSegment(&'static str),
}

/// Identity of a remote repository: the `(owner, name)` pair.
///
/// Construction validates both halves; [`RepoId::slug`] turns the pair into
/// a single filesystem-safe path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoId {
    owner: String,
    name: String,
}

impl RepoId {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Result<Self, RepoIdError> {
        let owner = owner.into();
        let name = name.into();
        check_segment("owner", &owner)?;
        check_segment("name", &name)?;
        Ok(Self { owner, name })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `owner/name`, as the provider spells it.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Filesystem-safe `<owner>_<name>` used for script, config and
    /// working-directory names.
    pub fn slug(&self) -> String {
        format!(
            "{}_{}",
            sanitize_segment(&self.owner),
            sanitize_segment(&self.name)
        )
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Validate a bare owner or organisation name, e.g. from a `?org=` query.
pub fn validate_owner(owner: &str) -> Result<(), RepoIdError> {
    check_segment("owner", owner)
}

fn check_segment(field: &'static str, value: &str) -> Result<(), RepoIdError> {
    if value.trim().is_empty() {
        return Err(RepoIdError::Empty(field));
    }
    if value.chars().count() > MAX_SEGMENT_LEN {
        return Err(RepoIdError::TooLong(field));
    }
    if value
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_control())
    {
        return Err(RepoIdError::InvalidCharacter(field));
    }
    if value == "." || value == ".." {
        return Err(RepoIdError::DotSegment(field));
    }
    Ok(())
}

/// Map an arbitrary string onto `[A-Za-z0-9._-]`.
///
/// Every other character becomes `-`, and a leading `.` becomes `_` so the
/// result is never hidden and never a `.`/`..` segment.
pub fn sanitize_segment(value: &str) -> String {
    let mut out: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if out.starts_with('.') {
        out.replace_range(..1, "_");
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}
