//! Resolution of operator-supplied working directories.

use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkDirError {
    #[error("workingDir is required")]
    Empty,
    #[error("workingDir must not contain `..` components")]
    ParentTraversal,
    #[error("workingDir {0} is outside the allowed deployment roots")]
    OutsideRoots(String),
}

/// Turn a requested working directory into an absolute path.
///
/// Relative paths are placed under `scripts_root`.  Absolute paths must fall
/// under `scripts_root` or one of `allowed_roots`.  `..` is rejected outright
/// so the check cannot be bypassed lexically.
pub fn resolve_work_dir(
    requested: &str,
    scripts_root: &Path,
    allowed_roots: &[PathBuf],
) -> Result<PathBuf, WorkDirError> {
    let requested = requested.trim();
    if requested.is_empty() {
        return Err(WorkDirError::Empty);
    }

    let path = Path::new(requested);
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(WorkDirError::ParentTraversal);
    }

    let resolved: PathBuf = if path.is_absolute() {
        path.components().collect()
    } else {
        scripts_root
            .join(path)
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect()
    };

    let allowed = std::iter::once(scripts_root)
        .chain(allowed_roots.iter().map(PathBuf::as_path))
        .any(|root| resolved.starts_with(root) && resolved != root);
    if !allowed {
        return Err(WorkDirError::OutsideRoots(resolved.display().to_string()));
    }
    Ok(resolved)
}
