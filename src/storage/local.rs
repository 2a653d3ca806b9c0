use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, instrument};

/// Read the whole file at `path`, returning `None` when it does not exist.
#[instrument(fields(path = %path.display()))]
pub async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("file not found");
            Ok(None)
        }
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

/// Replace the file at `path` with `contents`, applying the Unix permission
/// bits in `mode`.
///
/// The data is written to a temp file in the same directory and renamed into
/// place, so concurrent readers observe either the old or the new content.
/// Missing parent directories are created.
#[instrument(skip(contents), fields(path = %path.display(), len = contents.len()))]
pub async fn write_atomic(path: &Path, contents: Vec<u8>, mode: u32) -> Result<()> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic_blocking(&path, &contents, mode))
        .await
        .context("atomic write task panicked")?
}

fn write_atomic_blocking(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory {}", parent.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    tmp.write_all(contents)
        .context("failed to write temp file")?;
    tmp.as_file().sync_all().context("failed to sync temp file")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(mode))
            .context("failed to set file permissions")?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("failed to move temp file into {}", path.display()))?;
    debug!("file written");
    Ok(())
}

/// Delete the file at `path`.  Returns `false` when there was nothing to
/// delete; a missing file is not an error.
#[instrument(fields(path = %path.display()))]
pub async fn remove_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}
