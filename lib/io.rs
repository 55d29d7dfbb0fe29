//! Local filesystem helpers.

use std::os::unix::fs::MetadataExt as _;
use std::path::Path;

/// Remove all files and directories in the given directory, but not the directory itself.
pub async fn remove_dir_contents(path: &Path) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if tokio::fs::symlink_metadata(&path).await?.is_dir() {
            tokio::fs::remove_dir_all(path).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }
    }
    Ok(())
}

/// Whether a filesystem is mounted at `path`, judged by its device differing from its parent's.
pub async fn is_mount_point(path: &Path) -> std::io::Result<bool> {
    let Some(parent) = path.parent() else {
        return Ok(true);
    };
    let own = tokio::fs::metadata(path).await?;
    let above = tokio::fs::metadata(parent).await?;
    Ok(own.dev() != above.dev())
}
