use std::io;
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

use super::runtime::ContainerRuntime;
use crate::error::{OrchestratorError, Result};
use crate::models::WorkspaceId;

pub const PROJECT_DIR: &str = "/home/coder/project";

/// Copies a workspace's template tree into its running container.
pub struct FileInjector {
    target: String,
}

impl FileInjector {
    pub fn new() -> Self {
        Self {
            target: PROJECT_DIR.to_string(),
        }
    }

    /// Returns the number of archived entries.
    pub async fn inject(
        &self,
        runtime: &dyn ContainerRuntime,
        workspace_id: WorkspaceId,
        container_id: &str,
        source: &Path,
    ) -> Result<usize> {
        let failed = |reason: String| OrchestratorError::ProvisionFailed {
            workspace_id,
            reason,
        };

        if !source.is_dir() {
            return Err(failed(format!(
                "template path {} is not a directory",
                source.display()
            )));
        }

        let root = source.to_path_buf();
        let (archive, entries) = tokio::task::spawn_blocking(move || package_directory(&root))
            .await
            .map_err(|e| failed(format!("archive task failed: {}", e)))?
            .map_err(|e| failed(format!("failed to archive {}: {}", source.display(), e)))?;

        info!(
            "Uploading {} entries ({} bytes) from {} into container {}",
            entries,
            archive.len(),
            source.display(),
            container_id
        );

        runtime
            .upload_archive(container_id, &self.target, archive)
            .await
            .map_err(|e| failed(format!("failed to copy files into container: {}", e)))?;

        Ok(entries)
    }
}

impl Default for FileInjector {
    fn default() -> Self {
        Self::new()
    }
}

/// Tars everything under `root` with paths relative to it.
pub fn package_directory(root: &Path) -> io::Result<(Vec<u8>, usize)> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    let mut entries = 0;

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        let relative: PathBuf = entry
            .path()
            .strip_prefix(root)
            .map_err(io::Error::other)?
            .to_path_buf();

        if entry.file_type().is_dir() {
            builder.append_dir(&relative, entry.path())?;
        } else {
            builder.append_path_with_name(entry.path(), &relative)?;
        }
        entries += 1;
    }

    Ok((builder.into_inner()?, entries))
}
