//! Private scratch directories that hold downloaded installers

use crate::error::{Result, UpdateError};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const WORKSPACE_PREFIX: &str = "updraft-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    path: PathBuf,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn artifact_path(&self, file_name: &str) -> PathBuf {
        self.path.join(file_name)
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create a fresh, uniquely named directory under the root. The directory
    /// outlives this call; it is removed only by [`WorkspaceManager::destroy`].
    pub fn create(&self) -> Result<Workspace> {
        fs::create_dir_all(&self.root).map_err(|source| UpdateError::Workspace {
            path: self.root.clone(),
            source,
        })?;

        let prefix = format!("{}{}-", WORKSPACE_PREFIX, Utc::now().format("%Y%m%dT%H%M%S"));
        let dir = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(&self.root)
            .map_err(|source| UpdateError::Workspace {
                path: self.root.clone(),
                source,
            })?;

        let path = dir.keep();
        tracing::debug!("Created workspace {}", path.display());
        Ok(Workspace { path })
    }

    /// Remove a workspace and everything in it. Missing directories are fine.
    pub fn destroy(&self, path: &Path) {
        match fs::remove_dir_all(path) {
            Ok(()) => tracing::debug!("Removed workspace {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove workspace {}: {}", path.display(), e),
        }
    }

    /// Delete leftover workspaces older than `max_age`, returning how many went.
    pub fn sweep_stale(&self, max_age: Duration) -> usize {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("Skipping workspace sweep of {}: {}", self.root.display(), e);
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(WORKSPACE_PREFIX) {
                continue;
            }
            let Ok(metadata) = entry.metadata() else { continue };
            if !metadata.is_dir() {
                continue;
            }
            let stale = metadata
                .modified()
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age >= max_age);
            if stale {
                let path = entry.path();
                tracing::info!("Removing stale workspace {}", path.display());
                self.destroy(&path);
                if !path.exists() {
                    removed += 1;
                }
            }
        }
        removed
    }
}
