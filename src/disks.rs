use std::path::{Path, PathBuf};

use crate::config::{self, VmConfig};
use crate::error::VmError;
use crate::paths;

/// Every disk file belonging to one VM: the root overlay plus the numbered
/// storage disks. Derived purely from the config, so `start` and `destroy`
/// always agree on which files are ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSet {
    pub overlay: PathBuf,
    pub storage: Vec<PathBuf>,
}

impl DiskSet {
    pub fn for_config(dir: &Path, config: &VmConfig) -> Self {
        let storage = (1..=config.additional_disks)
            .map(|i| paths::storage_disk_path(dir, &config.name, i))
            .collect();
        Self {
            overlay: paths::overlay_path(dir, config::IMAGE_URL),
            storage,
        }
    }

    pub fn all(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.overlay.as_path()).chain(self.storage.iter().map(PathBuf::as_path))
    }

    /// Remove any files from this set already on disk. `start` runs this
    /// before provisioning so a rebuilt VM never boots from leftover state.
    pub async fn remove_existing(&self) -> Result<(), VmError> {
        for path in self.all() {
            match tokio::fs::remove_file(path).await {
                Ok(()) => tracing::info!(path = %path.display(), "removed stale disk"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(VmError::Io {
                        context: format!("removing {}", path.display()),
                        source: e,
                    });
                }
            }
        }
        Ok(())
    }

    /// Best-effort removal for teardown: failures are logged, never fatal.
    pub async fn remove_best_effort(&self) {
        for path in self.all() {
            remove_file_best_effort(path).await;
        }
    }
}

/// Delete a file if it exists, logging instead of failing when it cannot be
/// removed. Teardown keeps going no matter what it finds.
pub async fn remove_file_best_effort(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::info!(path = %path.display(), "removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not remove file"),
    }
}
