use std::path::{Path, PathBuf};

/// Filename portion of an image URL (or local path).
pub fn image_basename(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or("image.img")
}

/// Path to the cached base image: the URL basename in the working directory.
pub fn cached_image_path(dir: &Path, url: &str) -> PathBuf {
    dir.join(image_basename(url))
}

/// Path to the primary overlay disk: `<image stem>.qcow2`.
///
/// Named after the image rather than the VM, which is why `destroy` resolves
/// the primary disk from the domain definition instead of recomputing it
/// here: the configured image may have changed since the domain was created.
pub fn overlay_path(dir: &Path, url: &str) -> PathBuf {
    let basename = image_basename(url);
    let stem = basename.rsplit_once('.').map(|(s, _)| s).unwrap_or(basename);
    dir.join(format!("{stem}.qcow2"))
}

/// Path to an additional storage disk: `<vmname>-storage<i>.qcow2` (1-based).
pub fn storage_disk_path(dir: &Path, vm_name: &str, index: usize) -> PathBuf {
    dir.join(format!("{vm_name}-storage{index}.qcow2"))
}

/// Path to the saved-state snapshot file for a VM.
pub fn snapshot_path(dir: &Path, vm_name: &str) -> PathBuf {
    dir.join(format!("{vm_name}.snapshot"))
}

/// Path to the per-VM ssh private key (public key is `<this>.pub`).
pub fn ssh_key_path(dir: &Path, vm_name: &str) -> PathBuf {
    dir.join(format!("{vm_name}-ssh-key"))
}
