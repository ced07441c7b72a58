pub mod virsh;

use std::path::{Path, PathBuf};

use crate::error::VmError;

/// One disk handed to domain creation, in attach order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskAttachment {
    pub path: PathBuf,
    pub format: DiskFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    Qcow2,
    Raw,
}

impl DiskFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
        }
    }
}

/// Everything domain creation needs, resolved ahead of time. The backend
/// turns this into whatever its control plane wants and never consults the
/// config again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSpec {
    pub name: String,
    pub memory_mb: u64,
    pub cpus: u32,
    /// Boot disk first, storage disks after, in index order.
    pub disks: Vec<DiskAttachment>,
    pub os_variant: String,
    pub network: String,
    /// Host path to passthrough-mount into the guest, if enabled.
    pub workspace: Option<PathBuf>,
    /// Rendered `#cloud-config` document for first boot.
    pub user_data: String,
}

/// One guest network interface as reported by the guest agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestInterface {
    pub name: String,
    pub ipv4: Vec<String>,
}

/// The virtualization control plane, reduced to the operations the commands
/// actually issue. Commands stay pure orchestration over this seam, so tests
/// can substitute a recording implementation.
#[allow(async_fn_in_trait)] // trait is internal-only
pub trait Backend {
    async fn domain_exists(&self, name: &str) -> Result<bool, VmError>;
    /// Define and boot a new domain in one step.
    async fn define_domain(&self, spec: &DomainSpec) -> Result<(), VmError>;
    async fn start_domain(&self, name: &str) -> Result<(), VmError>;
    async fn shutdown_domain(&self, name: &str) -> Result<(), VmError>;
    async fn force_stop_domain(&self, name: &str) -> Result<(), VmError>;
    async fn undefine_domain(&self, name: &str) -> Result<(), VmError>;
    async fn dump_domain_xml(&self, name: &str) -> Result<String, VmError>;
    async fn list_domains(&self) -> Result<String, VmError>;
    async fn domain_info(&self, name: &str) -> Result<String, VmError>;
    async fn guest_interfaces(&self, name: &str) -> Result<Vec<GuestInterface>, VmError>;
    async fn save_domain(&self, name: &str, file: &Path) -> Result<(), VmError>;
    async fn restore_domain(&self, file: &Path) -> Result<(), VmError>;
    async fn create_overlay_disk(
        &self,
        base: &Path,
        overlay: &Path,
        size: &str,
    ) -> Result<(), VmError>;
    async fn create_blank_disk(&self, path: &Path, size: &str) -> Result<(), VmError>;
    /// Attach the interactive serial console; returns the session's exit code.
    async fn attach_console(&self, name: &str) -> Result<i32, VmError>;
    /// Open an interactive shell to the guest; returns the session's exit code.
    async fn open_shell(&self, user: &str, ip: &str, key: &Path) -> Result<i32, VmError>;
}

pub fn create_backend() -> virsh::VirshBackend {
    virsh::VirshBackend
}
