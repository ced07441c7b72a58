use std::path::Path;

use crate::backend::{Backend, DiskAttachment, DiskFormat, DomainSpec, GuestInterface, virsh};
use crate::config::{self, VmConfig};
use crate::disks::{self, DiskSet};
use crate::error::VmError;
use crate::{cloudinit, image, paths, ssh_keys};

/// Boot the VM. An existing domain is simply powered on; an absent one gets
/// the full provisioning pass: base image, fresh disks, keypair, cloud-init,
/// domain creation.
pub async fn start<B: Backend>(backend: &B, config: &VmConfig, dir: &Path) -> Result<(), VmError> {
    let name = &config.name;

    if backend.domain_exists(name).await? {
        println!("VM '{name}' already exists, starting it.");
        return backend.start_domain(name).await;
    }

    println!("Ensuring base image...");
    let base = image::ensure_base_image(dir, config::IMAGE_URL).await?;

    println!("Creating disks...");
    let set = DiskSet::for_config(dir, config);
    // A rebuilt VM never boots from a previous run's disks
    set.remove_existing().await?;
    backend
        .create_overlay_disk(&base, &set.overlay, &config.disk_size)
        .await?;
    for path in &set.storage {
        backend
            .create_blank_disk(path, &config.additional_disk_size)
            .await?;
    }

    let pubkey = ssh_keys::ensure_keypair(dir, name).await?;
    let user_data = cloudinit::build_user_data(config, &pubkey);

    println!("Creating VM...");
    let spec = DomainSpec {
        name: name.clone(),
        memory_mb: config.memory_mb,
        cpus: config.cpus,
        disks: attachments(&set),
        os_variant: config::OS_VARIANT.to_string(),
        network: config.network.clone(),
        workspace: config.workspace_mount.then(|| config.workspace_path.clone()),
        user_data,
    };
    backend.define_domain(&spec).await?;

    println!("VM '{name}' is up.");
    Ok(())
}

/// Request a graceful shutdown. Does not wait for the guest to power off.
pub async fn stop<B: Backend>(backend: &B, config: &VmConfig) -> Result<(), VmError> {
    backend.shutdown_domain(&config.name).await?;
    println!("Shutdown requested for VM '{}'.", config.name);
    Ok(())
}

/// Tear down the VM and every file it owns. Every sub-step tolerates "not
/// found", so a partially created or already-absent VM cleans up the same
/// way a healthy one does.
pub async fn destroy<B: Backend>(backend: &B, config: &VmConfig, dir: &Path) -> Result<(), VmError> {
    let name = config.name.as_str();
    let mut had_domain = false;

    if backend.domain_exists(name).await.unwrap_or(false) {
        had_domain = true;
        let _ = backend.force_stop_domain(name).await;

        // The domain definition is the only record of which overlay it
        // boots from; read it before undefine discards it.
        let defined_overlay = match backend.dump_domain_xml(name).await {
            Ok(xml) => virsh::primary_disk_source(&xml),
            Err(e) => {
                tracing::warn!(name, error = %e, "could not read domain definition");
                None
            }
        };

        if let Err(e) = backend.undefine_domain(name).await {
            tracing::warn!(name, error = %e, "undefine failed");
        }
        if let Some(path) = defined_overlay {
            disks::remove_file_best_effort(&path).await;
        }
    }

    let set = DiskSet::for_config(dir, config);
    set.remove_best_effort().await;
    disks::remove_file_best_effort(&paths::snapshot_path(dir, name)).await;
    let key = paths::ssh_key_path(dir, name);
    disks::remove_file_best_effort(&key.with_extension("pub")).await;
    disks::remove_file_best_effort(&key).await;

    if had_domain {
        println!("VM '{name}' destroyed.");
    } else {
        println!("VM '{name}' not found, removed any leftover files.");
    }
    Ok(())
}

/// Read-only view of the domain. Every query runs even when an earlier one
/// fails; the first failure's exit code becomes the command's.
pub async fn status<B: Backend>(backend: &B, config: &VmConfig) -> Result<(), VmError> {
    let name = &config.name;
    let mut first_err: Option<VmError> = None;

    match backend.list_domains().await {
        Ok(listing) => print!("{listing}"),
        Err(e) => {
            eprintln!("warning: could not list domains: {e}");
            first_err.get_or_insert(e);
        }
    }

    match backend.domain_info(name).await {
        Ok(info) => print!("{info}"),
        Err(e) => {
            eprintln!("warning: could not query VM '{name}': {e}");
            first_err.get_or_insert(e);
        }
    }

    match backend.guest_interfaces(name).await {
        Ok(interfaces) => {
            let mut any = false;
            for iface in &interfaces {
                for ip in &iface.ipv4 {
                    println!("  IP: {ip} ({})", iface.name);
                    any = true;
                }
            }
            if !any {
                println!("  IP: none reported yet");
            }
        }
        Err(e) => {
            println!("  No network info available.");
            first_err.get_or_insert(e);
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Open an interactive shell to the VM's first private-network address.
/// Returns the shell session's exit code.
pub async fn ssh<B: Backend>(backend: &B, config: &VmConfig, dir: &Path) -> Result<i32, VmError> {
    let name = &config.name;
    let interfaces = backend
        .guest_interfaces(name)
        .await
        .map_err(|_| VmError::GuestUnreachable { name: name.clone() })?;

    let Some(ip) = first_private_ipv4(&interfaces) else {
        return Err(VmError::GuestUnreachable { name: name.clone() });
    };

    let key = paths::ssh_key_path(dir, name);
    backend.open_shell(config::SSH_USER, &ip, &key).await
}

/// Attach the interactive serial console. Pure pass-through.
pub async fn console<B: Backend>(backend: &B, config: &VmConfig) -> Result<i32, VmError> {
    backend.attach_console(&config.name).await
}

/// Save full memory and device state to the per-VM snapshot file. A new
/// snapshot overwrites the previous one.
pub async fn snapshot<B: Backend>(
    backend: &B,
    config: &VmConfig,
    dir: &Path,
) -> Result<(), VmError> {
    let file = paths::snapshot_path(dir, &config.name);
    backend.save_domain(&config.name, &file).await?;
    println!("Saved VM state to {}.", file.display());
    Ok(())
}

/// Bring the VM back from its snapshot file, consuming the file on success.
pub async fn restore<B: Backend>(
    backend: &B,
    config: &VmConfig,
    dir: &Path,
) -> Result<(), VmError> {
    let file = paths::snapshot_path(dir, &config.name);
    backend.restore_domain(&file).await?;
    disks::remove_file_best_effort(&file).await;
    println!("Restored VM state from {}.", file.display());
    Ok(())
}

/// Boot disk first, then storage disks in index order.
fn attachments(set: &DiskSet) -> Vec<DiskAttachment> {
    std::iter::once(DiskAttachment {
        path: set.overlay.clone(),
        format: DiskFormat::Qcow2,
    })
    .chain(set.storage.iter().map(|p| DiskAttachment {
        path: p.clone(),
        format: DiskFormat::Raw,
    }))
    .collect()
}

/// First IPv4 on an interface that looks like the private network: `eth*`
/// or the predictable `en*` names, never loopback.
fn first_private_ipv4(interfaces: &[GuestInterface]) -> Option<String> {
    interfaces
        .iter()
        .filter(|i| i.name.starts_with("eth") || i.name.starts_with("en"))
        .flat_map(|i| i.ipv4.iter())
        .next()
        .cloned()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::config::tests::test_config;

    /// Backend double that records every call and mimics the collaborator's
    /// observable behavior: created disks appear on disk, a defined domain
    /// exists afterwards, and its XML names the boot disk.
    #[derive(Default)]
    struct RecordingBackend {
        exists: Mutex<bool>,
        calls: Mutex<Vec<String>>,
        last_spec: Mutex<Option<DomainSpec>>,
        interfaces: Vec<GuestInterface>,
        fail_guest_query: bool,
        fail_blank_disks: bool,
    }

    impl RecordingBackend {
        fn new() -> Self {
            Self::default()
        }

        fn with_interfaces(interfaces: Vec<GuestInterface>) -> Self {
            Self {
                interfaces,
                ..Self::default()
            }
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn count(&self, name: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.as_str() == name || c.starts_with(&format!("{name} ")))
                .count()
        }

        fn position(&self, name: &str) -> Option<usize> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .position(|c| c.as_str() == name)
        }

        fn query_failure(&self) -> VmError {
            VmError::CommandFailed {
                command: "virsh domifaddr".into(),
                code: Some(1),
                stderr: "error: Guest agent is not responding".into(),
            }
        }
    }

    impl Backend for RecordingBackend {
        async fn domain_exists(&self, _name: &str) -> Result<bool, VmError> {
            self.record("domain_exists");
            Ok(*self.exists.lock().unwrap())
        }

        async fn define_domain(&self, spec: &DomainSpec) -> Result<(), VmError> {
            self.record("define_domain");
            *self.exists.lock().unwrap() = true;
            *self.last_spec.lock().unwrap() = Some(spec.clone());
            Ok(())
        }

        async fn start_domain(&self, _name: &str) -> Result<(), VmError> {
            self.record("start_domain");
            Ok(())
        }

        async fn shutdown_domain(&self, _name: &str) -> Result<(), VmError> {
            self.record("shutdown_domain");
            Ok(())
        }

        async fn force_stop_domain(&self, _name: &str) -> Result<(), VmError> {
            self.record("force_stop_domain");
            Ok(())
        }

        async fn undefine_domain(&self, _name: &str) -> Result<(), VmError> {
            self.record("undefine_domain");
            *self.exists.lock().unwrap() = false;
            Ok(())
        }

        async fn dump_domain_xml(&self, _name: &str) -> Result<String, VmError> {
            self.record("dump_domain_xml");
            let spec = self.last_spec.lock().unwrap();
            let overlay = spec
                .as_ref()
                .and_then(|s| s.disks.first())
                .map(|d| d.path.display().to_string())
                .unwrap_or_default();
            Ok(format!(
                "<domain><devices><disk type='file' device='disk'>\
                 <source file='{overlay}'/></disk></devices></domain>"
            ))
        }

        async fn list_domains(&self) -> Result<String, VmError> {
            self.record("list_domains");
            Ok(" Id   Name        State\n---------------------------\n".into())
        }

        async fn domain_info(&self, _name: &str) -> Result<String, VmError> {
            self.record("domain_info");
            Ok("Name:           labvm-dev\nState:          running\n".into())
        }

        async fn guest_interfaces(&self, _name: &str) -> Result<Vec<GuestInterface>, VmError> {
            self.record("guest_interfaces");
            if self.fail_guest_query {
                return Err(self.query_failure());
            }
            Ok(self.interfaces.clone())
        }

        async fn save_domain(&self, _name: &str, file: &Path) -> Result<(), VmError> {
            self.record("save_domain");
            std::fs::write(file, b"state").unwrap();
            Ok(())
        }

        async fn restore_domain(&self, _file: &Path) -> Result<(), VmError> {
            self.record("restore_domain");
            Ok(())
        }

        async fn create_overlay_disk(
            &self,
            _base: &Path,
            overlay: &Path,
            _size: &str,
        ) -> Result<(), VmError> {
            self.record("create_overlay_disk");
            std::fs::write(overlay, b"").unwrap();
            Ok(())
        }

        async fn create_blank_disk(&self, path: &Path, _size: &str) -> Result<(), VmError> {
            self.record("create_blank_disk");
            if self.fail_blank_disks {
                return Err(VmError::CommandFailed {
                    command: "qemu-img create".into(),
                    code: Some(1),
                    stderr: "qemu-img: disk full".into(),
                });
            }
            std::fs::write(path, b"").unwrap();
            Ok(())
        }

        async fn attach_console(&self, _name: &str) -> Result<i32, VmError> {
            self.record("attach_console");
            Ok(0)
        }

        async fn open_shell(&self, user: &str, ip: &str, _key: &Path) -> Result<i32, VmError> {
            self.record(format!("open_shell {user}@{ip}"));
            Ok(0)
        }
    }

    fn seed_cached_image(dir: &Path) {
        std::fs::write(paths::cached_image_path(dir, config::IMAGE_URL), b"img").unwrap();
    }

    #[tokio::test]
    async fn first_start_provisions_everything() {
        let tmp = tempfile::tempdir().unwrap();
        seed_cached_image(tmp.path());
        let backend = RecordingBackend::new();
        let config = test_config();

        start(&backend, &config, tmp.path()).await.unwrap();

        assert_eq!(backend.count("create_overlay_disk"), 1);
        assert_eq!(backend.count("create_blank_disk"), 3);
        assert_eq!(backend.count("define_domain"), 1);
        assert_eq!(backend.count("start_domain"), 0);

        let spec = backend.last_spec.lock().unwrap().clone().unwrap();
        assert_eq!(spec.disks.len(), 4);
        assert_eq!(spec.disks[0].format, DiskFormat::Qcow2);
        assert!(spec.disks[1..].iter().all(|d| d.format == DiskFormat::Raw));
        assert!(spec.user_data.starts_with("#cloud-config"));
    }

    #[tokio::test]
    async fn second_start_resumes_without_reprovisioning() {
        let tmp = tempfile::tempdir().unwrap();
        seed_cached_image(tmp.path());
        let backend = RecordingBackend::new();
        let config = test_config();

        start(&backend, &config, tmp.path()).await.unwrap();
        start(&backend, &config, tmp.path()).await.unwrap();

        assert_eq!(backend.count("define_domain"), 1);
        assert_eq!(backend.count("create_overlay_disk"), 1);
        assert_eq!(backend.count("create_blank_disk"), 3);
        assert_eq!(backend.count("start_domain"), 1);
    }

    #[tokio::test]
    async fn start_creates_exactly_the_configured_disk_set() {
        let tmp = tempfile::tempdir().unwrap();
        seed_cached_image(tmp.path());
        let backend = RecordingBackend::new();
        let config = VmConfig {
            additional_disks: 2,
            ..test_config()
        };

        start(&backend, &config, tmp.path()).await.unwrap();

        assert!(tmp.path().join("labvm-dev-storage1.qcow2").exists());
        assert!(tmp.path().join("labvm-dev-storage2.qcow2").exists());
        assert!(!tmp.path().join("labvm-dev-storage3.qcow2").exists());
    }

    /// A mid-provisioning failure aborts without rollback: the overlay
    /// created before the failing step stays behind and no domain is made.
    #[tokio::test]
    async fn start_failure_leaves_partial_disks_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        seed_cached_image(tmp.path());
        let backend = RecordingBackend {
            fail_blank_disks: true,
            ..RecordingBackend::default()
        };
        let config = test_config();

        let err = start(&backend, &config, tmp.path()).await.unwrap_err();

        assert_eq!(err.exit_code(), 1);
        assert_eq!(backend.count("define_domain"), 0);
        let set = DiskSet::for_config(tmp.path(), &config);
        assert!(set.overlay.exists());
    }

    #[tokio::test]
    async fn destroy_on_absent_vm_succeeds_and_spares_the_filesystem() {
        let tmp = tempfile::tempdir().unwrap();
        let unrelated = tmp.path().join("notes.txt");
        std::fs::write(&unrelated, b"keep me").unwrap();
        let backend = RecordingBackend::new();

        destroy(&backend, &test_config(), tmp.path()).await.unwrap();

        assert!(unrelated.exists());
        assert_eq!(backend.count("force_stop_domain"), 0);
        assert_eq!(backend.count("undefine_domain"), 0);
    }

    #[tokio::test]
    async fn destroy_removes_the_disk_set_and_spares_neighbors() {
        let tmp = tempfile::tempdir().unwrap();
        seed_cached_image(tmp.path());
        let backend = RecordingBackend::new();
        let config = VmConfig {
            additional_disks: 2,
            ..test_config()
        };

        start(&backend, &config, tmp.path()).await.unwrap();
        // Leftover from an earlier run with a higher disk count
        let neighbor = tmp.path().join("labvm-dev-storage3.qcow2");
        std::fs::write(&neighbor, b"").unwrap();

        destroy(&backend, &config, tmp.path()).await.unwrap();

        let set = DiskSet::for_config(tmp.path(), &config);
        assert!(set.all().all(|p| !p.exists()));
        assert!(neighbor.exists());
        // The cached base image is shared across rebuilds
        assert!(paths::cached_image_path(tmp.path(), config::IMAGE_URL).exists());
    }

    #[tokio::test]
    async fn destroy_reads_the_definition_before_undefining() {
        let tmp = tempfile::tempdir().unwrap();
        seed_cached_image(tmp.path());
        let backend = RecordingBackend::new();
        let config = test_config();

        start(&backend, &config, tmp.path()).await.unwrap();
        destroy(&backend, &config, tmp.path()).await.unwrap();

        let dump = backend.position("dump_domain_xml").unwrap();
        let undefine = backend.position("undefine_domain").unwrap();
        assert!(dump < undefine);
    }

    #[tokio::test]
    async fn destroy_removes_the_overlay_named_by_the_domain() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = RecordingBackend::new();
        let config = test_config();

        // Domain defined against an overlay the current config would not
        // compute, as after an image URL change.
        let old_overlay = tmp.path().join("old-base.qcow2");
        std::fs::write(&old_overlay, b"").unwrap();
        *backend.exists.lock().unwrap() = true;
        *backend.last_spec.lock().unwrap() = Some(DomainSpec {
            name: config.name.clone(),
            memory_mb: config.memory_mb,
            cpus: config.cpus,
            disks: vec![DiskAttachment {
                path: old_overlay.clone(),
                format: DiskFormat::Qcow2,
            }],
            os_variant: config::OS_VARIANT.into(),
            network: config.network.clone(),
            workspace: None,
            user_data: String::new(),
        });

        destroy(&backend, &config, tmp.path()).await.unwrap();

        assert!(!old_overlay.exists());
    }

    #[tokio::test]
    async fn destroy_removes_snapshot_and_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = RecordingBackend::new();
        let config = test_config();

        let snapshot_file = paths::snapshot_path(tmp.path(), &config.name);
        std::fs::write(&snapshot_file, b"state").unwrap();
        ssh_keys::ensure_keypair(tmp.path(), &config.name).await.unwrap();

        destroy(&backend, &config, tmp.path()).await.unwrap();

        assert!(!snapshot_file.exists());
        let key = paths::ssh_key_path(tmp.path(), &config.name);
        assert!(!key.exists());
        assert!(!key.with_extension("pub").exists());
    }

    #[tokio::test]
    async fn status_runs_every_query() {
        let backend = RecordingBackend::with_interfaces(vec![GuestInterface {
            name: "enp1s0".into(),
            ipv4: vec!["192.168.122.50".into()],
        }]);

        status(&backend, &test_config()).await.unwrap();

        assert_eq!(backend.count("list_domains"), 1);
        assert_eq!(backend.count("domain_info"), 1);
        assert_eq!(backend.count("guest_interfaces"), 1);
    }

    #[tokio::test]
    async fn status_degrades_but_reports_the_failure() {
        let backend = RecordingBackend {
            fail_guest_query: true,
            ..RecordingBackend::default()
        };

        let err = status(&backend, &test_config()).await.unwrap_err();

        assert_eq!(err.exit_code(), 1);
        assert_eq!(backend.count("list_domains"), 1);
        assert_eq!(backend.count("domain_info"), 1);
    }

    #[tokio::test]
    async fn ssh_connects_to_the_private_interface() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = RecordingBackend::with_interfaces(vec![
            GuestInterface {
                name: "lo".into(),
                ipv4: vec!["127.0.0.1".into()],
            },
            GuestInterface {
                name: "enp1s0".into(),
                ipv4: vec!["192.168.122.50".into()],
            },
        ]);

        let code = ssh(&backend, &test_config(), tmp.path()).await.unwrap();

        assert_eq!(code, 0);
        assert_eq!(backend.count("open_shell"), 1);
        let calls = backend.calls.lock().unwrap();
        assert!(calls.iter().any(|c| c == "open_shell ubuntu@192.168.122.50"));
    }

    #[tokio::test]
    async fn ssh_without_address_fails_and_opens_no_shell() {
        use miette::Diagnostic;

        let tmp = tempfile::tempdir().unwrap();
        let backend = RecordingBackend::with_interfaces(vec![GuestInterface {
            name: "lo".into(),
            ipv4: vec!["127.0.0.1".into()],
        }]);

        let err = ssh(&backend, &test_config(), tmp.path()).await.unwrap_err();

        assert!(matches!(err, VmError::GuestUnreachable { .. }));
        let help = err.help().unwrap().to_string();
        assert!(help.contains("guest agent"));
        assert_eq!(backend.count("open_shell"), 0);
    }

    #[tokio::test]
    async fn ssh_query_failure_becomes_a_clear_error() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = RecordingBackend {
            fail_guest_query: true,
            ..RecordingBackend::default()
        };

        let err = ssh(&backend, &test_config(), tmp.path()).await.unwrap_err();

        assert!(matches!(err, VmError::GuestUnreachable { .. }));
        assert!(err.to_string().contains("labvm-dev"));
        assert_eq!(backend.count("open_shell"), 0);
    }

    #[tokio::test]
    async fn console_passes_through() {
        let backend = RecordingBackend::new();
        let code = console(&backend, &test_config()).await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(backend.count("attach_console"), 1);
    }

    #[tokio::test]
    async fn snapshot_saves_to_the_per_vm_file() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = RecordingBackend::new();
        let config = test_config();

        snapshot(&backend, &config, tmp.path()).await.unwrap();

        assert_eq!(backend.count("save_domain"), 1);
        assert!(paths::snapshot_path(tmp.path(), &config.name).exists());
    }

    #[tokio::test]
    async fn restore_consumes_the_snapshot_file() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = RecordingBackend::new();
        let config = test_config();
        let file = paths::snapshot_path(tmp.path(), &config.name);
        std::fs::write(&file, b"state").unwrap();

        restore(&backend, &config, tmp.path()).await.unwrap();

        assert_eq!(backend.count("restore_domain"), 1);
        assert!(!file.exists());
    }

    #[test]
    fn private_ipv4_skips_loopback() {
        let interfaces = vec![
            GuestInterface {
                name: "lo".into(),
                ipv4: vec!["127.0.0.1".into()],
            },
            GuestInterface {
                name: "eth0".into(),
                ipv4: vec!["10.0.0.7".into()],
            },
        ];
        assert_eq!(first_private_ipv4(&interfaces), Some("10.0.0.7".into()));
        assert_eq!(first_private_ipv4(&interfaces[..1]), None);
    }
}
