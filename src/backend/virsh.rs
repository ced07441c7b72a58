use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use super::{Backend, DomainSpec, GuestInterface};
use crate::cloudinit;
use crate::error::VmError;

/// Drives `virsh`, `virt-install`, and `qemu-img` as subprocesses. Only exit
/// codes are interpreted, plus the two textual reads the commands need: the
/// domain XML's disk source and the guest address table.
pub struct VirshBackend;

fn virsh(args: &[&str]) -> Command {
    let mut cmd = Command::new("virsh");
    cmd.args(args);
    cmd
}

/// Run a command to completion, mapping a non-zero exit to [`VmError::CommandFailed`].
/// `context` is the short label used in diagnostics, e.g. "virsh start".
async fn run_checked(context: &str, mut cmd: Command) -> Result<String, VmError> {
    let output = cmd.output().await.map_err(|e| VmError::Io {
        context: format!("running {context}"),
        source: e,
    })?;

    if !output.status.success() {
        return Err(VmError::CommandFailed {
            command: context.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run an interactive command with the terminal passed through, returning the
/// session's exit code.
async fn run_interactive(context: &str, mut cmd: Command) -> Result<i32, VmError> {
    let status = cmd
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|e| VmError::Io {
            context: format!("running {context}"),
            source: e,
        })?;
    Ok(status.code().unwrap_or(1))
}

async fn write_user_data(user_data: &str) -> Result<tempfile::NamedTempFile, VmError> {
    let file = tempfile::NamedTempFile::new().map_err(|e| VmError::Io {
        context: "creating user-data temp file".into(),
        source: e,
    })?;
    tokio::fs::write(file.path(), user_data)
        .await
        .map_err(|e| VmError::Io {
            context: format!("writing user-data to {}", file.path().display()),
            source: e,
        })?;
    Ok(file)
}

impl Backend for VirshBackend {
    async fn domain_exists(&self, name: &str) -> Result<bool, VmError> {
        // dominfo's exit code is the existence check
        let output = virsh(&["dominfo", name])
            .output()
            .await
            .map_err(|e| VmError::Io {
                context: "running virsh dominfo".into(),
                source: e,
            })?;
        Ok(output.status.success())
    }

    async fn define_domain(&self, spec: &DomainSpec) -> Result<(), VmError> {
        // Keep the temp file alive until virt-install has read it
        let user_data = write_user_data(&spec.user_data).await?;
        let args = virt_install_args(spec, user_data.path());

        let mut cmd = Command::new("virt-install");
        cmd.args(&args);
        run_checked("virt-install", cmd).await?;

        tracing::info!(name = %spec.name, "domain defined and started");
        Ok(())
    }

    async fn start_domain(&self, name: &str) -> Result<(), VmError> {
        run_checked("virsh start", virsh(&["start", name])).await?;
        tracing::info!(name, "domain started");
        Ok(())
    }

    async fn shutdown_domain(&self, name: &str) -> Result<(), VmError> {
        run_checked("virsh shutdown", virsh(&["shutdown", name])).await?;
        Ok(())
    }

    async fn force_stop_domain(&self, name: &str) -> Result<(), VmError> {
        run_checked("virsh destroy", virsh(&["destroy", name])).await?;
        Ok(())
    }

    async fn undefine_domain(&self, name: &str) -> Result<(), VmError> {
        run_checked("virsh undefine", virsh(&["undefine", name])).await?;
        Ok(())
    }

    async fn dump_domain_xml(&self, name: &str) -> Result<String, VmError> {
        run_checked("virsh dumpxml", virsh(&["dumpxml", name])).await
    }

    async fn list_domains(&self) -> Result<String, VmError> {
        run_checked("virsh list", virsh(&["list", "--all"])).await
    }

    async fn domain_info(&self, name: &str) -> Result<String, VmError> {
        run_checked("virsh dominfo", virsh(&["dominfo", name])).await
    }

    async fn guest_interfaces(&self, name: &str) -> Result<Vec<GuestInterface>, VmError> {
        let table = run_checked(
            "virsh domifaddr",
            virsh(&["domifaddr", "--source", "agent", name]),
        )
        .await?;
        Ok(parse_domifaddr(&table))
    }

    async fn save_domain(&self, name: &str, file: &Path) -> Result<(), VmError> {
        let mut cmd = virsh(&["save", name]);
        cmd.arg(file);
        run_checked("virsh save", cmd).await?;
        tracing::info!(name, file = %file.display(), "domain state saved");
        Ok(())
    }

    async fn restore_domain(&self, file: &Path) -> Result<(), VmError> {
        let mut cmd = virsh(&["restore"]);
        cmd.arg(file);
        run_checked("virsh restore", cmd).await?;
        tracing::info!(file = %file.display(), "domain state restored");
        Ok(())
    }

    async fn create_overlay_disk(
        &self,
        base: &Path,
        overlay: &Path,
        size: &str,
    ) -> Result<(), VmError> {
        let mut cmd = Command::new("qemu-img");
        cmd.args(["create", "-f", "qcow2", "-b"])
            .arg(base)
            .args(["-F", "qcow2"])
            .arg(overlay)
            .arg(size);
        run_checked("qemu-img create", cmd).await?;
        tracing::info!(path = %overlay.display(), size, "created qcow2 overlay");
        Ok(())
    }

    async fn create_blank_disk(&self, path: &Path, size: &str) -> Result<(), VmError> {
        let mut cmd = Command::new("qemu-img");
        cmd.args(["create", "-f", "raw"]).arg(path).arg(size);
        run_checked("qemu-img create", cmd).await?;
        tracing::info!(path = %path.display(), size, "created raw disk");
        Ok(())
    }

    async fn attach_console(&self, name: &str) -> Result<i32, VmError> {
        println!("Attaching console (press Ctrl+] to detach)...");
        run_interactive("virsh console", virsh(&["console", name])).await
    }

    async fn open_shell(&self, user: &str, ip: &str, key: &Path) -> Result<i32, VmError> {
        let mut cmd = Command::new("ssh");
        cmd.arg("-i")
            .arg(key)
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "LogLevel=ERROR"])
            .arg(format!("{user}@{ip}"));
        run_interactive("ssh", cmd).await
    }
}

/// Build the full virt-install invocation for a new domain. `--import` boots
/// the machine straight from the prepared disks, and the q35/IOMMU options
/// give the guest the device-passthrough features the storage tests exercise.
fn virt_install_args(spec: &DomainSpec, user_data: &Path) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--name".into(),
        spec.name.clone(),
        "--memory".into(),
        spec.memory_mb.to_string(),
        "--vcpus".into(),
        spec.cpus.to_string(),
        "--import".into(),
    ];

    for disk in &spec.disks {
        args.push("--disk".into());
        args.push(format!(
            "path={},format={},bus=virtio",
            disk.path.display(),
            disk.format.as_str()
        ));
    }

    args.push("--os-variant".into());
    args.push(spec.os_variant.clone());
    args.push("--machine".into());
    args.push("q35".into());
    args.push("--cpu".into());
    args.push("host-passthrough".into());
    args.push("--features".into());
    args.push("ioapic.driver=qemu".into());
    args.push("--iommu".into());
    args.push("model=intel,driver.intremap=on,driver.caching_mode=on".into());

    if let Some(workspace) = &spec.workspace {
        args.push("--filesystem".into());
        args.push(format!(
            "source={},target={},accessmode=passthrough",
            workspace.display(),
            cloudinit::WORKSPACE_TAG
        ));
    }

    args.push("--network".into());
    args.push(spec.network.clone());
    args.push("--cloud-init".into());
    args.push(format!("user-data={}", user_data.display()));
    // Agent channel so domifaddr --source agent can answer
    args.push("--channel".into());
    args.push("unix,target.type=virtio,name=org.qemu.guest_agent.0".into());
    args.push("--graphics".into());
    args.push("none".into());
    args.push("--noautoconsole".into());

    args
}

// ── output parsing ──────────────────────────────────────────────────

/// Parse the `domifaddr` table. Continuation rows (name "-") belong to the
/// previous interface; addresses are stored without their prefix length.
fn parse_domifaddr(table: &str) -> Vec<GuestInterface> {
    let mut interfaces: Vec<GuestInterface> = Vec::new();

    for line in table.lines() {
        // Header and separator rows never split into exactly four fields
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [name, _mac, proto, addr] = fields[..] else {
            continue;
        };

        if name != "-" {
            interfaces.push(GuestInterface {
                name: name.to_string(),
                ipv4: Vec::new(),
            });
        }
        if proto == "ipv4"
            && let Some(iface) = interfaces.last_mut()
            && let Some(bare) = addr.split('/').next()
        {
            iface.ipv4.push(bare.to_string());
        }
    }

    interfaces
}

/// Pull the primary disk's source file out of a domain XML dump. Skips
/// cdrom devices so a still-attached cloud-init ISO is never mistaken for
/// the boot disk.
pub fn primary_disk_source(xml: &str) -> Option<PathBuf> {
    for block in xml.split("<disk").skip(1) {
        let block = block.split("</disk>").next().unwrap_or(block);
        if block.contains("device='cdrom'") || block.contains("device=\"cdrom\"") {
            continue;
        }
        let source = block
            .split_once("source file='")
            .map(|(_, rest)| rest.split('\'').next())
            .or_else(|| {
                block
                    .split_once("source file=\"")
                    .map(|(_, rest)| rest.split('"').next())
            })
            .flatten()?;
        return Some(PathBuf::from(source));
    }
    None
}
