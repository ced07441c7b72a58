use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};

use crate::error::VmError;
use crate::paths;

/// Ensure the VM's ed25519 keypair exists next to its disks, generating one
/// on first use. Returns the public key line for cloud-init.
pub async fn ensure_keypair(dir: &Path, vm_name: &str) -> Result<String, VmError> {
    let key_path = paths::ssh_key_path(dir, vm_name);
    let pub_path = key_path.with_extension("pub");

    if pub_path.exists() {
        let line = tokio::fs::read_to_string(&pub_path)
            .await
            .map_err(|e| VmError::Io {
                context: format!("reading {}", pub_path.display()),
                source: e,
            })?;
        return Ok(line.trim().to_string());
    }

    let mut key =
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519).map_err(|e| VmError::SshKey {
            context: "generating ed25519 key".into(),
            source: e,
        })?;
    key.set_comment(vm_name);

    let private = key.to_openssh(LineEnding::LF).map_err(|e| VmError::SshKey {
        context: "encoding private key".into(),
        source: e,
    })?;
    let public = key.public_key().to_openssh().map_err(|e| VmError::SshKey {
        context: "encoding public key".into(),
        source: e,
    })?;

    tokio::fs::write(&key_path, private.as_bytes())
        .await
        .map_err(|e| VmError::Io {
            context: format!("writing {}", key_path.display()),
            source: e,
        })?;

    // sshd-side tooling refuses keys readable by the group or world
    let perms = std::fs::Permissions::from_mode(0o600);
    tokio::fs::set_permissions(&key_path, perms)
        .await
        .map_err(|e| VmError::Io {
            context: format!("restricting permissions on {}", key_path.display()),
            source: e,
        })?;

    tokio::fs::write(&pub_path, format!("{public}\n"))
        .await
        .map_err(|e| VmError::Io {
            context: format!("writing {}", pub_path.display()),
            source: e,
        })?;

    tracing::info!(key = %key_path.display(), "generated ssh keypair");
    Ok(public)
}
