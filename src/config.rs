use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::cli::StartArgs;
use crate::error::VmError;

/// Fixed name of the managed domain. Disk and snapshot filenames derive
/// from it, so it is deliberately not configurable.
pub const VM_NAME: &str = "labvm-dev";

/// Base cloud image, downloaded into the working directory on first use.
pub const IMAGE_URL: &str =
    "https://cloud-images.ubuntu.com/releases/noble/release/ubuntu-24.04-server-cloudimg-amd64.img";

/// OS-variant hint handed to domain creation.
pub const OS_VARIANT: &str = "ubuntu24.04";

/// Login user provisioned via cloud-init.
pub const SSH_USER: &str = "ubuntu";

const DEFAULT_MEMORY_MB: u64 = 16384;
const DEFAULT_CPUS: u32 = 16;
const DEFAULT_DISK_SIZE: &str = "100G";
const DEFAULT_ADDITIONAL_DISKS: usize = 3;
const DEFAULT_ADDITIONAL_DISK_SIZE: &str = "1G";
const DEFAULT_NETWORK: &str = "network=default";

/// Resolved, immutable run configuration. Built once per invocation by
/// [`resolve`]; nothing downstream mutates it or re-reads the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    pub name: String,
    pub memory_mb: u64,
    pub cpus: u32,
    /// Primary disk size, opaque to this tool (e.g. "100G").
    pub disk_size: String,
    pub additional_disks: usize,
    /// Additional disk size, opaque to this tool (e.g. "1G").
    pub additional_disk_size: String,
    pub workspace_mount: bool,
    pub workspace_path: PathBuf,
    /// Network mode string passed through verbatim to domain creation.
    pub network: String,
}

/// Resolve configuration from all four sources.
///
/// Precedence, lowest to highest: built-in defaults, process environment,
/// `--config` file, explicit flags. A missing config file warns and is
/// skipped rather than failing the command.
pub fn resolve(args: &StartArgs) -> Result<VmConfig, VmError> {
    let env = env_overrides();
    let file = args.config.as_deref().and_then(load_override_file);
    resolve_from(&env, file.as_ref(), args)
}

/// Pure precedence core, separated from process-environment access so the
/// layering can be tested directly.
fn resolve_from(
    env: &HashMap<String, String>,
    file: Option<&HashMap<String, String>>,
    args: &StartArgs,
) -> Result<VmConfig, VmError> {
    let mut memory_mb = DEFAULT_MEMORY_MB;
    if let Some(v) = layered("VM_MEMORY", env, file) {
        memory_mb = parse_number(v, "VM_MEMORY")?;
    }
    if let Some(m) = args.memory {
        memory_mb = m;
    }

    let mut cpus = DEFAULT_CPUS;
    if let Some(v) = layered("VM_CPUS", env, file) {
        cpus = parse_number(v, "VM_CPUS")?;
    }
    if let Some(c) = args.cpus {
        cpus = c;
    }

    let mut disk_size = DEFAULT_DISK_SIZE.to_string();
    if let Some(v) = layered("VM_DISK_SIZE", env, file) {
        disk_size = v.to_string();
    }
    if let Some(s) = &args.disk_size {
        disk_size = s.clone();
    }

    let mut additional_disks = DEFAULT_ADDITIONAL_DISKS;
    if let Some(v) = layered("ADDITIONAL_DISK_COUNT", env, file) {
        additional_disks = parse_number(v, "ADDITIONAL_DISK_COUNT")?;
    }
    if let Some(n) = args.additional_disks {
        additional_disks = n;
    }

    let mut additional_disk_size = DEFAULT_ADDITIONAL_DISK_SIZE.to_string();
    if let Some(v) = layered("ADDITIONAL_DISK_SIZE", env, file) {
        additional_disk_size = v.to_string();
    }
    if let Some(s) = &args.additional_disk_size {
        additional_disk_size = s.clone();
    }

    let mut workspace_mount = true;
    if let Some(v) = layered("WORKSPACE_MOUNT_ENABLED", env, file) {
        workspace_mount = parse_bool(v, "WORKSPACE_MOUNT_ENABLED")?;
    }
    if args.no_workspace {
        workspace_mount = false;
    }

    let mut workspace_path = default_workspace_path();
    if let Some(v) = layered("WORKSPACE_SOURCE_PATH", env, file) {
        workspace_path = PathBuf::from(v);
    }
    if let Some(p) = &args.workspace_path {
        workspace_path = p.clone();
    }

    let mut network = DEFAULT_NETWORK.to_string();
    if let Some(v) = layered("VM_NETWORK", env, file) {
        network = v.to_string();
    }
    if let Some(n) = &args.network {
        network = n.clone();
    }

    Ok(VmConfig {
        name: VM_NAME.to_string(),
        memory_mb,
        cpus,
        disk_size,
        additional_disks,
        additional_disk_size,
        workspace_mount,
        workspace_path,
        network,
    })
}

/// Value for `key` from the file layer, falling back to the environment
/// layer. Empty values count as unset, same as `${VAR:-default}` expansion
/// in the shell.
fn layered<'a>(
    key: &str,
    env: &'a HashMap<String, String>,
    file: Option<&'a HashMap<String, String>>,
) -> Option<&'a str> {
    file.and_then(|f| f.get(key))
        .or_else(|| env.get(key))
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

/// Snapshot of the recognized override variables from the process
/// environment.
fn env_overrides() -> HashMap<String, String> {
    const KEYS: [&str; 8] = [
        "VM_MEMORY",
        "VM_CPUS",
        "VM_DISK_SIZE",
        "ADDITIONAL_DISK_COUNT",
        "ADDITIONAL_DISK_SIZE",
        "WORKSPACE_MOUNT_ENABLED",
        "WORKSPACE_SOURCE_PATH",
        "VM_NETWORK",
    ];

    KEYS.iter()
        .filter_map(|k| std::env::var(k).ok().map(|v| (k.to_string(), v)))
        .collect()
}

/// Load `--config FILE`. A missing or unreadable file warns and yields no
/// layer; every other source still applies.
fn load_override_file(path: &Path) -> Option<HashMap<String, String>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Some(parse_override_file(&contents)),
        Err(e) => {
            eprintln!(
                "warning: config file {} not readable ({e}), continuing without it",
                path.display()
            );
            None
        }
    }
}

/// Parse shell-style `KEY=value` assignments. Blank lines, `#` comments,
/// and lines without `=` are skipped; an optional `export ` prefix and one
/// layer of quotes around the value are stripped. Unrecognized keys are
/// kept and simply never consulted.
pub fn parse_override_file(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map(str::trim).unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        map.insert(key.trim().to_string(), value.to_string());
    }
    map
}

fn parse_number<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, VmError> {
    value.trim().parse().map_err(|_| VmError::Config {
        message: format!("{key} must be a number (got '{value}')"),
    })
}

fn parse_bool(value: &str, key: &str) -> Result<bool, VmError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(VmError::Config {
            message: format!("{key} must be true or false (got '{value}')"),
        }),
    }
}

fn default_workspace_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("workspace")
}
