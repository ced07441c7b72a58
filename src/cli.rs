use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "labvm",
    about = "Development VM lifecycle manager for storage testing"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create and start the VM (or power it on if it already exists)
    Start(StartArgs),

    /// Request a graceful shutdown of the VM
    Stop,

    /// Force-stop the VM and remove its disks, snapshot, and keys
    Destroy,

    /// Show domain state and guest network addresses
    Status,

    /// Open an interactive shell in the VM
    Ssh,

    /// Attach to the VM serial console
    Console,

    /// Save VM memory and device state to a snapshot file
    Snapshot,

    /// Restore the VM from its snapshot file
    Restore,
}

/// Flags consumed by `start`. Every value is optional; unset flags fall
/// through to the config file, environment, and built-in defaults.
#[derive(Args, Debug, Default, Clone)]
pub struct StartArgs {
    /// Memory in MB
    #[arg(long)]
    pub memory: Option<u64>,

    /// Number of vCPUs
    #[arg(long)]
    pub cpus: Option<u32>,

    /// Primary disk size, passed through to the disk tool (e.g. "100G")
    #[arg(long)]
    pub disk_size: Option<String>,

    /// Number of additional raw storage disks
    #[arg(long)]
    pub additional_disks: Option<usize>,

    /// Size of each additional storage disk (e.g. "1G")
    #[arg(long)]
    pub additional_disk_size: Option<String>,

    /// Skip the workspace passthrough mount
    #[arg(long)]
    pub no_workspace: bool,

    /// Host directory to expose as the guest workspace
    #[arg(long)]
    pub workspace_path: Option<PathBuf>,

    /// Network mode string passed through to domain creation
    #[arg(long)]
    pub network: Option<String>,

    /// File of KEY=value overrides, applied between environment and flags
    #[arg(long)]
    pub config: Option<PathBuf>,
}
