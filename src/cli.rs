use crate::types::{BootMode, InstallMode};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// archsetup - unattended Arch Linux disk preparation and base install
#[derive(Parser)]
#[command(name = "archsetup")]
#[command(about = "Partition, format and install Arch Linux without a wizard")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: show what would be executed without making changes.
    ///
    /// Queries (lsblk, parted print) still run so the preview reflects the
    /// real drive. Anything that writes to a disk or the target is logged
    /// and skipped.
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Which drive or partition to work on and how
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// wipe-drive, use-partition or use-free-space
    #[arg(short, long, default_value = "wipe-drive")]
    pub mode: InstallMode,

    /// BIOS or EFI (detected from the running system when omitted)
    #[arg(short, long)]
    pub boot: Option<BootMode>,

    /// Target drive (e.g., sda or /dev/nvme0n1)
    #[arg(short, long)]
    pub drive: Option<String>,

    /// Target partition for use-partition (e.g., /dev/sda3)
    #[arg(short, long)]
    pub partition: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List drives that can be installed to
    Drives,
    /// Show the partitions of a drive
    Partitions {
        /// Drive to inspect (e.g., sda)
        drive: String,
    },
    /// Show the partition plan for a target without changing anything
    Plan(TargetArgs),
    /// Partition, format and mount the target
    Prepare {
        #[command(flatten)]
        target: TargetArgs,

        /// Confirm destructive changes without prompting
        #[arg(short, long)]
        yes: bool,
    },
    /// Install into a target that is already prepared and mounted
    Install {
        /// Configuration file with system and user settings
        #[arg(short, long)]
        config: PathBuf,

        /// Root partition mounted at the mount root
        #[arg(long)]
        root: PathBuf,

        /// EFI system partition (required for EFI installs)
        #[arg(long)]
        esp: Option<PathBuf>,
    },
    /// Plan, prepare and install from a configuration file
    Run {
        /// Configuration file to install from
        #[arg(short, long)]
        config: PathBuf,

        /// Confirm destructive changes without prompting
        #[arg(short, long)]
        yes: bool,
    },
    /// Install the host tools the installer needs
    Deps,
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        config: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
