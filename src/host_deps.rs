//! Host dependency checks
//!
//! The live system needs a handful of tools before anything can be
//! partitioned or bootstrapped. This module reports which are missing and
//! builds the one package-manager call that installs them.

use crate::runner::{CommandRunner, Invocation};
use std::fs;
use std::path::Path;
use strum::Display;
use tracing::debug;

/// Packages installed on the host by `deps`
pub const HOST_PACKAGES: &[&str] = &[
    "arch-install-scripts", // arch-chroot, genfstab
    "parted",
    "dosfstools", // mkfs.fat
    "e2fsprogs",  // mkfs.ext4, e2fsck, resize2fs
    "squashfs-tools",
    "wget",
    "curl", // bootstrap image download
];

/// Tools the pipeline calls on the host, with the package that ships them
const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("lsblk", "util-linux"),
    ("parted", "parted"),
    ("partprobe", "parted"),
    ("mkfs.ext4", "e2fsprogs"),
    ("e2fsck", "e2fsprogs"),
    ("resize2fs", "e2fsprogs"),
    ("mkfs.fat", "dosfstools"),
    ("arch-chroot", "arch-install-scripts"),
    ("genfstab", "arch-install-scripts"),
    ("curl", "curl"),
    ("tar", "tar"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum HostDistro {
    Arch,
    Fedora,
    /// Anything else is assumed to be apt-based
    Debian,
}

impl HostDistro {
    /// Read `/etc/os-release`; unreadable files count as Debian-like
    pub fn detect() -> Self {
        Self::detect_from(Path::new("/etc/os-release"))
    }

    fn detect_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => Self::from_os_release(&content),
            Err(e) => {
                debug!("could not read {}: {}", path.display(), e);
                Self::Debian
            }
        }
    }

    /// Classify by `ID=`, falling back to `ID_LIKE=`
    pub fn from_os_release(content: &str) -> Self {
        let field = |key: &str| {
            content.lines().find_map(|line| {
                line.trim()
                    .strip_prefix(key)
                    .and_then(|rest| rest.strip_prefix('='))
                    .map(|value| value.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
            })
        };
        let classify = |id: &str| match id {
            "arch" | "archlinux" => Some(Self::Arch),
            "fedora" => Some(Self::Fedora),
            _ => None,
        };

        field("ID")
            .as_deref()
            .and_then(classify)
            .or_else(|| {
                field("ID_LIKE").and_then(|like| like.split_whitespace().find_map(classify))
            })
            .unwrap_or(Self::Debian)
    }

    /// Privileged package-manager call installing `packages`
    pub fn install_invocation(self, packages: &[&str]) -> Invocation {
        let base = match self {
            Self::Arch => Invocation::mutation("pacman").args(["-S", "--needed", "--noconfirm"]),
            Self::Fedora => Invocation::mutation("dnf").args(["install", "-y"]),
            Self::Debian => Invocation::mutation("apt").args(["install", "-y"]),
        };
        base.args(packages.iter().copied()).streaming()
    }
}

/// Required host tools that cannot be found, as (tool, package)
pub fn missing_tools(runner: &dyn CommandRunner) -> Vec<(&'static str, &'static str)> {
    REQUIRED_TOOLS
        .iter()
        .copied()
        .filter(|(tool, _)| runner.locate_program(tool).is_none())
        .collect()
}
