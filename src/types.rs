//! Type-safe vocabulary shared by the planner, the workers and the config file
//!
//! Everything that ends up on a command line (`msdos`, `bios_grub`, `ext4`)
//! is an enum here so typos fail to compile instead of failing in `parted`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use strum::{Display, EnumIter, EnumString};

/// Bytes per mebibyte. All geometry is done in whole MiB.
pub const MIB: u64 = 1_048_576;

/// Truncating bytes → MiB conversion
#[inline]
pub const fn bytes_to_mib(bytes: u64) -> u64 {
    bytes / MIB
}

/// How the target drive is used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum InstallMode {
    /// Erase the drive and lay out a fresh table
    #[default]
    WipeDrive,
    /// Reuse one existing partition as root
    UsePartition,
    /// Create root in the largest unallocated region
    UseFreeSpace,
}

/// Boot firmware mode the installed system will use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum BootMode {
    #[default]
    #[strum(serialize = "BIOS")]
    Bios,
    #[strum(to_string = "EFI", serialize = "UEFI")]
    Efi,
}

impl BootMode {
    /// Detect the mode the live system was booted in.
    ///
    /// `/sys/firmware/efi` only exists when the kernel was started by UEFI
    /// firmware; anything else is treated as legacy BIOS.
    pub fn detect() -> Self {
        Self::detect_from(Path::new("/sys/firmware/efi"))
    }

    fn detect_from(efi_dir: &Path) -> Self {
        if efi_dir.is_dir() {
            Self::Efi
        } else {
            tracing::debug!("{} missing, assuming BIOS", efi_dir.display());
            Self::Bios
        }
    }

    pub fn is_efi(self) -> bool {
        matches!(self, Self::Efi)
    }
}

/// Partition table type as reported by `lsblk -o PTTYPE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TableType {
    Gpt,
    #[strum(to_string = "dos", serialize = "msdos")]
    Dos,
    #[default]
    Unknown,
}

impl TableType {
    /// Parse lsblk output, mapping anything unrecognised (including an
    /// empty column for an unpartitioned disk) to `Unknown`.
    pub fn from_lsblk(value: &str) -> Self {
        value.trim().parse().unwrap_or(Self::Unknown)
    }

    /// Label name understood by `parted mklabel`
    pub fn parted_label(self) -> &'static str {
        match self {
            Self::Gpt => "gpt",
            Self::Dos => "msdos",
            Self::Unknown => "loop",
        }
    }
}

/// Filesystems this installer creates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FsType {
    Ext4,
    Fat32,
}

impl FsType {
    /// Program and force arguments used to create this filesystem
    pub fn mkfs_command(self) -> (&'static str, &'static [&'static str]) {
        match self {
            Self::Ext4 => ("mkfs.ext4", &["-F"]),
            Self::Fat32 => ("mkfs.fat", &["-F32"]),
        }
    }
}

/// Partition flags toggled through `parted set N <flag> on`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PartFlag {
    Boot,
    Esp,
    BiosGrub,
}

/// Device path for partition `number` of `drive`.
///
/// Drives whose name ends in a digit (nvme0n1, mmcblk0, loop0) use a `p`
/// separator before the partition number.
pub fn partition_device(drive: &str, number: u32) -> PathBuf {
    PathBuf::from(format!("/dev/{}", partition_name(drive, number)))
}

/// Kernel name for partition `number` of `drive` (`sda1`, `nvme0n1p1`)
pub fn partition_name(drive: &str, number: u32) -> String {
    let drive = strip_dev(drive);
    if drive.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{}p{}", drive, number)
    } else {
        format!("{}{}", drive, number)
    }
}

/// `/dev/sda` → `sda`; bare names pass through
pub fn strip_dev(name: &str) -> &str {
    name.trim().trim_start_matches("/dev/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_boot_mode_display_and_parsing() {
        assert_eq!(BootMode::Bios.to_string(), "BIOS");
        assert_eq!(BootMode::Efi.to_string(), "EFI");
        assert_eq!(BootMode::from_str("efi").unwrap(), BootMode::Efi);
        assert_eq!(BootMode::from_str("UEFI").unwrap(), BootMode::Efi);
        assert_eq!(BootMode::from_str("bios").unwrap(), BootMode::Bios);
        assert!(BootMode::from_str("coreboot").is_err());
    }

    #[test]
    fn test_boot_mode_detect_from_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(BootMode::detect_from(&dir.path().join("efi")), BootMode::Bios);
        assert_eq!(BootMode::detect_from(dir.path()), BootMode::Efi);
    }

    #[test]
    fn test_install_mode_kebab_case() {
        assert_eq!(InstallMode::UseFreeSpace.to_string(), "use-free-space");
        assert_eq!(
            InstallMode::from_str("use-partition").unwrap(),
            InstallMode::UsePartition
        );
        let json = serde_json::to_string(&InstallMode::WipeDrive).unwrap();
        assert_eq!(json, "\"wipe-drive\"");
    }

    #[test]
    fn test_table_type_from_lsblk() {
        assert_eq!(TableType::from_lsblk("gpt\n"), TableType::Gpt);
        assert_eq!(TableType::from_lsblk("dos"), TableType::Dos);
        assert_eq!(TableType::from_lsblk(""), TableType::Unknown);
        assert_eq!(TableType::from_lsblk("atari"), TableType::Unknown);
        assert_eq!(TableType::from_lsblk("msdos"), TableType::Dos);
        assert_eq!(TableType::Dos.to_string(), "dos");
        assert_eq!(TableType::Dos.parted_label(), "msdos");
    }

    #[test]
    fn test_part_flag_names_match_parted() {
        let names: Vec<String> = PartFlag::iter().map(|f| f.to_string()).collect();
        assert_eq!(names, vec!["boot", "esp", "bios_grub"]);
    }

    #[test]
    fn test_mkfs_commands() {
        assert_eq!(FsType::Ext4.mkfs_command(), ("mkfs.ext4", &["-F"][..]));
        assert_eq!(FsType::Fat32.mkfs_command(), ("mkfs.fat", &["-F32"][..]));
    }

    #[test]
    fn test_partition_device_naming() {
        assert_eq!(partition_device("sda", 1), PathBuf::from("/dev/sda1"));
        assert_eq!(partition_device("/dev/nvme0n1", 2), PathBuf::from("/dev/nvme0n1p2"));
        assert_eq!(partition_device("mmcblk0", 1), PathBuf::from("/dev/mmcblk0p1"));
    }

    #[test]
    fn test_bytes_to_mib_truncates() {
        assert_eq!(bytes_to_mib(MIB - 1), 0);
        assert_eq!(bytes_to_mib(20 * 1024 * MIB + 12345), 20 * 1024);
    }
}
