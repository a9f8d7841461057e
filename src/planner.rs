//! Partition planner
//!
//! Turns an [`InstallPlan`] plus a [`DriveSnapshot`] into an ordered list of
//! [`PartitionOp`]s, or refuses with a [`PlanRejection`].
//!
//! | Mode                      | Operations |
//! |---------------------------|------------|
//! | WipeDrive, BIOS           | mklabel msdos → boot 1–513 MiB (boot flag) → root 513 MiB–100% |
//! | WipeDrive, EFI            | mklabel gpt → ESP 1–513 MiB fat32 → root 513 MiB–100% |
//! | UsePartition, BIOS on GPT | rm N → bios_grub 1 MiB → root over the rest of the old extent |
//! | UsePartition, EFI, no ESP | shrink fs → resizepart → ESP in the freed 512 MiB tail |
//! | UseFreeSpace              | one root partition over the largest free region |
//!
//! Pure logic: nothing here runs a command. The disk worker executes the
//! plan and re-reads the table after every geometry change.

use crate::inventory::{DriveSnapshot, FreeRegion, Partition};
use crate::types::{BootMode, FsType, InstallMode, PartFlag, TableType, strip_dev};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Start of the first partition on a fresh table
pub const FIRST_PARTITION_START_MIB: u64 = 1;
/// End of the boot partition or ESP on a fresh table
pub const BOOT_PARTITION_END_MIB: u64 = 513;
/// Size of the ESP carved from an existing partition
pub const ESP_SPLIT_MIB: u64 = 512;
/// A partition must be larger than this to give up an ESP
pub const MIN_SPLIT_SOURCE_MIB: u64 = 600;
/// Size of a GRUB BIOS boot partition
pub const BIOS_BOOT_MIB: u64 = 1;

// ============================================================================
// Request
// ============================================================================

/// What the user asked for. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallPlan {
    pub mode: InstallMode,
    pub boot_mode: BootMode,
    /// Kernel name of the target disk (`sda`)
    pub drive: String,
    /// Kernel name of the target partition, `UsePartition` only
    pub partition: Option<String>,
}

impl InstallPlan {
    /// Validate and build a plan.
    ///
    /// `UsePartition` needs a partition; every mode needs the drive the
    /// partition lives on (resolve it with `Inventory::parent_drive`).
    pub fn new(
        mode: InstallMode,
        boot_mode: BootMode,
        drive: &str,
        partition: Option<&str>,
    ) -> Result<Self, PlanRejection> {
        let drive = strip_dev(drive);
        let partition = partition.map(strip_dev).filter(|p| !p.is_empty());

        if mode == InstallMode::UsePartition && partition.is_none() {
            return Err(PlanRejection::InvalidPlan(
                "use-partition requires a target partition".to_string(),
            ));
        }
        if drive.is_empty() {
            return Err(PlanRejection::InvalidPlan(format!(
                "{} requires a target drive",
                mode
            )));
        }

        Ok(Self {
            mode,
            boot_mode,
            drive: drive.to_string(),
            partition: if mode == InstallMode::UsePartition {
                partition.map(str::to_string)
            } else {
                None
            },
        })
    }
}

// ============================================================================
// Operations
// ============================================================================

/// Partition end given to `parted mkpart`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Boundary {
    Mib(u64),
    /// `100%`: the end of the device
    End,
}

impl fmt::Display for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mib(mib) => write!(f, "{}MiB", mib),
            Self::End => write!(f, "100%"),
        }
    }
}

/// What a created partition is for; drives formatting and mounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PartitionRole {
    /// ext4 `/boot` of the BIOS wipe layout
    Boot,
    Esp,
    /// Unformatted GRUB core image area
    BiosBoot,
    Root,
}

/// One step of a partition plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PartitionOp {
    CreateTable(TableType),
    CreatePartition {
        start_mib: u64,
        end: Boundary,
        /// Filesystem hint passed to `mkpart`
        fs: Option<FsType>,
        flags: Vec<PartFlag>,
        name: Option<String>,
        role: PartitionRole,
    },
    DeletePartition(u32),
    ResizePartition { number: u32, new_end_mib: u64 },
    SetFlag { number: u32, flag: PartFlag },
    /// `e2fsck -f` then `resize2fs` down to `new_size_mib`
    ShrinkFilesystem { partition: String, new_size_mib: u64 },
}

impl PartitionOp {
    /// True when the kernel must re-read the table before the next step
    pub fn changes_geometry(&self) -> bool {
        !matches!(self, Self::SetFlag { .. } | Self::ShrinkFilesystem { .. })
    }

    /// Arguments after `parted --script /dev/X`, or `None` for steps that
    /// are not `parted` commands
    pub fn parted_args(&self) -> Option<Vec<String>> {
        let args = match self {
            Self::CreateTable(table) => vec!["mklabel".to_string(), table.parted_label().to_string()],
            Self::CreatePartition { start_mib, end, fs, .. } => {
                let mut args = vec!["mkpart".to_string(), "primary".to_string()];
                if let Some(fs) = fs {
                    args.push(fs.to_string());
                }
                args.push(format!("{}MiB", start_mib));
                args.push(end.to_string());
                args
            }
            Self::DeletePartition(number) => vec!["rm".to_string(), number.to_string()],
            Self::ResizePartition { number, new_end_mib } => vec![
                "resizepart".to_string(),
                number.to_string(),
                format!("{}MiB", new_end_mib),
            ],
            Self::SetFlag { number, flag } => vec![
                "set".to_string(),
                number.to_string(),
                flag.to_string(),
                "on".to_string(),
            ],
            Self::ShrinkFilesystem { .. } => return None,
        };
        Some(args)
    }
}

impl fmt::Display for PartitionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateTable(table) => write!(f, "CreateTable({})", table.parted_label()),
            Self::CreatePartition { start_mib, end, fs, flags, name, role } => {
                write!(f, "CreatePartition({}MiB..{}", start_mib, end)?;
                if let Some(fs) = fs {
                    write!(f, ", {}", fs)?;
                }
                if !flags.is_empty() {
                    let flags: Vec<String> = flags.iter().map(|fl| fl.to_string()).collect();
                    write!(f, ", [{}]", flags.join(","))?;
                }
                if let Some(name) = name {
                    write!(f, ", name={}", name)?;
                }
                write!(f, ", {:?})", role)
            }
            Self::DeletePartition(n) => write!(f, "DeletePartition({})", n),
            Self::ResizePartition { number, new_end_mib } => {
                write!(f, "ResizePartition({}, end={}MiB)", number, new_end_mib)
            }
            Self::SetFlag { number, flag } => write!(f, "SetFlag({}, {})", number, flag),
            Self::ShrinkFilesystem { partition, new_size_mib } => {
                write!(f, "ShrinkFilesystem({}, {}MiB)", partition, new_size_mib)
            }
        }
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Why a plan was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanRejection {
    #[error("mbr primary limit")]
    MbrPrimaryLimit,

    #[error("partition {0} not found")]
    PartitionNotFound(String),

    #[error("partition {name} is too small to split ({size_mib} MiB)")]
    PartitionTooSmall { name: String, size_mib: u64 },

    #[error("no free space on {0}")]
    NoFreeSpace(String),

    #[error("free region {start_mib}..{end_mib} MiB is outside device boundaries ({disk_mib} MiB)")]
    RegionOutOfBounds {
        start_mib: u64,
        end_mib: u64,
        disk_mib: u64,
    },

    #[error("cannot determine partition number of {0}")]
    AmbiguousPartitionNumber(String),

    #[error("invalid install plan: {0}")]
    InvalidPlan(String),
}

/// Ordered operations for one drive
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionPlan {
    pub drive: String,
    pub mode: InstallMode,
    pub boot_mode: BootMode,
    /// `UsePartition` target, unmounted before anything runs
    pub target_partition: Option<String>,
    pub ops: Vec<PartitionOp>,
    /// Existing partition that becomes root when no op creates one
    pub reuse_root: Option<String>,
    /// Existing ESP kept as is (never reformatted)
    pub reuse_esp: Option<String>,
}

impl PartitionPlan {
    /// True if existing data is erased: table rewrites, deletes, resizes,
    /// or an existing partition that will be reformatted as root
    pub fn is_destructive(&self) -> bool {
        self.reuse_root.is_some()
            || self.ops.iter().any(|op| {
                matches!(
                    op,
                    PartitionOp::CreateTable(_)
                        | PartitionOp::DeletePartition(_)
                        | PartitionOp::ResizePartition { .. }
                        | PartitionOp::ShrinkFilesystem { .. }
                )
            })
    }

    /// The op that creates partition `role`, if any
    pub fn created(&self, role: PartitionRole) -> Option<&PartitionOp> {
        self.ops
            .iter()
            .find(|op| matches!(op, PartitionOp::CreatePartition { role: r, .. } if *r == role))
    }

    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!("Partition plan: {} ({})", self.mode, self.boot_mode),
            format!("  Drive: /dev/{}", self.drive),
        ];
        if let Some(part) = &self.target_partition {
            lines.push(format!("  Partition: /dev/{}", part));
        }
        if let Some(root) = &self.reuse_root {
            lines.push(format!("  Reused root: /dev/{} (will be formatted)", root));
        }
        if let Some(esp) = &self.reuse_esp {
            lines.push(format!("  Reused ESP: /dev/{}", esp));
        }
        lines.push(format!("  Destructive: {}", self.is_destructive()));
        lines.push(format!("  Operations ({}):", self.ops.len()));
        for (i, op) in self.ops.iter().enumerate() {
            lines.push(format!("    {}. {}", i + 1, op));
        }
        lines.join("\n")
    }
}

/// Compute the operations for `request` against the current drive state.
///
/// # Errors
///
/// - `MbrPrimaryLimit` for free-space installs on a full MBR table
/// - `PartitionNotFound` / `AmbiguousPartitionNumber` when the chosen
///   partition can't be used
/// - `PartitionTooSmall` when an EFI split would leave ≤ 600 MiB
/// - `NoFreeSpace` / `RegionOutOfBounds` for unusable free regions
pub fn plan(request: &InstallPlan, snapshot: &DriveSnapshot) -> Result<PartitionPlan, PlanRejection> {
    if snapshot.drive.name != request.drive {
        return Err(PlanRejection::InvalidPlan(format!(
            "snapshot is of {}, plan targets {}",
            snapshot.drive.name, request.drive
        )));
    }

    let mut result = PartitionPlan {
        drive: request.drive.clone(),
        mode: request.mode,
        boot_mode: request.boot_mode,
        target_partition: request.partition.clone(),
        ops: Vec::new(),
        reuse_root: None,
        reuse_esp: None,
    };

    match request.mode {
        InstallMode::WipeDrive => result.ops = wipe_layout(request.boot_mode),
        InstallMode::UsePartition => plan_use_partition(request, snapshot, &mut result)?,
        InstallMode::UseFreeSpace => result.ops = plan_free_space(snapshot)?,
    }
    Ok(result)
}

fn wipe_layout(boot_mode: BootMode) -> Vec<PartitionOp> {
    match boot_mode {
        BootMode::Bios => vec![
            PartitionOp::CreateTable(TableType::Dos),
            PartitionOp::CreatePartition {
                start_mib: FIRST_PARTITION_START_MIB,
                end: Boundary::Mib(BOOT_PARTITION_END_MIB),
                fs: Some(FsType::Ext4),
                flags: Vec::new(),
                name: None,
                role: PartitionRole::Boot,
            },
            // Partition 1 on a table that was just created
            PartitionOp::SetFlag {
                number: 1,
                flag: PartFlag::Boot,
            },
            root_partition(BOOT_PARTITION_END_MIB, Boundary::End),
        ],
        BootMode::Efi => vec![
            PartitionOp::CreateTable(TableType::Gpt),
            esp_partition(FIRST_PARTITION_START_MIB, BOOT_PARTITION_END_MIB),
            root_partition(BOOT_PARTITION_END_MIB, Boundary::End),
        ],
    }
}

fn root_partition(start_mib: u64, end: Boundary) -> PartitionOp {
    PartitionOp::CreatePartition {
        start_mib,
        end,
        fs: Some(FsType::Ext4),
        flags: Vec::new(),
        name: None,
        role: PartitionRole::Root,
    }
}

fn esp_partition(start_mib: u64, end_mib: u64) -> PartitionOp {
    PartitionOp::CreatePartition {
        start_mib,
        end: Boundary::Mib(end_mib),
        fs: Some(FsType::Fat32),
        flags: vec![PartFlag::Esp, PartFlag::Boot],
        name: Some("ESP".to_string()),
        role: PartitionRole::Esp,
    }
}

fn partition_number(partition: &Partition) -> Result<u32, PlanRejection> {
    partition
        .number
        .ok_or_else(|| PlanRejection::AmbiguousPartitionNumber(partition.name.clone()))
}

fn plan_use_partition(
    request: &InstallPlan,
    snapshot: &DriveSnapshot,
    result: &mut PartitionPlan,
) -> Result<(), PlanRejection> {
    let name = request
        .partition
        .as_deref()
        .ok_or_else(|| PlanRejection::InvalidPlan("no target partition".to_string()))?;
    let partition = snapshot
        .drive
        .find_partition(name)
        .ok_or_else(|| PlanRejection::PartitionNotFound(name.to_string()))?;

    match request.boot_mode {
        BootMode::Bios if snapshot.drive.table == TableType::Gpt && !snapshot.has_bios_boot => {
            result.ops = bios_boot_split(partition)?;
        }
        BootMode::Bios => result.reuse_root = Some(partition.name.clone()),
        BootMode::Efi => {
            match snapshot.esp().filter(|esp| esp.name != partition.name) {
                Some(esp) => result.reuse_esp = Some(esp.name.clone()),
                // The split adds a primary partition, so a full msdos table
                // is refused before anything is shrunk
                None if snapshot.mbr_limit_reached() => return Err(PlanRejection::MbrPrimaryLimit),
                None => result.ops = plan_efi_split(partition)?,
            }
            result.reuse_root = Some(partition.name.clone());
        }
    }
    Ok(())
}

/// Replace `partition` with a 1 MiB bios_grub partition followed by a root
/// partition over the rest of the original extent
fn bios_boot_split(partition: &Partition) -> Result<Vec<PartitionOp>, PlanRejection> {
    let number = partition_number(partition)?;
    let start = partition.start_mib();
    let end = partition.end_mib();
    if end <= start + BIOS_BOOT_MIB {
        return Err(PlanRejection::PartitionTooSmall {
            name: partition.name.clone(),
            size_mib: end.saturating_sub(start),
        });
    }
    Ok(vec![
        PartitionOp::DeletePartition(number),
        PartitionOp::CreatePartition {
            start_mib: start,
            end: Boundary::Mib(start + BIOS_BOOT_MIB),
            fs: None,
            flags: vec![PartFlag::BiosGrub],
            name: None,
            role: PartitionRole::BiosBoot,
        },
        root_partition(start + BIOS_BOOT_MIB, Boundary::Mib(end)),
    ])
}

/// Carve a 512 MiB ESP from the tail of an existing ext4 partition.
///
/// The filesystem is shrunk before the partition so the partition never
/// ends inside live filesystem data.
pub fn plan_efi_split(partition: &Partition) -> Result<Vec<PartitionOp>, PlanRejection> {
    let number = partition_number(partition)?;
    let start = partition.start_mib();
    let end = partition.end_mib();
    let size = end.saturating_sub(start);
    if size <= MIN_SPLIT_SOURCE_MIB {
        return Err(PlanRejection::PartitionTooSmall {
            name: partition.name.clone(),
            size_mib: size,
        });
    }
    let new_end = end - ESP_SPLIT_MIB;
    Ok(vec![
        PartitionOp::ShrinkFilesystem {
            partition: partition.name.clone(),
            new_size_mib: new_end - start,
        },
        PartitionOp::ResizePartition {
            number,
            new_end_mib: new_end,
        },
        esp_partition(new_end, end),
    ])
}

/// Largest region, first one wins a tie
pub fn select_largest_region(regions: &[FreeRegion]) -> Option<&FreeRegion> {
    regions.iter().fold(None, |best: Option<&FreeRegion>, region| match best {
        Some(b) if region.size_mib <= b.size_mib => Some(b),
        _ => Some(region),
    })
}

/// Whole-MiB bounds for a new partition in `region`.
///
/// The start is truncated and kept at or after 1 MiB for alignment; an end
/// at or past the device size is pulled back to `disk_mib - 1`.
pub fn clamp_region(region: &FreeRegion, disk_mib: u64) -> Result<(u64, u64), PlanRejection> {
    let start = (region.start_mib.trunc() as u64).max(FIRST_PARTITION_START_MIB);
    let mut end = region.end_mib.trunc() as u64;
    if end >= disk_mib {
        end = disk_mib.saturating_sub(1);
    }
    if start >= disk_mib || end > disk_mib || start >= end {
        return Err(PlanRejection::RegionOutOfBounds {
            start_mib: start,
            end_mib: end,
            disk_mib,
        });
    }
    Ok((start, end))
}

fn plan_free_space(snapshot: &DriveSnapshot) -> Result<Vec<PartitionOp>, PlanRejection> {
    if snapshot.mbr_limit_reached() {
        return Err(PlanRejection::MbrPrimaryLimit);
    }
    let region = select_largest_region(&snapshot.free_regions)
        .ok_or_else(|| PlanRejection::NoFreeSpace(snapshot.drive.name.clone()))?;
    let (start, end) = clamp_region(region, snapshot.drive.size_mib())?;
    Ok(vec![root_partition(start, Boundary::Mib(end))])
}
