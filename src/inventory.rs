//! Block device inventory
//!
//! Wraps `lsblk`, `parted print free`, `partprobe` and `udevadm` behind typed
//! accessors. Parsing lives in pure `parse_*` functions that are tested
//! against captured tool output; they skip malformed lines and never panic.
//!
//! Query failures are not fatal here: a failing `lsblk` is logged and the
//! accessor returns an empty result. Only mutating callers turn exit codes
//! into errors.

use crate::runner::{CommandRunner, Invocation};
use crate::types::{TableType, bytes_to_mib, strip_dev};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// GPT type GUID of a BIOS boot partition (GRUB core image)
pub const BIOS_BOOT_GUID: &str = "21686148-6449-6e6f-744e-656564454649";
/// GPT type GUID of an EFI System Partition
pub const ESP_GUID: &str = "c12a7328-f81f-11d2-ba4b-00a0c93ec93b";
/// MBR partition type id of an EFI System Partition
pub const ESP_MBR_TYPE: &str = "0xef";
/// Size of the sectors lsblk reports START in
pub const KERNEL_SECTOR: u64 = 512;

// ============================================================================
// Data model
// ============================================================================

/// A whole disk as seen at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Drive {
    pub name: String,
    pub size_bytes: u64,
    pub table: TableType,
    pub partitions: Vec<Partition>,
}

impl Drive {
    pub fn path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/{}", self.name))
    }

    pub fn size_mib(&self) -> u64 {
        bytes_to_mib(self.size_bytes)
    }

    pub fn find_partition(&self, name: &str) -> Option<&Partition> {
        let name = strip_dev(name);
        self.partitions.iter().find(|p| p.name == name)
    }
}

/// One partition row from `lsblk`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Partition {
    pub name: String,
    pub drive: String,
    /// Parsed from the trailing digits of the name; `None` if that fails
    pub number: Option<u32>,
    /// In 512-byte kernel sectors
    pub start_sector: u64,
    pub size_bytes: u64,
    pub fs_type: Option<String>,
    pub part_type: Option<String>,
    pub flags: Option<String>,
    pub mountpoint: Option<String>,
}

impl Partition {
    pub fn path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/{}", self.name))
    }

    pub fn start_bytes(&self) -> u64 {
        self.start_sector * KERNEL_SECTOR
    }

    pub fn start_mib(&self) -> u64 {
        bytes_to_mib(self.start_bytes())
    }

    pub fn size_mib(&self) -> u64 {
        bytes_to_mib(self.size_bytes)
    }

    /// Start plus size, in whole MiB
    pub fn end_mib(&self) -> u64 {
        self.start_mib() + self.size_mib()
    }

    pub fn is_bios_boot(&self) -> bool {
        is_bios_boot_marker(self.flags.as_deref(), self.part_type.as_deref())
    }

    pub fn is_esp(&self) -> bool {
        is_esp_marker(self.part_type.as_deref())
    }
}

/// Unallocated extent from `parted -m unit MiB print free`, in MiB
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FreeRegion {
    pub start_mib: f64,
    pub end_mib: f64,
    pub size_mib: f64,
}

/// Everything the planner needs to know about one drive
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriveSnapshot {
    pub drive: Drive,
    pub free_regions: Vec<FreeRegion>,
    pub has_bios_boot: bool,
    pub has_esp: bool,
    pub primary_partition_count: usize,
}

impl DriveSnapshot {
    /// Build a snapshot from an already-described drive
    pub fn from_drive(drive: Drive, free_regions: Vec<FreeRegion>) -> Self {
        let has_bios_boot = drive.partitions.iter().any(Partition::is_bios_boot);
        let has_esp = drive.partitions.iter().any(Partition::is_esp);
        let primary_partition_count = drive.partitions.len();
        Self {
            drive,
            free_regions,
            has_bios_boot,
            has_esp,
            primary_partition_count,
        }
    }

    /// MBR tables hold at most four primary partitions
    pub fn mbr_limit_reached(&self) -> bool {
        self.drive.table == TableType::Dos && self.primary_partition_count >= 4
    }

    pub fn esp(&self) -> Option<&Partition> {
        self.drive.partitions.iter().find(|p| p.is_esp())
    }
}

// ============================================================================
// Parsers
// ============================================================================

fn is_bios_boot_marker(flags: Option<&str>, part_type: Option<&str>) -> bool {
    flags.is_some_and(|f| f.to_ascii_lowercase().contains("bios_grub"))
        || part_type.is_some_and(|t| t.eq_ignore_ascii_case(BIOS_BOOT_GUID))
}

fn is_esp_marker(part_type: Option<&str>) -> bool {
    part_type.is_some_and(|t| t.eq_ignore_ascii_case(ESP_GUID) || t.eq_ignore_ascii_case(ESP_MBR_TYPE))
}

/// `lsblk -d -n -b -o NAME,SIZE,TYPE` → `(name, size_bytes)` of real disks
pub fn parse_drive_list(output: &str) -> Vec<(String, u64)> {
    output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 3 || cols[2] != "disk" {
                return None;
            }
            let name = cols[0];
            if ["loop", "ram", "zram", "sr"].iter().any(|p| name.starts_with(p)) {
                return None;
            }
            let size = cols[1].parse().ok()?;
            Some((name.to_string(), size))
        })
        .collect()
}

/// `lsblk -n -r -o PARTFLAGS,PARTTYPE` contains a BIOS boot partition.
///
/// Raw mode separates columns with a single space and leaves empty columns
/// empty, so lines are scanned token by token instead of by position.
pub fn parse_bios_boot(output: &str) -> bool {
    output.lines().any(|line| {
        let lower = line.to_ascii_lowercase();
        lower.contains("bios_grub") || lower.split(' ').any(|tok| tok == BIOS_BOOT_GUID)
    })
}

/// `lsblk -n -r -o PARTFLAGS,PARTTYPE` contains an EFI System Partition
pub fn parse_esp(output: &str) -> bool {
    output
        .lines()
        .any(|line| line.split(' ').any(|tok| is_esp_marker(Some(tok))))
}

/// `lsblk -n -r -o TYPE` → number of `part` rows
pub fn parse_partition_count(output: &str) -> usize {
    output.lines().filter(|line| line.trim() == "part").count()
}

/// Undo lsblk's `\x20`-style escaping in raw mode
fn unescape_raw(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(pos) = rest.find("\\x") {
        out.push_str(&rest[..pos]);
        let hex = rest.get(pos + 2..pos + 4);
        match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
            Some(byte) => {
                out.push(byte as char);
                rest = &rest[pos + 4..];
            }
            None => {
                out.push_str("\\x");
                rest = &rest[pos + 2..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .filter(|v| !v.is_empty())
        .map(unescape_raw)
}

/// Trailing decimal digits of a partition name (`sda3` → 3, `nvme0n1p2` → 2)
pub fn parse_partition_number(name: &str) -> Option<u32> {
    let digits = name.len() - name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 || digits == name.len() {
        return None;
    }
    name[name.len() - digits..].parse().ok()
}

/// Columns requested for [`parse_partitions`]
pub const PARTITION_COLUMNS: &str = "NAME,TYPE,START,SIZE,FSTYPE,PARTTYPE,PARTFLAGS,MOUNTPOINT";

/// `lsblk -b -n -r -o NAME,TYPE,START,SIZE,FSTYPE,PARTTYPE,PARTFLAGS,MOUNTPOINT`
/// → partitions of `drive`, in output order. Rows that are not `part` or
/// whose START/SIZE don't parse are skipped.
pub fn parse_partitions(drive: &str, output: &str) -> Vec<Partition> {
    output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split(' ').collect();
            if cols.len() < 4 || cols[1] != "part" {
                return None;
            }
            let name = cols[0].to_string();
            Some(Partition {
                number: parse_partition_number(&name),
                start_sector: cols[2].parse().ok()?,
                size_bytes: cols[3].parse().ok()?,
                fs_type: non_empty(cols.get(4).copied()),
                part_type: non_empty(cols.get(5).copied()),
                flags: non_empty(cols.get(6).copied()),
                mountpoint: non_empty(cols.get(7).copied()),
                drive: drive.to_string(),
                name,
            })
        })
        .collect()
}

/// `lsblk -n -r -o MOUNTPOINT` → real mountpoints, skipping swap and blanks
pub fn parse_mountpoints(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|mp| !mp.is_empty() && *mp != "[SWAP]")
        .map(unescape_raw)
        .collect()
}

fn parse_mib(value: &str) -> Option<f64> {
    let value: f64 = value.trim().trim_end_matches("MiB").parse().ok()?;
    (value.is_finite() && value >= 0.0).then_some(value)
}

/// `parted -m <dev> unit MiB print free` → free regions in listing order.
///
/// Machine output rows look like `1:0.02MiB:1.00MiB:0.98MiB:free;`.
pub fn parse_free_regions(output: &str) -> Vec<FreeRegion> {
    output
        .lines()
        .filter(|line| line.trim_end_matches(';').ends_with("free"))
        .filter_map(|line| {
            let cols: Vec<&str> = line.split(':').collect();
            if cols.len() < 4 {
                return None;
            }
            Some(FreeRegion {
                start_mib: parse_mib(cols[1])?,
                end_mib: parse_mib(cols[2])?,
                size_mib: parse_mib(cols[3])?,
            })
        })
        .collect()
}

// ============================================================================
// Inventory
// ============================================================================

/// Typed view over the block device tools
pub struct Inventory<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> Inventory<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    /// Run a query, returning stdout or an empty string on any failure
    fn query(&self, invocation: Invocation) -> String {
        match self.runner.run(&invocation) {
            Ok(out) if out.success() => out.stdout,
            Ok(out) => {
                warn!(
                    "`{}` exited with {:?}: {}",
                    invocation.command_line(),
                    out.exit_code,
                    out.stderr.trim()
                );
                String::new()
            }
            Err(e) => {
                warn!("`{}` could not run: {}", invocation.command_line(), e);
                String::new()
            }
        }
    }

    fn lsblk(&self) -> Invocation {
        Invocation::query("lsblk")
    }

    /// Disks of kind "disk", excluding loop/ram/optical devices, fully described
    pub fn list_drives(&self) -> Vec<Drive> {
        let output = self.query(self.lsblk().args(["-d", "-n", "-b", "-o", "NAME,SIZE,TYPE"]));
        parse_drive_list(&output)
            .into_iter()
            .map(|(name, size_bytes)| Drive {
                table: self.table_type(&name),
                partitions: self.describe_partitions(&name),
                name,
                size_bytes,
            })
            .collect()
    }

    pub fn table_type(&self, drive: &str) -> TableType {
        let output = self.query(self.lsblk().args(["-d", "-n", "-o", "PTTYPE"]).arg(dev(drive)));
        TableType::from_lsblk(&output)
    }

    fn partition_markers(&self, drive: &str) -> String {
        self.query(
            self.lsblk()
                .args(["-n", "-r", "-o", "PARTFLAGS,PARTTYPE"])
                .arg(dev(drive)),
        )
    }

    pub fn has_bios_boot_partition(&self, drive: &str) -> bool {
        parse_bios_boot(&self.partition_markers(drive))
    }

    pub fn has_esp(&self, drive: &str) -> bool {
        parse_esp(&self.partition_markers(drive))
    }

    pub fn primary_partition_count(&self, drive: &str) -> usize {
        parse_partition_count(&self.query(self.lsblk().args(["-n", "-r", "-o", "TYPE"]).arg(dev(drive))))
    }

    pub fn mbr_limit_reached(&self, drive: &str) -> bool {
        self.table_type(drive) == TableType::Dos && self.primary_partition_count(drive) >= 4
    }

    pub fn describe_partitions(&self, drive: &str) -> Vec<Partition> {
        let drive = strip_dev(drive);
        let output = self.query(
            self.lsblk()
                .args(["-b", "-n", "-r", "-o", PARTITION_COLUMNS])
                .arg(dev(drive)),
        );
        parse_partitions(drive, &output)
    }

    pub fn partition_names(&self, drive: &str) -> Vec<String> {
        self.describe_partitions(drive)
            .into_iter()
            .map(|p| p.name)
            .collect()
    }

    /// Mountpoints of `device` and anything below it
    pub fn mountpoints(&self, device: &str) -> Vec<String> {
        parse_mountpoints(&self.query(self.lsblk().args(["-n", "-r", "-o", "MOUNTPOINT"]).arg(dev(device))))
    }

    /// Parent disk of a partition (`sda2` → `sda`)
    pub fn parent_drive(&self, partition: &str) -> Option<String> {
        let output = self.query(self.lsblk().args(["-n", "-d", "-o", "PKNAME"]).arg(dev(partition)));
        let parent = output.trim();
        (!parent.is_empty()).then(|| parent.to_string())
    }

    pub fn disk_size_bytes(&self, drive: &str) -> Option<u64> {
        self.query(self.lsblk().args(["-b", "-d", "-n", "-o", "SIZE"]).arg(dev(drive)))
            .trim()
            .parse()
            .ok()
    }

    pub fn free_regions(&self, drive: &str) -> Vec<FreeRegion> {
        let parted = self
            .runner
            .locate_program("parted")
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "parted".to_string());
        let output = self.query(
            Invocation::query(parted)
                .privileged()
                .arg("-m")
                .arg(dev(drive))
                .args(["unit", "MiB", "print", "free"]),
        );
        parse_free_regions(&output)
    }

    /// Re-read the partition table and wait for udev. Failures only warn.
    pub fn refresh(&self, drive: &str) {
        for invocation in [
            Invocation::mutation("partprobe").arg(dev(drive)),
            Invocation::mutation("udevadm").arg("settle"),
        ] {
            match self.runner.run(&invocation) {
                Ok(out) if out.success() => {}
                Ok(out) => warn!("`{}` failed: {}", invocation.command_line(), out.stderr.trim()),
                Err(e) => warn!("`{}` could not run: {}", invocation.command_line(), e),
            }
        }
    }

    /// Poll once per second until `path` exists, for at most `timeout_secs`
    pub fn wait_for_partition_node(&self, path: &Path, timeout_secs: u64) -> bool {
        for elapsed in 0..=timeout_secs {
            if self.runner.path_exists(path) {
                debug!("{} present after {}s", path.display(), elapsed);
                return true;
            }
            if elapsed < timeout_secs {
                self.runner.sleep(Duration::from_secs(1));
            }
        }
        false
    }

    /// Query everything the planner reads about `drive`
    pub fn snapshot(&self, drive: &str) -> DriveSnapshot {
        let name = strip_dev(drive).to_string();
        let table = self.table_type(&name);
        let partitions = self.describe_partitions(&name);
        let size_bytes = self.disk_size_bytes(&name).unwrap_or(0);
        let free_regions = self.free_regions(&name);
        let has_bios_boot = self.has_bios_boot_partition(&name);
        let has_esp = self.has_esp(&name);
        let primary_partition_count = self.primary_partition_count(&name);
        DriveSnapshot {
            drive: Drive {
                name,
                size_bytes,
                table,
                partitions,
            },
            free_regions,
            has_bios_boot,
            has_esp,
            primary_partition_count,
        }
    }
}

fn dev(name: &str) -> String {
    format!("/dev/{}", strip_dev(name))
}
