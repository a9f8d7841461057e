//! Disk preparation worker
//!
//! Executes a [`PartitionPlan`] against the drive, formats the partitions
//! the install needs and mounts the target root.
//!
//! ```text
//! Idle → Unmounting → Executing → Formatting → Mounting → Complete
//!                         └───────────┴────────────┴──→ Failed
//! ```
//!
//! The first hard failure ends the run with one `Error` event. Nothing is
//! rolled back: a drive that failed halfway stays in its halfway state.

use crate::config::PipelineSettings;
use crate::error::{InstallError, Result};
use crate::events::EventSender;
use crate::inventory::{Inventory, parse_partition_number};
use crate::planner::{PartitionOp, PartitionPlan, PartitionRole, PlanRejection};
use crate::runner::{CommandRunner, Invocation};
use crate::stage::{Stage, StageTracker};
use crate::types::{FsType, partition_device};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepPhase {
    Idle,
    Unmounting,
    Executing,
    Formatting,
    Mounting,
    Complete,
    Failed,
}

impl PrepPhase {
    /// Pipeline stage this phase runs under
    pub fn stage(self) -> Option<Stage> {
        match self {
            Self::Unmounting | Self::Executing => Some(Stage::Preparing),
            Self::Formatting => Some(Stage::Formatting),
            Self::Mounting => Some(Stage::Mounting),
            Self::Idle | Self::Complete | Self::Failed => None,
        }
    }
}

/// Devices of a prepared drive, handed to the install worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTarget {
    pub drive: String,
    pub root_device: PathBuf,
    /// Separate `/boot` of the BIOS wipe layout, mounted under the root
    pub boot_device: Option<PathBuf>,
    /// Created or reused ESP; not mounted yet
    pub esp_device: Option<PathBuf>,
    pub mount_root: PathBuf,
}

/// Partition numbers assumed during a dry run, where nothing is created
#[derive(Debug, Default)]
struct SimulatedTable {
    cleared: bool,
    removed: BTreeSet<u32>,
    added: BTreeSet<u32>,
}

impl SimulatedTable {
    /// Lowest number the kernel would hand out next
    fn next_number(&mut self, existing: &[String]) -> u32 {
        let mut taken: BTreeSet<u32> = if self.cleared {
            BTreeSet::new()
        } else {
            existing
                .iter()
                .filter_map(|name| parse_partition_number(name))
                .filter(|n| !self.removed.contains(n))
                .collect()
        };
        taken.extend(&self.added);
        let number = (1..).find(|n| !taken.contains(n)).unwrap_or(1);
        self.added.insert(number);
        number
    }
}

pub struct DiskPrepWorker {
    plan: PartitionPlan,
    settings: PipelineSettings,
    runner: Arc<dyn CommandRunner>,
    phase: PrepPhase,
    simulated: SimulatedTable,
}

impl DiskPrepWorker {
    pub fn new(plan: PartitionPlan, settings: PipelineSettings, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            plan,
            settings,
            runner,
            phase: PrepPhase::Idle,
            simulated: SimulatedTable::default(),
        }
    }

    pub fn phase(&self) -> PrepPhase {
        self.phase
    }

    /// Prepare the drive. Emits exactly one `Complete` or one `Error`.
    pub fn run(mut self, events: &EventSender, tracker: &mut StageTracker) -> Result<PreparedTarget> {
        events.log(format!("Starting disk preparation on /dev/{}", self.plan.drive));
        match self.execute(events, tracker) {
            Ok(target) => {
                self.phase = PrepPhase::Complete;
                events.log("Drive is ready.");
                events.complete();
                Ok(target)
            }
            Err(e) => {
                self.phase = PrepPhase::Failed;
                let stage = tracker.current();
                if let Err(te) = tracker.fail() {
                    warn!("could not record failure: {}", te);
                }
                events.error(format!("{} failed: {}", stage, e));
                Err(e)
            }
        }
    }

    fn enter(&mut self, phase: PrepPhase, tracker: &mut StageTracker) -> Result<()> {
        self.phase = phase;
        if let Some(stage) = phase.stage().filter(|s| *s != tracker.current()) {
            tracker.transition_to(stage)?;
        }
        Ok(())
    }

    fn execute(&mut self, events: &EventSender, tracker: &mut StageTracker) -> Result<PreparedTarget> {
        let runner = Arc::clone(&self.runner);
        let inventory = Inventory::new(runner.as_ref());

        self.enter(PrepPhase::Unmounting, tracker)?;
        self.unmount(&inventory, events);

        self.enter(PrepPhase::Executing, tracker)?;
        let created = self.execute_ops(&inventory, events)?;

        let drive = self.plan.drive.clone();
        let root_device = created
            .get(&PartitionRole::Root)
            .cloned()
            .or_else(|| self.plan.reuse_root.as_deref().map(dev_path))
            .ok_or_else(|| InstallError::validation("partition plan yields no root partition"))?;
        let boot_device = created.get(&PartitionRole::Boot).cloned();
        let created_esp = created.get(&PartitionRole::Esp).cloned();
        let esp_device = created_esp
            .clone()
            .or_else(|| self.plan.reuse_esp.as_deref().map(dev_path));

        self.enter(PrepPhase::Formatting, tracker)?;
        let mut to_format = vec![(root_device.clone(), FsType::Ext4)];
        if let Some(boot) = &boot_device {
            to_format.push((boot.clone(), FsType::Ext4));
        }
        if let Some(esp) = &created_esp {
            to_format.push((esp.clone(), FsType::Fat32));
        }
        for (device, _) in &to_format {
            if !inventory.wait_for_partition_node(device, self.settings.node_timeout_secs) {
                return Err(InstallError::DeviceNotReady {
                    path: device.clone(),
                    timeout_secs: self.settings.node_timeout_secs,
                });
            }
        }
        for (device, fs) in &to_format {
            events.log(format!("Formatting {} as {}...", device.display(), fs));
            let (program, flags) = fs.mkfs_command();
            self.runner.run_checked(
                &Invocation::mutation(program)
                    .args(flags.iter().copied())
                    .path_arg(device),
            )?;
        }

        self.enter(PrepPhase::Mounting, tracker)?;
        let mount_root = self.settings.mount_root.clone();
        events.log(format!("Mounting {} at {}...", root_device.display(), mount_root.display()));
        self.mkdir(&mount_root)?;
        self.mount(&root_device, &mount_root)?;
        if let Some(boot) = &boot_device {
            let boot_dir = mount_root.join("boot");
            events.log(format!("Mounting {} at {}...", boot.display(), boot_dir.display()));
            self.mkdir(&boot_dir)?;
            self.mount(boot, &boot_dir)?;
        }
        self.copy_install_image(events);

        Ok(PreparedTarget {
            drive,
            root_device,
            boot_device,
            esp_device,
            mount_root,
        })
    }

    // ========================================================================
    // Steps
    // ========================================================================

    /// Release everything mounted from the target. Failures only log.
    fn unmount(&self, inventory: &Inventory<'_>, events: &EventSender) {
        events.log(format!("Unmounting existing {}...", self.settings.mount_root.display()));
        self.best_effort(
            &Invocation::mutation("umount")
                .arg("-R")
                .path_arg(&self.settings.mount_root),
        );

        let target = self
            .plan
            .target_partition
            .as_deref()
            .unwrap_or(&self.plan.drive);
        for mountpoint in inventory.mountpoints(target) {
            events.log(format!("Unmounting {}...", mountpoint));
            self.best_effort(&Invocation::mutation("umount").arg("-f").arg(mountpoint));
        }
    }

    fn execute_ops(
        &mut self,
        inventory: &Inventory<'_>,
        events: &EventSender,
    ) -> Result<HashMap<PartitionRole, PathBuf>> {
        let mut created = HashMap::new();
        if self.plan.ops.is_empty() {
            events.log("Partition table left unchanged.");
            return Ok(created);
        }

        let parted = self
            .runner
            .locate_program("parted")
            .ok_or_else(|| InstallError::resource_not_found("parted"))?;
        let drive = self.plan.drive.clone();
        let ops = self.plan.ops.clone();
        let total = ops.len();

        for (i, op) in ops.iter().enumerate() {
            events.log(format!("[{}/{}] {}", i + 1, total, op));
            match op {
                PartitionOp::ShrinkFilesystem { partition, new_size_mib } => {
                    self.shrink_filesystem(partition, *new_size_mib)?;
                }
                PartitionOp::CreatePartition { flags, name, role, .. } => {
                    let before = inventory.partition_names(&drive);
                    self.parted(&parted, op)?;
                    inventory.refresh(&drive);

                    let number = self.find_new_partition(inventory, &before)?;
                    debug!("{:?} partition is number {}", role, number);
                    for flag in flags {
                        self.parted_raw(&parted, ["set".to_string(), number.to_string(), flag.to_string(), "on".to_string()])?;
                    }
                    if let Some(name) = name {
                        // msdos tables have no partition names
                        let invocation = self.parted_invocation(
                            &parted,
                            ["name".to_string(), number.to_string(), name.clone()],
                        );
                        self.best_effort(&invocation);
                    }
                    created.insert(*role, partition_device(&drive, number));
                    continue;
                }
                other => {
                    self.parted(&parted, other)?;
                    self.track_simulated(other);
                }
            }
            if op.changes_geometry() {
                inventory.refresh(&drive);
            }
        }
        Ok(created)
    }

    /// `e2fsck` must pass before `resize2fs` will shrink
    fn shrink_filesystem(&self, partition: &str, new_size_mib: u64) -> Result<()> {
        let device = dev_path(partition);
        let check = Invocation::mutation("e2fsck").args(["-f", "-y"]).path_arg(&device);
        let output = self.runner.run(&check)?;
        // 1 means errors were found and corrected
        if !matches!(output.exit_code, Some(0) | Some(1)) {
            return Err(InstallError::command_failed(
                check.command_line(),
                output.exit_code,
                output.stderr,
            ));
        }
        self.runner.run_checked(
            &Invocation::mutation("resize2fs")
                .path_arg(&device)
                .arg(format!("{}M", new_size_mib)),
        )?;
        Ok(())
    }

    /// The one partition present now that was not in `before`
    fn find_new_partition(&mut self, inventory: &Inventory<'_>, before: &[String]) -> Result<u32> {
        let after = inventory.partition_names(&self.plan.drive);
        let new: Vec<&String> = after.iter().filter(|name| !before.contains(name)).collect();
        match new.as_slice() {
            [name] => parse_partition_number(name)
                .ok_or_else(|| PlanRejection::AmbiguousPartitionNumber((*name).clone()).into()),
            [] if self.runner.is_simulated() => Ok(self.simulated.next_number(before)),
            [] => Err(InstallError::resource_not_found(format!(
                "newly created partition on /dev/{}",
                self.plan.drive
            ))),
            many => Err(PlanRejection::AmbiguousPartitionNumber(
                many.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(","),
            )
            .into()),
        }
    }

    fn track_simulated(&mut self, op: &PartitionOp) {
        if !self.runner.is_simulated() {
            return;
        }
        match op {
            PartitionOp::CreateTable(_) => {
                self.simulated = SimulatedTable {
                    cleared: true,
                    ..SimulatedTable::default()
                };
            }
            PartitionOp::DeletePartition(number) => {
                self.simulated.removed.insert(*number);
                self.simulated.added.remove(number);
            }
            _ => {}
        }
    }

    fn copy_install_image(&self, events: &EventSender) {
        let iso = &self.settings.iso_path;
        if !self.runner.path_exists(iso) {
            debug!("no installation image at {}", iso.display());
            return;
        }
        let file_name = iso.file_name().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("archlinux.iso"));
        let dest = self.settings.mount_root.join(file_name);
        events.log(format!("Copying {} to {}...", iso.display(), dest.display()));
        self.best_effort(&Invocation::mutation("cp").path_arg(iso).path_arg(&dest));
    }

    // ========================================================================
    // Command helpers
    // ========================================================================

    fn parted_invocation<I, S>(&self, parted: &Path, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation::mutation(parted.display().to_string())
            .arg("--script")
            .path_arg(&dev_path(&self.plan.drive))
            .args(args)
    }

    fn parted_raw<I, S>(&self, parted: &Path, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runner.run_checked(&self.parted_invocation(parted, args))?;
        Ok(())
    }

    fn parted(&self, parted: &Path, op: &PartitionOp) -> Result<()> {
        match op.parted_args() {
            Some(args) => self.parted_raw(parted, args),
            None => Ok(()),
        }
    }

    fn mkdir(&self, dir: &Path) -> Result<()> {
        self.runner
            .run_checked(&Invocation::mutation("mkdir").arg("-p").path_arg(dir))?;
        Ok(())
    }

    fn mount(&self, device: &Path, at: &Path) -> Result<()> {
        self.runner
            .run_checked(&Invocation::mutation("mount").path_arg(device).path_arg(at))?;
        Ok(())
    }

    fn best_effort(&self, invocation: &Invocation) {
        match self.runner.run(invocation) {
            Ok(out) if out.success() => {}
            Ok(out) => debug!(
                "`{}` exited with {:?}: {}",
                invocation.command_line(),
                out.exit_code,
                out.stderr.trim()
            ),
            Err(e) => warn!("`{}` could not run: {}", invocation.command_line(), e),
        }
    }
}

fn dev_path(name: &str) -> PathBuf {
    Path::new("/dev").join(crate::types::strip_dev(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{WorkerEvent, channel};
    use crate::inventory::{Drive, DriveSnapshot, FreeRegion, PARTITION_COLUMNS, Partition};
    use crate::planner::{InstallPlan, plan};
    use crate::runner::{DryRunRunner, ScriptedRunner};
    use crate::types::{BootMode, InstallMode, MIB, TableType};
    use std::time::Duration;

    fn empty_snapshot(name: &str, size_mib: u64) -> DriveSnapshot {
        DriveSnapshot::from_drive(
            Drive {
                name: name.to_string(),
                size_bytes: size_mib * MIB,
                table: TableType::Unknown,
                partitions: Vec::new(),
            },
            Vec::new(),
        )
    }

    fn wipe_plan(boot: BootMode) -> PartitionPlan {
        let request = InstallPlan::new(InstallMode::WipeDrive, boot, "sdb", None).unwrap();
        plan(&request, &empty_snapshot("sdb", 20 * 1024)).unwrap()
    }

    fn lsblk_parts(runner: &ScriptedRunner, listings: &[&str]) {
        for listing in listings {
            runner.respond_once("lsblk", &["-o", PARTITION_COLUMNS], listing);
        }
    }

    fn run_worker(
        plan: PartitionPlan,
        runner: Arc<dyn CommandRunner>,
    ) -> (Result<PreparedTarget>, Vec<WorkerEvent>, StageTracker) {
        let (tx, rx) = channel(1024);
        let mut tracker = StageTracker::new();
        let result = DiskPrepWorker::new(plan, PipelineSettings::default(), runner).run(&tx, &mut tracker);
        drop(tx);
        (result, rx.drain(), tracker)
    }

    /// A GPT `sdb` holding `partitions`, with `free` reported by parted
    fn gpt_snapshot(size_mib: u64, partitions: Vec<Partition>, free: Vec<FreeRegion>) -> DriveSnapshot {
        DriveSnapshot::from_drive(
            Drive {
                name: "sdb".to_string(),
                size_bytes: size_mib * MIB,
                table: TableType::Gpt,
                partitions,
            },
            free,
        )
    }

    fn ext4_partition(number: u32, start_mib: u64, size_mib: u64) -> Partition {
        Partition {
            name: format!("sdb{}", number),
            drive: "sdb".to_string(),
            number: Some(number),
            start_sector: start_mib * 2048,
            size_bytes: size_mib * MIB,
            fs_type: Some("ext4".to_string()),
            part_type: None,
            flags: None,
            mountpoint: None,
        }
    }

    fn in_order(commands: &[String], expected: &[&str]) -> bool {
        let mut cursor = 0;
        for cmd in commands {
            if cursor < expected.len() && cmd == expected[cursor] {
                cursor += 1;
            }
        }
        cursor == expected.len()
    }

    const SDB1: &str = "sdb1 part 2048 536870912 ext4\n";
    const SDB12: &str = "sdb1 part 2048 536870912 ext4\nsdb2 part 1050624 20936916992 ext4\n";

    #[test]
    fn test_wipe_bios_layout_and_mounts() {
        let runner = Arc::new(ScriptedRunner::new());
        lsblk_parts(&runner, &["", SDB1, SDB1, SDB12]);

        let (result, events, tracker) = run_worker(wipe_plan(BootMode::Bios), runner.clone());
        let target = result.unwrap();
        assert_eq!(target.root_device, PathBuf::from("/dev/sdb2"));
        assert_eq!(target.boot_device, Some(PathBuf::from("/dev/sdb1")));
        assert_eq!(target.esp_device, None);
        assert_eq!(tracker.current(), Stage::Mounting);
        assert_eq!(events.last(), Some(&WorkerEvent::Complete));

        let mutations = runner.mutations();
        let expect_in_order = [
            "/usr/bin/parted --script /dev/sdb mklabel msdos",
            "/usr/bin/parted --script /dev/sdb mkpart primary ext4 1MiB 513MiB",
            "/usr/bin/parted --script /dev/sdb set 1 boot on",
            "/usr/bin/parted --script /dev/sdb mkpart primary ext4 513MiB 100%",
            "mkfs.ext4 -F /dev/sdb2",
            "mkfs.ext4 -F /dev/sdb1",
            "mount /dev/sdb2 /mnt",
            "mkdir -p /mnt/boot",
            "mount /dev/sdb1 /mnt/boot",
        ];
        let mut cursor = 0;
        for cmd in &mutations {
            if cursor < expect_in_order.len() && cmd == expect_in_order[cursor] {
                cursor += 1;
            }
        }
        assert_eq!(cursor, expect_in_order.len(), "mutations: {:#?}", mutations);
    }

    #[test]
    fn test_efi_split_shrinks_then_adds_esp() {
        let runner = Arc::new(ScriptedRunner::new());
        lsblk_parts(
            &runner,
            &[
                "sdb1 part 2048 9948889088 ext4\n",
                "sdb1 part 2048 9948889088 ext4\nsdb2 part 19433472 536870912 vfat\n",
            ],
        );
        let snap = gpt_snapshot(20480, vec![ext4_partition(1, 1, 10000)], Vec::new());
        let request = InstallPlan::new(InstallMode::UsePartition, BootMode::Efi, "sdb", Some("sdb1")).unwrap();

        let (result, events, _) = run_worker(plan(&request, &snap).unwrap(), runner.clone());
        let target = result.unwrap();
        assert_eq!(target.root_device, PathBuf::from("/dev/sdb1"));
        assert_eq!(target.esp_device, Some(PathBuf::from("/dev/sdb2")));
        assert_eq!(target.boot_device, None);
        assert_eq!(events.last(), Some(&WorkerEvent::Complete));

        let mutations = runner.mutations();
        assert!(
            in_order(
                &mutations,
                &[
                    "e2fsck -f -y /dev/sdb1",
                    "resize2fs /dev/sdb1 9488M",
                    "/usr/bin/parted --script /dev/sdb resizepart 1 9489MiB",
                    "/usr/bin/parted --script /dev/sdb mkpart primary fat32 9489MiB 10001MiB",
                    "/usr/bin/parted --script /dev/sdb set 2 esp on",
                    "/usr/bin/parted --script /dev/sdb set 2 boot on",
                    "/usr/bin/parted --script /dev/sdb name 2 ESP",
                    "mkfs.ext4 -F /dev/sdb1",
                    "mkfs.fat -F32 /dev/sdb2",
                    "mount /dev/sdb1 /mnt",
                ]
            ),
            "mutations: {:#?}",
            mutations
        );
    }

    #[test]
    fn test_bios_on_gpt_rebuilds_with_bios_grub() {
        const BIOS1: &str = "sdb1 part 2048 1048576 \n";
        let runner = Arc::new(ScriptedRunner::new());
        lsblk_parts(
            &runner,
            &["", BIOS1, BIOS1, "sdb1 part 2048 1048576 \nsdb2 part 4096 10484711424 \n"],
        );
        let snap = gpt_snapshot(20480, vec![ext4_partition(1, 1, 10000)], Vec::new());
        let request = InstallPlan::new(InstallMode::UsePartition, BootMode::Bios, "sdb", Some("sdb1")).unwrap();

        let (result, _, _) = run_worker(plan(&request, &snap).unwrap(), runner.clone());
        let target = result.unwrap();
        // Root comes from the listing diff, not the number the old partition had
        assert_eq!(target.root_device, PathBuf::from("/dev/sdb2"));
        assert_eq!(target.boot_device, None);

        let mutations = runner.mutations();
        assert!(
            in_order(
                &mutations,
                &[
                    "/usr/bin/parted --script /dev/sdb rm 1",
                    "/usr/bin/parted --script /dev/sdb mkpart primary 1MiB 2MiB",
                    "/usr/bin/parted --script /dev/sdb set 1 bios_grub on",
                    "/usr/bin/parted --script /dev/sdb mkpart primary ext4 2MiB 10001MiB",
                    "mkfs.ext4 -F /dev/sdb2",
                    "mount /dev/sdb2 /mnt",
                ]
            ),
            "mutations: {:#?}",
            mutations
        );
        assert!(!mutations.iter().any(|m| m.ends_with("/dev/sdb1") && m.starts_with("mkfs")));
    }

    #[test]
    fn test_free_space_creates_one_root_partition() {
        const EXISTING: &str = "sdb1 part 2048 10485760000 ext4\n";
        let runner = Arc::new(ScriptedRunner::new());
        lsblk_parts(&runner, &[EXISTING, "sdb1 part 2048 10485760000 ext4\nsdb2 part 20482048 10987175936 \n"]);
        let free = vec![FreeRegion {
            start_mib: 10001.0,
            end_mib: 20480.0,
            size_mib: 10479.0,
        }];
        let snap = gpt_snapshot(20480, vec![ext4_partition(1, 1, 10000)], free);
        let request = InstallPlan::new(InstallMode::UseFreeSpace, BootMode::Bios, "sdb", None).unwrap();

        let (result, _, _) = run_worker(plan(&request, &snap).unwrap(), runner.clone());
        assert_eq!(result.unwrap().root_device, PathBuf::from("/dev/sdb2"));

        let mutations = runner.mutations();
        let mkparts: Vec<&String> = mutations.iter().filter(|m| m.contains(" mkpart ")).collect();
        assert_eq!(
            mkparts,
            vec!["/usr/bin/parted --script /dev/sdb mkpart primary ext4 10001MiB 20479MiB"]
        );
        assert!(
            in_order(&mutations, &["mkfs.ext4 -F /dev/sdb2", "mkdir -p /mnt", "mount /dev/sdb2 /mnt"]),
            "mutations: {:#?}",
            mutations
        );
        assert!(!mutations.iter().any(|m| m.contains("/dev/sdb1")), "the existing partition is untouched");
    }

    #[test]
    fn test_refresh_follows_every_geometry_change() {
        let runner = Arc::new(ScriptedRunner::new());
        lsblk_parts(&runner, &["", SDB1, SDB1, SDB12]);
        run_worker(wipe_plan(BootMode::Bios), runner.clone()).0.unwrap();

        let partprobes = runner
            .commands()
            .iter()
            .filter(|c| c.as_str() == "partprobe /dev/sdb")
            .count();
        // mklabel + two mkparts; set-flag does not move boundaries
        assert_eq!(partprobes, 3);
    }

    #[test]
    fn test_reused_partition_needs_no_parted() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.remove_program("parted");
        runner.respond("lsblk", &["-o", "MOUNTPOINT", "/dev/sda3"], "/home\n");

        let snapshot = DriveSnapshot::from_drive(
            Drive {
                name: "sda".to_string(),
                size_bytes: 100 * 1024 * MIB,
                table: TableType::Dos,
                partitions: vec![Partition {
                    name: "sda3".to_string(),
                    drive: "sda".to_string(),
                    number: Some(3),
                    start_sector: 2048,
                    size_bytes: 50 * 1024 * MIB,
                    fs_type: Some("ext4".to_string()),
                    part_type: None,
                    flags: None,
                    mountpoint: Some("/home".to_string()),
                }],
            },
            Vec::new(),
        );
        let request = InstallPlan::new(InstallMode::UsePartition, BootMode::Bios, "sda", Some("sda3")).unwrap();
        let plan = plan(&request, &snapshot).unwrap();

        let (result, events, _) = run_worker(plan, runner.clone());
        assert_eq!(result.unwrap().root_device, PathBuf::from("/dev/sda3"));
        assert_eq!(events.last(), Some(&WorkerEvent::Complete));
        let mutations = runner.mutations();
        assert_eq!(mutations[0], "umount -R /mnt");
        assert_eq!(mutations[1], "umount -f /home");
        assert!(mutations.contains(&"mkfs.ext4 -F /dev/sda3".to_string()));
    }

    #[test]
    fn test_missing_parted_is_resource_not_found() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.remove_program("parted");
        let (result, events, tracker) = run_worker(wipe_plan(BootMode::Efi), runner.clone());
        assert!(matches!(result, Err(InstallError::ResourceNotFound(_))));
        assert_eq!(tracker.failed_at(), Some(Stage::Preparing));
        let errors: Vec<_> = events.iter().filter(|e| matches!(e, WorkerEvent::Error(_))).collect();
        assert_eq!(errors.len(), 1);
        assert!(!events.contains(&WorkerEvent::Complete));
        assert!(runner.mutations().iter().all(|c| c.starts_with("umount")));
    }

    #[test]
    fn test_device_node_timeout() {
        let runner = Arc::new(ScriptedRunner::new());
        lsblk_parts(
            &runner,
            &[
                "",
                "sdb1 part 2048 1 vfat\n",
                "sdb1 part 2048 1 vfat\n",
                "sdb1 part 2048 1 vfat\nsdb2 part 4096 1 ext4\n",
            ],
        );
        runner.remove_path("/dev/sdb2");

        let (result, events, _) = run_worker(wipe_plan(BootMode::Efi), runner.clone());
        match result {
            Err(InstallError::DeviceNotReady { path, timeout_secs }) => {
                assert_eq!(path, PathBuf::from("/dev/sdb2"));
                assert_eq!(timeout_secs, 10);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(runner.slept(), Duration::from_secs(10));
        assert!(runner.mutations().iter().all(|c| !c.starts_with("mkfs")));
        assert!(matches!(events.last(), Some(WorkerEvent::Error(_))));
    }

    #[test]
    fn test_format_failure_stops_before_mount() {
        let runner = Arc::new(ScriptedRunner::new());
        lsblk_parts(&runner, &["", SDB1, SDB1, SDB12]);
        runner.fail("mkfs.ext4", &[], 1, "mkfs.ext4: Device or resource busy");

        let (result, events, tracker) = run_worker(wipe_plan(BootMode::Bios), runner.clone());
        assert!(matches!(result, Err(InstallError::CommandFailed { .. })));
        assert_eq!(tracker.failed_at(), Some(Stage::Formatting));
        assert!(runner.mutations().iter().all(|c| !c.starts_with("mount")));
        match events.last() {
            Some(WorkerEvent::Error(msg)) => {
                assert!(msg.starts_with("Formatting partitions failed"));
                assert!(msg.contains("resource busy"));
            }
            other => panic!("unexpected last event: {:?}", other),
        }
    }

    #[test]
    fn test_two_new_partitions_is_ambiguous() {
        let runner = Arc::new(ScriptedRunner::new());
        lsblk_parts(&runner, &["", SDB12]);
        let (result, _, _) = run_worker(wipe_plan(BootMode::Efi), runner);
        assert!(matches!(
            result,
            Err(InstallError::PlanRejected(PlanRejection::AmbiguousPartitionNumber(_)))
        ));
    }

    #[test]
    fn test_no_new_partition_on_real_run() {
        let runner = Arc::new(ScriptedRunner::new());
        let (result, _, _) = run_worker(wipe_plan(BootMode::Efi), runner);
        assert!(matches!(result, Err(InstallError::ResourceNotFound(_))));
    }

    #[test]
    fn test_shrink_accepts_corrected_fsck() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.fail("e2fsck", &[], 1, "FILE SYSTEM WAS MODIFIED");
        let worker = DiskPrepWorker::new(wipe_plan(BootMode::Efi), PipelineSettings::default(), runner.clone());
        worker.shrink_filesystem("sda2", 4096).unwrap();
        assert_eq!(
            runner.mutations(),
            vec!["e2fsck -f -y /dev/sda2", "resize2fs /dev/sda2 4096M"]
        );

        runner.fail("e2fsck", &[], 4, "errors left uncorrected");
        assert!(worker.shrink_filesystem("sda2", 4096).is_err());
    }

    #[test]
    fn test_dry_run_predicts_partition_numbers() {
        let inner = Arc::new(ScriptedRunner::new());
        inner.respond("lsblk", &["-o", PARTITION_COLUMNS], "sdb1 part 2048 1 ntfs\nsdb2 part 4096 1 ntfs\n");
        let dry = Arc::new(DryRunRunner::new(inner.clone()));

        let (result, events, _) = run_worker(wipe_plan(BootMode::Efi), dry.clone());
        let target = result.unwrap();
        assert_eq!(target.esp_device, Some(PathBuf::from("/dev/sdb1")));
        assert_eq!(target.root_device, PathBuf::from("/dev/sdb2"));
        assert_eq!(events.last(), Some(&WorkerEvent::Complete));
        assert!(inner.mutations().is_empty());
        assert!(dry.skipped().iter().any(|inv| inv.command_line() == "mkfs.fat -F32 /dev/sdb1"));
    }

    #[test]
    fn test_iso_copied_when_present() {
        let runner = Arc::new(ScriptedRunner::new());
        lsblk_parts(&runner, &["", SDB1, SDB1, SDB12]);
        runner.add_path("/tmp/archlinux.iso");
        run_worker(wipe_plan(BootMode::Efi), runner.clone()).0.unwrap();
        assert_eq!(
            runner.mutations().last().map(String::as_str),
            Some("cp /tmp/archlinux.iso /mnt/archlinux.iso")
        );
    }

    #[test]
    fn test_phase_stage_mapping() {
        assert_eq!(PrepPhase::Unmounting.stage(), Some(Stage::Preparing));
        assert_eq!(PrepPhase::Executing.stage(), Some(Stage::Preparing));
        assert_eq!(PrepPhase::Formatting.stage(), Some(Stage::Formatting));
        assert_eq!(PrepPhase::Complete.stage(), None);
    }
}
