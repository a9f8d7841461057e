//! Bootstrap and base-install worker
//!
//! Takes a mounted target root and turns it into a bootable system:
//! bootstrap image, package keys, base packages, system configuration,
//! the primary user, GRUB and optionally a desktop.
//!
//! Every step runs once and must succeed before the next one starts. The
//! first failure is reported as a single `Error` event prefixed with the
//! stage it happened in; completed steps stay done.

use crate::config::{Credentials, PipelineSettings};
use crate::desktop::Desktop;
use crate::disk_prep::PreparedTarget;
use crate::error::{InstallError, Result};
use crate::events::EventSender;
use crate::runner::{CommandRunner, Invocation};
use crate::stage::{Stage, StageTracker};
use crate::types::BootMode;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Installed into every target
pub const BASE_PACKAGES: &[&str] = &[
    "base",
    "linux",
    "linux-firmware",
    "grub",
    "os-prober",
    "sudo",
    "networkmanager",
];

/// Added for EFI installs
pub const EFI_PACKAGES: &[&str] = &["efibootmgr"];

/// Host files copied into the target before the bootstrap image lands
const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";
const HOST_MIRRORLIST: &str = "/etc/pacman.d/mirrorlist";

/// ESP mount point inside the target, as GRUB sees it
const EFI_DIRECTORY: &str = "/boot/efi";

const LINUX_PRESET_PATH: &str = "etc/mkinitcpio.d/linux.preset";

/// The stock preset references kernel paths that don't exist before the
/// `linux` package is installed; this one is valid from the start.
const LINUX_PRESET: &str = "\
# mkinitcpio preset file for the 'linux' package

ALL_kver=\"/boot/vmlinuz-linux\"

PRESETS=('default' 'fallback')

default_image=\"/boot/initramfs-linux.img\"

fallback_image=\"/boot/initramfs-linux-fallback.img\"
fallback_options=\"-S autodetect\"
";

const SUDOERS_DROP_IN: &str = "etc/sudoers.d/10-wheel";

// ============================================================================
// Request
// ============================================================================

/// Devices the install works on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallTarget {
    /// Disk GRUB is written to in BIOS mode
    pub drive: String,
    pub root_device: PathBuf,
    /// Required for EFI installs
    pub esp_device: Option<PathBuf>,
}

impl From<&PreparedTarget> for InstallTarget {
    fn from(prepared: &PreparedTarget) -> Self {
        Self {
            drive: prepared.drive.clone(),
            root_device: prepared.root_device.clone(),
            esp_device: prepared.esp_device.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub target: InstallTarget,
    pub boot_mode: BootMode,
    pub credentials: Credentials,
    pub hostname: String,
    pub locale: String,
    pub timezone: String,
    pub keymap: String,
    pub desktop: Desktop,
}

/// `en_US.UTF-8` → `en_US.UTF-8 UTF-8`, the line `locale-gen` expects
fn locale_gen_line(locale: &str) -> String {
    let charset = locale
        .split_once('.')
        .map(|(_, charset)| charset)
        .filter(|charset| !charset.is_empty())
        .unwrap_or("UTF-8");
    format!("{} {}", locale, charset)
}

// ============================================================================
// Worker
// ============================================================================

pub struct BootstrapWorker {
    request: InstallRequest,
    settings: PipelineSettings,
    runner: Arc<dyn CommandRunner>,
}

impl BootstrapWorker {
    pub fn new(request: InstallRequest, settings: PipelineSettings, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            request,
            settings,
            runner,
        }
    }

    /// Install into the mounted target. Emits exactly one `Complete` or one `Error`.
    pub fn run(self, events: &EventSender, tracker: &mut StageTracker) -> Result<()> {
        match self.execute(events, tracker) {
            Ok(()) => {
                events.log("Installation complete.");
                events.complete();
                Ok(())
            }
            Err(e) => {
                let stage = tracker.current();
                if let Err(te) = tracker.fail() {
                    warn!("could not record failure: {}", te);
                }
                events.error(format!("{} failed: {}", stage, e));
                Err(e)
            }
        }
    }

    fn execute(&self, events: &EventSender, tracker: &mut StageTracker) -> Result<()> {
        self.enter(Stage::Bootstrapping, tracker, events)?;
        self.bootstrap(events)?;

        self.enter(Stage::InstallingBase, tracker, events)?;
        self.install_base(events)?;

        self.enter(Stage::ConfiguringSystem, tracker, events)?;
        self.configure_system(events)?;
        self.create_user(events)?;

        self.enter(Stage::InstallingBootloader, tracker, events)?;
        self.install_bootloader(events)?;

        self.enter(Stage::InstallingDesktop, tracker, events)?;
        self.install_desktop(events)?;

        self.enter(Stage::Done, tracker, events)?;
        Ok(())
    }

    fn enter(&self, stage: Stage, tracker: &mut StageTracker, events: &EventSender) -> Result<()> {
        if tracker.current() != stage {
            tracker.transition_to(stage)?;
        }
        if stage != Stage::Done {
            events.log(format!("==> {} ({}%)", stage, stage.progress_percent()));
        }
        Ok(())
    }

    // ========================================================================
    // Stages
    // ========================================================================

    fn bootstrap(&self, events: &EventSender) -> Result<()> {
        events.log("Copying DNS configuration into the target...");
        self.mkdir(&self.target_path("etc/pacman.d"))?;
        self.step(&self.copy(Path::new(HOST_RESOLV_CONF), &self.target_path("etc/resolv.conf")))?;

        let mirrorlist = self.target_path("etc/pacman.d/mirrorlist");
        if self.runner.path_exists(Path::new(HOST_MIRRORLIST)) {
            self.step(&self.copy(Path::new(HOST_MIRRORLIST), &mirrorlist))?;
        } else {
            events.log(format!("No host mirrorlist, using {}", self.settings.mirror_url));
            self.write_file(&mirrorlist, &format!("Server = {}\n", self.settings.mirror_url))?;
        }

        if self.runner.path_exists(&self.target_path("usr/bin/pacman")) {
            events.log("Package manager already present in the target.");
        } else {
            self.extract_bootstrap_image(events)?;
        }

        events.log("Initializing package signing keys...");
        self.step(&self.chroot("pacman-key", ["--init"]))?;
        self.step(&self.chroot("pacman-key", ["--populate", "archlinux"]))?;

        if self.request.boot_mode.is_efi() {
            let esp = self
                .request
                .target
                .esp_device
                .as_deref()
                .ok_or_else(|| InstallError::resource_not_found("EFI system partition"))?;
            let efi_dir = self.target_path(EFI_DIRECTORY.trim_start_matches('/'));
            events.log(format!("Mounting {} at {}...", esp.display(), efi_dir.display()));
            self.mkdir(&efi_dir)?;
            self.step(&Invocation::mutation("mount").path_arg(esp).path_arg(&efi_dir))?;
        }
        Ok(())
    }

    fn extract_bootstrap_image(&self, events: &EventSender) -> Result<()> {
        let image = &self.settings.bootstrap_image;
        if !self.runner.path_exists(image) {
            events.log(format!("Downloading {}...", self.settings.bootstrap_url));
            self.step(
                &Invocation::mutation("curl")
                    .args(["-L", "--fail", "-o"])
                    .path_arg(image)
                    .arg(self.settings.bootstrap_url.as_str()),
            )?;
            if !self.runner.is_simulated() && !self.runner.path_exists(image) {
                return Err(InstallError::resource_not_found(format!(
                    "bootstrap image {}",
                    image.display()
                )));
            }
        }

        events.log(format!("Extracting {}...", image.display()));
        // Existing files win so the DNS and mirror config copied above survive
        self.step(
            &Invocation::mutation("tar")
                .args(["--zstd", "-xpf"])
                .path_arg(image)
                .arg("-C")
                .path_arg(self.root())
                .args(["--strip-components=1", "--skip-old-files"]),
        )
    }

    fn install_base(&self, events: &EventSender) -> Result<()> {
        events.log("Writing initramfs preset...");
        self.write_file(&self.target_path(LINUX_PRESET_PATH), LINUX_PRESET)?;

        let mut packages = BASE_PACKAGES.to_vec();
        if self.request.boot_mode.is_efi() {
            packages.extend_from_slice(EFI_PACKAGES);
        }
        events.log(format!("Installing {}...", packages.join(" ")));
        self.stream(
            &self
                .chroot("pacman", ["-Sy", "--noconfirm"])
                .args(packages.iter().copied())
                .streaming(),
            events,
        )
    }

    fn configure_system(&self, events: &EventSender) -> Result<()> {
        let request = &self.request;

        events.log("Generating initramfs...");
        self.step(&self.chroot("mkinitcpio", ["-P"]))?;

        events.log("Generating /etc/fstab...");
        let fstab = self.step_output(&Invocation::mutation("genfstab").arg("-U").path_arg(self.root()))?;
        self.write_file(&self.target_path("etc/fstab"), &fstab)?;

        events.log(format!("Setting hostname to {}...", request.hostname));
        self.write_file(&self.target_path("etc/hostname"), &format!("{}\n", request.hostname))?;

        events.log(format!("Configuring locale {}...", request.locale));
        self.write_file(
            &self.target_path("etc/locale.gen"),
            &format!("{}\n", locale_gen_line(&request.locale)),
        )?;
        self.step(&self.chroot("locale-gen", Vec::<String>::new()))?;
        self.write_file(
            &self.target_path("etc/locale.conf"),
            &format!("LANG={}\n", request.locale),
        )?;
        self.write_file(
            &self.target_path("etc/vconsole.conf"),
            &format!("KEYMAP={}\n", request.keymap),
        )?;

        events.log(format!("Setting timezone to {}...", request.timezone));
        self.step(&self.chroot(
            "ln",
            [
                "-sf".to_string(),
                format!("/usr/share/zoneinfo/{}", request.timezone),
                "/etc/localtime".to_string(),
            ],
        ))?;
        self.step(&self.chroot("hwclock", ["--systohc"]))?;

        self.step(&self.chroot("systemctl", ["enable", "NetworkManager"]))?;
        Ok(())
    }

    fn create_user(&self, events: &EventSender) -> Result<()> {
        let credentials = &self.request.credentials;
        events.log(format!("Creating user {}...", credentials.username));
        self.step(&self.chroot(
            "useradd",
            ["-m", "-G", "wheel", "-s", "/bin/bash", credentials.username.as_str()],
        ))?;

        events.log("Setting passwords...");
        self.step(
            &self
                .chroot("chpasswd", Vec::<String>::new())
                .stdin(credentials.chpasswd_input()),
        )?;

        events.log("Enabling sudo for the wheel group...");
        let drop_in = self.target_path(SUDOERS_DROP_IN);
        self.write_file(&drop_in, "%wheel ALL=(ALL:ALL) ALL\n")?;
        self.step(&Invocation::mutation("chmod").arg("0440").path_arg(&drop_in))
    }

    fn install_bootloader(&self, events: &EventSender) -> Result<()> {
        let install = match self.request.boot_mode {
            BootMode::Bios => {
                let disk = format!("/dev/{}", self.request.target.drive);
                events.log(format!("Installing GRUB to {}...", disk));
                self.chroot("grub-install", ["--target=i386-pc".to_string(), disk])
            }
            BootMode::Efi => {
                events.log("Installing GRUB for EFI...");
                self.chroot(
                    "grub-install",
                    [
                        "--target=x86_64-efi".to_string(),
                        format!("--efi-directory={}", EFI_DIRECTORY),
                        "--bootloader-id=GRUB".to_string(),
                    ],
                )
            }
        };
        self.step(&install)?;

        events.log("Writing GRUB configuration...");
        self.step(&self.chroot("grub-mkconfig", ["-o", "/boot/grub/grub.cfg"]))
    }

    fn install_desktop(&self, events: &EventSender) -> Result<()> {
        let desktop = self.request.desktop;
        if !desktop.is_graphical() {
            events.log("No desktop selected, skipping.");
            return Ok(());
        }

        events.log(format!("Installing {}...", desktop));
        self.stream(
            &self
                .chroot("pacman", ["-S", "--noconfirm"])
                .args(desktop.packages())
                .streaming(),
            events,
        )?;

        if let Some(service) = desktop.display_manager() {
            events.log(format!("Enabling {}...", service));
            self.step(&self.chroot("systemctl", ["enable", service]))?;
        }
        Ok(())
    }

    // ========================================================================
    // Command helpers
    // ========================================================================

    fn root(&self) -> &Path {
        &self.settings.mount_root
    }

    fn target_path(&self, relative: &str) -> PathBuf {
        self.root().join(relative)
    }

    /// `program args...` inside the target
    fn chroot<I, S>(&self, program: &str, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation::mutation(self.settings.chroot_program.as_str())
            .path_arg(self.root())
            .arg(program)
            .args(args)
    }

    fn copy(&self, from: &Path, to: &Path) -> Invocation {
        Invocation::mutation("cp").arg("-L").path_arg(from).path_arg(to)
    }

    fn mkdir(&self, dir: &Path) -> Result<()> {
        self.step(&Invocation::mutation("mkdir").arg("-p").path_arg(dir))
    }

    /// Write `content` to an absolute host path through `tee`
    fn write_file(&self, path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            self.mkdir(parent)?;
        }
        debug!("writing {} ({} bytes)", path.display(), content.len());
        self.step(&Invocation::mutation("tee").path_arg(path).stdin(content))
    }

    fn step(&self, invocation: &Invocation) -> Result<()> {
        self.runner.run_checked(invocation)?;
        Ok(())
    }

    fn step_output(&self, invocation: &Invocation) -> Result<String> {
        Ok(self.runner.run_checked(invocation)?.stdout)
    }

    /// Forward every output line as a `Log` event while the command runs
    fn stream(&self, invocation: &Invocation, events: &EventSender) -> Result<()> {
        self.runner
            .execute(invocation, &mut |line| events.log(line))?
            .ensure_success(invocation)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{WorkerEvent, channel};
    use crate::runner::ScriptedRunner;

    fn request(boot_mode: BootMode, desktop: Desktop) -> InstallRequest {
        InstallRequest {
            target: InstallTarget {
                drive: "sdb".to_string(),
                root_device: PathBuf::from("/dev/sdb2"),
                esp_device: boot_mode.is_efi().then(|| PathBuf::from("/dev/sdb1")),
            },
            boot_mode,
            credentials: Credentials::new("alice", "hunter2", "toor").unwrap(),
            hostname: "archbox".to_string(),
            locale: "de_DE.UTF-8".to_string(),
            timezone: "Europe/Berlin".to_string(),
            keymap: "de-latin1".to_string(),
            desktop,
        }
    }

    /// Runner with the bootstrap image already downloaded
    fn scripted() -> Arc<ScriptedRunner> {
        let runner = Arc::new(ScriptedRunner::new());
        runner.add_path("/tmp/archlinux-bootstrap-x86_64.tar.zst");
        runner
    }

    fn run_worker(
        request: InstallRequest,
        runner: Arc<ScriptedRunner>,
    ) -> (Result<()>, Vec<WorkerEvent>, StageTracker) {
        let (tx, rx) = channel(4096);
        let mut tracker = StageTracker::new();
        tracker.transition_to(Stage::Mounting).unwrap();
        let result = BootstrapWorker::new(request, PipelineSettings::default(), runner).run(&tx, &mut tracker);
        drop(tx);
        (result, rx.drain(), tracker)
    }

    fn position(commands: &[String], needle: &str) -> usize {
        commands
            .iter()
            .position(|c| c == needle)
            .unwrap_or_else(|| panic!("{:?} not run; commands: {:#?}", needle, commands))
    }

    #[test]
    fn test_efi_install_runs_every_stage_in_order() {
        let runner = scripted();
        let (result, events, tracker) = run_worker(request(BootMode::Efi, Desktop::Gnome), runner.clone());
        result.unwrap();
        assert!(tracker.is_done());
        assert_eq!(events.last(), Some(&WorkerEvent::Complete));

        let cmds = runner.commands();
        let order = [
            "cp -L /etc/resolv.conf /mnt/etc/resolv.conf",
            "tar --zstd -xpf /tmp/archlinux-bootstrap-x86_64.tar.zst -C /mnt --strip-components=1 --skip-old-files",
            "arch-chroot /mnt pacman-key --init",
            "arch-chroot /mnt pacman-key --populate archlinux",
            "mount /dev/sdb1 /mnt/boot/efi",
            "tee /mnt/etc/mkinitcpio.d/linux.preset",
            "arch-chroot /mnt pacman -Sy --noconfirm base linux linux-firmware grub os-prober sudo networkmanager efibootmgr",
            "arch-chroot /mnt mkinitcpio -P",
            "genfstab -U /mnt",
            "tee /mnt/etc/fstab",
            "arch-chroot /mnt locale-gen",
            "arch-chroot /mnt ln -sf /usr/share/zoneinfo/Europe/Berlin /etc/localtime",
            "arch-chroot /mnt useradd -m -G wheel -s /bin/bash alice",
            "arch-chroot /mnt chpasswd",
            "arch-chroot /mnt grub-install --target=x86_64-efi --efi-directory=/boot/efi --bootloader-id=GRUB",
            "arch-chroot /mnt grub-mkconfig -o /boot/grub/grub.cfg",
            "arch-chroot /mnt pacman -S --noconfirm gnome gdm",
            "arch-chroot /mnt systemctl enable gdm",
        ];
        let positions: Vec<usize> = order.iter().map(|c| position(&cmds, c)).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "out of order: {:#?}", cmds);
    }

    #[test]
    fn test_config_files_written_with_expected_content() {
        let runner = scripted();
        run_worker(request(BootMode::Bios, Desktop::None), runner.clone()).0.unwrap();

        let written = |path: &str| {
            runner
                .calls()
                .into_iter()
                .find(|inv| inv.program == "tee" && inv.args == [path])
                .and_then(|inv| inv.stdin)
                .unwrap_or_else(|| panic!("{} not written", path))
        };
        assert_eq!(written("/mnt/etc/hostname"), "archbox\n");
        assert_eq!(written("/mnt/etc/locale.gen"), "de_DE.UTF-8 UTF-8\n");
        assert_eq!(written("/mnt/etc/locale.conf"), "LANG=de_DE.UTF-8\n");
        assert_eq!(written("/mnt/etc/vconsole.conf"), "KEYMAP=de-latin1\n");
        assert_eq!(written("/mnt/etc/sudoers.d/10-wheel"), "%wheel ALL=(ALL:ALL) ALL\n");
        assert!(written("/mnt/etc/mkinitcpio.d/linux.preset").contains("PRESETS=('default' 'fallback')"));
        assert_eq!(
            written("/mnt/etc/pacman.d/mirrorlist"),
            "Server = https://mirrors.mit.edu/archlinux/$repo/os/$arch\n"
        );
    }

    #[test]
    fn test_passwords_only_on_stdin() {
        let runner = scripted();
        run_worker(request(BootMode::Bios, Desktop::None), runner.clone()).0.unwrap();

        let chpasswd = runner
            .calls()
            .into_iter()
            .find(|inv| inv.args.iter().any(|a| a == "chpasswd"))
            .unwrap();
        assert_eq!(chpasswd.stdin.as_deref(), Some("alice:hunter2\nroot:toor\n"));
        assert!(runner.commands().iter().all(|c| !c.contains("hunter2") && !c.contains("toor")));
    }

    #[test]
    fn test_existing_pacman_skips_bootstrap_image() {
        let runner = scripted();
        runner.add_path("/mnt/usr/bin/pacman").add_path("/etc/pacman.d/mirrorlist");
        run_worker(request(BootMode::Bios, Desktop::None), runner.clone()).0.unwrap();

        let cmds = runner.commands();
        assert!(cmds.iter().all(|c| !c.starts_with("curl") && !c.starts_with("tar")));
        assert!(cmds.contains(&"cp -L /etc/pacman.d/mirrorlist /mnt/etc/pacman.d/mirrorlist".to_string()));
    }

    #[test]
    fn test_cached_image_is_extracted_without_download() {
        let runner = scripted();
        run_worker(request(BootMode::Bios, Desktop::None), runner.clone()).0.unwrap();

        let cmds = runner.commands();
        assert!(cmds.iter().all(|c| !c.starts_with("curl")));
        position(
            &cmds,
            "tar --zstd -xpf /tmp/archlinux-bootstrap-x86_64.tar.zst -C /mnt --strip-components=1 --skip-old-files",
        );
    }

    #[test]
    fn test_failed_download_is_resource_not_found() {
        let runner = Arc::new(ScriptedRunner::new());
        let (result, events, tracker) = run_worker(request(BootMode::Bios, Desktop::None), runner.clone());
        assert!(matches!(result, Err(InstallError::ResourceNotFound(_))));
        assert_eq!(tracker.failed_at(), Some(Stage::Bootstrapping));
        let cmds = runner.commands();
        position(
            &cmds,
            "curl -L --fail -o /tmp/archlinux-bootstrap-x86_64.tar.zst https://mirrors.mit.edu/archlinux/iso/latest/archlinux-bootstrap-x86_64.tar.zst",
        );
        assert!(cmds.iter().all(|c| !c.starts_with("tar") && !c.contains("pacman-key")));
        assert!(matches!(events.last(), Some(WorkerEvent::Error(_))));
    }

    #[test]
    fn test_bios_grub_targets_drive() {
        let runner = scripted();
        run_worker(request(BootMode::Bios, Desktop::None), runner.clone()).0.unwrap();
        let cmds = runner.commands();
        position(&cmds, "arch-chroot /mnt grub-install --target=i386-pc /dev/sdb");
        assert!(cmds.iter().all(|c| !c.contains("efibootmgr") && !c.contains("/boot/efi")));
        assert!(cmds.iter().all(|c| !c.contains("pacman -S --noconfirm")));
    }

    #[test]
    fn test_efi_without_esp_is_resource_not_found() {
        let runner = scripted();
        let mut req = request(BootMode::Efi, Desktop::None);
        req.target.esp_device = None;
        let (result, _, tracker) = run_worker(req, runner);
        assert!(matches!(result, Err(InstallError::ResourceNotFound(_))));
        assert_eq!(tracker.failed_at(), Some(Stage::Bootstrapping));
    }

    #[test]
    fn test_bootloader_failure_halts_remaining_steps() {
        let runner = scripted();
        runner.fail("arch-chroot", &["grub-install"], 1, "grub-install: error: cannot find EFI directory.");
        let (result, events, tracker) = run_worker(request(BootMode::Efi, Desktop::Xfce), runner.clone());

        assert!(matches!(result, Err(InstallError::CommandFailed { .. })));
        assert_eq!(tracker.failed_at(), Some(Stage::InstallingBootloader));
        let cmds = runner.commands();
        assert!(cmds.iter().all(|c| !c.contains("grub-mkconfig") && !c.contains("xfce4")));

        let terminal: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminal.len(), 1);
        match terminal[0] {
            WorkerEvent::Error(msg) => {
                assert!(msg.starts_with("Installing bootloader failed"));
                assert!(msg.contains("cannot find EFI directory"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_package_output_streamed_as_logs() {
        let runner = scripted();
        runner.respond(
            "arch-chroot",
            &["pacman", "-Sy"],
            ":: Synchronizing package databases...\n(1/7) installing base\n",
        );
        let (_, events, _) = run_worker(request(BootMode::Bios, Desktop::None), runner);
        assert!(events.contains(&WorkerEvent::Log("(1/7) installing base".to_string())));
    }

    #[test]
    fn test_locale_gen_line() {
        assert_eq!(locale_gen_line("en_US.UTF-8"), "en_US.UTF-8 UTF-8");
        assert_eq!(locale_gen_line("ja_JP.EUC-JP"), "ja_JP.EUC-JP EUC-JP");
        assert_eq!(locale_gen_line("en_US"), "en_US UTF-8");
    }
}
