//! archsetup - main entry point
//!
//! Thin front-end over the library: parse arguments, pick a runner, hand
//! off to the pipeline and turn failures into a non-zero exit.

use anyhow::{Context, Result, bail};
use archsetup::bootstrap::{InstallRequest, InstallTarget};
use archsetup::cli::{Cli, Commands, TargetArgs};
use archsetup::config::{InstallConfig, PipelineSettings};
use archsetup::events::WorkerEvent;
use archsetup::host_deps::{self, HOST_PACKAGES, HostDistro};
use archsetup::inventory::Inventory;
use archsetup::pipeline::Pipeline;
use archsetup::planner::PartitionPlan;
use archsetup::process_guard::{self, CleanupGuard};
use archsetup::runner::{CommandRunner, DryRunRunner, SystemRunner};
use archsetup::stage::StageTracker;
use archsetup::types::{BootMode, strip_dev};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Log to stderr at `info`, overridable through RUST_LOG
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn build_runner(dry_run: bool, settings: &PipelineSettings) -> Arc<dyn CommandRunner> {
    let system: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new(settings.privilege_wrapper.clone()));
    if dry_run {
        info!("Dry-run mode: disk and target changes will only be logged");
        Arc::new(DryRunRunner::new(system))
    } else {
        system
    }
}

fn main() -> Result<()> {
    init_tracing();

    // Children are terminated on SIGINT/SIGTERM/SIGHUP and on normal exit
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    let _cleanup = CleanupGuard::new();

    let cli = Cli::parse_args();
    debug!("CLI arguments parsed");

    match cli.command {
        Commands::Drives => list_drives(cli.dry_run),
        Commands::Partitions { drive } => list_partitions(cli.dry_run, &drive),
        Commands::Plan(target) => {
            let settings = PipelineSettings::default();
            let pipeline = Pipeline::new(build_runner(cli.dry_run, &settings), settings);
            let plan = plan_target(&pipeline, &target)?;
            println!("{}", plan.summary());
            Ok(())
        }
        Commands::Prepare { target, yes } => prepare(cli.dry_run, &target, yes),
        Commands::Install { config, root, esp } => install(cli.dry_run, &config, &root, esp.as_deref()),
        Commands::Run { config, yes } => run(cli.dry_run, &config, yes),
        Commands::Deps => install_host_deps(cli.dry_run),
        Commands::Validate { config } => validate(&config),
    }
}

// ============================================================================
// Commands
// ============================================================================

fn list_drives(dry_run: bool) -> Result<()> {
    let runner = build_runner(dry_run, &PipelineSettings::default());
    let drives = Inventory::new(runner.as_ref()).list_drives();
    if drives.is_empty() {
        bail!("No installable drives found");
    }
    for drive in drives {
        println!(
            "/dev/{:<12} {:>10} MiB  {:<5} {} partition(s)",
            drive.name,
            drive.size_mib(),
            drive.table.to_string(),
            drive.partitions.len()
        );
    }
    Ok(())
}

fn list_partitions(dry_run: bool, drive: &str) -> Result<()> {
    let runner = build_runner(dry_run, &PipelineSettings::default());
    let snapshot = Inventory::new(runner.as_ref()).snapshot(drive);
    println!(
        "/dev/{} ({} MiB, {} table)",
        snapshot.drive.name,
        snapshot.drive.size_mib(),
        snapshot.drive.table.to_string()
    );
    for part in &snapshot.drive.partitions {
        let mut markers = Vec::new();
        if part.is_esp() {
            markers.push("esp");
        }
        if part.is_bios_boot() {
            markers.push("bios_grub");
        }
        println!(
            "  /dev/{:<14} {:>8}..{:<8} MiB  {:<6} {:<10} {}",
            part.name,
            part.start_mib(),
            part.end_mib(),
            part.fs_type.as_deref().unwrap_or("-"),
            part.mountpoint.as_deref().unwrap_or(""),
            markers.join(",")
        );
    }
    for region in &snapshot.free_regions {
        println!(
            "  free               {:>8.0}..{:<8.0} MiB  ({:.0} MiB)",
            region.start_mib, region.end_mib, region.size_mib
        );
    }
    Ok(())
}

fn plan_target(pipeline: &Pipeline, target: &TargetArgs) -> Result<PartitionPlan> {
    let config = InstallConfig {
        mode: target.mode,
        boot_mode: target.boot,
        drive: target.drive.clone().unwrap_or_default(),
        partition: target.partition.clone(),
        ..InstallConfig::default()
    };
    let request = pipeline.install_plan(&config)?;
    Ok(pipeline.plan(&request)?)
}

/// Destructive plans need `--yes` unless nothing will really change
fn confirm(plan: &PartitionPlan, yes: bool, dry_run: bool) -> Result<()> {
    if plan.is_destructive() && !yes && !dry_run {
        println!("{}", plan.summary());
        bail!("This plan erases data on /dev/{}; re-run with --yes to proceed", plan.drive);
    }
    Ok(())
}

fn print_event(event: &WorkerEvent) {
    // Log and Error events are already traced by the worker
    if let WorkerEvent::Complete = event {
        println!("✓ Step complete");
    }
}

fn prepare(dry_run: bool, target: &TargetArgs, yes: bool) -> Result<()> {
    let settings = PipelineSettings::default();
    let pipeline = Pipeline::new(build_runner(dry_run, &settings), settings);
    let plan = plan_target(&pipeline, target)?;
    confirm(&plan, yes, dry_run)?;

    let (result, _) = pipeline.prepare(plan, StageTracker::new(), &mut print_event);
    let prepared = result?;
    println!("Root {} mounted at {}", prepared.root_device.display(), prepared.mount_root.display());
    if let Some(esp) = prepared.esp_device {
        println!("ESP {} (pass --esp {} to install)", esp.display(), esp.display());
    }
    Ok(())
}

fn install(dry_run: bool, config_path: &Path, root: &Path, esp: Option<&Path>) -> Result<()> {
    let config = InstallConfig::load_from_file(config_path)?;
    config.validate()?;

    let boot_mode = config.boot_mode();
    if boot_mode == BootMode::Efi && esp.is_none() {
        bail!("EFI installs need --esp");
    }
    let pipeline = Pipeline::new(build_runner(dry_run, &config.settings), config.settings.clone());
    let request = InstallRequest {
        target: InstallTarget {
            drive: strip_dev(&config.drive).to_string(),
            root_device: root.to_path_buf(),
            esp_device: esp.map(Path::to_path_buf),
        },
        boot_mode,
        credentials: config.credentials()?,
        hostname: config.hostname.clone(),
        locale: config.locale.clone(),
        timezone: config.timezone.clone(),
        keymap: config.keymap.clone(),
        desktop: config.desktop,
    };

    let (result, _) = pipeline.install(request, StageTracker::new(), &mut print_event);
    result?;
    println!("\n✓ Installation completed successfully!");
    Ok(())
}

fn run(dry_run: bool, config_path: &Path, yes: bool) -> Result<()> {
    info!("Loading configuration from: {:?}", config_path);
    let config = InstallConfig::load_from_file(config_path)?;
    config.validate()?;
    info!("Configuration validated successfully");

    let pipeline = Pipeline::new(build_runner(dry_run, &config.settings), config.settings.clone());
    let plan = pipeline.plan(&pipeline.install_plan(&config)?)?;
    confirm(&plan, yes, dry_run)?;

    match pipeline.run_plan(&config, plan, &mut print_event) {
        Ok(outcome) => {
            info!("Stages: {:?}", outcome.stages);
            println!("\n✓ Installation completed successfully!");
            Ok(())
        }
        Err(e) => {
            error!("Installation failed: {}", e);
            Err(e).context("Installation failed; the drive is left as it was at the failing step")
        }
    }
}

fn install_host_deps(dry_run: bool) -> Result<()> {
    let runner = build_runner(dry_run, &PipelineSettings::default());
    let missing = host_deps::missing_tools(runner.as_ref());
    for (tool, package) in &missing {
        warn!("{} not found (package {})", tool, package);
    }

    let distro = HostDistro::detect();
    info!("Installing host dependencies for {}", distro);
    let invocation = distro.install_invocation(HOST_PACKAGES);
    let output = runner.execute(&invocation, &mut |line| println!("{}", line))?;
    output
        .ensure_success(&invocation)
        .context("Failed to install required dependencies")?;
    println!("✓ Host dependencies installed");
    Ok(())
}

fn validate(path: &Path) -> Result<()> {
    info!("Validating configuration file: {:?}", path);
    let config = InstallConfig::load_from_file(path)?;
    match config.validate() {
        Ok(()) => {
            println!("✓ Configuration file is valid: {:?}", config);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed: {}", e);
            Err(e)
        }
    }
}
