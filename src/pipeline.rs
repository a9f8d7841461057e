//! Headless controller
//!
//! Drives one installation end to end without a UI: snapshot the drive,
//! plan, prepare the disk on a worker thread, then install on a second
//! worker thread. Only one worker is ever alive, and both share a single
//! [`StageTracker`] that is handed across threads by value.

use crate::bootstrap::{BootstrapWorker, InstallRequest, InstallTarget};
use crate::config::{Credentials, InstallConfig, PipelineSettings};
use crate::disk_prep::{DiskPrepWorker, PreparedTarget};
use crate::error::{InstallError, Result};
use crate::events::{WorkerEvent, WorkerHandle, spawn_worker};
use crate::inventory::{DriveSnapshot, Inventory};
use crate::planner::{self, InstallPlan, PartitionPlan};
use crate::runner::CommandRunner;
use crate::stage::{Stage, StageTracker};
use crate::types::strip_dev;
use std::sync::Arc;
use tracing::{debug, info};

/// What a finished run produced
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub plan: PartitionPlan,
    pub target: PreparedTarget,
    pub stages: Vec<Stage>,
}

pub struct Pipeline {
    runner: Arc<dyn CommandRunner>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: PipelineSettings) -> Self {
        Self { runner, settings }
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    /// Build the immutable request from a config, resolving the drive of a
    /// use-partition install from the partition when it is not given
    pub fn install_plan(&self, config: &InstallConfig) -> Result<InstallPlan> {
        let mut drive = strip_dev(config.drive.trim()).to_string();
        if drive.is_empty() {
            if let Some(partition) = config.partition.as_deref() {
                drive = Inventory::new(self.runner())
                    .parent_drive(partition)
                    .ok_or_else(|| InstallError::resource_not_found(format!("parent drive of {}", partition)))?;
                debug!("{} lives on {}", partition, drive);
            }
        }
        Ok(InstallPlan::new(
            config.mode,
            config.boot_mode(),
            &drive,
            config.partition.as_deref(),
        )?)
    }

    pub fn snapshot(&self, drive: &str) -> DriveSnapshot {
        Inventory::new(self.runner()).snapshot(drive)
    }

    /// Snapshot the drive and plan against it. Runs queries only.
    pub fn plan(&self, request: &InstallPlan) -> Result<PartitionPlan> {
        let snapshot = self.snapshot(&request.drive);
        let plan = planner::plan(request, &snapshot)?;
        info!("{}", plan.summary());
        Ok(plan)
    }

    /// Run the disk preparation worker to completion
    pub fn prepare(
        &self,
        plan: PartitionPlan,
        tracker: StageTracker,
        observer: &mut dyn FnMut(&WorkerEvent),
    ) -> (Result<PreparedTarget>, StageTracker) {
        let worker = DiskPrepWorker::new(plan, self.settings.clone(), Arc::clone(&self.runner));
        self.run_worker("disk-prep", tracker, observer, move |events, tracker| {
            worker.run(events, tracker)
        })
    }

    /// Run the install worker to completion
    pub fn install(
        &self,
        request: InstallRequest,
        tracker: StageTracker,
        observer: &mut dyn FnMut(&WorkerEvent),
    ) -> (Result<()>, StageTracker) {
        let worker = BootstrapWorker::new(request, self.settings.clone(), Arc::clone(&self.runner));
        self.run_worker("bootstrap", tracker, observer, move |events, tracker| {
            worker.run(events, tracker)
        })
    }

    /// Plan, prepare and install as configured
    pub fn run(
        &self,
        config: &InstallConfig,
        observer: &mut dyn FnMut(&WorkerEvent),
    ) -> Result<PipelineOutcome> {
        let credentials = credentials(config)?;
        let request = self.install_plan(config)?;
        let plan = match self.plan(&request) {
            Ok(plan) => plan,
            Err(e) => {
                observer(&WorkerEvent::Error(e.to_string()));
                return Err(e);
            }
        };
        self.execute(config, plan, credentials, observer)
    }

    /// Prepare and install from a plan the caller already made and confirmed.
    /// The drive is not snapshotted again.
    pub fn run_plan(
        &self,
        config: &InstallConfig,
        plan: PartitionPlan,
        observer: &mut dyn FnMut(&WorkerEvent),
    ) -> Result<PipelineOutcome> {
        let credentials = credentials(config)?;
        self.execute(config, plan, credentials, observer)
    }

    fn execute(
        &self,
        config: &InstallConfig,
        plan: PartitionPlan,
        credentials: Credentials,
        observer: &mut dyn FnMut(&WorkerEvent),
    ) -> Result<PipelineOutcome> {
        let (prepared, tracker) = self.prepare(plan.clone(), StageTracker::new(), observer);
        let target = prepared?;

        let install = InstallRequest {
            target: InstallTarget::from(&target),
            boot_mode: plan.boot_mode,
            credentials,
            hostname: config.hostname.clone(),
            locale: config.locale.clone(),
            timezone: config.timezone.clone(),
            keymap: config.keymap.clone(),
            desktop: config.desktop,
        };
        let (installed, tracker) = self.install(install, tracker, observer);
        installed?;

        Ok(PipelineOutcome {
            plan,
            target,
            stages: tracker.history().iter().map(|(stage, _)| *stage).collect(),
        })
    }

    fn run_worker<T, F>(
        &self,
        name: &str,
        tracker: StageTracker,
        observer: &mut dyn FnMut(&WorkerEvent),
        work: F,
    ) -> (Result<T>, StageTracker)
    where
        T: Send + 'static,
        F: FnOnce(&crate::events::EventSender, &mut StageTracker) -> Result<T> + Send + 'static,
    {
        let fallback = tracker.clone();
        let handle: WorkerHandle<(Result<T>, StageTracker)> =
            match spawn_worker(name, self.settings.event_capacity, move |events| {
                let mut tracker = tracker;
                let result = work(events, &mut tracker);
                (result, tracker)
            }) {
                Ok(handle) => handle,
                Err(e) => return (Err(e), fallback),
            };

        let mut terminal = 0;
        for event in handle.events.iter() {
            if event.is_terminal() {
                terminal += 1;
            }
            observer(&event);
        }
        debug!("{} finished with {} terminal event(s)", name, terminal);

        match handle.join() {
            Ok((Ok(_), _)) if terminal == 0 => (
                Err(InstallError::worker(format!("{} ended without reporting completion", name))),
                fallback,
            ),
            Ok(outcome) => outcome,
            Err(e) => (Err(e), fallback),
        }
    }
}

fn credentials(config: &InstallConfig) -> Result<Credentials> {
    config
        .credentials()
        .map_err(|e| InstallError::validation(e.to_string()))
}
