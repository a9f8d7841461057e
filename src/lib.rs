//! archsetup library
//!
//! Drive inventory, partition planning, disk preparation and the base
//! install, driven headlessly through worker threads and an event stream.

pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod desktop;
pub mod disk_prep;
pub mod error;
pub mod events;
pub mod host_deps;
pub mod inventory;
pub mod pipeline;
pub mod planner;
pub mod process_guard;
pub mod runner;
pub mod stage;
pub mod types;

// Re-export main types for convenience
pub use bootstrap::{BootstrapWorker, InstallRequest, InstallTarget};
pub use config::{Credentials, CredentialsError, InstallConfig, PipelineSettings};
pub use desktop::Desktop;
pub use disk_prep::{DiskPrepWorker, PrepPhase, PreparedTarget};
pub use error::{InstallError, Result};
pub use events::{EventReceiver, EventSender, WorkerEvent, WorkerHandle, spawn_worker};
pub use inventory::{Drive, DriveSnapshot, FreeRegion, Inventory, Partition};
pub use pipeline::{Pipeline, PipelineOutcome};
pub use planner::{InstallPlan, PartitionOp, PartitionPlan, PartitionRole, PlanRejection};
pub use process_guard::{ChildRegistry, CleanupGuard, CommandProcessGroup};
pub use runner::{CommandOutput, CommandRunner, DryRunRunner, Invocation, ScriptedRunner, SystemRunner};
pub use stage::{Stage, StageTracker, TransitionError};
pub use types::{BootMode, FsType, InstallMode, PartFlag, TableType};
