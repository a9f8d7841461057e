//! Pipeline stage tracking
//!
//! ```text
//! Idle → Preparing → Formatting → Mounting            (disk preparation)
//!      → Bootstrapping → InstallingBase → ConfiguringSystem
//!      → InstallingBootloader → InstallingDesktop → Done   (base install)
//!
//! (any non-terminal stage can move to Failed)
//! ```
//!
//! Transitions only move forward. Skipping ahead is allowed so the base
//! install can start from `Idle` on a target that was prepared earlier.
//! A failure is terminal; nothing resumes from `Failed`.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Stage {
    Idle = 0,
    /// Unmounting and rewriting the partition table
    Preparing = 1,
    Formatting = 2,
    Mounting = 3,
    Bootstrapping = 4,
    InstallingBase = 5,
    ConfiguringSystem = 6,
    InstallingBootloader = 7,
    InstallingDesktop = 8,
    Done = 9,
    Failed = 255,
}

impl Stage {
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Stages that rewrite or erase data on the target drive
    #[inline]
    pub const fn is_destructive(self) -> bool {
        matches!(self, Self::Preparing | Self::Formatting)
    }

    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::Preparing),
            Self::Preparing => Some(Self::Formatting),
            Self::Formatting => Some(Self::Mounting),
            Self::Mounting => Some(Self::Bootstrapping),
            Self::Bootstrapping => Some(Self::InstallingBase),
            Self::InstallingBase => Some(Self::ConfiguringSystem),
            Self::ConfiguringSystem => Some(Self::InstallingBootloader),
            Self::InstallingBootloader => Some(Self::InstallingDesktop),
            Self::InstallingDesktop => Some(Self::Done),
            Self::Done | Self::Failed => None,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Preparing => "Preparing disk",
            Self::Formatting => "Formatting partitions",
            Self::Mounting => "Mounting target",
            Self::Bootstrapping => "Bootstrapping root filesystem",
            Self::InstallingBase => "Installing base system",
            Self::ConfiguringSystem => "Configuring system",
            Self::InstallingBootloader => "Installing bootloader",
            Self::InstallingDesktop => "Installing desktop",
            Self::Done => "Installation complete",
            Self::Failed => "Installation failed",
        }
    }

    /// Rough progress for a status line
    pub const fn progress_percent(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Preparing => 5,
            Self::Formatting => 12,
            Self::Mounting => 18,
            Self::Bootstrapping => 25,
            Self::InstallingBase => 45,
            Self::ConfiguringSystem => 70,
            Self::InstallingBootloader => 80,
            Self::InstallingDesktop => 88,
            Self::Done => 100,
            Self::Failed => 0,
        }
    }

    /// All stages in order, excluding `Failed`
    pub const fn all_stages() -> &'static [Self] {
        &[
            Self::Idle,
            Self::Preparing,
            Self::Formatting,
            Self::Mounting,
            Self::Bootstrapping,
            Self::InstallingBase,
            Self::ConfiguringSystem,
            Self::InstallingBootloader,
            Self::InstallingDesktop,
            Self::Done,
        ]
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Cannot go backwards from {from} to {to}")]
    Backward { from: Stage, to: Stage },

    #[error("Cannot leave terminal stage {from}")]
    FromTerminal { from: Stage },

    #[error("Already at stage {stage}")]
    AlreadyAt { stage: Stage },

    #[error("Use fail() to enter the failed stage")]
    FailedViaTransition,
}

impl From<TransitionError> for crate::error::InstallError {
    fn from(err: TransitionError) -> Self {
        crate::error::InstallError::StageTransition(err.to_string())
    }
}

/// Owns the current stage and its history.
///
/// ```
/// use archsetup::stage::{Stage, StageTracker};
///
/// let mut tracker = StageTracker::new();
/// tracker.transition_to(Stage::Preparing).unwrap();
/// assert!(tracker.transition_to(Stage::Idle).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct StageTracker {
    current: Stage,
    failed_at: Option<Stage>,
    /// (stage, unix timestamp) in the order entered
    history: Vec<(Stage, u64)>,
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StageTracker {
    pub fn new() -> Self {
        Self {
            current: Stage::Idle,
            failed_at: None,
            history: Vec::with_capacity(Stage::all_stages().len()),
        }
    }

    #[inline]
    pub fn current(&self) -> Stage {
        self.current
    }

    #[inline]
    pub fn failed_at(&self) -> Option<Stage> {
        self.failed_at
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.current == Stage::Done
    }

    pub fn history(&self) -> &[(Stage, u64)] {
        &self.history
    }

    /// Move to the next stage in sequence
    pub fn advance(&mut self) -> Result<Stage, TransitionError> {
        match self.current.next() {
            Some(next) => {
                self.record(next);
                Ok(next)
            }
            None => Err(TransitionError::FromTerminal { from: self.current }),
        }
    }

    /// Move forward to `target`, possibly skipping stages
    pub fn transition_to(&mut self, target: Stage) -> Result<Stage, TransitionError> {
        if self.current.is_terminal() {
            return Err(TransitionError::FromTerminal { from: self.current });
        }
        if target == Stage::Failed {
            return Err(TransitionError::FailedViaTransition);
        }
        if target == self.current {
            return Err(TransitionError::AlreadyAt { stage: target });
        }
        if target.order() < self.current.order() {
            return Err(TransitionError::Backward {
                from: self.current,
                to: target,
            });
        }
        self.record(target);
        Ok(target)
    }

    /// Record failure of the current stage
    pub fn fail(&mut self) -> Result<(), TransitionError> {
        if self.current.is_terminal() {
            return Err(TransitionError::FromTerminal { from: self.current });
        }
        self.failed_at = Some(self.current);
        self.record(Stage::Failed);
        Ok(())
    }

    fn record(&mut self, stage: Stage) {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.history.push((stage, timestamp));
        self.current = stage;
    }
}
