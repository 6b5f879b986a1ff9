//! `botflow-types` – shared vocabulary for the routine engine.
//!
//! Everything that crosses a crate boundary lives here: the routine graph
//! model, device telemetry snapshots, control signals, run outcomes and the
//! [`BotError`] taxonomy.
//!
//! # Modules
//!
//! - [`routine`] – [`RoutineGraph`], [`RoutineNode`], [`NodeType`] and the
//!   per-node [`RetryPolicy`].
//! - [`status`] – [`MissionStatus`] telemetry snapshots and [`MissionCode`].
//! - [`error`] – the [`BotError`] enum shared by every layer.

pub mod error;
pub mod routine;
pub mod status;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use error::{BotError, TransitionKind};
pub use routine::{NodeType, RetryPolicy, RoutineGraph, RoutineNode, Transitions, routine_schema};
pub use status::{MissionCode, MissionStatus, Orientation, Position};

/// Control signals delivered asynchronously into a running routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Signal {
    /// Cancel the in-flight step and hold before the next node.
    Pause,
    /// Release a pause; the interrupted node is executed again from scratch.
    Resume,
    /// Cancel the in-flight step, sit the robot down, end the run.
    LowBattery,
    /// Cancel the in-flight step and end the run without compensation.
    Cancel,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Pause => write!(f, "pause"),
            Signal::Resume => write!(f, "resume"),
            Signal::LowBattery => write!(f, "low-battery"),
            Signal::Cancel => write!(f, "cancel"),
        }
    }
}

impl FromStr for Signal {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pause" => Ok(Signal::Pause),
            "resume" => Ok(Signal::Resume),
            "low-battery" | "low_battery" | "low-battery-signal" => Ok(Signal::LowBattery),
            "cancel" | "stop" => Ok(Signal::Cancel),
            other => Err(BotError::InvalidInput(format!("unknown control signal '{other}'"))),
        }
    }
}

/// Why a run was torn down from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelCause {
    /// Battery dropped below the safe threshold; triggers compensation.
    LowBattery,
    /// An operator asked for the run to stop.
    Operator,
}

impl CancelCause {
    /// Only a low-battery abort puts the robot into a safe pose afterwards.
    pub fn requires_compensation(self) -> bool {
        matches!(self, CancelCause::LowBattery)
    }
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelCause::LowBattery => write!(f, "workflow canceled due to low battery"),
            CancelCause::Operator => write!(f, "workflow canceled by operator"),
        }
    }
}

/// Terminal state of a routine run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// An `End` node was reached.
    Completed,
    /// An unrecoverable error stopped the run.
    Failed,
    /// The run was torn down by an external cancellation cause.
    Canceled,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "Completed"),
            RunOutcome::Failed => write!(f, "Failed"),
            RunOutcome::Canceled => write!(f, "Canceled"),
        }
    }
}

/// Everything a caller learns about a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub outcome: RunOutcome,
    /// Human-readable summary, e.g. the last successful step's result.
    pub message: String,
    /// The error that ended the run (`Failed`) or the cancellation (`Canceled`).
    pub error: Option<BotError>,
    /// Set when a compensating action was attempted and failed.
    pub compensation_error: Option<BotError>,
}

impl RunReport {
    pub fn completed(run_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            outcome: RunOutcome::Completed,
            message: message.into(),
            error: None,
            compensation_error: None,
        }
    }

    pub fn failed(run_id: impl Into<String>, error: BotError) -> Self {
        Self {
            run_id: run_id.into(),
            outcome: RunOutcome::Failed,
            message: error.to_string(),
            error: Some(error),
            compensation_error: None,
        }
    }

    pub fn canceled(run_id: impl Into<String>, cause: CancelCause) -> Self {
        Self {
            run_id: run_id.into(),
            outcome: RunOutcome::Canceled,
            message: cause.to_string(),
            error: Some(BotError::Canceled(cause.to_string())),
            compensation_error: None,
        }
    }
}

/// Generate a fresh identifier for a routine run.
pub fn new_run_id() -> String {
    format!("routine-{}", Uuid::new_v4())
}
