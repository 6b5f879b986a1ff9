//! `botflow-runtime` – executes robot routines.
//!
//! # Modules
//!
//! - [`scheduler`] – the [`StepScheduler`] seam (retry, signals, heartbeats,
//!   queries) and its in-process implementation [`LocalScheduler`].
//! - [`liveness`] – heartbeat deadlines per running step.
//! - [`context`] – [`StepContext`], identity and cancellation of one step.
//! - [`heartbeat`] – runs a device call on its own task while heartbeating
//!   and racing it against cancellation.
//! - [`action_client`] – [`ActionClient`], logical robot actions as device
//!   calls.
//! - [`move_supervisor`] – [`MoveSupervisor`], dispatch-then-poll for move
//!   missions.
//! - [`interpreter`] – [`RoutineInterpreter`], the graph walk with
//!   pause/resume and low-battery compensation.
//! - [`battery_monitor`] – turns low battery telemetry into a signal.
//! - [`routine_store`] – [`GraphStore`] and the directory-backed store.
//! - [`telemetry`] – [`init_tracing`] with optional OTLP span export.

pub mod action_client;
pub mod battery_monitor;
pub mod context;
pub mod heartbeat;
pub mod interpreter;
pub mod liveness;
pub mod move_supervisor;
pub mod routine_store;
pub mod scheduler;
pub mod telemetry;

pub use action_client::{ActionClient, ActionClientConfig, DeviceCommand};
pub use battery_monitor::{BatteryMonitor, BatteryMonitorConfig};
pub use context::StepContext;
pub use interpreter::{CURRENT_STEP_QUERY, InterpreterConfig, RoutineInterpreter};
pub use move_supervisor::{MoveConfig, MoveSupervisor, MoveTarget};
pub use routine_store::{DirectoryGraphStore, GraphStore};
pub use scheduler::{LocalScheduler, SignalSender, StepScheduler};
pub use telemetry::{TracerProviderGuard, init_tracing};
