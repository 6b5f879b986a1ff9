//! [`RoutineInterpreter`] – walks a [`RoutineGraph`] one node at a time.
//!
//! # Control flow
//!
//! ```text
//!            ┌──────────────────────────────────────────────┐
//!            ▼                                              │
//!   await !paused ──▶ look up node ──▶ execute ──ok──▶ next ┘
//!            ▲                            │
//!            │                            ├──err──▶ failure edge ─┘
//!            └──── step interrupted ──────┤
//!                  by pause               └──abort──▶ compensation ──▶ Canceled
//! ```
//!
//! A signal listener runs alongside the walk.  `Pause` cancels exactly the
//! in-flight step and holds the walk before the next node; `Resume` releases
//! it and the interrupted node runs again from the start.  `LowBattery` and
//! `Cancel` abort the run; only the former sits the robot down afterwards.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use botflow_types::{
    BotError, CancelCause, NodeType, RetryPolicy, RoutineGraph, RoutineNode, RunReport, Signal,
    TransitionKind,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::action_client::{ActionClient, DeviceCommand};
use crate::context::StepContext;
use crate::move_supervisor::{MoveSupervisor, MoveTarget};
use crate::scheduler::{StepFuture, StepScheduler};

/// Name of the query exposing the current step label.
pub const CURRENT_STEP_QUERY: &str = "get_step";

/// Label reported while the run is paused.
pub const PAUSED_LABEL: &str = "Paused";

const INITIAL_LABEL: &str = "Initializing";
const COMPLETED_MESSAGE: &str = "Workflow completed successfully";

#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    /// Budget for the compensating SitDown after a low-battery abort.
    pub compensation_timeout: Duration,
    /// Applied to action nodes without a `retry` block.
    pub default_retry: RetryPolicy,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            compensation_timeout: Duration::from_secs(300),
            default_retry: RetryPolicy::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Run state
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct RunState {
    current_node: String,
    paused: bool,
    step_label: String,
    active_cancel: Option<CancellationToken>,
    abort: Option<CancelCause>,
}

/// State shared between the walk and its signal listener.
struct SharedRunState {
    state: Mutex<RunState>,
    changed: Notify,
}

impl SharedRunState {
    fn new(root: &str) -> Self {
        Self {
            state: Mutex::new(RunState {
                current_node: root.to_string(),
                paused: false,
                step_label: INITIAL_LABEL.to_string(),
                active_cancel: None,
                abort: None,
            }),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply(&self, signal: Signal) {
        {
            let mut state = self.lock();
            info!(node_id = %state.current_node, %signal, "applying control signal");
            match signal {
                Signal::Pause => state.paused = true,
                Signal::Resume => state.paused = false,
                Signal::LowBattery => {
                    state.abort.get_or_insert(CancelCause::LowBattery);
                }
                Signal::Cancel => {
                    state.abort.get_or_insert(CancelCause::Operator);
                }
            }
            if signal != Signal::Resume
                && let Some(token) = &state.active_cancel
            {
                token.cancel();
            }
        }
        self.changed.notify_waiters();
    }

    /// Block until the walk may proceed.  Returns the abort cause instead
    /// when the run was torn down.
    async fn wait_until_runnable(&self) -> Option<CancelCause> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.lock();
                if let Some(cause) = state.abort {
                    return Some(cause);
                }
                if !state.paused {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Register `node_id` as the in-flight step.  `None` when a signal slipped
    /// in since the last [`wait_until_runnable`](Self::wait_until_runnable).
    fn begin_step(&self, node_id: &str, label: &str) -> Option<CancellationToken> {
        let mut state = self.lock();
        if state.paused || state.abort.is_some() {
            return None;
        }
        let token = CancellationToken::new();
        state.current_node = node_id.to_string();
        state.step_label = label.to_string();
        state.active_cancel = Some(token.clone());
        Some(token)
    }

    fn end_step(&self) {
        self.lock().active_cancel = None;
    }

    fn abort_cause(&self) -> Option<CancelCause> {
        self.lock().abort
    }

    fn current_step(&self) -> String {
        let state = self.lock();
        if state.paused {
            PAUSED_LABEL.to_string()
        } else {
            state.step_label.clone()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Interpreter
// ─────────────────────────────────────────────────────────────────────────────

enum StepResult {
    /// Follow the `next` edge; carries the step's result message.
    Continue(String),
    /// An `End` node was reached.
    End,
}

#[derive(Clone)]
enum StepAction {
    Device(DeviceCommand),
    Move(MoveTarget),
}

pub struct RoutineInterpreter {
    scheduler: Arc<dyn StepScheduler>,
    client: Arc<ActionClient>,
    mover: Arc<MoveSupervisor>,
    config: InterpreterConfig,
}

impl RoutineInterpreter {
    pub fn new(
        scheduler: Arc<dyn StepScheduler>,
        client: Arc<ActionClient>,
        mover: Arc<MoveSupervisor>,
        config: InterpreterConfig,
    ) -> Self {
        Self {
            scheduler,
            client,
            mover,
            config,
        }
    }

    /// Execute `graph` to a terminal state.
    ///
    /// Signals are read from the scheduler for the duration of the call and
    /// the [`CURRENT_STEP_QUERY`] is registered on it.
    #[instrument(name = "routine_run", skip(self, graph), fields(workflow_id = ?graph.workflow_id))]
    pub async fn run(&self, graph: &RoutineGraph, run_id: &str) -> RunReport {
        let shared = Arc::new(SharedRunState::new(&graph.root_node_id));

        let query_state = Arc::clone(&shared);
        self.scheduler
            .register_query(CURRENT_STEP_QUERY, Arc::new(move || query_state.current_step()));

        let listener = {
            let scheduler = Arc::clone(&self.scheduler);
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                while let Some(signal) = scheduler.await_signal().await {
                    shared.apply(signal);
                }
            })
        };

        info!(run_id, root = %graph.root_node_id, "routine started");
        let report = self.walk(graph, run_id, &shared).await;
        listener.abort();

        match &report.error {
            None => info!(run_id, outcome = %report.outcome, "routine finished"),
            Some(e) => warn!(run_id, outcome = %report.outcome, error = %e, "routine finished"),
        }
        report
    }

    async fn walk(&self, graph: &RoutineGraph, run_id: &str, shared: &SharedRunState) -> RunReport {
        let mut current = graph.root_node_id.clone();
        let mut last_message = String::new();

        loop {
            if let Some(cause) = shared.wait_until_runnable().await {
                return self.finish_aborted(run_id, cause).await;
            }

            let Some(node) = graph.node(&current) else {
                return RunReport::failed(run_id, BotError::NodeNotFound(current));
            };
            let Some(token) = shared.begin_step(&node.id, node.node_type.as_str()) else {
                continue;
            };

            let ctx = StepContext::new(
                run_id,
                node.node_type.as_str(),
                token.clone(),
                Arc::clone(&self.scheduler),
            );
            let result = self.execute_node(&ctx, node).await;
            shared.end_step();

            match result {
                Ok(StepResult::End) => {
                    let message = if last_message.is_empty() {
                        COMPLETED_MESSAGE.to_string()
                    } else {
                        last_message
                    };
                    return RunReport::completed(run_id, message);
                }
                Ok(StepResult::Continue(message)) => {
                    let Some(next) = node.transitions.next() else {
                        return RunReport::failed(
                            run_id,
                            BotError::missing_transition(&node.id, TransitionKind::Next),
                        );
                    };
                    if !message.is_empty() {
                        last_message = message;
                    }
                    current = next.to_string();
                }
                Err(e) if token.is_cancelled() || e.is_canceled() => {
                    if let Some(cause) = shared.abort_cause() {
                        return self.finish_aborted(run_id, cause).await;
                    }
                    if !token.is_cancelled() {
                        // Canceled from below without any signal.
                        return RunReport::failed(run_id, e);
                    }
                    info!(run_id, node_id = %node.id, "step interrupted by pause, will run again");
                }
                Err(e) if e.is_configuration_error() => {
                    error!(run_id, node_id = %node.id, error = %e, "routine misconfigured");
                    return RunReport::failed(run_id, e);
                }
                Err(e) => {
                    warn!(run_id, node_id = %node.id, error = %e, "step failed");
                    let Some(failure) = node.transitions.failure() else {
                        return RunReport::failed(
                            run_id,
                            BotError::missing_transition(&node.id, TransitionKind::Failure),
                        );
                    };
                    current = failure.to_string();
                }
            }
        }
    }

    #[instrument(
        name = "routine_step",
        skip_all,
        fields(run_id = %ctx.run_id, node_id = %node.id, node_type = %node.node_type)
    )]
    async fn execute_node(&self, ctx: &StepContext, node: &RoutineNode) -> Result<StepResult, BotError> {
        match &node.node_type {
            NodeType::Start => Ok(StepResult::Continue(String::new())),
            NodeType::End => Ok(StepResult::End),
            NodeType::Sleep => {
                let millis = node.number_param("duration")?;
                if !millis.is_finite() || millis < 0.0 {
                    return Err(BotError::InvalidInput(format!(
                        "node {}: duration must be a non-negative number of milliseconds",
                        node.id
                    )));
                }
                tokio::select! {
                    _ = ctx.cancelled() => Err(BotError::Canceled(format!("sleep in {} canceled", node.id))),
                    _ = tokio::time::sleep(Duration::from_millis(millis as u64)) => {
                        Ok(StepResult::Continue(String::new()))
                    }
                }
            }
            NodeType::Move => {
                let target = MoveTarget::from_node(node)?;
                self.run_action(ctx, node, StepAction::Move(target)).await
            }
            kind if kind.is_action() => {
                let command = DeviceCommand::from_node(node)?;
                self.run_action(ctx, node, StepAction::Device(command)).await
            }
            other => Err(BotError::UnsupportedNodeType(other.to_string())),
        }
    }

    /// Run a device action under the node's retry policy.
    async fn run_action(
        &self,
        ctx: &StepContext,
        node: &RoutineNode,
        action: StepAction,
    ) -> Result<StepResult, BotError> {
        let policy = node
            .retry
            .clone()
            .unwrap_or_else(|| self.config.default_retry.clone());

        let client = Arc::clone(&self.client);
        let mover = Arc::clone(&self.mover);
        let attempt_ctx = ctx.clone();
        let op = move || -> StepFuture {
            let client = Arc::clone(&client);
            let mover = Arc::clone(&mover);
            let ctx = attempt_ctx.clone();
            let action = action.clone();
            Box::pin(async move {
                match action {
                    StepAction::Move(target) => mover.run(&ctx, target).await,
                    StepAction::Device(command) => client.invoke(&ctx, command).await,
                }
            })
        };

        let message = self
            .scheduler
            .execute_with_retry(&ctx.step, &policy, &ctx.cancel, &op)
            .await?;
        Ok(StepResult::Continue(message))
    }

    async fn finish_aborted(&self, run_id: &str, cause: CancelCause) -> RunReport {
        let mut report = RunReport::canceled(run_id, cause);
        if cause.requires_compensation() {
            info!(run_id, "sitting robot down after abort");
            if let Err(e) = self.compensate(run_id).await {
                error!(run_id, error = %e, "compensating SitDown failed");
                report.compensation_error = Some(e);
            }
        }
        report
    }

    /// SitDown on a fresh token, bounded by the compensation timeout.
    async fn compensate(&self, run_id: &str) -> Result<String, BotError> {
        let ctx = StepContext::new(
            run_id,
            "Compensation",
            CancellationToken::new(),
            Arc::clone(&self.scheduler),
        );
        let timeout = self.config.compensation_timeout;
        match tokio::time::timeout(timeout, self.client.invoke(&ctx, DeviceCommand::SitDown)).await {
            Ok(result) => result,
            Err(_) => {
                ctx.cancel.cancel();
                Err(BotError::Timeout(format!("compensating SitDown exceeded {timeout:?}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_client::ActionClientConfig;
    use crate::move_supervisor::MoveConfig;
    use crate::scheduler::{LocalScheduler, SignalSender};
    use botflow_link::DeviceLink;
    use botflow_link::loopback::{LoopbackDevice, Reply, SimRobot};
    use botflow_link::protocol::{ServiceRequest, api_id};
    use botflow_types::RunOutcome;

    struct Harness {
        interpreter: RoutineInterpreter,
        scheduler: Arc<LocalScheduler>,
        signals: SignalSender,
    }

    fn harness(device: Arc<LoopbackDevice>) -> Harness {
        let (scheduler, signals) = LocalScheduler::new();
        let scheduler = Arc::new(scheduler);
        let client = Arc::new(ActionClient::new(
            Arc::new(DeviceLink::new(device)),
            ActionClientConfig {
                endpoint: "loop://robot".to_string(),
                heartbeat_interval: Duration::from_millis(10),
                stop_timeout: Duration::from_millis(200),
                ..ActionClientConfig::default()
            },
        ));
        let mover = Arc::new(MoveSupervisor::new(
            Arc::clone(&client),
            None,
            MoveConfig {
                poll_interval: Duration::from_millis(10),
            },
        ));
        let interpreter = RoutineInterpreter::new(
            scheduler.clone(),
            client,
            mover,
            InterpreterConfig {
                compensation_timeout: Duration::from_millis(500),
                default_retry: RetryPolicy::no_retry(),
            },
        );
        Harness {
            interpreter,
            scheduler,
            signals,
        }
    }

    fn linear(middle: RoutineNode) -> RoutineGraph {
        let id = middle.id.clone();
        RoutineGraph::new("start")
            .with_node(RoutineNode::new("start", NodeType::Start).then(&id))
            .with_node(middle.then("end"))
            .with_node(RoutineNode::new("end", NodeType::End))
    }

    #[tokio::test]
    async fn start_sleep_end_completes() {
        let h = harness(SimRobot::new().device());
        let graph = linear(RoutineNode::new("nap", NodeType::Sleep).with_param("duration", 5));
        let report = h.interpreter.run(&graph, "run-1").await;
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.message, COMPLETED_MESSAGE);
    }

    #[tokio::test]
    async fn end_stops_the_walk() {
        let robot = SimRobot::new();
        let device = robot.device();
        let h = harness(device.clone());
        let graph = RoutineGraph::new("end")
            .with_node(RoutineNode::new("end", NodeType::End).then("stand"))
            .with_node(RoutineNode::new("stand", NodeType::StandUp));
        let report = h.interpreter.run(&graph, "run-end").await;
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert!(device.requests().is_empty());
    }

    #[tokio::test]
    async fn missing_node_fails() {
        let h = harness(SimRobot::new().device());
        let graph = RoutineGraph::new("start")
            .with_node(RoutineNode::new("start", NodeType::Start).then("ghost"));
        let report = h.interpreter.run(&graph, "run-2").await;
        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_eq!(report.error, Some(BotError::NodeNotFound("ghost".into())));
    }

    #[tokio::test]
    async fn unknown_node_type_fails() {
        let h = harness(SimRobot::new().device());
        let graph = linear(RoutineNode::new("d", NodeType::Other("Dance".into())));
        let report = h.interpreter.run(&graph, "run-3").await;
        assert!(matches!(report.error, Some(BotError::UnsupportedNodeType(_))));
    }

    #[tokio::test]
    async fn action_without_next_is_misconfigured() {
        let h = harness(SimRobot::new().device());
        let graph = RoutineGraph::new("stand").with_node(RoutineNode::new("stand", NodeType::StandUp));
        let report = h.interpreter.run(&graph, "run-4").await;
        assert_eq!(
            report.error,
            Some(BotError::missing_transition("stand", TransitionKind::Next))
        );
    }

    #[tokio::test]
    async fn failed_action_follows_failure_edge() {
        let robot = SimRobot::new();
        robot.reject(api_id::TTS);
        let device = robot.device();
        let h = harness(device.clone());
        let graph = RoutineGraph::new("say")
            .with_node(
                RoutineNode::new("say", NodeType::Tts)
                    .with_param("text", "hello")
                    .then("end")
                    .on_failure("sit"),
            )
            .with_node(RoutineNode::new("sit", NodeType::SitDown).then("end"))
            .with_node(RoutineNode::new("end", NodeType::End));
        let report = h.interpreter.run(&graph, "run-5").await;
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(device.calls_with_api(api_id::MOTION_CONTROL), 1);
    }

    #[tokio::test]
    async fn invalid_params_fail_without_failure_edge() {
        let robot = SimRobot::new();
        let device = robot.device();
        let h = harness(device.clone());
        let graph = RoutineGraph::new("head")
            .with_node(
                RoutineNode::new("head", NodeType::Head)
                    .then("end")
                    .on_failure("end"),
            )
            .with_node(RoutineNode::new("end", NodeType::End));
        let report = h.interpreter.run(&graph, "run-6").await;
        assert_eq!(report.outcome, RunOutcome::Failed);
        assert!(matches!(report.error, Some(BotError::InvalidInput(_))));
        assert!(device.requests().is_empty());
    }

    #[tokio::test]
    async fn node_retry_policy_is_honoured() {
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let device = LoopbackDevice::new(move |req: &ServiceRequest| {
            if counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                Reply::rejected(req, "busy")
            } else {
                Reply::ok(req, "ok")
            }
        });
        let h = harness(device);
        let graph = linear(RoutineNode::new("stand", NodeType::StandUp).with_retry(RetryPolicy {
            initial_interval_ms: 5,
            maximum_interval_ms: 5,
            maximum_attempts: 3,
            backoff_coefficient: 1.0,
        }));
        let report = h.interpreter.run(&graph, "run-7").await;
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn query_reports_step_and_pause() {
        let h = harness(SimRobot::new().device());
        let graph = linear(RoutineNode::new("nap", NodeType::Sleep).with_param("duration", 10_000));
        let Harness {
            interpreter,
            scheduler,
            signals,
        } = h;
        let run = tokio::spawn(async move { interpreter.run(&graph, "run-8").await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(scheduler.query(CURRENT_STEP_QUERY).as_deref(), Some("Sleep"));

        signals.send(Signal::Pause).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(scheduler.query(CURRENT_STEP_QUERY).as_deref(), Some(PAUSED_LABEL));

        signals.send(Signal::Cancel).unwrap();
        let report = run.await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Canceled);
    }

    #[tokio::test]
    async fn low_battery_while_paused_still_compensates() {
        let robot = SimRobot::new();
        let device = robot.device();
        let h = harness(device.clone());
        let graph = linear(RoutineNode::new("nap", NodeType::Sleep).with_param("duration", 10_000));
        let Harness {
            interpreter,
            signals,
            ..
        } = h;
        let run = tokio::spawn(async move { interpreter.run(&graph, "run-9").await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        signals.send(Signal::Pause).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        signals.send(Signal::LowBattery).unwrap();

        let report = run.await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Canceled);
        assert!(report.compensation_error.is_none());
        assert_eq!(device.calls_with_api(api_id::MOTION_CONTROL), 1);
        assert_eq!(device.requests()[0].body()["action"], 4);
    }

    #[tokio::test]
    async fn failed_compensation_is_reported() {
        let robot = SimRobot::new();
        robot.reject(api_id::MOTION_CONTROL);
        let h = harness(robot.device());
        let graph = linear(RoutineNode::new("nap", NodeType::Sleep).with_param("duration", 10_000));
        let Harness {
            interpreter,
            signals,
            ..
        } = h;
        let run = tokio::spawn(async move { interpreter.run(&graph, "run-10").await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        signals.send(Signal::LowBattery).unwrap();

        let report = run.await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Canceled);
        assert!(matches!(report.error, Some(BotError::Canceled(_))));
        assert!(matches!(
            report.compensation_error,
            Some(BotError::RemoteServiceError(_))
        ));
    }
}
