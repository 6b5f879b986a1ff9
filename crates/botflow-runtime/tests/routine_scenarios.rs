//! End-to-end routine runs against a simulated robot.

use std::sync::Arc;
use std::time::Duration;

use botflow_link::loopback::{LoopbackDevice, SimRobot};
use botflow_link::protocol::{api_id, motion};
use botflow_link::{DeviceLink, StatusCache, StatusSubscriber, SubscriberConfig};
use botflow_runtime::{
    ActionClient, ActionClientConfig, BatteryMonitor, BatteryMonitorConfig, CURRENT_STEP_QUERY,
    InterpreterConfig, LocalScheduler, MoveConfig, MoveSupervisor, RoutineInterpreter, SignalSender,
};
use botflow_types::{
    BotError, MissionCode, NodeType, RetryPolicy, RoutineGraph, RoutineNode, RunOutcome, RunReport,
    Signal, TransitionKind,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const ENDPOINT: &str = "loop://robot";

struct Rig {
    interpreter: Arc<RoutineInterpreter>,
    scheduler: Arc<LocalScheduler>,
    signals: SignalSender,
}

fn rig(device: Arc<LoopbackDevice>, cache: Option<Arc<StatusCache>>) -> Rig {
    let (scheduler, signals) = LocalScheduler::new();
    let scheduler = Arc::new(scheduler);
    let client = Arc::new(ActionClient::new(
        Arc::new(DeviceLink::new(device)),
        ActionClientConfig {
            endpoint: ENDPOINT.to_string(),
            heartbeat_interval: Duration::from_millis(20),
            stop_timeout: Duration::from_millis(500),
            ..ActionClientConfig::default()
        },
    ));
    let mover = Arc::new(MoveSupervisor::new(
        Arc::clone(&client),
        cache,
        MoveConfig {
            poll_interval: Duration::from_millis(10),
        },
    ));
    let interpreter = RoutineInterpreter::new(
        scheduler.clone(),
        client,
        mover,
        InterpreterConfig {
            compensation_timeout: Duration::from_secs(1),
            default_retry: RetryPolicy::no_retry(),
        },
    );
    Rig {
        interpreter: Arc::new(interpreter),
        scheduler,
        signals,
    }
}

impl Rig {
    fn start(&self, graph: RoutineGraph, run_id: &str) -> JoinHandle<RunReport> {
        let interpreter = Arc::clone(&self.interpreter);
        let run_id = run_id.to_string();
        tokio::spawn(async move { interpreter.run(&graph, &run_id).await })
    }
}

/// `start -> action -> end`.
fn single_action(action: RoutineNode) -> RoutineGraph {
    let id = action.id.clone();
    RoutineGraph::new("start")
        .with_node(RoutineNode::new("start", NodeType::Start).then(&id))
        .with_node(action.then("end"))
        .with_node(RoutineNode::new("end", NodeType::End))
}

fn move_node(id: &str, x: f64, y: f64) -> RoutineNode {
    RoutineNode::new(id, NodeType::Move)
        .with_param("x", x)
        .with_param("y", y)
        .with_param("orientation", 0.0)
}

/// Poll `cond` every 5ms for up to 2s.
async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn move_to_target_completes_with_final_position() {
    let robot = SimRobot::new();
    let rig = rig(robot.device(), None);

    let report = rig.start(single_action(move_node("A", 1.0, 1.0)), "scenario-move").await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(report.message.contains("1.00, 1.00"), "message: {}", report.message);
}

#[tokio::test]
async fn rejected_speech_without_failure_edge_fails_the_run() {
    let robot = SimRobot::new();
    robot.reject(api_id::TTS);
    let rig = rig(robot.device(), None);

    let tts = RoutineNode::new("A", NodeType::Tts).with_param("text", "hi");
    let report = rig.start(single_action(tts), "scenario-tts").await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(
        report.error,
        Some(BotError::missing_transition("A", TransitionKind::Failure))
    );
}

#[tokio::test]
async fn pause_stops_the_move_and_resume_redispatches_it() {
    let robot = SimRobot::new();
    robot.finish_missions_with(MissionCode::Start);
    let device = robot.device();
    let rig = rig(device.clone(), None);
    let run = rig.start(single_action(move_node("A", 2.0, 3.0)), "scenario-pause");

    eventually("first dispatch", || device.calls_with_api(api_id::MOVE) == 1).await;
    let first_mission = robot.mission_id();

    rig.signals.send(Signal::Pause).unwrap();
    eventually("stop command", || device.calls_with_api(api_id::STOP) == 1).await;
    assert_eq!(rig.scheduler.query(CURRENT_STEP_QUERY).as_deref(), Some("Paused"));

    // Nothing is dispatched while paused.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(device.calls_with_api(api_id::MOVE), 1);

    robot.finish_missions_with(MissionCode::Success);
    rig.signals.send(Signal::Resume).unwrap();

    let report = run.await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(report.message.contains("2.00, 3.00"));
    assert_eq!(device.calls_with_api(api_id::MOVE), 2);
    assert_ne!(robot.mission_id(), first_mission, "resumed move must use a new mission id");
}

#[tokio::test]
async fn low_battery_from_telemetry_sits_the_robot_down_once() {
    let robot = SimRobot::new();
    robot.finish_missions_with(MissionCode::Start);
    let device = robot.device();
    let shutdown = CancellationToken::new();

    let cache = Arc::new(StatusCache::default());
    StatusSubscriber::new(
        device.clone(),
        Arc::clone(&cache),
        SubscriberConfig {
            endpoint: ENDPOINT.to_string(),
            reconnect_delay: Duration::from_millis(20),
        },
    )
    .spawn(shutdown.clone());

    // The robot publishes its status every 10ms.
    let feed = {
        let robot = robot.clone();
        let device = device.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            while !shutdown.is_cancelled() {
                device.publish(robot.telemetry_data());
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };

    let rig = rig(device.clone(), Some(Arc::clone(&cache)));
    BatteryMonitor::new(
        Arc::clone(&cache),
        rig.signals.clone(),
        BatteryMonitorConfig {
            threshold: 50,
            interval: Duration::from_millis(10),
        },
    )
    .spawn(shutdown.clone());

    let run = rig.start(single_action(move_node("A", 5.0, 5.0)), "scenario-battery");
    eventually("move dispatched", || device.calls_with_api(api_id::MOVE) == 1).await;

    robot.set_battery(20);
    let report = run.await.unwrap();
    shutdown.cancel();
    feed.await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Canceled);
    assert!(report.message.contains("low battery"));
    assert!(report.compensation_error.is_none());
    assert_eq!(device.calls_with_api(api_id::STOP), 1);

    let motion_calls: Vec<_> = device
        .requests()
        .into_iter()
        .filter(|r| r.api_id() == Some(api_id::MOTION_CONTROL))
        .collect();
    assert_eq!(motion_calls.len(), 1, "exactly one compensating call");
    assert_eq!(motion_calls[0].body()["action"], motion::SIT_DOWN);
}

#[tokio::test]
async fn operator_cancel_ends_without_compensation() {
    let robot = SimRobot::new();
    robot.finish_missions_with(MissionCode::Start);
    let device = robot.device();
    let rig = rig(device.clone(), None);
    let run = rig.start(single_action(move_node("A", 1.0, 0.0)), "scenario-cancel");

    eventually("move dispatched", || device.calls_with_api(api_id::MOVE) == 1).await;
    rig.signals.send(Signal::Cancel).unwrap();

    let report = run.await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Canceled);
    assert_eq!(device.calls_with_api(api_id::STOP), 1);
    assert_eq!(device.calls_with_api(api_id::MOTION_CONTROL), 0);
}

#[tokio::test]
async fn failure_branch_runs_recovery_actions() {
    let robot = SimRobot::new();
    robot.finish_missions_with(MissionCode::Failed);
    let device = robot.device();
    let rig = rig(device.clone(), None);

    let graph = RoutineGraph::new("start")
        .with_node(RoutineNode::new("start", NodeType::Start).then("stand"))
        .with_node(RoutineNode::new("stand", NodeType::StandUp).then("go"))
        .with_node(move_node("go", 4.0, 4.0).then("say").on_failure("look"))
        .with_node(
            RoutineNode::new("look", NodeType::Head)
                .with_param("angle", -15)
                .then("sit"),
        )
        .with_node(RoutineNode::new("say", NodeType::Tts).with_param("text", "arrived").then("sit"))
        .with_node(RoutineNode::new("sit", NodeType::SitDown).then("end"))
        .with_node(RoutineNode::new("end", NodeType::End));

    let report = rig.start(graph, "scenario-branch").await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(device.calls_with_api(api_id::TTS), 0);
    assert_eq!(device.calls_with_api(api_id::MOTION_CONTROL), 2);
    let head_calls = device.requests().iter().filter(|r| r.api_id().is_none()).count();
    assert_eq!(head_calls, 1);
}
