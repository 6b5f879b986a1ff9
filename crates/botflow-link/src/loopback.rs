//! In-process device doubles for headless tests.
//!
//! [`LoopbackDevice`] is a [`Dialer`] whose connections are served by a
//! scripted responder instead of a socket.  It records every service call,
//! counts dials, and can push telemetry frames to subscribed connections.
//! [`SimRobot`] is a small stateful responder that behaves like the real
//! robot's `/api/system` service.
//!
//! ```rust
//! use botflow_link::loopback::{LoopbackDevice, Reply};
//! use botflow_link::protocol::ServiceRequest;
//!
//! let device = LoopbackDevice::new(|req: &ServiceRequest| Reply::ok(req, "{}"));
//! assert_eq!(device.dial_count(), 0);
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use botflow_types::{BotError, MissionCode};
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::protocol::{ServiceRequest, ServiceResponse, TELEMETRY_TOPIC, TopicMessage, api_id, motion};
use crate::transport::{Dialer, Transport};

fn locked<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ────────────────────────────────────────────────────────────────────────────
// Scripted replies
// ────────────────────────────────────────────────────────────────────────────

/// What the device does with one service call.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Answer immediately.
    Respond(ServiceResponse),
    /// Answer with an arbitrary frame.
    Raw(String),
    /// Answer after a delay.  Later calls on the same connection queue behind it.
    Delay(Duration, ServiceResponse),
    /// Never answer.
    Silent,
    /// Drop the connection.
    Disconnect,
}

impl Reply {
    pub fn ok(req: &ServiceRequest, data: impl Into<String>) -> Self {
        Reply::Respond(ServiceResponse::ok(&req.service, data))
    }

    pub fn rejected(req: &ServiceRequest, data: impl Into<String>) -> Self {
        Reply::Respond(ServiceResponse::rejected(&req.service, data))
    }
}

type Responder = dyn Fn(&ServiceRequest) -> Reply + Send + Sync;

struct Shared {
    responder: Box<Responder>,
    requests: StdMutex<Vec<ServiceRequest>>,
    subscribers: StdMutex<Vec<mpsc::UnboundedSender<String>>>,
    connections: StdMutex<Vec<CancellationToken>>,
    dials: AtomicUsize,
    refuse_dials: AtomicBool,
}

// ────────────────────────────────────────────────────────────────────────────
// LoopbackDevice
// ────────────────────────────────────────────────────────────────────────────

pub struct LoopbackDevice {
    shared: Arc<Shared>,
}

impl LoopbackDevice {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&ServiceRequest) -> Reply + Send + Sync + 'static,
    {
        Arc::new(Self {
            shared: Arc::new(Shared {
                responder: Box::new(responder),
                requests: StdMutex::new(Vec::new()),
                subscribers: StdMutex::new(Vec::new()),
                connections: StdMutex::new(Vec::new()),
                dials: AtomicUsize::new(0),
                refuse_dials: AtomicBool::new(false),
            }),
        })
    }

    /// Number of successful dials so far.
    pub fn dial_count(&self) -> usize {
        self.shared.dials.load(Ordering::SeqCst)
    }

    /// Every service call received, in arrival order.
    pub fn requests(&self) -> Vec<ServiceRequest> {
        locked(&self.shared.requests).clone()
    }

    /// How many `/api/system` calls carried `api`.
    pub fn calls_with_api(&self, api: i64) -> usize {
        locked(&self.shared.requests)
            .iter()
            .filter(|req| req.api_id() == Some(api))
            .count()
    }

    /// Make subsequent dials fail with a connection error.
    pub fn refuse_dials(&self, refuse: bool) {
        self.shared.refuse_dials.store(refuse, Ordering::SeqCst);
    }

    /// Connections currently subscribed to telemetry.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = locked(&self.shared.subscribers);
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    /// Push `data` on the telemetry topic to every subscriber.  Returns the
    /// number of connections reached.
    pub fn publish(&self, data: impl Into<String>) -> usize {
        let Ok(frame) = TopicMessage::new(TELEMETRY_TOPIC, data).encode() else {
            return 0;
        };
        let mut subscribers = locked(&self.shared.subscribers);
        subscribers.retain(|tx| tx.send(frame.clone()).is_ok());
        subscribers.len()
    }

    /// Drop every open connection, as if the device rebooted.
    pub fn disconnect_all(&self) {
        for token in locked(&self.shared.connections).drain(..) {
            token.cancel();
        }
        locked(&self.shared.subscribers).clear();
    }
}

#[async_trait]
impl Dialer for LoopbackDevice {
    async fn dial(&self, endpoint: &str) -> Result<Arc<dyn Transport>, BotError> {
        if self.shared.refuse_dials.load(Ordering::SeqCst) {
            return Err(BotError::connection(endpoint, "connection refused"));
        }
        self.shared.dials.fetch_add(1, Ordering::SeqCst);

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        locked(&self.shared.connections).push(closed.clone());

        tokio::spawn(serve(
            Arc::clone(&self.shared),
            inbox_rx,
            outbox_tx,
            closed.clone(),
        ));

        Ok(Arc::new(LoopbackTransport {
            endpoint: endpoint.to_string(),
            inbox: inbox_tx,
            outbox: Mutex::new(outbox_rx),
            closed,
        }))
    }
}

/// Device side of one connection.  Calls are answered strictly in order.
async fn serve(
    shared: Arc<Shared>,
    mut inbox: mpsc::UnboundedReceiver<String>,
    outbox: mpsc::UnboundedSender<String>,
    closed: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = inbox.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let Ok(value) = serde_json::from_str::<Value>(&frame) else {
            continue;
        };
        match value.get("op").and_then(Value::as_str) {
            Some("subscribe") => locked(&shared.subscribers).push(outbox.clone()),
            Some("call_service") => {
                let Ok(req) = serde_json::from_value::<ServiceRequest>(value) else {
                    continue;
                };
                let reply = (shared.responder)(&req);
                locked(&shared.requests).push(req);
                match reply {
                    Reply::Respond(response) => {
                        let _ = outbox.send(response.encode());
                    }
                    Reply::Raw(raw) => {
                        let _ = outbox.send(raw);
                    }
                    Reply::Delay(delay, response) => {
                        tokio::select! {
                            _ = closed.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {
                                let _ = outbox.send(response.encode());
                            }
                        }
                    }
                    Reply::Silent => {}
                    Reply::Disconnect => {
                        closed.cancel();
                        break;
                    }
                }
            }
            _ => {}
        }
    }
}

struct LoopbackTransport {
    endpoint: String,
    inbox: mpsc::UnboundedSender<String>,
    outbox: Mutex<mpsc::UnboundedReceiver<String>>,
    closed: CancellationToken,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, frame: String) -> Result<(), BotError> {
        if self.closed.is_cancelled() {
            return Err(BotError::connection(&self.endpoint, "connection closed"));
        }
        self.inbox
            .send(frame)
            .map_err(|_| BotError::connection(&self.endpoint, "device hung up"))
    }

    async fn recv(&self) -> Result<String, BotError> {
        let mut outbox = self.outbox.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => {
                Err(BotError::connection(&self.endpoint, "connection reset by device"))
            }
            frame = outbox.recv() => {
                frame.ok_or_else(|| BotError::connection(&self.endpoint, "device hung up"))
            }
        }
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimRobot
// ────────────────────────────────────────────────────────────────────────────

struct SimState {
    battery: i64,
    x: f64,
    y: f64,
    yaw_rad: f64,
    mission_id: String,
    mission_code: MissionCode,
    mission_message: String,
    finish_with: MissionCode,
    rejected: HashSet<i64>,
}

/// A stateful stand-in for the robot's system service.
///
/// Move missions jump straight to the configured outcome
/// ([`MissionCode::Success`] by default) at the target pose; with
/// [`MissionCode::Start`] they never finish until stopped.
#[derive(Clone)]
pub struct SimRobot {
    state: Arc<StdMutex<SimState>>,
}

impl Default for SimRobot {
    fn default() -> Self {
        Self::new()
    }
}

impl SimRobot {
    pub fn new() -> Self {
        Self {
            state: Arc::new(StdMutex::new(SimState {
                battery: 100,
                x: 0.0,
                y: 0.0,
                yaw_rad: 0.0,
                mission_id: String::new(),
                mission_code: MissionCode::Init,
                mission_message: String::new(),
                finish_with: MissionCode::Success,
                rejected: HashSet::new(),
            })),
        }
    }

    /// A [`LoopbackDevice`] served by this robot.
    pub fn device(&self) -> Arc<LoopbackDevice> {
        let robot = self.clone();
        LoopbackDevice::new(move |req: &ServiceRequest| robot.respond(req))
    }

    pub fn set_battery(&self, level: i64) {
        locked(&self.state).battery = level;
    }

    /// Outcome reported for the next move missions.
    pub fn finish_missions_with(&self, code: MissionCode) {
        locked(&self.state).finish_with = code;
    }

    /// Answer calls with `api` using `result: false`.
    pub fn reject(&self, api: i64) {
        locked(&self.state).rejected.insert(api);
    }

    pub fn mission_id(&self) -> String {
        locked(&self.state).mission_id.clone()
    }

    /// The status document as returned by the status service.
    pub fn status_document(&self) -> Value {
        let state = locked(&self.state);
        let half = state.yaw_rad / 2.0;
        json!({
            "api_id": api_id::STATUS,
            "battery_level": state.battery,
            "pose": {
                "position": { "x": state.x, "y": state.y, "z": 0.0 },
                "orientation": { "x": 0.0, "y": 0.0, "z": half.sin(), "w": half.cos() }
            },
            "mission_id": state.mission_id,
            "mission": { "code": state.mission_code.code(), "message": state.mission_message },
            "status": { "code": 0, "message": "SUCCESS" }
        })
    }

    /// `msg.data` of a telemetry frame.
    pub fn telemetry_data(&self) -> String {
        json!({
            "device_name": "sim-robot",
            "device_status": self.status_document().to_string(),
            "timestamp": Utc::now().to_rfc3339(),
        })
        .to_string()
    }

    fn accepted(api: i64) -> String {
        json!({ "api_id": api, "status": { "code": 0, "message": "SUCCESS" } }).to_string()
    }

    pub fn respond(&self, req: &ServiceRequest) -> Reply {
        let Some(api) = req.api_id() else {
            // Head service: no api id, just acknowledge.
            return Reply::ok(req, "");
        };
        if locked(&self.state).rejected.contains(&api) {
            return Reply::rejected(req, format!("api {api} rejected"));
        }
        let body = req.body();
        match api {
            api_id::MOVE => {
                let mut state = locked(&self.state);
                state.mission_id = body
                    .get("mission_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                state.mission_code = state.finish_with;
                if state.finish_with == MissionCode::Success {
                    state.x = body.get("x").and_then(Value::as_f64).unwrap_or(state.x);
                    state.y = body.get("y").and_then(Value::as_f64).unwrap_or(state.y);
                    state.yaw_rad = body
                        .get("orientation")
                        .and_then(Value::as_f64)
                        .unwrap_or(state.yaw_rad);
                    state.mission_message = "arrived".to_string();
                } else {
                    state.mission_message = format!("mission {:?}", state.finish_with);
                }
                Reply::ok(req, Self::accepted(api))
            }
            api_id::STATUS => Reply::ok(req, self.status_document().to_string()),
            api_id::STOP => {
                let mut state = locked(&self.state);
                if state.mission_code == MissionCode::Start {
                    state.mission_code = MissionCode::Abort;
                    state.mission_message = "stopped".to_string();
                }
                Reply::ok(req, Self::accepted(api))
            }
            api_id::MOTION_CONTROL => {
                let action = body.get("action").and_then(Value::as_i64);
                if matches!(action, Some(motion::STAND_UP) | Some(motion::SIT_DOWN)) {
                    Reply::ok(req, Self::accepted(api))
                } else {
                    Reply::ok(
                        req,
                        json!({ "api_id": api, "status": { "code": 1, "message": "unknown action" } })
                            .to_string(),
                    )
                }
            }
            _ => Reply::ok(req, Self::accepted(api)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system(api: i64, extra: Value) -> ServiceRequest {
        let mut body = json!({ "api_id": api });
        if let (Some(body), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
            body.extend(extra.clone());
        }
        ServiceRequest::system(&body)
    }

    #[tokio::test]
    async fn loopback_records_calls_and_answers() {
        let device = LoopbackDevice::new(|req: &ServiceRequest| Reply::ok(req, "pong"));
        let transport = device.dial("loop://robot").await.unwrap();
        transport
            .send(system(api_id::STATUS, json!({})).encode().unwrap())
            .await
            .unwrap();
        let reply = ServiceResponse::parse(&transport.recv().await.unwrap()).unwrap();
        assert_eq!(reply.data(), "pong");
        assert_eq!(device.calls_with_api(api_id::STATUS), 1);
        assert_eq!(device.dial_count(), 1);
    }

    #[tokio::test]
    async fn refused_dial_is_connection_failure() {
        let device = SimRobot::new().device();
        device.refuse_dials(true);
        assert!(matches!(
            device.dial("loop://robot").await.map(|_| ()),
            Err(BotError::ConnectionFailure { .. })
        ));
        assert_eq!(device.dial_count(), 0);
    }

    #[test]
    fn sim_robot_completes_moves_at_target() {
        let robot = SimRobot::new();
        let req = system(
            api_id::MOVE,
            json!({ "mission_id": "m-9", "x": 2.0, "y": -1.0, "orientation": 0.0 }),
        );
        assert!(matches!(robot.respond(&req), Reply::Respond(r) if r.result));
        let doc = robot.status_document();
        assert_eq!(doc["mission_id"], "m-9");
        assert_eq!(doc["mission"]["code"], 2);
        assert_eq!(doc["pose"]["position"]["x"], 2.0);
    }

    #[test]
    fn stop_aborts_running_mission() {
        let robot = SimRobot::new();
        robot.finish_missions_with(MissionCode::Start);
        robot.respond(&system(api_id::MOVE, json!({ "mission_id": "m-1" })));
        robot.respond(&system(api_id::STOP, json!({})));
        assert_eq!(robot.status_document()["mission"]["code"], 4);
    }

    #[test]
    fn rejected_api_answers_result_false() {
        let robot = SimRobot::new();
        robot.reject(api_id::TTS);
        let reply = robot.respond(&system(api_id::TTS, json!({ "text": "hi" })));
        assert!(matches!(reply, Reply::Respond(r) if !r.result));
    }
}
