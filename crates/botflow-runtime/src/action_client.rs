//! [`ActionClient`] – turns logical robot actions into device calls.
//!
//! Every call is encoded into the device's service envelope, sent through
//! the shared [`DeviceLink`] under the heartbeat supervisor, and its reply
//! classified into a payload or a [`BotError`].

use std::sync::Arc;
use std::time::Duration;

use botflow_link::DeviceLink;
use botflow_link::normalize::normalize_status;
use botflow_link::protocol::{ServiceRequest, ServiceResponse, api_id, motion};
use botflow_types::{BotError, MissionStatus, NodeType, RoutineNode};
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::context::StepContext;
use crate::heartbeat::{DEFAULT_HEARTBEAT_INTERVAL, with_heartbeat};

#[derive(Debug, Clone)]
pub struct ActionClientConfig {
    /// `ws://host:port` of the robot.
    pub endpoint: String,
    pub heartbeat_interval: Duration,
    /// Budget for a stop command issued after cancellation.
    pub stop_timeout: Duration,
    pub voice_name: String,
    pub speech_speed: f64,
    pub speech_volume: f64,
}

impl Default for ActionClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:9090".to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            stop_timeout: Duration::from_secs(5),
            voice_name: "English-US.Male-1".to_string(),
            speech_speed: 1.0,
            speech_volume: 1.0,
        }
    }
}

/// A single device command.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    StandUp,
    SitDown,
    Head { angle_deg: f64 },
    Move {
        mission_id: String,
        x: f64,
        y: f64,
        orientation_deg: f64,
    },
    Speak { text: String },
    Status,
    Stop,
}

impl DeviceCommand {
    /// Build the command for an action node from its params.
    ///
    /// Move nodes are not single commands; they go through
    /// [`MoveSupervisor`](crate::MoveSupervisor).
    pub fn from_node(node: &RoutineNode) -> Result<Self, BotError> {
        match &node.node_type {
            NodeType::StandUp => Ok(DeviceCommand::StandUp),
            NodeType::SitDown => Ok(DeviceCommand::SitDown),
            NodeType::Head => Ok(DeviceCommand::Head {
                angle_deg: node.number_param("angle")?,
            }),
            NodeType::Tts => Ok(DeviceCommand::Speak {
                text: node.string_param("text")?.to_string(),
            }),
            other => Err(BotError::UnsupportedNodeType(format!(
                "{other} is not a device action"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeviceCommand::StandUp => "StandUp",
            DeviceCommand::SitDown => "SitDown",
            DeviceCommand::Head { .. } => "Head",
            DeviceCommand::Move { .. } => "Move",
            DeviceCommand::Speak { .. } => "TTS",
            DeviceCommand::Status => "Status",
            DeviceCommand::Stop => "Stop",
        }
    }

    /// Encode into the device's request envelope.
    pub fn to_request(&self, config: &ActionClientConfig) -> ServiceRequest {
        let body = match self {
            DeviceCommand::Head { angle_deg } => return ServiceRequest::head(*angle_deg),
            DeviceCommand::StandUp => json!({
                "api_id": api_id::MOTION_CONTROL,
                "action": motion::STAND_UP,
            }),
            DeviceCommand::SitDown => json!({
                "api_id": api_id::MOTION_CONTROL,
                "action": motion::SIT_DOWN,
            }),
            DeviceCommand::Move {
                mission_id,
                x,
                y,
                orientation_deg,
            } => json!({
                "api_id": api_id::MOVE,
                "mission_id": mission_id,
                "x": x,
                "y": y,
                "orientation": orientation_deg.to_radians(),
            }),
            DeviceCommand::Speak { text } => json!({
                "api_id": api_id::TTS,
                "text": text,
                "voice_name": config.voice_name,
                "speed": config.speech_speed,
                "volume": config.speech_volume,
            }),
            DeviceCommand::Status => json!({ "api_id": api_id::STATUS }),
            DeviceCommand::Stop => json!({ "api_id": api_id::STOP }),
        };
        ServiceRequest::system(&body)
    }
}

/// Fresh identifier for a move mission.
pub fn new_mission_id() -> String {
    Uuid::new_v4().to_string()
}

pub struct ActionClient {
    link: Arc<DeviceLink>,
    config: ActionClientConfig,
}

impl ActionClient {
    pub fn new(link: Arc<DeviceLink>, config: ActionClientConfig) -> Self {
        Self { link, config }
    }

    pub fn config(&self) -> &ActionClientConfig {
        &self.config
    }

    /// Send `command` and return the reply payload.
    ///
    /// # Errors
    ///
    /// * [`BotError::Canceled`] as soon as `ctx` is cancelled.
    /// * [`BotError::RemoteServiceError`] when the device rejects the call.
    /// * [`BotError::InvalidResponse`] for a malformed reply.
    /// * [`BotError::ConnectionFailure`] on socket errors.
    #[instrument(
        name = "device_call",
        skip(self, ctx, command),
        fields(run_id = %ctx.run_id, step = %ctx.step, command = command.name())
    )]
    pub async fn invoke(&self, ctx: &StepContext, command: DeviceCommand) -> Result<String, BotError> {
        let request = command.to_request(&self.config).encode()?;
        let link = Arc::clone(&self.link);
        let endpoint = self.config.endpoint.clone();
        let cancel = ctx.cancel.clone();

        let raw = with_heartbeat(ctx, self.config.heartbeat_interval, async move {
            link.call(&endpoint, request, &cancel).await
        })
        .await?;

        let payload = ServiceResponse::parse(&raw)?.into_payload()?;
        info!(command = command.name(), "device call succeeded");
        Ok(payload)
    }

    /// Query the robot's current status directly.
    pub async fn status(&self, ctx: &StepContext) -> Result<MissionStatus, BotError> {
        let payload = self.invoke(ctx, DeviceCommand::Status).await?;
        normalize_status(&Value::String(payload), "", Utc::now())
    }

    /// Best-effort stop, on a context detached from `ctx` and bounded by the
    /// configured stop timeout.
    pub async fn stop(&self, ctx: &StepContext) -> Result<String, BotError> {
        let detached = ctx.detached();
        match tokio::time::timeout(
            self.config.stop_timeout,
            self.invoke(&detached, DeviceCommand::Stop),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                detached.cancel.cancel();
                warn!(run_id = %ctx.run_id, "stop command timed out");
                Err(BotError::Timeout(format!(
                    "stop command did not complete within {:?}",
                    self.config.stop_timeout
                )))
            }
        }
    }
}
