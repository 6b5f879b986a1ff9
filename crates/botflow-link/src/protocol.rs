//! Device wire protocol.
//!
//! The robot speaks a `rosbridge_server`-style JSON dialect over a single
//! WebSocket:
//!
//! * **Service calls** – `{"op":"call_service","service":..,"type":..,
//!   "args":{"data":..}}` answered by `{"op":"service_response","service":..,
//!   "values":{"data":..},"result":bool}`.
//! * **Telemetry** – the client sends `{"op":"subscribe","topic":"/api/info",..}`
//!   and the device pushes `{"op":"publish","topic":..,"msg":{"data":..}}`.
//!
//! Most commands go to `/api/system`, whose `args.data` is itself a JSON
//! document serialised to a string and keyed by an `api_id`.

use botflow_types::BotError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Generic command service.
pub const SYSTEM_SERVICE: &str = "/api/system";
pub const SYSTEM_SERVICE_TYPE: &str = "custom_msgs/srv/Api";

/// Head angle service; takes a bare number.
pub const HEAD_SERVICE: &str = "/set_angle_tag";
pub const HEAD_SERVICE_TYPE: &str = "custom_msgs/srv/SetFloat";

/// Telemetry feed.
pub const TELEMETRY_TOPIC: &str = "/api/info";
pub const TELEMETRY_TYPE: &str = "std_msgs/msg/String";

/// `api_id` values understood by [`SYSTEM_SERVICE`].
pub mod api_id {
    pub const MOVE: i64 = 1005;
    pub const STATUS: i64 = 1009;
    pub const MOTION_CONTROL: i64 = 1013;
    pub const TTS: i64 = 1014;
    pub const STOP: i64 = 5000;
}

/// `action` values for [`api_id::MOTION_CONTROL`].
pub mod motion {
    pub const STAND_UP: i64 = 3;
    pub const SIT_DOWN: i64 = 4;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceArgs {
    pub data: Value,
}

/// Outbound `call_service` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub op: String,
    pub service: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub args: ServiceArgs,
}

impl ServiceRequest {
    /// A call to [`SYSTEM_SERVICE`] carrying `body` as a JSON string.
    pub fn system(body: &Value) -> Self {
        Self {
            op: "call_service".to_string(),
            service: SYSTEM_SERVICE.to_string(),
            service_type: SYSTEM_SERVICE_TYPE.to_string(),
            args: ServiceArgs {
                data: Value::String(body.to_string()),
            },
        }
    }

    /// A call to [`HEAD_SERVICE`] with the angle in degrees.
    pub fn head(angle_deg: f64) -> Self {
        Self {
            op: "call_service".to_string(),
            service: HEAD_SERVICE.to_string(),
            service_type: HEAD_SERVICE_TYPE.to_string(),
            args: ServiceArgs {
                data: json!(angle_deg),
            },
        }
    }

    pub fn encode(&self) -> Result<String, BotError> {
        serde_json::to_string(self)
            .map_err(|e| BotError::Internal(format!("failed to encode request: {e}")))
    }

    pub fn decode(raw: &str) -> Result<Self, BotError> {
        serde_json::from_str(raw)
            .map_err(|e| BotError::InvalidInput(format!("malformed service request: {e}")))
    }

    /// The request body: the parsed JSON document for string payloads, the
    /// raw value otherwise.
    pub fn body(&self) -> Value {
        match &self.args.data {
            Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| self.args.data.clone()),
            other => other.clone(),
        }
    }

    pub fn api_id(&self) -> Option<i64> {
        self.body().get("api_id").and_then(Value::as_i64)
    }
}

/// Inbound `service_response` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub op: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub values: Value,
    #[serde(default)]
    pub result: bool,
}

impl ServiceResponse {
    /// A successful reply whose `values.data` is `data`.
    pub fn ok(service: &str, data: impl Into<String>) -> Self {
        Self::with_result(service, data, true)
    }

    /// A reply with `result: false`.
    pub fn rejected(service: &str, data: impl Into<String>) -> Self {
        Self::with_result(service, data, false)
    }

    fn with_result(service: &str, data: impl Into<String>, result: bool) -> Self {
        Self {
            op: "service_response".to_string(),
            service: service.to_string(),
            values: json!({ "data": data.into() }),
            result,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, BotError> {
        let response: ServiceResponse = serde_json::from_str(raw)
            .map_err(|e| BotError::InvalidResponse(format!("malformed envelope: {e}")))?;
        if response.op != "service_response" {
            return Err(BotError::InvalidResponse(format!(
                "expected service_response, got op '{}'",
                response.op
            )));
        }
        Ok(response)
    }

    pub fn encode(&self) -> String {
        Value::from(self).to_string()
    }

    /// The `values.data` payload rendered as a string.
    pub fn data(&self) -> String {
        match self.values.get("data") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None if self.values.is_null() => String::new(),
            None => self.values.to_string(),
        }
    }

    /// Classify the reply and return its payload.
    ///
    /// `result: false` and a body whose `status.code` is non-zero are
    /// remote rejections.
    pub fn into_payload(self) -> Result<String, BotError> {
        let data = self.data();
        if !self.result {
            return Err(BotError::RemoteServiceError(format!(
                "service {} returned result=false: {data}",
                self.service
            )));
        }
        if let Ok(body) = serde_json::from_str::<Value>(&data)
            && let Some(status) = body.get("status")
        {
            let code = status
                .get("code")
                .and_then(|c| c.as_i64().or_else(|| c.as_str()?.trim().parse().ok()))
                .unwrap_or(0);
            if code != 0 {
                let message = status
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Err(BotError::RemoteServiceError(format!(
                    "service {} failed with code {code}: {message}",
                    self.service
                )));
            }
        }
        Ok(data)
    }
}

impl From<&ServiceResponse> for Value {
    fn from(response: &ServiceResponse) -> Self {
        json!({
            "op": response.op,
            "service": response.service,
            "values": response.values,
            "result": response.result,
        })
    }
}

/// Outbound `subscribe` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub op: String,
    pub topic: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub throttle_rate: u32,
    pub queue_length: u32,
}

impl SubscribeRequest {
    /// Subscription to the device's status feed, newest frame only.
    pub fn telemetry() -> Self {
        Self {
            op: "subscribe".to_string(),
            topic: TELEMETRY_TOPIC.to_string(),
            message_type: TELEMETRY_TYPE.to_string(),
            throttle_rate: 0,
            queue_length: 1,
        }
    }

    pub fn encode(&self) -> Result<String, BotError> {
        serde_json::to_string(self)
            .map_err(|e| BotError::Internal(format!("failed to encode subscription: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicPayload {
    #[serde(default)]
    pub data: Value,
}

/// Inbound `publish` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicMessage {
    pub op: String,
    #[serde(default)]
    pub topic: String,
    pub msg: TopicPayload,
}

impl TopicMessage {
    pub fn new(topic: &str, data: impl Into<String>) -> Self {
        Self {
            op: "publish".to_string(),
            topic: topic.to_string(),
            msg: TopicPayload {
                data: Value::String(data.into()),
            },
        }
    }

    pub fn encode(&self) -> Result<String, BotError> {
        serde_json::to_string(self)
            .map_err(|e| BotError::Internal(format!("failed to encode topic message: {e}")))
    }
}
