//! Tolerant decoding of device telemetry.
//!
//! The device reports numbers inconsistently: battery level may arrive as
//! `94` or `"94"`, coordinates as floats or numeric strings, and the whole
//! `device_status` document either inline or serialised into a string.  All
//! of that is absorbed here so the rest of the engine only sees
//! [`MissionStatus`].

use botflow_types::{BotError, MissionCode, MissionStatus, Orientation, Position};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Read a number from a JSON number or a numeric string.
pub fn lenient_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Read an integer, truncating floats.
pub fn lenient_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    }
}

/// Read a string; numbers are rendered in their JSON form.
pub fn lenient_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn field<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(*key))
}

fn number_at(value: &Value, path: &[&str], default: f64) -> f64 {
    field(value, path).and_then(lenient_f64).unwrap_or(default)
}

/// Parse a document that may be JSON inline or JSON-in-a-string.
fn unwrap_document(value: &Value) -> Result<Value, BotError> {
    match value {
        Value::String(s) => serde_json::from_str(s)
            .map_err(|e| BotError::InvalidResponse(format!("embedded document is not JSON: {e}"))),
        Value::Object(_) => Ok(value.clone()),
        other => Err(BotError::InvalidResponse(format!(
            "expected a JSON document, got {other}"
        ))),
    }
}

/// Build a [`MissionStatus`] from a device status document.
///
/// `battery_level` is mandatory; every other field falls back to its
/// default when missing or unreadable.
pub fn normalize_status(
    raw: &Value,
    device_name: &str,
    observed_at: DateTime<Utc>,
) -> Result<MissionStatus, BotError> {
    let doc = unwrap_document(raw)?;
    let battery_level = doc
        .get("battery_level")
        .and_then(lenient_i64)
        .ok_or_else(|| BotError::InvalidResponse("status without battery_level".to_string()))?;

    let default_orientation = Orientation::default();
    let mission_code = field(&doc, &["mission", "code"])
        .and_then(lenient_i64)
        .and_then(MissionCode::from_code)
        .unwrap_or_default();

    Ok(MissionStatus {
        battery_level,
        position: Position {
            x: number_at(&doc, &["pose", "position", "x"], 0.0),
            y: number_at(&doc, &["pose", "position", "y"], 0.0),
            z: number_at(&doc, &["pose", "position", "z"], 0.0),
        },
        orientation: Orientation {
            x: number_at(&doc, &["pose", "orientation", "x"], default_orientation.x),
            y: number_at(&doc, &["pose", "orientation", "y"], default_orientation.y),
            z: number_at(&doc, &["pose", "orientation", "z"], default_orientation.z),
            w: number_at(&doc, &["pose", "orientation", "w"], default_orientation.w),
        },
        mission_id: doc
            .get("mission_id")
            .and_then(lenient_string)
            .unwrap_or_default(),
        mission_code,
        mission_message: field(&doc, &["mission", "message"])
            .and_then(lenient_string)
            .unwrap_or_default(),
        device_name: device_name.to_string(),
        observed_at,
    })
}

/// Decode the `msg.data` of a telemetry frame:
/// `{"device_name", "device_status", "timestamp"}`.
///
/// The observation time is the frame's `timestamp` when it is RFC 3339,
/// otherwise `now`.
pub fn parse_telemetry_data(data: &Value, now: DateTime<Utc>) -> Result<MissionStatus, BotError> {
    let envelope = unwrap_document(data)?;
    let device_name = envelope
        .get("device_name")
        .and_then(lenient_string)
        .unwrap_or_default();
    let status = envelope
        .get("device_status")
        .ok_or_else(|| BotError::InvalidResponse("telemetry without device_status".to_string()))?;
    let observed_at = envelope
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or(now);
    normalize_status(status, &device_name, observed_at)
}
