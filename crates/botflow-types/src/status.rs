//! Device telemetry snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one device-side move mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MissionCode {
    #[default]
    Init,
    Start,
    Success,
    Failed,
    Abort,
}

impl MissionCode {
    /// Map the device's numeric code (`0..=4`) onto a [`MissionCode`].
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(MissionCode::Init),
            1 => Some(MissionCode::Start),
            2 => Some(MissionCode::Success),
            3 => Some(MissionCode::Failed),
            4 => Some(MissionCode::Abort),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            MissionCode::Init => 0,
            MissionCode::Start => 1,
            MissionCode::Success => 2,
            MissionCode::Failed => 3,
            MissionCode::Abort => 4,
        }
    }

    /// `Failed` or `Abort`.
    pub fn is_failure(self) -> bool {
        matches!(self, MissionCode::Failed | MissionCode::Abort)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Orientation quaternion as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Default for Orientation {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
        }
    }
}

impl Orientation {
    /// Heading around the Z axis in degrees, assuming a pure yaw rotation.
    pub fn yaw_degrees(&self) -> f64 {
        (2.0 * self.z.atan2(self.w)).to_degrees()
    }
}

/// Snapshot of the robot's state, produced by the telemetry stream or a
/// direct status query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MissionStatus {
    pub battery_level: i64,
    pub position: Position,
    pub orientation: Orientation,
    /// Identifier of the mission the device is currently executing.
    pub mission_id: String,
    pub mission_code: MissionCode,
    pub mission_message: String,
    #[serde(default)]
    pub device_name: String,
    pub observed_at: DateTime<Utc>,
}

impl MissionStatus {
    /// `true` when this snapshot belongs to `mission_id`.
    pub fn is_mission(&self, mission_id: &str) -> bool {
        self.mission_id == mission_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mission_codes_roundtrip_through_numbers() {
        for code in 0..=4 {
            let mission = MissionCode::from_code(code).expect("known code");
            assert_eq!(mission.code(), code);
        }
        assert_eq!(MissionCode::from_code(7), None);
    }

    #[test]
    fn failure_codes() {
        assert!(MissionCode::Failed.is_failure());
        assert!(MissionCode::Abort.is_failure());
        assert!(!MissionCode::Success.is_failure());
    }

    #[test]
    fn yaw_of_quarter_turn() {
        let half = std::f64::consts::FRAC_PI_4;
        let q = Orientation {
            x: 0.0,
            y: 0.0,
            z: half.sin(),
            w: half.cos(),
        };
        assert!((q.yaw_degrees() - 90.0).abs() < 1e-9);
        assert!(Orientation::default().yaw_degrees().abs() < 1e-12);
    }

    #[test]
    fn mission_match_is_exact() {
        let status = MissionStatus {
            mission_id: "abc".into(),
            ..MissionStatus::default()
        };
        assert!(status.is_mission("abc"));
        assert!(!status.is_mission("abcd"));
    }
}
