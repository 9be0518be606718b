// Wire contract between client and host.
//
// Actions and observations travel as flat JSON objects keyed by motor
// name: `arm_shoulder_pan.pos` (radians), `arm_gripper.pos` (normalized
// [-1, 1]), `x.vel` / `y.vel` (m/s), `theta.vel` (deg/s), and
// `<wheel>.vel` (raw counts) on the way back. Unrecognized keys are
// ignored, never rejected.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::motor::kinematics::BodyVelocity;
use crate::motor::routing::{Motor, MotorGroup};

const POS_SUFFIX: &str = ".pos";

/// Parsed inbound action: sparse arm targets plus an optional base
/// velocity command. Either half may be absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionPayload {
    /// Arm joint name -> target, in that joint's engineering units.
    pub arm: BTreeMap<String, f32>,
    pub base: Option<BodyVelocity>,
}

impl ActionPayload {
    /// Parse a wire payload. Keys that are not part of the contract are
    /// dropped; a base command is present if any `*.vel` body key is
    /// (missing components default to zero).
    pub fn from_wire(bytes: &[u8], motors: &[Motor]) -> Result<Self, serde_json::Error> {
        let raw: Map<String, Value> = serde_json::from_slice(bytes)?;
        let mut action = ActionPayload::default();
        let mut base = BodyVelocity::ZERO;
        let mut base_seen = false;

        for (key, value) in raw {
            // Non-numeric values (camera blobs and the like) are not ours.
            let Some(value) = value.as_f64() else { continue };
            match key.as_str() {
                "x.vel" => {
                    base.x = value as f32;
                    base_seen = true;
                }
                "y.vel" => {
                    base.y = value as f32;
                    base_seen = true;
                }
                "theta.vel" => {
                    base.theta = value as f32;
                    base_seen = true;
                }
                _ => {
                    if let Some(name) = key.strip_suffix(POS_SUFFIX) {
                        let known_arm = motors
                            .iter()
                            .any(|m| m.group == MotorGroup::Arm && m.name == name);
                        if known_arm {
                            action.arm.insert(name.to_string(), value as f32);
                        }
                    }
                    // anything else: not ours, skip
                }
            }
        }

        if base_seen {
            action.base = Some(base);
        }
        Ok(action)
    }

    /// Serialize back to the wire layout. Inverse of [`Self::from_wire`].
    pub fn to_wire(&self) -> Value {
        let mut map = Map::new();
        for (name, value) in &self.arm {
            map.insert(format!("{name}{POS_SUFFIX}"), json_f32(*value));
        }
        if let Some(base) = self.base {
            map.insert("x.vel".into(), json_f32(base.x));
            map.insert("y.vel".into(), json_f32(base.y));
            map.insert("theta.vel".into(), json_f32(base.theta));
        }
        Value::Object(map)
    }

    pub fn is_empty(&self) -> bool {
        self.arm.is_empty() && self.base.is_none()
    }
}

fn json_f32(v: f32) -> Value {
    serde_json::Number::from_f64(v as f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Outbound observation: one entry per known motor (`<arm>.pos` /
/// `<wheel>.vel`), the body-frame velocity estimate (`x.vel` / `y.vel` /
/// `theta.vel`), plus opaque pass-through blobs from external
/// collaborators (cameras). Only the motor portion is produced here.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    #[serde(flatten)]
    pub motors: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extras: Map<String, Value>,
}

impl Observation {
    pub fn get(&self, key: &str) -> Option<f64> {
        self.motors.get(key).copied()
    }
}

/// Host health, published once per tick alongside the observation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum HostHealth {
    Ok,
    /// Watchdog tripped: no action within the timeout, base stopped.
    CmdStale,
    /// At least one bus is currently erroring.
    BusDegraded,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::routing::lekiwi_motors;

    #[test]
    fn parses_mixed_action() {
        let wire = br#"{
            "arm_shoulder_pan.pos": 0.25,
            "arm_gripper.pos": -0.5,
            "x.vel": 0.1,
            "theta.vel": 15.0
        }"#;
        let action = ActionPayload::from_wire(wire, &lekiwi_motors()).unwrap();
        assert_eq!(action.arm.len(), 2);
        assert!((action.arm["arm_shoulder_pan"] - 0.25).abs() < 1e-6);
        let base = action.base.unwrap();
        assert!((base.x - 0.1).abs() < 1e-6);
        assert!((base.y - 0.0).abs() < 1e-6);
        assert!((base.theta - 15.0).abs() < 1e-6);
    }

    #[test]
    fn unrecognized_keys_are_ignored_not_rejected() {
        let wire = br#"{
            "arm_shoulder_pan.pos": 0.1,
            "left_antenna.pos": 3.0,
            "battery.voltage": 12.1,
            "base_left_wheel.pos": 7.0
        }"#;
        let action = ActionPayload::from_wire(wire, &lekiwi_motors()).unwrap();
        assert_eq!(action.arm.len(), 1);
        assert!(action.base.is_none());
    }

    #[test]
    fn arm_only_action_has_no_base_command() {
        let wire = br#"{"arm_wrist_flex.pos": -0.3}"#;
        let action = ActionPayload::from_wire(wire, &lekiwi_motors()).unwrap();
        assert!(action.base.is_none());
        assert!(!action.is_empty());
    }

    #[test]
    fn wire_round_trip() {
        let mut action = ActionPayload::default();
        action.arm.insert("arm_elbow_flex".into(), 0.75);
        action.base = Some(BodyVelocity { x: 0.05, y: -0.02, theta: 30.0 });

        let bytes = action.to_wire().to_string().into_bytes();
        let back = ActionPayload::from_wire(&bytes, &lekiwi_motors()).unwrap();
        assert_eq!(back.arm.len(), 1);
        assert!((back.arm["arm_elbow_flex"] - 0.75).abs() < 1e-6);
        assert!((back.base.unwrap().theta - 30.0).abs() < 1e-4);
    }

    #[test]
    fn observation_serializes_flat() {
        let mut obs = Observation::default();
        obs.motors.insert("arm_shoulder_pan.pos".into(), 0.1);
        obs.motors.insert("base_left_wheel.vel".into(), 250.0);

        let value = serde_json::to_value(&obs).unwrap();
        assert!(value.get("arm_shoulder_pan.pos").is_some());
        assert!(value.get("extras").is_none());

        let back: Observation = serde_json::from_value(value).unwrap();
        assert_eq!(back.get("base_left_wheel.vel"), Some(250.0));
    }

    #[test]
    fn health_uses_snake_case_tags() {
        assert_eq!(
            serde_json::to_string(&HostHealth::CmdStale).unwrap(),
            r#""cmd_stale""#
        );
    }
}
