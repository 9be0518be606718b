// Calibration records: per-motor raw range and homing offset, persisted as
// JSON and loaded once per connect cycle. The manager uses them to convert
// between raw encoder ticks and engineering units (radians, or the
// normalized gripper range).

use std::collections::BTreeMap;
use std::f32::consts::TAU;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::routing::{Motor, MotorId, Units};

/// Encoder resolution: 4096 ticks per revolution.
const TICKS_PER_REV: f32 = 4096.0;

#[derive(Debug, Error)]
pub enum CalibrationFileError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Calibrated range of one servo.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub min_position: u16,
    pub max_position: u16,
    /// Software offset subtracted from every raw reading before unit
    /// conversion (and added back on writes).
    pub homing_offset: i16,
}

impl CalibrationRecord {
    /// Midpoint of the calibrated span, the zero reference for radians.
    pub fn center(&self) -> f32 {
        (self.min_position as f32 + self.max_position as f32) / 2.0
    }

    pub fn span(&self) -> f32 {
        (self.max_position.saturating_sub(self.min_position)) as f32
    }
}

/// The full per-robot record set, keyed by motor id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CalibrationSet {
    records: BTreeMap<MotorId, CalibrationRecord>,
}

impl CalibrationSet {
    pub fn load(path: &Path) -> Result<Self, CalibrationFileError> {
        let display = path.display().to_string();
        let contents = std::fs::read_to_string(path).map_err(|source| {
            CalibrationFileError::Io { path: display.clone(), source }
        })?;
        serde_json::from_str(&contents)
            .map_err(|source| CalibrationFileError::Parse { path: display, source })
    }

    pub fn save(&self, path: &Path) -> Result<(), CalibrationFileError> {
        let display = path.display().to_string();
        let json = serde_json::to_string_pretty(self).map_err(|source| {
            CalibrationFileError::Parse { path: display.clone(), source }
        })?;
        std::fs::write(path, json)
            .map_err(|source| CalibrationFileError::Io { path: display, source })
    }

    /// Full-range, zero-offset records for every motor. Used when no
    /// calibration file is configured (simulation, bring-up).
    pub fn nominal(motors: &[Motor]) -> Self {
        let records = motors
            .iter()
            .map(|m| {
                (m.id, CalibrationRecord {
                    min_position: 0,
                    max_position: 4095,
                    homing_offset: 0,
                })
            })
            .collect();
        Self { records }
    }

    pub fn insert(&mut self, id: MotorId, record: CalibrationRecord) {
        self.records.insert(id, record);
    }

    pub fn record(&self, id: MotorId) -> Option<&CalibrationRecord> {
        self.records.get(&id)
    }

    /// Name of the first motor lacking a record, if any. A missing record
    /// for a known motor is a hard connect-time error, wheels included:
    /// an incomplete file usually means it belongs to a different robot.
    pub fn first_missing(&self, motors: &[Motor]) -> Option<&'static str> {
        motors
            .iter()
            .find(|m| !self.records.contains_key(&m.id))
            .map(|m| m.name)
    }

    /// Raw encoder reading -> engineering units for `motor`.
    pub fn raw_to_unit(&self, motor: &Motor, raw: u16) -> f32 {
        match (motor.units, self.record(motor.id)) {
            (Units::RawCounts, _) | (_, None) => raw as f32,
            (Units::Radians, Some(rec)) => {
                let adjusted = raw as f32 - rec.homing_offset as f32;
                (adjusted - rec.center()) * TAU / TICKS_PER_REV
            }
            (Units::Normalized, Some(rec)) => {
                let adjusted = raw as f32 - rec.homing_offset as f32;
                if rec.span() == 0.0 {
                    return 0.0;
                }
                ((adjusted - rec.min_position as f32) / rec.span()) * 2.0 - 1.0
            }
        }
    }

    /// Engineering units -> raw goal ticks, clamped into the calibrated
    /// span so a bad command can never drive a joint past its limits.
    pub fn unit_to_raw(&self, motor: &Motor, value: f32) -> u16 {
        let Some(rec) = self.record(motor.id) else {
            return value.round().clamp(0.0, 4095.0) as u16;
        };
        let adjusted = match motor.units {
            Units::RawCounts => return value.round().clamp(0.0, 4095.0) as u16,
            Units::Radians => value * TICKS_PER_REV / TAU + rec.center(),
            Units::Normalized => (value + 1.0) / 2.0 * rec.span() + rec.min_position as f32,
        };
        let clamped = adjusted.clamp(rec.min_position as f32, rec.max_position as f32);
        (clamped + rec.homing_offset as f32).round().clamp(0.0, 4095.0) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::routing::{LEKIWI_MOTORS, MotorGroup};

    fn motor(name: &str) -> Motor {
        *LEKIWI_MOTORS.iter().find(|m| m.name == name).unwrap()
    }

    fn set_with(id: MotorId, min: u16, max: u16, offset: i16) -> CalibrationSet {
        let mut set = CalibrationSet::default();
        set.insert(id, CalibrationRecord {
            min_position: min,
            max_position: max,
            homing_offset: offset,
        });
        set
    }

    #[test]
    fn center_reads_as_zero_radians() {
        let pan = motor("arm_shoulder_pan");
        let set = set_with(pan.id, 1024, 3072, 0);
        assert!(set.raw_to_unit(&pan, 2048).abs() < 1e-6);
    }

    #[test]
    fn radian_conversion_round_trips() {
        let pan = motor("arm_shoulder_pan");
        let set = set_with(pan.id, 0, 4095, 100);
        for &rad in &[-1.2f32, -0.3, 0.0, 0.7, 1.5] {
            let raw = set.unit_to_raw(&pan, rad);
            let back = set.raw_to_unit(&pan, raw);
            // one tick of quantization = TAU/4096 ≈ 1.5e-3 rad
            assert!((back - rad).abs() < 2e-3, "rad={rad} back={back}");
        }
    }

    #[test]
    fn gripper_normalized_endpoints() {
        let gripper = motor("arm_gripper");
        let set = set_with(gripper.id, 1000, 3000, 0);
        assert!((set.raw_to_unit(&gripper, 1000) - -1.0).abs() < 1e-6);
        assert!((set.raw_to_unit(&gripper, 3000) - 1.0).abs() < 1e-6);
        assert_eq!(set.unit_to_raw(&gripper, 0.0), 2000);
    }

    #[test]
    fn writes_clamp_to_calibrated_span() {
        let pan = motor("arm_shoulder_pan");
        let set = set_with(pan.id, 1024, 3072, 0);
        assert_eq!(set.unit_to_raw(&pan, 100.0), 3072);
        assert_eq!(set.unit_to_raw(&pan, -100.0), 1024);
    }

    #[test]
    fn every_known_motor_requires_a_record() {
        let mut set = CalibrationSet::default();
        assert_eq!(set.first_missing(&LEKIWI_MOTORS), Some("arm_shoulder_pan"));

        for m in LEKIWI_MOTORS.iter().filter(|m| m.group == MotorGroup::Arm) {
            set.insert(m.id, CalibrationRecord {
                min_position: 0,
                max_position: 4095,
                homing_offset: 0,
            });
        }
        // An arm-only file is incomplete: the wheels are known motors too.
        assert_eq!(set.first_missing(&LEKIWI_MOTORS), Some("base_left_wheel"));

        let nominal = CalibrationSet::nominal(&LEKIWI_MOTORS);
        assert_eq!(nominal.first_missing(&LEKIWI_MOTORS), None);
    }

    #[test]
    fn file_round_trip() {
        let pan = motor("arm_shoulder_pan");
        let set = set_with(pan.id, 500, 3500, -42);

        let dir = std::env::temp_dir().join("lekiwi-test-calibration");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("roundtrip.json");
        set.save(&path).unwrap();
        let back = CalibrationSet::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let rec = back.record(pan.id).unwrap();
        assert_eq!(rec.min_position, 500);
        assert_eq!(rec.max_position, 3500);
        assert_eq!(rec.homing_offset, -42);
    }
}
