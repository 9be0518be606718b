// Motor identity and bus routing.
//
// Which board owns which motor is decided once, when the manager connects,
// and frozen into a `RoutingTable` for the life of the connection. Per-call
// "is this a base motor?" branching never happens on the I/O path.

use std::collections::BTreeMap;

use super::bus::BusRole;

/// Physical servo id, globally unique across all boards of one robot.
pub type MotorId = u8;

/// Static partition of the motor set: the manipulator arm and the mobile
/// base. The partition drives both bus routing (dual-board mode) and the
/// watchdog's differentiated stop policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorGroup {
    Arm,
    Base,
}

/// How goal values for a motor are interpreted on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveMode {
    /// Goal-position targets (arm joints, gripper).
    Position,
    /// Goal-velocity targets in raw counts (omniwheels).
    Velocity,
}

/// Unit convention for a motor's engineering values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Units {
    /// Radians about the calibration center.
    Radians,
    /// Normalized [-1, 1] across the calibrated min..max span (gripper).
    Normalized,
    /// Raw velocity counts, no calibration applied (wheels).
    RawCounts,
}

/// One servo: id, wire name, group membership and conventions.
#[derive(Debug, Clone, Copy)]
pub struct Motor {
    pub id: MotorId,
    pub name: &'static str,
    pub group: MotorGroup,
    pub units: Units,
}

impl Motor {
    pub const fn drive_mode(&self) -> DriveMode {
        match self.group {
            MotorGroup::Arm => DriveMode::Position,
            MotorGroup::Base => DriveMode::Velocity,
        }
    }
}

/// The LeKiwi motor set: six arm servos, three omniwheel servos.
pub const LEKIWI_MOTORS: [Motor; 9] = [
    Motor { id: 1, name: "arm_shoulder_pan", group: MotorGroup::Arm, units: Units::Radians },
    Motor { id: 2, name: "arm_shoulder_lift", group: MotorGroup::Arm, units: Units::Radians },
    Motor { id: 3, name: "arm_elbow_flex", group: MotorGroup::Arm, units: Units::Radians },
    Motor { id: 4, name: "arm_wrist_flex", group: MotorGroup::Arm, units: Units::Radians },
    Motor { id: 5, name: "arm_wrist_roll", group: MotorGroup::Arm, units: Units::Radians },
    Motor { id: 6, name: "arm_gripper", group: MotorGroup::Arm, units: Units::Normalized },
    Motor { id: 7, name: "base_left_wheel", group: MotorGroup::Base, units: Units::RawCounts },
    Motor { id: 8, name: "base_back_wheel", group: MotorGroup::Base, units: Units::RawCounts },
    Motor { id: 9, name: "base_right_wheel", group: MotorGroup::Base, units: Units::RawCounts },
];

/// Default discriminating motor for port detection: the board that answers
/// a ping for the shoulder-pan servo hosts the arm, hence is Primary.
pub const DISCRIMINATING_ID: MotorId = 1;

pub fn lekiwi_motors() -> Vec<Motor> {
    LEKIWI_MOTORS.to_vec()
}

pub fn all_motor_ids() -> Vec<MotorId> {
    LEKIWI_MOTORS.iter().map(|m| m.id).collect()
}

/// Immutable-after-build map from motor id to the bus that owns it.
///
/// Built once per connect; every known motor resolves to exactly one bus.
/// Single-board mode routes everything to `Primary`; dual-board mode
/// partitions exactly along [`MotorGroup`] lines.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: BTreeMap<MotorId, BusRole>,
}

impl RoutingTable {
    /// All motors on the one (primary) bus.
    pub fn single_board(motors: &[Motor]) -> Self {
        Self {
            routes: motors.iter().map(|m| (m.id, BusRole::Primary)).collect(),
        }
    }

    /// Arm on the primary bus, base on the secondary bus.
    pub fn dual_board(motors: &[Motor]) -> Self {
        let routes = motors
            .iter()
            .map(|m| {
                let role = match m.group {
                    MotorGroup::Arm => BusRole::Primary,
                    MotorGroup::Base => BusRole::Secondary,
                };
                (m.id, role)
            })
            .collect();
        Self { routes }
    }

    /// The bus owning `id`, or `None` for a motor we do not know.
    pub fn route(&self, id: MotorId) -> Option<BusRole> {
        self.routes.get(&id).copied()
    }

    /// Distinct buses appearing in the table, in role order.
    pub fn buses(&self) -> Vec<BusRole> {
        let mut roles: Vec<BusRole> = self.routes.values().copied().collect();
        roles.sort_unstable();
        roles.dedup();
        roles
    }

    /// Split `ids` by owning bus, preserving the input order within each
    /// bucket. Unknown ids are dropped (reported upstream by the manager).
    pub fn partition<'a>(&self, ids: impl IntoIterator<Item = &'a MotorId>)
        -> BTreeMap<BusRole, Vec<MotorId>>
    {
        let mut buckets: BTreeMap<BusRole, Vec<MotorId>> = BTreeMap::new();
        for &id in ids {
            if let Some(role) = self.route(id) {
                buckets.entry(role).or_default().push(id);
            }
        }
        buckets
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_board_routes_everything_to_primary() {
        let table = RoutingTable::single_board(&LEKIWI_MOTORS);
        assert_eq!(table.len(), 9);
        for id in all_motor_ids() {
            assert_eq!(table.route(id), Some(BusRole::Primary));
        }
        assert_eq!(table.buses(), vec![BusRole::Primary]);
    }

    #[test]
    fn dual_board_partitions_along_group_lines() {
        let table = RoutingTable::dual_board(&LEKIWI_MOTORS);

        // Every motor maps to exactly one bus and the two id-sets are
        // disjoint and exhaustive.
        let buckets = table.partition(all_motor_ids().iter());
        let arm = &buckets[&BusRole::Primary];
        let base = &buckets[&BusRole::Secondary];
        assert_eq!(arm.len() + base.len(), LEKIWI_MOTORS.len());
        assert!(arm.iter().all(|id| !base.contains(id)));

        for m in &LEKIWI_MOTORS {
            let expected = match m.group {
                MotorGroup::Arm => BusRole::Primary,
                MotorGroup::Base => BusRole::Secondary,
            };
            assert_eq!(table.route(m.id), Some(expected));
        }
    }

    #[test]
    fn partition_preserves_request_order() {
        let table = RoutingTable::dual_board(&LEKIWI_MOTORS);
        let buckets = table.partition([9, 2, 7, 1].iter());
        assert_eq!(buckets[&BusRole::Secondary], vec![9, 7]);
        assert_eq!(buckets[&BusRole::Primary], vec![2, 1]);
    }

    #[test]
    fn unknown_ids_are_not_routed() {
        let table = RoutingTable::single_board(&LEKIWI_MOTORS);
        assert_eq!(table.route(42), None);
        let buckets = table.partition([42].iter());
        assert!(buckets.is_empty());
    }
}
