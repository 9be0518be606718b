// MotorBusManager: sole owner of the bus handles and the routing table,
// and the only place raw motor I/O happens.
//
// Group-level operations (connect, configure, calibrate, batched reads and
// writes) fan out across the owned buses. The two buses of a dual-board
// robot are independent failure domains: an error on one is recorded and
// reported, never allowed to block the other.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use super::bus::{BusOpener, BusRole, BusState, MotorBus};
use super::calibration::CalibrationSet;
use super::routing::{DriveMode, Motor, MotorGroup, MotorId, RoutingTable};
use super::MotorError;

/// Connection lifecycle of the whole manager.
///
/// `Degraded` (dual-board only) means the manager is connected but the
/// last fan-out recorded a failure on one bus. `Failed` is entered when a
/// required bus cannot be opened and holds until an explicit reconnect or
/// disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Failed,
}

/// One owned serial connection plus its lifecycle state.
struct BusHandle {
    role: BusRole,
    port: String,
    state: BusState,
    bus: Option<Box<dyn MotorBus>>,
}

impl BusHandle {
    fn new(role: BusRole, port: String) -> Self {
        Self { role, port, state: BusState::Unopened, bus: None }
    }

    fn open(&mut self, opener: &dyn BusOpener) -> Result<(), MotorError> {
        let bus = opener.open(&self.port).map_err(|source| MotorError::ConnectFailure {
            port: self.port.clone(),
            source,
        })?;
        self.bus = Some(bus);
        self.state = BusState::Open;
        Ok(())
    }

    /// Dropping the boxed bus releases the OS serial resource; closing an
    /// already-closed handle is a no-op.
    fn close(&mut self) {
        if self.state == BusState::Open {
            debug!("closing {} bus on {}", self.role, self.port);
        }
        self.bus = None;
        if self.state != BusState::Unopened {
            self.state = BusState::Closed;
        }
    }

    fn bus_mut(&mut self) -> Result<&mut dyn MotorBus, MotorError> {
        match (&self.state, self.bus.as_deref_mut()) {
            (BusState::Open, Some(bus)) => Ok(bus),
            _ => Err(MotorError::NotConnected),
        }
    }
}

/// Merged result of a fanned-out read. `values` keeps the caller's id
/// order; ids owned by a bus that errored are absent and the error is in
/// `failures`, tagged with the bus it came from.
#[derive(Debug, Default)]
pub struct PositionReadout {
    pub values: Vec<(MotorId, f32)>,
    pub failures: Vec<MotorError>,
}

impl PositionReadout {
    pub fn get(&self, id: MotorId) -> Option<f32> {
        self.values.iter().find(|(i, _)| *i == id).map(|(_, v)| *v)
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Requested ids that did not come back.
    pub fn missing<'a>(&self, requested: impl IntoIterator<Item = &'a MotorId>) -> Vec<MotorId> {
        requested
            .into_iter()
            .copied()
            .filter(|id| self.get(*id).is_none())
            .collect()
    }
}

/// Per-bus failures from a fanned-out write. Writes already dispatched to
/// the other bus are unaffected by entries here.
#[derive(Debug, Default)]
pub struct WriteOutcome {
    pub failures: Vec<MotorError>,
}

impl WriteOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct MotorBusManager {
    opener: Box<dyn BusOpener>,
    motors: Vec<Motor>,
    calibration_path: Option<PathBuf>,
    calibration: CalibrationSet,
    buses: Vec<BusHandle>,
    routing: Option<RoutingTable>,
    state: ConnectionState,
}

impl MotorBusManager {
    /// All motors on one board.
    pub fn single_board(
        opener: Box<dyn BusOpener>,
        motors: Vec<Motor>,
        port: String,
        calibration_path: Option<PathBuf>,
    ) -> Self {
        Self {
            opener,
            motors,
            calibration_path,
            calibration: CalibrationSet::default(),
            buses: vec![BusHandle::new(BusRole::Primary, port)],
            routing: None,
            state: ConnectionState::Disconnected,
        }
    }

    /// Arm on `primary_port`, base on `secondary_port`. Ports come either
    /// from explicit configuration or from [`super::resolve_ports`].
    pub fn dual_board(
        opener: Box<dyn BusOpener>,
        motors: Vec<Motor>,
        primary_port: String,
        secondary_port: String,
        calibration_path: Option<PathBuf>,
    ) -> Self {
        Self {
            opener,
            motors,
            calibration_path,
            calibration: CalibrationSet::default(),
            buses: vec![
                BusHandle::new(BusRole::Primary, primary_port),
                BusHandle::new(BusRole::Secondary, secondary_port),
            ],
            routing: None,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected | ConnectionState::Degraded)
    }

    pub fn motors(&self) -> &[Motor] {
        &self.motors
    }

    pub fn motor_ids(&self) -> Vec<MotorId> {
        self.motors.iter().map(|m| m.id).collect()
    }

    fn motor(&self, id: MotorId) -> Option<&Motor> {
        self.motors.iter().find(|m| m.id == id)
    }

    fn dual(&self) -> bool {
        self.buses.len() > 1
    }

    fn handle_index(role: BusRole) -> usize {
        match role {
            BusRole::Primary => 0,
            BusRole::Secondary => 1,
        }
    }

    /// Open every required bus, load calibration, build the routing table
    /// and apply static servo configuration.
    ///
    /// Dual-board connect is all-or-nothing: if the second bus fails to
    /// open, the first is closed again, no partially-open state survives,
    /// and the manager lands in `Failed`.
    pub fn connect(&mut self) -> Result<(), MotorError> {
        if self.is_connected() {
            return Ok(());
        }
        self.state = ConnectionState::Connecting;

        // Calibration is (re)loaded once per connect cycle.
        self.calibration = match &self.calibration_path {
            Some(path) => match CalibrationSet::load(path) {
                Ok(set) => set,
                Err(e) => {
                    self.state = ConnectionState::Disconnected;
                    return Err(e.into());
                }
            },
            None => CalibrationSet::nominal(&self.motors),
        };
        if let Some(motor) = self.calibration.first_missing(&self.motors) {
            self.state = ConnectionState::Disconnected;
            return Err(MotorError::MissingCalibration { motor: motor.to_string() });
        }

        for i in 0..self.buses.len() {
            if let Err(e) = self.buses[i].open(self.opener.as_ref()) {
                warn!("connect failed: {}", e);
                self.rollback();
                return Err(e);
            }
            info!("opened {} bus on {}", self.buses[i].role, self.buses[i].port);
        }

        self.routing = Some(if self.dual() {
            RoutingTable::dual_board(&self.motors)
        } else {
            RoutingTable::single_board(&self.motors)
        });

        if let Err(e) = self.apply_configuration() {
            warn!("servo configuration failed: {}", e);
            self.rollback();
            return Err(e);
        }

        self.state = ConnectionState::Connected;
        info!(
            "connected: {} bus(es), {} motors routed",
            self.buses.len(),
            self.motors.len()
        );
        Ok(())
    }

    fn rollback(&mut self) {
        for handle in &mut self.buses {
            handle.close();
        }
        self.routing = None;
        self.state = ConnectionState::Failed;
    }

    /// Idempotent: closes whatever is open, ignores already-closed
    /// handles, always lands in `Disconnected`.
    pub fn disconnect(&mut self) {
        for handle in &mut self.buses {
            handle.close();
        }
        self.routing = None;
        self.state = ConnectionState::Disconnected;
    }

    fn routing(&self) -> Result<&RoutingTable, MotorError> {
        if !self.is_connected() {
            return Err(MotorError::NotConnected);
        }
        self.routing.as_ref().ok_or(MotorError::NotConnected)
    }

    /// Fold the outcome of one fan-out into the connection state.
    fn note_fanout(&mut self, had_failures: bool) {
        if !self.dual() {
            return;
        }
        self.state = match (self.state, had_failures) {
            (ConnectionState::Connected, true) => ConnectionState::Degraded,
            (ConnectionState::Degraded, false) => ConnectionState::Connected,
            (s, _) => s,
        };
    }

    /// Read current values for `ids`: present position for arm motors
    /// (engineering units), present velocity counts for wheels.
    ///
    /// One bus erroring never suppresses results from the other: its ids
    /// are simply missing from `values` and the error is reported in
    /// `failures`. Result order follows the input order.
    pub fn read_positions(&mut self, ids: &[MotorId]) -> Result<PositionReadout, MotorError> {
        let buckets = self.routing()?.partition(ids.iter());
        let mut collected: BTreeMap<MotorId, f32> = BTreeMap::new();
        let mut failures = Vec::new();

        for (role, bus_ids) in buckets {
            match self.read_batch(role, &bus_ids) {
                Ok(batch) => collected.extend(batch),
                Err(e) => {
                    warn!("read failed on {} bus: {}", role, e);
                    failures.push(e);
                }
            }
        }

        self.note_fanout(!failures.is_empty());
        let values = ids
            .iter()
            .filter_map(|id| collected.get(id).map(|v| (*id, *v)))
            .collect();
        Ok(PositionReadout { values, failures })
    }

    /// One batched read on one bus. Aborts at the first wire error so a
    /// dead bus costs one timeout, not one per motor.
    fn read_batch(&mut self, role: BusRole, ids: &[MotorId]) -> Result<Vec<(MotorId, f32)>, MotorError> {
        let motors: Vec<Motor> = ids.iter().filter_map(|id| self.motor(*id).copied()).collect();
        let calibration = self.calibration.clone();
        let bus = self.buses[Self::handle_index(role)].bus_mut()?;

        let mut out = Vec::with_capacity(motors.len());
        for motor in &motors {
            let value = match motor.drive_mode() {
                DriveMode::Position => {
                    let raw = bus
                        .read_position(motor.id)
                        .map_err(|source| MotorError::BusIo { bus: role, source })?;
                    calibration.raw_to_unit(motor, raw)
                }
                DriveMode::Velocity => {
                    let counts = bus
                        .read_velocity(motor.id)
                        .map_err(|source| MotorError::BusIo { bus: role, source })?;
                    counts as f32
                }
            };
            out.push((motor.id, value));
        }
        Ok(out)
    }

    /// Write goal values: position targets (engineering units) for arm
    /// motors, velocity counts for wheels. Targets are grouped per bus and
    /// dispatched independently; a failure on one bus is recorded without
    /// touching writes on the other.
    pub fn write_targets(&mut self, targets: &[(MotorId, f32)]) -> Result<WriteOutcome, MotorError> {
        let ids: Vec<MotorId> = targets.iter().map(|(id, _)| *id).collect();
        let buckets = self.routing()?.partition(ids.iter());
        let mut failures = Vec::new();

        for (role, bus_ids) in buckets {
            let bus_targets: Vec<(MotorId, f32)> = targets
                .iter()
                .filter(|(id, _)| bus_ids.contains(id))
                .copied()
                .collect();
            if let Err(e) = self.write_batch(role, &bus_targets) {
                warn!("write failed on {} bus: {}", role, e);
                failures.push(e);
            }
        }

        self.note_fanout(!failures.is_empty());
        Ok(WriteOutcome { failures })
    }

    fn write_batch(&mut self, role: BusRole, targets: &[(MotorId, f32)]) -> Result<(), MotorError> {
        let mut positions: Vec<(MotorId, u16)> = Vec::new();
        let mut velocities: Vec<(MotorId, i16)> = Vec::new();
        for &(id, value) in targets {
            let Some(motor) = self.motor(id).copied() else { continue };
            match motor.drive_mode() {
                DriveMode::Position => {
                    positions.push((id, self.calibration.unit_to_raw(&motor, value)));
                }
                DriveMode::Velocity => {
                    let counts = value.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                    velocities.push((id, counts));
                }
            }
        }

        let bus = self.buses[Self::handle_index(role)].bus_mut()?;
        bus.write_positions(&positions)
            .map_err(|source| MotorError::BusIo { bus: role, source })?;
        bus.write_velocities(&velocities)
            .map_err(|source| MotorError::BusIo { bus: role, source })?;
        Ok(())
    }

    /// Force the mobile base to a stop: zero velocity counts to every
    /// wheel. Arm motors are deliberately untouched.
    pub fn stop_base(&mut self) -> Result<WriteOutcome, MotorError> {
        let targets: Vec<(MotorId, f32)> = self
            .motors
            .iter()
            .filter(|m| m.group == MotorGroup::Base)
            .map(|m| (m.id, 0.0))
            .collect();
        self.write_targets(&targets)
    }

    /// Run the homing sequence, bus by bus, for `group` (or everything).
    ///
    /// Buses are homed sequentially and the manager is `&mut self`
    /// throughout, so calibration never interleaves with ordinary I/O on
    /// the same bus. A failure leaves that bus uncalibrated and is
    /// surfaced to the caller.
    pub fn calibrate(&mut self, group: Option<MotorGroup>) -> Result<(), MotorError> {
        let all_ids: Vec<MotorId> = self
            .motors
            .iter()
            .filter(|m| group.is_none_or(|g| m.group == g))
            .map(|m| m.id)
            .collect();
        let buckets = self.routing()?.partition(all_ids.iter());

        for (role, ids) in buckets {
            info!("homing {} motor(s) on {} bus", ids.len(), role);
            let bus = self.buses[Self::handle_index(role)].bus_mut()?;
            bus.set_homing(&ids)
                .map_err(|source| MotorError::Calibration { bus: role, source })?;
        }
        Ok(())
    }

    /// Re-apply static servo parameters (operating modes, torque) on every
    /// bus. Also runs as part of `connect`.
    pub fn configure(&mut self) -> Result<(), MotorError> {
        if !self.is_connected() {
            return Err(MotorError::NotConnected);
        }
        self.apply_configuration()
    }

    fn apply_configuration(&mut self) -> Result<(), MotorError> {
        let Some(routing) = self.routing.clone() else {
            return Err(MotorError::NotConnected);
        };
        let all_ids: Vec<MotorId> = self.motor_ids();
        let buckets = routing.partition(all_ids.iter());

        for (role, ids) in buckets {
            let (position_ids, velocity_ids): (Vec<MotorId>, Vec<MotorId>) =
                ids.iter().copied().partition(|id| {
                    self.motor(*id)
                        .map(|m| m.drive_mode() == DriveMode::Position)
                        .unwrap_or(false)
                });
            let bus = self.buses[Self::handle_index(role)].bus_mut()?;
            bus.configure(&position_ids, &velocity_ids)
                .map_err(|source| MotorError::BusIo { bus: role, source })?;
        }
        Ok(())
    }
}

impl Drop for MotorBusManager {
    fn drop(&mut self) {
        // Leave the base stopped if we still can.
        if self.is_connected() {
            if let Err(e) = self.stop_base() {
                warn!("failed to stop base on drop: {}", e);
            }
        }
        self.disconnect();
    }
}
