// Bus abstraction: the manager and the port resolver talk to boards
// through the `MotorBus` trait, so hardware (Feetech over serialport) and
// the echo stub used for tests/simulation are interchangeable.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::feetech::{FeetechBus, FeetechError};
use super::routing::MotorId;

/// Which board a bus handle is attached to. Single-board robots only use
/// `Primary`; dual-board robots put the arm on `Primary` and the wheels on
/// `Secondary`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BusRole {
    Primary,
    Secondary,
}

impl fmt::Display for BusRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusRole::Primary => f.write_str("primary"),
            BusRole::Secondary => f.write_str("secondary"),
        }
    }
}

/// Lifecycle of one serial connection. At most one open handle may hold a
/// given port name at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Unopened,
    Open,
    Closed,
}

/// One exclusive connection to one motor-controller board.
///
/// All calls are synchronous with a bounded timeout; a timed-out `ping`
/// reports `Ok(false)` rather than an error so callers can sweep IDs.
pub trait MotorBus: Send {
    fn ping(&mut self, id: MotorId) -> Result<bool, FeetechError>;
    fn read_position(&mut self, id: MotorId) -> Result<u16, FeetechError>;
    fn read_velocity(&mut self, id: MotorId) -> Result<i16, FeetechError>;
    /// Batched goal-position write (one packet for all targets).
    fn write_positions(&mut self, targets: &[(MotorId, u16)]) -> Result<(), FeetechError>;
    /// Batched goal-velocity write (one packet for all targets).
    fn write_velocities(&mut self, targets: &[(MotorId, i16)]) -> Result<(), FeetechError>;
    /// Apply static servo parameters: position mode for the arm ids,
    /// velocity mode for the wheel ids, torque enabled for both.
    fn configure(&mut self, position_ids: &[MotorId], velocity_ids: &[MotorId])
        -> Result<(), FeetechError>;
    /// Run the homing sequence: record the current pose as the new center.
    fn set_homing(&mut self, ids: &[MotorId]) -> Result<(), FeetechError>;
}

/// Factory for bus handles, injected into the resolver and the manager so
/// tests never need a serial port.
pub trait BusOpener: Send + Sync {
    fn open(&self, port: &str) -> Result<Box<dyn MotorBus>, FeetechError>;
}

/// Opens real Feetech buses over `serialport`.
pub struct FeetechOpener {
    baud_rate: u32,
    timeout: Duration,
}

impl FeetechOpener {
    pub fn new(baud_rate: u32, timeout: Duration) -> Self {
        Self { baud_rate, timeout }
    }
}

impl Default for FeetechOpener {
    fn default() -> Self {
        Self::new(
            super::feetech::DEFAULT_BAUDRATE,
            Duration::from_millis(super::feetech::DEFAULT_TIMEOUT_MS),
        )
    }
}

impl BusOpener for FeetechOpener {
    fn open(&self, port: &str) -> Result<Box<dyn MotorBus>, FeetechError> {
        let bus = FeetechBus::open_with(port, self.baud_rate, self.timeout)?;
        Ok(Box::new(bus))
    }
}

// =========================================================================
// Echo stub
// =========================================================================

#[derive(Debug, Default)]
struct EchoInner {
    ids: Vec<MotorId>,
    positions: BTreeMap<MotorId, u16>,
    velocities: BTreeMap<MotorId, i16>,
    homed: Vec<MotorId>,
    configured: bool,
    faulted: bool,
}

/// In-memory bus that echoes writes back on reads. Backs `--simulate` runs
/// and every test that would otherwise need a physical board.
///
/// Clones share state, so a test can keep a handle while the manager owns
/// the boxed copy.
#[derive(Debug, Clone, Default)]
pub struct EchoBus {
    inner: Arc<Mutex<EchoInner>>,
}

impl EchoBus {
    /// A bus hosting the given motor ids, all parked at mid-range (2048).
    pub fn hosting(ids: &[MotorId]) -> Self {
        let inner = EchoInner {
            ids: ids.to_vec(),
            positions: ids.iter().map(|&id| (id, 2048)).collect(),
            velocities: ids.iter().map(|&id| (id, 0)).collect(),
            ..EchoInner::default()
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// While faulted, every operation fails with an I/O error.
    pub fn set_fault(&self, on: bool) {
        self.inner.lock().unwrap().faulted = on;
    }

    pub fn set_position(&self, id: MotorId, raw: u16) {
        self.inner.lock().unwrap().positions.insert(id, raw);
    }

    pub fn velocity(&self, id: MotorId) -> Option<i16> {
        self.inner.lock().unwrap().velocities.get(&id).copied()
    }

    pub fn is_configured(&self) -> bool {
        self.inner.lock().unwrap().configured
    }

    pub fn homed_ids(&self) -> Vec<MotorId> {
        self.inner.lock().unwrap().homed.clone()
    }

    fn fault_error() -> FeetechError {
        FeetechError::Io(std::io::Error::other("injected bus fault"))
    }
}

impl MotorBus for EchoBus {
    fn ping(&mut self, id: MotorId) -> Result<bool, FeetechError> {
        let inner = self.inner.lock().unwrap();
        if inner.faulted {
            return Err(Self::fault_error());
        }
        Ok(inner.ids.contains(&id))
    }

    fn read_position(&mut self, id: MotorId) -> Result<u16, FeetechError> {
        let inner = self.inner.lock().unwrap();
        if inner.faulted {
            return Err(Self::fault_error());
        }
        inner
            .positions
            .get(&id)
            .copied()
            .ok_or(FeetechError::Timeout { id })
    }

    fn read_velocity(&mut self, id: MotorId) -> Result<i16, FeetechError> {
        let inner = self.inner.lock().unwrap();
        if inner.faulted {
            return Err(Self::fault_error());
        }
        inner
            .velocities
            .get(&id)
            .copied()
            .ok_or(FeetechError::Timeout { id })
    }

    fn write_positions(&mut self, targets: &[(MotorId, u16)]) -> Result<(), FeetechError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.faulted {
            return Err(Self::fault_error());
        }
        for &(id, raw) in targets {
            if !inner.ids.contains(&id) {
                return Err(FeetechError::Timeout { id });
            }
            inner.positions.insert(id, raw);
        }
        Ok(())
    }

    fn write_velocities(&mut self, targets: &[(MotorId, i16)]) -> Result<(), FeetechError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.faulted {
            return Err(Self::fault_error());
        }
        for &(id, counts) in targets {
            if !inner.ids.contains(&id) {
                return Err(FeetechError::Timeout { id });
            }
            inner.velocities.insert(id, counts);
        }
        Ok(())
    }

    fn configure(
        &mut self,
        _position_ids: &[MotorId],
        _velocity_ids: &[MotorId],
    ) -> Result<(), FeetechError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.faulted {
            return Err(Self::fault_error());
        }
        inner.configured = true;
        Ok(())
    }

    fn set_homing(&mut self, ids: &[MotorId]) -> Result<(), FeetechError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.faulted {
            return Err(Self::fault_error());
        }
        inner.homed.extend_from_slice(ids);
        Ok(())
    }
}

/// Opener handing out [`EchoBus`] handles keyed by port name.
///
/// Each port maps to one shared bus: opening the same port twice yields
/// handles over the same state, and every handed-out bus stays reachable
/// through [`EchoOpener::bus`] for inspection.
#[derive(Default)]
pub struct EchoOpener {
    buses: Mutex<BTreeMap<String, EchoBus>>,
    unreachable: Mutex<Vec<String>>,
}

impl EchoOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-register a port hosting the given motor ids.
    pub fn with_port(self, port: &str, ids: &[MotorId]) -> Self {
        self.buses
            .lock()
            .unwrap()
            .insert(port.to_string(), EchoBus::hosting(ids));
        self
    }

    /// Make `open` fail for this port, as an unplugged adapter would.
    pub fn with_unreachable(self, port: &str) -> Self {
        self.unreachable.lock().unwrap().push(port.to_string());
        self
    }

    /// Shared handle to the bus behind `port`, if one was registered.
    pub fn bus(&self, port: &str) -> Option<EchoBus> {
        self.buses.lock().unwrap().get(port).cloned()
    }
}

impl BusOpener for EchoOpener {
    fn open(&self, port: &str) -> Result<Box<dyn MotorBus>, FeetechError> {
        if self.unreachable.lock().unwrap().iter().any(|p| p == port) {
            return Err(FeetechError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such port: {port}"),
            )));
        }
        let bus = self
            .buses
            .lock()
            .unwrap()
            .entry(port.to_string())
            .or_insert_with(|| EchoBus::hosting(&super::routing::all_motor_ids()))
            .clone();
        Ok(Box::new(bus))
    }
}
