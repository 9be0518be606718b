// Motor I/O for the LeKiwi mobile manipulator.
//
// Provides:
// - Feetech STS3215 serial protocol (one bus handle per controller board)
// - Port auto-detection for dual-board setups
// - A routing table dispatching each motor to the board that hosts it
// - The bus manager that owns all serial handles and fans out I/O
// - Calibration records and omniwheel kinematics

pub mod bus;
pub mod calibration;
pub mod feetech;
pub mod kinematics;
pub mod manager;
pub mod resolver;
pub mod routing;

pub use bus::{BusOpener, BusRole, BusState, EchoBus, EchoOpener, FeetechOpener, MotorBus};
pub use feetech::{FeetechBus, FeetechError};
pub use manager::{ConnectionState, MotorBusManager, PositionReadout, WriteOutcome};
pub use resolver::{resolve_ports, PortResolution};
pub use routing::{lekiwi_motors, Motor, MotorGroup, MotorId, RoutingTable};

use thiserror::Error;

/// Errors surfaced by the routing/manager layer. Wire-level problems are
/// wrapped in [`FeetechError`] and tagged with the bus they occurred on.
#[derive(Debug, Error)]
pub enum MotorError {
    /// Port auto-detection could not disambiguate the boards.
    #[error("board detection failed: {0}")]
    DetectionFailed(String),

    /// A required bus failed to open; connect is all-or-nothing.
    #[error("failed to open bus on {port}: {source}")]
    ConnectFailure {
        port: String,
        #[source]
        source: FeetechError,
    },

    /// A read or write failed on one bus. Other buses are unaffected.
    #[error("I/O error on {bus} bus: {source}")]
    BusIo {
        bus: BusRole,
        #[source]
        source: FeetechError,
    },

    /// Homing sequence failed; the bus stays uncalibrated.
    #[error("calibration failed on {bus} bus: {source}")]
    Calibration {
        bus: BusRole,
        #[source]
        source: FeetechError,
    },

    /// Calibration file lacks a record for a motor we route to.
    #[error("no calibration record for motor '{motor}'")]
    MissingCalibration { motor: String },

    /// Calibration file could not be read or parsed.
    #[error("calibration file error: {0}")]
    CalibrationFile(#[from] calibration::CalibrationFileError),

    /// Motor I/O attempted while not connected.
    #[error("bus manager is not connected")]
    NotConnected,
}
