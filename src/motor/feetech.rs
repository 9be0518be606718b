// Feetech STS3215 serial protocol.
//
// Dynamixel-1.0-style framing: [0xFF, 0xFF, ID, Length, Instruction,
// Params..., Checksum]. One `FeetechBus` owns one exclusive serial port,
// i.e. one controller board.

use serialport::{self, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;

use super::bus::MotorBus;
use super::routing::MotorId;

pub const DEFAULT_BAUDRATE: u32 = 1_000_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

const HEADER: [u8; 2] = [0xFF, 0xFF];
const BROADCAST_ID: u8 = 0xFE;

/// Mid-range tick: homing parks every joint so it reads this value.
pub const CENTER_TICK: u16 = 2048;

#[repr(u8)]
#[derive(Debug, Clone, Copy)]
enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
    SyncWrite = 0x83,
}

/// STS3215 control table, the registers this runtime touches.
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Register {
    // EEPROM (persists across power cycles)
    HomingOffset = 31, // 2 bytes, sign-magnitude
    OperatingMode = 33, // 1 byte: 0=position, 1=velocity

    // RAM
    TorqueEnable = 40,    // 1 byte
    GoalPosition = 42,    // 2 bytes
    GoalVelocity = 46,    // 2 bytes, sign-magnitude
    Lock = 55,            // 1 byte, guards EEPROM writes
    PresentPosition = 56, // 2 bytes, read-only
    PresentVelocity = 58, // 2 bytes, sign-magnitude, read-only
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatingMode {
    Position = 0,
    Velocity = 1,
}

#[derive(Debug, thiserror::Error)]
pub enum FeetechError {
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid response from motor {id}: {reason}")]
    InvalidResponse { id: u8, reason: String },

    #[error("checksum mismatch for motor {id}")]
    ChecksumMismatch { id: u8 },

    #[error("motor {id} returned error status 0x{status:02X}")]
    MotorError { id: u8, status: u8 },

    #[error("timeout waiting for motor {id}")]
    Timeout { id: u8 },
}

pub type Result<T> = std::result::Result<T, FeetechError>;

/// Serial handle to one Feetech board.
pub struct FeetechBus {
    port: Box<dyn SerialPort>,
}

impl FeetechBus {
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with(
            port_name,
            DEFAULT_BAUDRATE,
            Duration::from_millis(DEFAULT_TIMEOUT_MS),
        )
    }

    /// Open with explicit baudrate and per-read timeout. The timeout bounds
    /// every response wait, so no bus call can block indefinitely.
    pub fn open_with(port_name: &str, baudrate: u32, timeout: Duration) -> Result<Self> {
        let port = serialport::new(port_name, baudrate).timeout(timeout).open()?;
        Ok(Self { port })
    }

    /// Ones-complement sum over everything after the header.
    fn checksum(data: &[u8]) -> u8 {
        let sum: u16 = data.iter().map(|&b| b as u16).sum();
        (!sum & 0xFF) as u8
    }

    fn build_packet(id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
        let length = (params.len() + 2) as u8; // instruction + checksum
        let mut packet = Vec::with_capacity(6 + params.len());
        packet.extend_from_slice(&HEADER);
        packet.push(id);
        packet.push(length);
        packet.push(instruction as u8);
        packet.extend_from_slice(params);
        packet.push(Self::checksum(&packet[2..]));
        packet
    }

    fn send_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.port.write_all(packet)?;
        self.port.flush()?;
        Ok(())
    }

    /// Read one status packet, verifying id, checksum and error byte.
    /// Returns the parameter bytes.
    fn read_response(&mut self, expected_id: u8) -> Result<Vec<u8>> {
        let mut header = [0u8; 2];
        self.port.read_exact(&mut header).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                FeetechError::Timeout { id: expected_id }
            } else {
                FeetechError::Io(e)
            }
        })?;
        if header != HEADER {
            return Err(FeetechError::InvalidResponse {
                id: expected_id,
                reason: format!("bad header {header:02X?}"),
            });
        }

        let mut id_length = [0u8; 2];
        self.port.read_exact(&mut id_length)?;
        let (id, length) = (id_length[0], id_length[1] as usize);
        if id != expected_id {
            return Err(FeetechError::InvalidResponse {
                id: expected_id,
                reason: format!("id mismatch: expected {expected_id}, got {id}"),
            });
        }

        // error byte + params + checksum
        let mut rest = vec![0u8; length];
        self.port.read_exact(&mut rest)?;
        parse_status_body(id, &rest)
    }

    fn write_u8(&mut self, id: u8, register: Register, value: u8) -> Result<()> {
        let packet = Self::build_packet(id, Instruction::Write, &[register as u8, value]);
        debug!("write u8 motor={} reg={:?} value={}", id, register, value);
        self.send_packet(&packet)?;
        let _ = self.read_response(id)?;
        Ok(())
    }

    fn write_u16(&mut self, id: u8, register: Register, value: u16) -> Result<()> {
        let params = [register as u8, (value & 0xFF) as u8, (value >> 8) as u8];
        let packet = Self::build_packet(id, Instruction::Write, &params);
        debug!("write u16 motor={} reg={:?} value={}", id, register, value);
        self.send_packet(&packet)?;
        let _ = self.read_response(id)?;
        Ok(())
    }

    fn read_u16(&mut self, id: u8, register: Register) -> Result<u16> {
        let packet = Self::build_packet(id, Instruction::Read, &[register as u8, 2]);
        self.send_packet(&packet)?;
        let response = self.read_response(id)?;
        if response.len() < 2 {
            return Err(FeetechError::InvalidResponse {
                id,
                reason: format!("expected 2 bytes, got {}", response.len()),
            });
        }
        Ok(u16::from_le_bytes([response[0], response[1]]))
    }

    /// One broadcast packet writing the same 2-byte register on many motors.
    /// Sync writes are not acknowledged by the servos.
    fn sync_write_u16(&mut self, register: Register, data: &[(u8, u16)]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut params = vec![register as u8, 2];
        for &(id, value) in data {
            params.push(id);
            params.push((value & 0xFF) as u8);
            params.push((value >> 8) as u8);
        }
        let packet = Self::build_packet(BROADCAST_ID, Instruction::SyncWrite, &params);
        debug!("sync write {} motors reg={:?}", data.len(), register);
        self.send_packet(&packet)
    }

    fn enable_torque(&mut self, id: u8) -> Result<()> {
        self.write_u8(id, Register::TorqueEnable, 1)?;
        self.write_u8(id, Register::Lock, 1)
    }

    fn disable_torque(&mut self, id: u8) -> Result<()> {
        self.write_u8(id, Register::TorqueEnable, 0)?;
        self.write_u8(id, Register::Lock, 0)
    }

    /// Record the current pose of `id` as the center ([`CENTER_TICK`]).
    /// EEPROM must be unlocked and torque off while the offset is written.
    fn home_motor(&mut self, id: u8) -> Result<()> {
        self.disable_torque(id)?;
        // Clear the old offset so the present-position read is unbiased.
        self.write_u16(id, Register::HomingOffset, 0)?;
        let present = self.read_u16(id, Register::PresentPosition)?;
        let offset = present as i32 - CENTER_TICK as i32;
        self.write_u16(id, Register::HomingOffset, encode_sign_magnitude(offset as i16))?;
        debug!("homed motor {}: present={} offset={}", id, present, offset);
        Ok(())
    }
}

impl MotorBus for FeetechBus {
    fn ping(&mut self, id: MotorId) -> Result<bool> {
        let packet = Self::build_packet(id, Instruction::Ping, &[]);
        self.send_packet(&packet)?;
        match self.read_response(id) {
            Ok(_) => Ok(true),
            Err(FeetechError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn read_position(&mut self, id: MotorId) -> Result<u16> {
        self.read_u16(id, Register::PresentPosition)
    }

    fn read_velocity(&mut self, id: MotorId) -> Result<i16> {
        Ok(decode_sign_magnitude(
            self.read_u16(id, Register::PresentVelocity)?,
        ))
    }

    fn write_positions(&mut self, targets: &[(MotorId, u16)]) -> Result<()> {
        self.sync_write_u16(Register::GoalPosition, targets)
    }

    fn write_velocities(&mut self, targets: &[(MotorId, i16)]) -> Result<()> {
        let encoded: Vec<(u8, u16)> = targets
            .iter()
            .map(|&(id, v)| (id, encode_sign_magnitude(v)))
            .collect();
        self.sync_write_u16(Register::GoalVelocity, &encoded)
    }

    fn configure(&mut self, position_ids: &[MotorId], velocity_ids: &[MotorId]) -> Result<()> {
        // Operating mode can only change with torque off.
        for &id in position_ids.iter().chain(velocity_ids) {
            self.disable_torque(id)?;
        }
        for &id in position_ids {
            self.write_u8(id, Register::OperatingMode, OperatingMode::Position as u8)?;
        }
        for &id in velocity_ids {
            self.write_u8(id, Register::OperatingMode, OperatingMode::Velocity as u8)?;
        }
        for &id in position_ids.iter().chain(velocity_ids) {
            self.enable_torque(id)?;
        }
        Ok(())
    }

    fn set_homing(&mut self, ids: &[MotorId]) -> Result<()> {
        for &id in ids {
            self.home_motor(id)?;
        }
        Ok(())
    }
}

/// Validate a status packet body (error byte + params + checksum) and
/// return the parameter bytes. A corrupted stream can deliver any length
/// byte, so anything shorter than error + checksum is rejected up front.
fn parse_status_body(id: u8, body: &[u8]) -> Result<Vec<u8>> {
    if body.len() < 2 {
        return Err(FeetechError::InvalidResponse {
            id,
            reason: format!("status length {} too short", body.len()),
        });
    }

    let mut checked = vec![id, body.len() as u8];
    checked.extend_from_slice(&body[..body.len() - 1]);
    if FeetechBus::checksum(&checked) != body[body.len() - 1] {
        return Err(FeetechError::ChecksumMismatch { id });
    }

    if body[0] != 0 {
        return Err(FeetechError::MotorError { id, status: body[0] });
    }
    Ok(body[1..body.len() - 1].to_vec())
}

/// Sign-magnitude: bit 15 is the sign, bits 0-14 the magnitude.
fn encode_sign_magnitude(value: i16) -> u16 {
    if value >= 0 {
        value as u16
    } else {
        0x8000 | (-(value as i32)) as u16
    }
}

fn decode_sign_magnitude(raw: u16) -> i16 {
    let magnitude = (raw & 0x7FFF) as i16;
    if raw & 0x8000 != 0 { -magnitude } else { magnitude }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_matches_protocol_reference() {
        // ID=1, Length=4, WRITE, addr=30, data=[0, 2] -> ~(40) = 215
        let data = [1u8, 4, 0x03, 30, 0, 2];
        assert_eq!(FeetechBus::checksum(&data), 215);
    }

    #[test]
    fn sign_magnitude_round_trip() {
        assert_eq!(encode_sign_magnitude(0), 0);
        assert_eq!(encode_sign_magnitude(100), 100);
        assert_eq!(encode_sign_magnitude(-100), 0x8064);
        assert_eq!(encode_sign_magnitude(-1), 0x8001);
        assert_eq!(encode_sign_magnitude(i16::MIN), 0x8000 | 0x8000u16);

        assert_eq!(decode_sign_magnitude(0), 0);
        assert_eq!(decode_sign_magnitude(100), 100);
        assert_eq!(decode_sign_magnitude(0x8064), -100);
        assert_eq!(decode_sign_magnitude(0x8001), -1);
    }

    #[test]
    fn ping_packet_layout() {
        let packet = FeetechBus::build_packet(1, Instruction::Ping, &[]);
        assert_eq!(packet, [0xFF, 0xFF, 1, 2, 0x01, 251]);
    }

    #[test]
    fn status_body_parses_params() {
        // id=1, length=4: error=0, params=[0x00, 0x08], checksum over
        // [1, 4, 0, 0, 8] = ~13 = 242
        let params = parse_status_body(1, &[0, 0x00, 0x08, 242]).unwrap();
        assert_eq!(params, [0x00, 0x08]);
    }

    #[test]
    fn truncated_status_body_is_an_error_not_a_panic() {
        // A corrupted stream can claim length 0 or 1; both must come back
        // as InvalidResponse.
        for body in [&[][..], &[0x00][..]] {
            let err = parse_status_body(1, body).unwrap_err();
            assert!(matches!(err, FeetechError::InvalidResponse { id: 1, .. }), "{err}");
        }
    }

    #[test]
    fn status_body_checksum_and_error_byte() {
        assert!(matches!(
            parse_status_body(1, &[0, 0x00, 0x08, 0]),
            Err(FeetechError::ChecksumMismatch { id: 1 })
        ));
        // error byte 0x20 (overload), checksum over [1, 2, 0x20] = ~35 = 220
        assert!(matches!(
            parse_status_body(1, &[0x20, 220]),
            Err(FeetechError::MotorError { id: 1, status: 0x20 })
        ));
    }

    #[test]
    fn sync_write_packet_layout() {
        let mut params = vec![Register::GoalPosition as u8, 2];
        params.extend_from_slice(&[7, 0x00, 0x08]);
        let packet = FeetechBus::build_packet(0xFE, Instruction::SyncWrite, &params);
        // broadcast id, length = params + instruction + checksum
        assert_eq!(packet[2], 0xFE);
        assert_eq!(packet[3], (params.len() + 2) as u8);
        assert_eq!(packet[4], 0x83);
    }
}
