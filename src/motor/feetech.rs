// STS-series smart servo bus protocol
//
// Packet format: [0xFF, 0xFF, ID, Length, Instruction, Params..., Checksum]
// Status format: [0xFF, 0xFF, ID, Length, Error, Params..., Checksum]
// Length counts everything after itself, checksum is !(sum of ID..last param).
//
// The control unit runs these motors open-loop in PWM mode and closes the
// speed loop itself from the position register.

use serialport::{self, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BAUDRATE: u32 = 1_000_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Position register resolution, one full output revolution
pub const STEPS_PER_REVOLUTION: u32 = 4096;

/// Full-scale magnitude of the PWM goal register
pub const PWM_FULL_SCALE: u16 = 1000;

/// Direction bit of the PWM goal register
const PWM_DIRECTION_BIT: u16 = 1 << 10;

const HEADER: [u8; 2] = [0xFF, 0xFF];

#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
}

/// RAM registers used by the control unit
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Register {
    OperatingMode = 33,   // 1 byte: 0=position, 1=velocity, 2=PWM
    TorqueEnable = 40,    // 1 byte
    GoalPwm = 44,         // 2 bytes, magnitude 0..=1000, bit 10 = reverse
    Lock = 55,            // 1 byte
    PresentPosition = 56, // 2 bytes, 0..4096 single turn
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatingMode {
    Position = 0,
    Velocity = 1,
    Pwm = 2,
}

#[derive(Debug, thiserror::Error)]
pub enum FeetechError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response from motor {id}: {reason}")]
    InvalidResponse { id: u8, reason: String },

    #[error("Checksum mismatch for motor {id}")]
    ChecksumMismatch { id: u8 },

    #[error("Motor {id} returned error status: 0x{status:02X}")]
    MotorError { id: u8, status: u8 },

    #[error("Timeout waiting for response from motor {id}")]
    Timeout { id: u8 },
}

pub type Result<T> = std::result::Result<T, FeetechError>;

fn checksum(data: &[u8]) -> u8 {
    let sum: u32 = data.iter().map(|&b| b as u32).sum();
    !(sum as u8)
}

/// Frame an instruction packet
pub fn encode_packet(id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(6 + params.len());
    packet.extend_from_slice(&HEADER);
    packet.push(id);
    packet.push((params.len() + 2) as u8);
    packet.push(instruction as u8);
    packet.extend_from_slice(params);
    packet.push(checksum(&packet[2..]));
    packet
}

/// Validate a complete status frame and return its parameters
pub fn decode_status(expected_id: u8, frame: &[u8]) -> Result<Vec<u8>> {
    let invalid = |reason: String| FeetechError::InvalidResponse {
        id: expected_id,
        reason,
    };

    if frame.len() < 6 {
        return Err(invalid(format!("frame too short: {} bytes", frame.len())));
    }
    if frame[..2] != HEADER {
        return Err(invalid(format!("Invalid header: {:02X?}", &frame[..2])));
    }

    let id = frame[2];
    if id != expected_id {
        return Err(invalid(format!("ID mismatch: expected {expected_id}, got {id}")));
    }

    let length = frame[3] as usize;
    if frame.len() != 4 + length {
        return Err(invalid(format!(
            "length field {length} does not match {} byte frame",
            frame.len()
        )));
    }

    let (body, received) = frame[2..].split_at(frame.len() - 3);
    if checksum(body) != received[0] {
        return Err(FeetechError::ChecksumMismatch { id });
    }

    let status = frame[4];
    if status != 0 {
        return Err(FeetechError::MotorError { id, status });
    }

    Ok(frame[5..frame.len() - 1].to_vec())
}

/// Signed duty in [-1000, 1000] to the register's magnitude + direction bit
fn encode_pwm(duty: i16) -> u16 {
    let magnitude = duty.unsigned_abs().min(PWM_FULL_SCALE);
    if duty < 0 {
        magnitude | PWM_DIRECTION_BIT
    } else {
        magnitude
    }
}

pub struct FeetechBus {
    port: Box<dyn SerialPort>,
}

impl FeetechBus {
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        Ok(Self { port })
    }

    /// Send one instruction and wait for its status packet
    fn transact(&mut self, id: u8, instruction: Instruction, params: &[u8]) -> Result<Vec<u8>> {
        let packet = encode_packet(id, instruction, params);
        self.port.write_all(&packet)?;
        self.port.flush()?;

        let mut frame = vec![0u8; 4];
        self.port.read_exact(&mut frame).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                FeetechError::Timeout { id }
            } else {
                FeetechError::Io(e)
            }
        })?;

        let length = frame[3] as usize;
        frame.resize(4 + length, 0);
        self.port.read_exact(&mut frame[4..])?;

        decode_status(id, &frame)
    }

    pub fn ping(&mut self, id: u8) -> Result<bool> {
        match self.transact(id, Instruction::Ping, &[]) {
            Ok(_) => Ok(true),
            Err(FeetechError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn write_u8(&mut self, id: u8, register: Register, value: u8) -> Result<()> {
        debug!("Write u8 to motor {}: reg={:?}, value={}", id, register, value);
        self.transact(id, Instruction::Write, &[register as u8, value])?;
        Ok(())
    }

    /// Two bytes, little-endian
    pub fn write_u16(&mut self, id: u8, register: Register, value: u16) -> Result<()> {
        let [lo, hi] = value.to_le_bytes();
        self.transact(id, Instruction::Write, &[register as u8, lo, hi])?;
        Ok(())
    }

    pub fn read_u16(&mut self, id: u8, register: Register) -> Result<u16> {
        let response = self.transact(id, Instruction::Read, &[register as u8, 2])?;
        match response[..] {
            [lo, hi] => Ok(u16::from_le_bytes([lo, hi])),
            _ => Err(FeetechError::InvalidResponse {
                id,
                reason: format!("Expected 2 bytes, got {}", response.len()),
            }),
        }
    }

    pub fn enable_torque(&mut self, id: u8) -> Result<()> {
        self.write_u8(id, Register::TorqueEnable, 1)?;
        self.write_u8(id, Register::Lock, 1)
    }

    pub fn disable_torque(&mut self, id: u8) -> Result<()> {
        self.write_u8(id, Register::TorqueEnable, 0)?;
        self.write_u8(id, Register::Lock, 0)
    }

    /// Torque must be disabled first
    pub fn set_operating_mode(&mut self, id: u8, mode: OperatingMode) -> Result<()> {
        self.write_u8(id, Register::OperatingMode, mode as u8)
    }

    /// Open-loop drive, `duty` in [-1000, 1000] (motor must be in PWM mode)
    pub fn set_pwm(&mut self, id: u8, duty: i16) -> Result<()> {
        self.write_u16(id, Register::GoalPwm, encode_pwm(duty))
    }

    /// Single-turn position, 0..STEPS_PER_REVOLUTION
    pub fn present_position(&mut self, id: u8) -> Result<u16> {
        self.read_u16(id, Register::PresentPosition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_frame(id: u8, status: u8, params: &[u8]) -> Vec<u8> {
        let mut frame = vec![0xFF, 0xFF, id, (params.len() + 2) as u8, status];
        frame.extend_from_slice(params);
        frame.push(checksum(&frame[2..]));
        frame
    }

    #[test]
    fn test_checksum() {
        // ID=1, Length=4, Instruction=WRITE, Addr=30, Data=0, 2
        // ~(1+4+3+30+0+2) = ~40 = 215
        assert_eq!(checksum(&[1u8, 4, 0x03, 30, 0, 2]), 215);
    }

    #[test]
    fn test_encode_packet() {
        let packet = encode_packet(1, Instruction::Ping, &[]);
        assert_eq!(packet, vec![0xFF, 0xFF, 1, 2, 0x01, !4u8]);

        let packet = encode_packet(7, Instruction::Read, &[Register::PresentPosition as u8, 2]);
        assert_eq!(packet.len(), 8);
        assert_eq!(packet[3], 4);
    }

    #[test]
    fn test_decode_position_status() {
        let frame = status_frame(7, 0, &[0x34, 0x12]);
        assert_eq!(decode_status(7, &frame).unwrap(), vec![0x34, 0x12]);
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        let mut frame = status_frame(7, 0, &[0x34, 0x12]);
        assert!(matches!(
            decode_status(8, &frame),
            Err(FeetechError::InvalidResponse { id: 8, .. })
        ));

        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(matches!(
            decode_status(7, &frame),
            Err(FeetechError::ChecksumMismatch { id: 7 })
        ));

        let frame = status_frame(7, 0x20, &[]);
        assert!(matches!(
            decode_status(7, &frame),
            Err(FeetechError::MotorError { id: 7, status: 0x20 })
        ));
    }

    #[test]
    fn test_pwm_encoding() {
        assert_eq!(encode_pwm(0), 0);
        assert_eq!(encode_pwm(500), 500);
        assert_eq!(encode_pwm(-500), 500 | 0x400);
        assert_eq!(encode_pwm(i16::MIN), 1000 | 0x400);
        assert_eq!(encode_pwm(4000), 1000);
    }
}
