// Motor slot identifiers and the actuator collaborator interface

use std::fmt;

use serde::{Deserialize, Serialize};

use super::feetech::FeetechError;
use crate::error::ConfigurationError;

/// One of the four physical motor outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct MotorSlot(u8);

impl MotorSlot {
    pub const COUNT: usize = 4;
    pub const ALL: [MotorSlot; Self::COUNT] = [MotorSlot(0), MotorSlot(1), MotorSlot(2), MotorSlot(3)];

    pub fn new(index: i64) -> Result<Self, ConfigurationError> {
        if (0..Self::COUNT as i64).contains(&index) {
            Ok(MotorSlot(index as u8))
        } else {
            Err(ConfigurationError::InvalidSlot(index))
        }
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<i64> for MotorSlot {
    type Error = ConfigurationError;

    fn try_from(index: i64) -> Result<Self, Self::Error> {
        MotorSlot::new(index)
    }
}

impl From<MotorSlot> for u8 {
    fn from(slot: MotorSlot) -> u8 {
        slot.0
    }
}

impl fmt::Display for MotorSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    #[error("motor {0} is not wired to this actuator")]
    Unmapped(MotorSlot),

    #[error("bus error on motor {slot}: {source}")]
    Bus {
        slot: MotorSlot,
        #[source]
        source: FeetechError,
    },

    #[error("injected failure on motor {0}")]
    Injected(MotorSlot),
}

/// What the control unit needs from the peripheral layer: drive a motor with a
/// duty in [-100, 100] and read back its encoder.
///
/// Tick counts are cumulative and signed. Implementations must not wrap them.
pub trait MotorActuator {
    fn set_duty(&mut self, slot: MotorSlot, duty: i8) -> Result<(), HardwareError>;
    fn read_ticks(&mut self, slot: MotorSlot) -> Result<i64, HardwareError>;
}
