// Motor actuator backed by STS-series smart servos
//
// Each motor slot maps to a servo ID on a shared serial bus. The servos run in
// open-loop PWM mode; the control unit's PID closes the loop from the unwrapped
// position register.

use tracing::{debug, info, warn};

use super::actuator::{HardwareError, MotorActuator, MotorSlot};
use super::feetech::{
    FeetechBus, FeetechError, OperatingMode, PWM_FULL_SCALE, STEPS_PER_REVOLUTION,
};

/// Turns the single-turn position register into a cumulative tick count
#[derive(Debug, Clone, Copy, Default)]
struct PositionUnwrap {
    last: Option<u16>,
    total: i64,
}

impl PositionUnwrap {
    fn update(&mut self, raw: u16) -> i64 {
        if let Some(last) = self.last {
            let revolution = STEPS_PER_REVOLUTION as i64;
            let mut delta = raw as i64 - last as i64;
            // Shortest way around the circle, the loop runs far faster than half a turn per tick
            if delta > revolution / 2 {
                delta -= revolution;
            } else if delta < -revolution / 2 {
                delta += revolution;
            }
            self.total += delta;
        } else {
            self.total = raw as i64;
        }
        self.last = Some(raw);
        self.total
    }
}

pub struct FeetechActuator {
    bus: FeetechBus,
    ids: [Option<u8>; MotorSlot::COUNT],
    positions: [PositionUnwrap; MotorSlot::COUNT],
}

impl FeetechActuator {
    /// Open the bus; `ids[slot]` is the servo wired to that slot, if any
    pub fn open(port: &str, ids: [Option<u8>; MotorSlot::COUNT]) -> Result<Self, FeetechError> {
        info!("Opening motor bus on {}", port);
        let bus = FeetechBus::open(port)?;
        Ok(Self {
            bus,
            ids,
            positions: Default::default(),
        })
    }

    fn wired(&self) -> impl Iterator<Item = u8> + '_ {
        self.ids.iter().flatten().copied()
    }

    /// Ping every wired servo and switch it to open-loop PWM mode
    pub fn initialize(&mut self) -> Result<(), FeetechError> {
        let ids: Vec<u8> = self.wired().collect();
        info!("Initializing servos {:?} for PWM control", ids);

        for &id in &ids {
            if !self.bus.ping(id)? {
                warn!("Servo {} not responding to ping", id);
                return Err(FeetechError::Timeout { id });
            }
            debug!("Servo {} responding", id);
        }

        // Operating mode can only change with torque off
        for &id in &ids {
            self.bus.disable_torque(id)?;
            self.bus.set_operating_mode(id, OperatingMode::Pwm)?;
            self.bus.set_pwm(id, 0)?;
            self.bus.enable_torque(id)?;
        }

        info!("Servos initialized");
        Ok(())
    }

    fn id(&self, slot: MotorSlot) -> Result<u8, HardwareError> {
        self.ids[slot.index()].ok_or(HardwareError::Unmapped(slot))
    }
}

impl MotorActuator for FeetechActuator {
    fn set_duty(&mut self, slot: MotorSlot, duty: i8) -> Result<(), HardwareError> {
        let id = self.id(slot)?;
        let pwm = duty as i16 * (PWM_FULL_SCALE / 100) as i16;
        self.bus
            .set_pwm(id, pwm)
            .map_err(|source| HardwareError::Bus { slot, source })
    }

    fn read_ticks(&mut self, slot: MotorSlot) -> Result<i64, HardwareError> {
        let id = self.id(slot)?;
        let raw = self
            .bus
            .present_position(id)
            .map_err(|source| HardwareError::Bus { slot, source })?;
        Ok(self.positions[slot.index()].update(raw))
    }
}

impl Drop for FeetechActuator {
    fn drop(&mut self) {
        // Never leave a servo driving when the unit goes away
        let ids: Vec<u8> = self.wired().collect();
        for id in ids {
            if let Err(e) = self.bus.set_pwm(id, 0) {
                warn!("Failed to stop servo {} on drop: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwrap_starts_at_raw_position() {
        let mut unwrap = PositionUnwrap::default();
        assert_eq!(unwrap.update(1000), 1000);
        assert_eq!(unwrap.update(1100), 1100);
    }

    #[test]
    fn test_unwrap_crosses_zero_forward() {
        let mut unwrap = PositionUnwrap::default();
        unwrap.update(4000);
        assert_eq!(unwrap.update(50), 4000 + 96 + 50);
        assert_eq!(unwrap.update(300), 4000 + 96 + 300);
    }

    #[test]
    fn test_unwrap_crosses_zero_backward() {
        let mut unwrap = PositionUnwrap::default();
        unwrap.update(20);
        assert_eq!(unwrap.update(4076), 20 - 40);
        // Several full turns backward never wrap the count
        let mut position = 4076u16;
        for _ in 0..3 * 8 {
            position = (position + 4096 - 512) % 4096;
            unwrap.update(position);
        }
        assert_eq!(unwrap.total, -20 - 3 * 4096);
    }
}
