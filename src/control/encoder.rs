// Encoder tracking: cumulative ticks and derived RPM per motor
//
// Raw counts come from the actuator. A logical baseline lets resetEncoder zero
// the count without touching the hardware counter.

use std::time::Duration;

use tracing::{error, warn};

use crate::error::{AmcuError, Result};
use crate::motor::{HardwareError, MotorSlot};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct EncoderState {
    /// Last good raw count, None until the first successful read
    raw: Option<i64>,
    baseline: i64,
    rpm: f32,
    failures: u32,
    /// Time covered by reads that failed since the last good one
    stale: Duration,
}

#[derive(Debug, Clone)]
pub struct Tracker {
    motors: [EncoderState; MotorSlot::COUNT],
    ticks_per_revolution: u32,
    fault_threshold: u32,
}

impl Tracker {
    pub fn new(ticks_per_revolution: u32, fault_threshold: u32) -> Self {
        Self {
            motors: Default::default(),
            ticks_per_revolution,
            fault_threshold,
        }
    }

    pub fn ticks_per_revolution(&self) -> u32 {
        self.ticks_per_revolution
    }

    /// Feed one raw read covering `dt`. A failed read keeps the previous count
    /// and speed, and the next good read spreads its delta over the whole gap.
    /// Once failures pass the threshold the motor is reported as faulted.
    pub fn update(
        &mut self,
        slot: MotorSlot,
        reading: std::result::Result<i64, HardwareError>,
        dt: Duration,
    ) -> Result<()> {
        match reading {
            Ok(raw) => {
                let motor = &mut self.motors[slot.index()];
                motor.failures = 0;
                let elapsed = std::mem::take(&mut motor.stale) + dt;
                match motor.raw.replace(raw) {
                    Some(prev) if !elapsed.is_zero() => {
                        let revolutions = (raw - prev) as f32 / self.ticks_per_revolution as f32;
                        motor.rpm = revolutions / elapsed.as_secs_f32() * 60.0;
                    }
                    Some(_) => {}
                    // First read defines logical zero
                    None => motor.baseline = raw,
                }
                Ok(())
            }
            Err(e) => {
                warn!("Encoder read failed on motor {}, reusing last value: {}", slot, e);
                self.motors[slot.index()].stale += dt;
                self.record_failure(slot)
            }
        }
    }

    /// Count a hardware failure against the motor (reads and duty writes alike)
    pub fn record_failure(&mut self, slot: MotorSlot) -> Result<()> {
        let motor = &mut self.motors[slot.index()];
        motor.failures += 1;
        if motor.failures > self.fault_threshold {
            error!(
                "Motor {} exceeded {} consecutive hardware failures",
                slot, self.fault_threshold
            );
            return Err(AmcuError::HardwareFault {
                slot,
                failures: motor.failures,
            });
        }
        Ok(())
    }

    /// Ticks since the last reset
    pub fn ticks(&self, slot: MotorSlot) -> i64 {
        let motor = &self.motors[slot.index()];
        motor.raw.map_or(0, |raw| raw - motor.baseline)
    }

    /// Raw counts for every slot, unaffected by resets. `None` for a motor that
    /// has not been read successfully yet.
    pub fn raw_snapshot(&self) -> [Option<i64>; MotorSlot::COUNT] {
        self.motors.map(|motor| motor.raw)
    }

    pub fn rpm(&self, slot: MotorSlot) -> f32 {
        self.motors[slot.index()].rpm
    }

    pub fn reset(&mut self, slot: MotorSlot) {
        let motor = &mut self.motors[slot.index()];
        if let Some(raw) = motor.raw {
            motor.baseline = raw;
        }
    }

    /// Forget accumulated failures, used when the unit recovers from a fault
    pub fn clear_failures(&mut self) {
        for motor in &mut self.motors {
            motor.failures = 0;
            motor.stale = Duration::ZERO;
        }
    }
}
