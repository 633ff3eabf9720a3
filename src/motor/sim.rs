// Simulated motors for tests and bench runs without hardware
//
// Each motor is a first-order lag from duty to RPM, integrated into encoder
// ticks. Time only moves when `advance` is called, so runs are deterministic.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::actuator::{HardwareError, MotorActuator, MotorSlot};

/// RPM a motor settles at per unit of duty (150 RPM at full duty)
const RPM_PER_DUTY: f64 = 1.5;

/// Duty-to-speed time constant in seconds
const TIME_CONSTANT_S: f64 = 0.1;

#[derive(Debug, Clone, Copy, Default)]
struct SimMotor {
    duty: i8,
    rpm: f64,
    ticks: f64,
    failing: bool,
}

#[derive(Debug)]
struct SimBench {
    motors: [SimMotor; MotorSlot::COUNT],
    ticks_per_revolution: u32,
}

/// Cloneable handle, every clone drives the same simulated bench
#[derive(Debug, Clone)]
pub struct SimulatedActuator {
    bench: Arc<Mutex<SimBench>>,
}

impl SimulatedActuator {
    pub fn new(ticks_per_revolution: u32) -> Self {
        Self {
            bench: Arc::new(Mutex::new(SimBench {
                motors: Default::default(),
                ticks_per_revolution,
            })),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut SimBench) -> R) -> R {
        let mut bench = self.bench.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut bench)
    }

    /// Let `dt` of simulated time pass
    pub fn advance(&self, dt: Duration) {
        let seconds = dt.as_secs_f64();
        let blend = (seconds / TIME_CONSTANT_S).min(1.0);
        self.with(|bench| {
            let tpr = bench.ticks_per_revolution as f64;
            for motor in &mut bench.motors {
                let settled = motor.duty as f64 * RPM_PER_DUTY;
                motor.rpm += (settled - motor.rpm) * blend;
                motor.ticks += motor.rpm / 60.0 * seconds * tpr;
            }
        });
    }

    /// Last duty written to the slot
    pub fn duty(&self, slot: MotorSlot) -> i8 {
        self.with(|bench| bench.motors[slot.index()].duty)
    }

    pub fn rpm(&self, slot: MotorSlot) -> f64 {
        self.with(|bench| bench.motors[slot.index()].rpm)
    }

    /// Move the physical counter, e.g. to emulate a wheel pushed by hand
    pub fn set_ticks(&self, slot: MotorSlot, ticks: i64) {
        self.with(|bench| bench.motors[slot.index()].ticks = ticks as f64);
    }

    /// Make every read and write on the slot fail until cleared
    pub fn set_failing(&self, slot: MotorSlot, failing: bool) {
        self.with(|bench| bench.motors[slot.index()].failing = failing);
    }
}

impl MotorActuator for SimulatedActuator {
    fn set_duty(&mut self, slot: MotorSlot, duty: i8) -> Result<(), HardwareError> {
        self.with(|bench| {
            let motor = &mut bench.motors[slot.index()];
            if motor.failing {
                return Err(HardwareError::Injected(slot));
            }
            motor.duty = duty;
            Ok(())
        })
    }

    fn read_ticks(&mut self, slot: MotorSlot) -> Result<i64, HardwareError> {
        self.with(|bench| {
            let motor = &bench.motors[slot.index()];
            if motor.failing {
                Err(HardwareError::Injected(slot))
            } else {
                Ok(motor.ticks.round() as i64)
            }
        })
    }
}
