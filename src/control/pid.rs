// Per-motor speed regulator
//
// output = kp*error + ki*∫error dt + kd*d(error)/dt, in duty percent.
// Gains are shared by every motor, integral and previous error are per motor.

use serde::{Deserialize, Serialize};

use crate::config::COMMAND_LIMIT;

const OUTPUT_LIMIT: f32 = COMMAND_LIMIT as f32;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl PidGains {
    pub fn new(kp: f32, ki: f32, kd: f32) -> Self {
        Self { kp, ki, kd }
    }
}

impl Default for PidGains {
    fn default() -> Self {
        Self::new(0.5, 3.0, 0.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PidController {
    integral: f32,
    prev_error: Option<f32>,
}

impl PidController {
    /// One regulation step, returns a duty in [-100, 100]
    pub fn update(&mut self, gains: &PidGains, target_rpm: f32, measured_rpm: f32, dt: f32) -> f32 {
        let error = target_rpm - measured_rpm;

        if dt > 0.0 {
            self.integral += error * dt;
        }
        // Anti-windup: the integral term alone may never exceed the output range
        if gains.ki != 0.0 {
            let i_max = OUTPUT_LIMIT / gains.ki.abs();
            self.integral = self.integral.clamp(-i_max, i_max);
        }

        // No derivative kick on the first step after a reset
        let derivative = match self.prev_error.replace(error) {
            Some(prev) if dt > 0.0 => (error - prev) / dt,
            _ => 0.0,
        };

        let output = gains.kp * error + gains.ki * self.integral + gains.kd * derivative;
        output.clamp(-OUTPUT_LIMIT, OUTPUT_LIMIT)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn integral(&self) -> f32 {
        self.integral
    }
}
