// Loop rate, topics, and tunable unit parameters
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::control::pid::PidGains;
use crate::error::{AmcuError, Result};

// Control loop frequency
pub const LOOP_HZ: u64 = 50;

// RPM targets and duty commands both live in [-COMMAND_LIMIT, COMMAND_LIMIT]
pub const COMMAND_LIMIT: i8 = 100;

// Zenoh topics
pub const TOPIC_CMD: &str = "amcu/cmd"; // host commands
pub const TOPIC_LIMIT_EDGE: &str = "amcu/hw/limit"; // raw limit switch edges from the GPIO bridge
pub const TOPIC_EVENT: &str = "amcu/event"; // drive completions and limit switch triggers
pub const TOPIC_MOTORS: &str = "amcu/state/motors"; // per-motor telemetry
pub const TOPIC_HEALTH: &str = "amcu/state/health"; // health status
pub const TOPIC_REPLY: &str = "amcu/reply"; // per-command outcome

// Serial port for the smart-servo motor bus
pub const MOTOR_PORT: &str = "/dev/ttyACM0";

/// Parameters that vary between robots. Every field has a default so a config
/// file only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitConfig {
    /// Encoder ticks per wheel revolution
    pub ticks_per_revolution: u32,
    /// Gains in effect until the host calls setPID
    pub gains: PidGains,
    /// Limit switch debounce window
    pub debounce_ms: u64,
    /// Cruise speeds used to plan distance drives
    pub distance_speed_cms: f32,
    pub distance_turn_degs: f32,
    /// Distance drive completion tolerances
    pub distance_tolerance_mm: f32,
    pub angle_tolerance_deg: f32,
    /// Distance drives give up after `planned * factor + margin` seconds
    pub safety_time_factor: f32,
    pub safety_time_margin_s: f32,
    /// Consecutive hardware failures on one motor before the unit faults
    pub fault_threshold: u32,
    /// Limit switch edges buffered while the control tick holds the lock
    pub edge_queue_depth: usize,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            ticks_per_revolution: 360,
            gains: PidGains::default(),
            debounce_ms: 20,
            distance_speed_cms: 20.0,
            distance_turn_degs: 45.0,
            distance_tolerance_mm: 10.0,
            angle_tolerance_deg: 2.0,
            safety_time_factor: 3.0,
            safety_time_margin_s: 2.0,
            fault_threshold: 5,
            edge_queue_depth: 32,
        }
    }
}

impl UnitConfig {
    /// Load from a JSON file, missing fields fall back to defaults
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| AmcuError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text).map_err(|source| AmcuError::ConfigParse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_json(text: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
