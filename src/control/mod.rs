// Closed-loop side of the control unit
//
// Provides:
// - Per-motor PID speed regulation
// - Encoder tracking with logical reset and fault counting
// - Limit switch monitoring with debounce
// - The drive action scheduler
// - ControlUnit, which ties them to a motor actuator behind one lock

pub mod encoder;
pub mod limit_switch;
pub mod pid;
pub mod scheduler;
mod unit;

pub use limit_switch::{LimitSwitchConfig, LimitSwitchEvent, SwitchState};
pub use pid::PidGains;
pub use scheduler::{CompletionReason, DriveAction, SchedulerState};
pub use unit::{ControlUnit, DriveActionHandler, LimitSwitchHandler};
