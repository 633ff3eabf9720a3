// Message types for the runtime

use serde::{Deserialize, Serialize};

use crate::control::{CompletionReason, SchedulerState};
use crate::motor::MotorSlot;

/// Command from the host -> runtime, one variant per public operation.
/// Motor slots outside 0..=3 are rejected while parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HostCommand {
    InitOmniDriveBase {
        wheel_radius_mm: u32,
        robot_radius_mm: u32,
        motor_left: MotorSlot,
        motor_right: MotorSlot,
        motor_back: MotorSlot,
    },
    InitMecanumDriveBase {
        wheel_radius_mm: u32,
        robot_x_mm: u32,
        robot_y_mm: u32,
        motor_front_left: MotorSlot,
        motor_front_right: MotorSlot,
        motor_back_left: MotorSlot,
        motor_back_right: MotorSlot,
    },
    #[serde(rename = "init_differential_drive_base_2wheel")]
    InitDifferentialDriveBase2Wheel {
        wheel_radius_mm: u32,
        wheel_distance_mm: u32,
        motor_left: MotorSlot,
        motor_right: MotorSlot,
    },
    #[serde(rename = "init_differential_drive_base_4wheel")]
    InitDifferentialDriveBase4Wheel {
        wheel_radius_mm: u32,
        wheel_distance_mm: u32,
        motor_front_left: MotorSlot,
        motor_front_right: MotorSlot,
        motor_back_left: MotorSlot,
        motor_back_right: MotorSlot,
    },
    SetPid {
        kp: f32,
        ki: f32,
        kd: f32,
    },
    SetLimitSwitches {
        motor: MotorSlot,
        active_high: bool,
        enabled: bool,
        normally_closed: bool,
        debounce: bool,
    },
    SetRpm {
        motor: MotorSlot,
        rpm: i32,
    },
    SetSpeed {
        motor: MotorSlot,
        percent: i32,
    },
    ResetEncoder {
        motor: MotorSlot,
    },
    GetEncoder {
        motor: MotorSlot,
    },
    GetRpm {
        motor: MotorSlot,
    },
    Stop,
    SpeedDrive {
        x_speed_cms: i32,
        y_speed_cms: i32,
        w_speed_degs: i32,
    },
    TimeDrive {
        x_speed_cms: i32,
        y_speed_cms: i32,
        w_speed_degs: i32,
        time_s: u32,
    },
    DriveDistance {
        x_meter: i32,
        y_meter: i32,
        omega_degree: i32,
    },
}

impl HostCommand {
    pub fn op(&self) -> &'static str {
        match self {
            HostCommand::InitOmniDriveBase { .. } => "init_omni_drive_base",
            HostCommand::InitMecanumDriveBase { .. } => "init_mecanum_drive_base",
            HostCommand::InitDifferentialDriveBase2Wheel { .. } => "init_differential_drive_base_2wheel",
            HostCommand::InitDifferentialDriveBase4Wheel { .. } => "init_differential_drive_base_4wheel",
            HostCommand::SetPid { .. } => "set_pid",
            HostCommand::SetLimitSwitches { .. } => "set_limit_switches",
            HostCommand::SetRpm { .. } => "set_rpm",
            HostCommand::SetSpeed { .. } => "set_speed",
            HostCommand::ResetEncoder { .. } => "reset_encoder",
            HostCommand::GetEncoder { .. } => "get_encoder",
            HostCommand::GetRpm { .. } => "get_rpm",
            HostCommand::Stop => "stop",
            HostCommand::SpeedDrive { .. } => "speed_drive",
            HostCommand::TimeDrive { .. } => "time_drive",
            HostCommand::DriveDistance { .. } => "drive_distance",
        }
    }
}

/// Outcome of one host command, runtime -> host.
/// `value` carries the applied (possibly clamped) value or the queried reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReply {
    pub op: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandReply {
    pub fn ok(op: &str, value: Option<i64>) -> Self {
        Self {
            op: op.to_string(),
            ok: true,
            value,
            error: None,
        }
    }

    pub fn failed(op: &str, error: impl ToString) -> Self {
        Self {
            op: op.to_string(),
            ok: false,
            value: None,
            error: Some(error.to_string()),
        }
    }
}

// Raw edge from the GPIO bridge -> runtime
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitEdgeMessage {
    pub motor: MotorSlot,
    pub level_high: bool,
}

/// Asynchronous notifications, runtime -> host
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UnitEvent {
    LimitSwitch { motor: MotorSlot, level_high: bool },
    DriveComplete { reason: CompletionReason },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorTelemetry {
    pub motor: MotorSlot,
    pub ticks: i64,
    pub rpm: i32,
    pub duty: i8,
    pub target_rpm: Option<f32>,
}

/// Published every loop once a drive base exists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorsState {
    pub drive: SchedulerState,
    pub motors: Vec<MotorTelemetry>,
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Uninitialized,
    Ok,
    Faulted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_init_command() {
        let cmd: HostCommand = serde_json::from_str(
            r#"{"op":"init_differential_drive_base_2wheel","wheel_radius_mm":50,"wheel_distance_mm":300,"motor_left":0,"motor_right":1}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            HostCommand::InitDifferentialDriveBase2Wheel {
                wheel_radius_mm: 50,
                wheel_distance_mm: 300,
                motor_left: MotorSlot::ALL[0],
                motor_right: MotorSlot::ALL[1],
            }
        );
        assert_eq!(cmd.op(), "init_differential_drive_base_2wheel");
    }

    #[test]
    fn test_parse_unit_variant() {
        let cmd: HostCommand = serde_json::from_str(r#"{"op":"stop"}"#).unwrap();
        assert_eq!(cmd, HostCommand::Stop);
    }

    #[test]
    fn test_invalid_motor_rejected() {
        let err = serde_json::from_str::<HostCommand>(r#"{"op":"set_rpm","motor":4,"rpm":10}"#)
            .unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err}");
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_string(&UnitEvent::DriveComplete {
            reason: CompletionReason::TargetReached,
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"drive_complete","reason":"target_reached"}"#);

        let json = serde_json::to_string(&RuntimeHealth::Uninitialized).unwrap();
        assert_eq!(json, r#""uninitialized""#);
    }

    #[test]
    fn test_reply_omits_empty_fields() {
        let json = serde_json::to_string(&CommandReply::ok("stop", None)).unwrap();
        assert_eq!(json, r#"{"op":"stop","ok":true}"#);
    }
}
