// Motor control unit core for a wheeled robot base
//
// The library holds the control unit itself (kinematics, PID, encoder tracking,
// limit switches, drive actions). The binary wraps it in a zenoh runtime.

pub mod config;
pub mod control;
pub mod error;
pub mod messages;
pub mod motor;
pub mod runtime;
