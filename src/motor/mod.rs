// Hardware-facing side of the control unit
//
// Provides:
// - Motor slots and the actuator interface the peripheral layer implements
// - Drivetrain kinematics (body velocity <-> per-motor RPM / progress)
// - STS-series smart servo bus protocol and an actuator built on it
// - A simulated actuator for tests and bench runs

mod actuator;
mod driver;
pub mod feetech;
pub mod kinematics;
mod sim;

pub use actuator::{HardwareError, MotorActuator, MotorSlot};
pub use driver::FeetechActuator;
pub use feetech::{FeetechBus, FeetechError};
pub use kinematics::{BodyVelocity, Displacement, Drivetrain, WheelTargets};
pub use sim::SimulatedActuator;
