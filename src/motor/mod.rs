// Motor control module for the 4-DOF robot arm
//
// Provides:
// - Forward/inverse kinematics (xyz <-> joint angles)
// - Stepper joint model (angle <-> steps, move timing)
// - Motor controller line protocol over serial
// - High-level robot arm driver API

pub mod controller;
pub(crate) mod driver;
pub mod kinematics;
#[cfg(test)]
pub(crate) mod mock;
pub mod stepper;

pub use controller::{Ack, ControllerError, MotorController, StatusCode, Transport};
pub use driver::{ArmError, RobotArm};
pub use kinematics::{JointAngles, KinematicError, Kinematics, Point};
pub use stepper::Motor;
