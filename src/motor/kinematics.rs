// Forward and inverse kinematics for the 4-DOF arm
//
// Base rotates about the vertical axis, arm A and arm B form a planar
// two-link chain whose shoulder sits `z_center_to_origin` above the origin,
// and the picker is counter-rotated so it stays level with the ground.
// All angles are in degrees.

use std::fmt;

use crate::command::MotorId;
use crate::config::{ArmGeometry, JointEnvelope};

/// Picker angle plus arm A and arm B angles that keeps the picker level
const PICKER_LEVEL_SUM: f64 = 270.0;

/// Joint angles for all four motors
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct JointAngles {
    pub base: f64,
    pub arm_a: f64,
    pub arm_b: f64,
    pub picker: f64,
}

impl JointAngles {
    pub fn new(base: f64, arm_a: f64, arm_b: f64, picker: f64) -> Self {
        Self {
            base,
            arm_a,
            arm_b,
            picker,
        }
    }

    pub fn get(&self, id: MotorId) -> f64 {
        match id {
            MotorId::Base => self.base,
            MotorId::ArmA => self.arm_a,
            MotorId::ArmB => self.arm_b,
            MotorId::Picker => self.picker,
        }
    }

    /// Returns angles as array [base, arm_a, arm_b, picker]
    pub fn as_array(&self) -> [f64; 4] {
        [self.base, self.arm_a, self.arm_b, self.picker]
    }
}

impl fmt::Display for JointAngles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "base={:.3} arm_a={:.3} arm_b={:.3} picker={:.3}",
            self.base, self.arm_a, self.arm_b, self.picker
        )
    }
}

/// Cartesian position of the end effector
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3})", self.x, self.y, self.z)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KinematicError {
    #[error("Target {target} is unreachable: {reason}")]
    Unreachable { target: Point, reason: &'static str },

    #[error("Target {target} needs {joint} outside its envelope ({angles})")]
    OutOfRange {
        target: Point,
        joint: MotorId,
        angles: JointAngles,
    },
}

/// Kinematic model of the arm: link lengths plus per-joint envelopes
#[derive(Debug, Clone)]
pub struct Kinematics {
    arm_a: f64,
    arm_a2: f64,
    arm_b: f64,
    arm_b2: f64,
    z_offset: f64,
    envelopes: [JointEnvelope; 4],
}

impl Kinematics {
    /// `envelopes` is ordered like `MotorId::ALL`
    pub fn new(geometry: ArmGeometry, envelopes: [JointEnvelope; 4]) -> Self {
        Self {
            arm_a: geometry.arm_a_length,
            arm_a2: geometry.arm_a_length * geometry.arm_a_length,
            arm_b: geometry.arm_b_length,
            arm_b2: geometry.arm_b_length * geometry.arm_b_length,
            z_offset: geometry.z_center_to_origin,
            envelopes,
        }
    }

    pub fn envelope(&self, id: MotorId) -> &JointEnvelope {
        &self.envelopes[id as usize]
    }

    /// Position of the end effector for the given base, arm A and arm B angles
    pub fn forward(&self, base: f64, arm_a: f64, arm_b: f64) -> Point {
        let theta1 = 180.0 - arm_b - arm_a;
        let h2 = self.arm_b * theta1.to_radians().sin();
        let h1 = self.arm_a * arm_a.to_radians().sin();
        let z = h1 - h2 + self.z_offset;

        // Horizontal reach from the base axis
        let l = self.arm_a * arm_a.to_radians().cos() + self.arm_b * theta1.to_radians().cos();
        let x = l * base.to_radians().cos();
        let y = l * base.to_radians().sin();

        Point::new(x, y, z)
    }

    /// Joint angles that place the end effector at `(x, y, z)`.
    ///
    /// Fails if the point cannot be reached by the linkage, or if any
    /// resulting angle lies outside its joint envelope.
    pub fn inverse(&self, x: f64, y: f64, z: f64) -> Result<JointAngles, KinematicError> {
        let target = Point::new(x, y, z);
        let unreachable = |reason| KinematicError::Unreachable { target, reason };

        if !(x.is_finite() && y.is_finite() && z.is_finite()) {
            return Err(unreachable("coordinates must be finite"));
        }

        let base = base_angle(x, y);

        let r1 = (x * x + y * y).sqrt();
        let r2 = z - self.z_offset;
        let r3 = (r1 * r1 + r2 * r2).sqrt();
        let r3_2 = r3 * r3;

        if r1 == 0.0 {
            return Err(unreachable("target lies on the base axis"));
        }

        let cos_a = (self.arm_b2 - self.arm_a2 - r3_2) / (-2.0 * self.arm_a * r3);
        if !(-1.0..=1.0).contains(&cos_a) {
            return Err(unreachable("target is out of reach of arm A"));
        }
        let arm_a = (cos_a.acos() + (r2 / r1).atan()).to_degrees();

        let cos_b = (r3_2 - self.arm_a2 - self.arm_b2) / (-2.0 * self.arm_a * self.arm_b);
        if !(-1.0..=1.0).contains(&cos_b) {
            return Err(unreachable("target is out of reach of arm B"));
        }
        let arm_b = cos_b.acos().to_degrees();

        let picker = PICKER_LEVEL_SUM - arm_b - arm_a;
        let angles = JointAngles::new(base, arm_a, arm_b, picker);

        for id in MotorId::ALL {
            if !self.envelope(id).contains(angles.get(id)) {
                return Err(KinematicError::OutOfRange {
                    target,
                    joint: id,
                    angles,
                });
            }
        }

        Ok(angles)
    }
}

/// Base rotation for a point, in (-90, 270)
fn base_angle(x: f64, y: f64) -> f64 {
    if x == 0.0 {
        90.0
    } else if y == 0.0 {
        if x < 0.0 { 180.0 } else { 0.0 }
    } else {
        let angle = (y / x).atan().to_degrees();
        if x < 0.0 { angle + 180.0 } else { angle }
    }
}
