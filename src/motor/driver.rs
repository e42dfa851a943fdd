// High-level driver for the robot arm
//
// Combines kinematics, the per-joint stepper model and the controller
// protocol. A move solves the target first, then queues steps and time on
// every motor, and only after every controller holds its queue does it
// trigger them all, so joints on different boards start together.

use std::collections::BTreeMap;
use std::thread::sleep;
use tracing::{debug, info, warn};

use super::controller::{Ack, ControllerError, MotorController, STATUS_OK, StatusCode};
use super::kinematics::{JointAngles, KinematicError, Kinematics, Point};
use super::stepper::Motor;
use crate::command::{Coord, MotorId};
use crate::config::{ArmConfig, ConfigError, RESTART_SETTLE};

#[derive(Debug, thiserror::Error)]
pub enum ArmError {
    #[error(transparent)]
    Kinematic(#[from] KinematicError),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error("Unknown motor controller `{0}`")]
    UnknownController(String),
}

pub type Result<T> = std::result::Result<T, ArmError>;

/// The whole arm: motors, their controllers and the current pose
pub struct RobotArm {
    kinematics: Kinematics,
    motors: [Motor; 4],
    controllers: BTreeMap<String, MotorController>,
    pose: Point,
}

impl RobotArm {
    /// Open every configured controller and build the arm
    pub fn connect(config: &ArmConfig) -> std::result::Result<Self, ConfigError> {
        let mut controllers = BTreeMap::new();
        for (name, controller_config) in &config.motor_controllers {
            let controller = MotorController::open(name, controller_config).map_err(|source| {
                ConfigError::Unreachable {
                    controller: name.clone(),
                    source,
                }
            })?;
            controllers.insert(name.clone(), controller);
        }
        Self::with_controllers(config, controllers)
    }

    /// Build the arm around already connected controllers
    pub fn with_controllers(
        config: &ArmConfig,
        controllers: BTreeMap<String, MotorController>,
    ) -> std::result::Result<Self, ConfigError> {
        for id in MotorId::ALL {
            let name = &config.motor(id).controller;
            if !controllers.contains_key(name) {
                return Err(ConfigError::UnknownController {
                    motor: id,
                    controller: name.clone(),
                });
            }
        }

        let motors = MotorId::ALL.map(|id| Motor::new(id, config.motor(id)));
        let kinematics = Kinematics::new(
            config.geometry(),
            MotorId::ALL.map(|id| config.motor(id).envelope),
        );
        let pose = kinematics.forward(motors[0].angle(), motors[1].angle(), motors[2].angle());

        info!("Robot arm ready at {}", pose);
        Ok(Self {
            kinematics,
            motors,
            controllers,
            pose,
        })
    }

    pub fn kinematics(&self) -> &Kinematics {
        &self.kinematics
    }

    /// Where the arm was last sent
    pub fn pose(&self) -> Point {
        self.pose
    }

    pub fn coord(&self, coord: Coord) -> f64 {
        match coord {
            Coord::X => self.pose.x,
            Coord::Y => self.pose.y,
            Coord::Z => self.pose.z,
        }
    }

    /// Overwrite one pose coordinate without moving
    pub fn set_coord(&mut self, coord: Coord, value: f64) {
        match coord {
            Coord::X => self.pose.x = value,
            Coord::Y => self.pose.y = value,
            Coord::Z => self.pose.z = value,
        }
        info!("Set {} to {}", coord, value);
    }

    pub fn motor(&self, id: MotorId) -> &Motor {
        &self.motors[id as usize]
    }

    /// Current (step-quantized) angle of every motor
    pub fn angles(&self) -> JointAngles {
        JointAngles::new(
            self.motors[0].angle(),
            self.motors[1].angle(),
            self.motors[2].angle(),
            self.motors[3].angle(),
        )
    }

    fn controller_mut(&mut self, name: &str) -> Result<&mut MotorController> {
        self.controllers
            .get_mut(name)
            .ok_or_else(|| ArmError::UnknownController(name.to_string()))
    }

    /// Move the end effector to `(x, y, z)`, blocking until every controller acknowledges.
    ///
    /// Without an explicit `duration` (ms), the slowest joint's time is used
    /// for all of them so they finish together. Returns the worst status
    /// reported while queueing and completing the move.
    pub fn moveto(&mut self, x: f64, y: f64, z: f64, duration: Option<u32>) -> Result<StatusCode> {
        let angles = self.kinematics.inverse(x, y, z)?;
        info!("Moving arm to ({}, {}, {}): {}", x, y, z, angles);

        let millis = match duration {
            Some(millis) => millis,
            None => {
                let slowest = self
                    .motors
                    .iter()
                    .map(|motor| motor.duration_to(angles.get(motor.id())))
                    .fold(0.0, f64::max);
                slowest.round() as u32
            }
        };

        self.pose = Point::new(x, y, z);

        match self.dispatch(angles, millis) {
            Ok(status) => {
                if status != STATUS_OK {
                    warn!("Move to ({}, {}, {}) finished with status {}", x, y, z, status);
                }
                Ok(status)
            }
            Err(e) => {
                warn!("Move interrupted, pose and motor angles may not match the hardware");
                Err(e)
            }
        }
    }

    /// Queue on every motor, then trigger every controller, then collect every acknowledgment
    fn dispatch(&mut self, angles: JointAngles, millis: u32) -> Result<StatusCode> {
        let mut worst = STATUS_OK;

        for motor in self.motors.iter_mut() {
            let controller = self
                .controllers
                .get_mut(motor.controller())
                .ok_or_else(|| ArmError::UnknownController(motor.controller().to_string()))?;
            let status = motor.moveto(controller, angles.get(motor.id()), millis)?;
            worst = worst.max(status);
        }
        debug!("Queued movements with status {}", worst);

        let mut failure = None;
        for controller in self.controllers.values_mut() {
            if let Err(e) = controller.trigger_all(Ack::Deferred) {
                failure = Some(e);
                break;
            }
        }
        // Collect every outstanding ack, even after a failure, so no controller is left pending
        for controller in self.controllers.values_mut().filter(|c| c.ack_pending()) {
            match controller.wait_for_ack() {
                Ok(status) => worst = worst.max(status),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e.into()),
            None => {
                debug!("Move complete");
                Ok(worst)
            }
        }
    }

    /// Worst status across all controllers. Non-zero means at least one reports an error.
    pub fn status(&mut self) -> Result<StatusCode> {
        let mut worst = STATUS_OK;
        for (name, controller) in self.controllers.iter_mut() {
            let status = controller.status()?;
            debug!("{}: {}", name, status);
            worst = worst.max(status);
        }
        Ok(worst)
    }

    /// Restart every controller, settle, and report the combined status
    pub fn restart(&mut self) -> Result<StatusCode> {
        info!("Restarting all motor controllers");
        for controller in self.controllers.values_mut() {
            controller.restart()?;
        }
        sleep(RESTART_SETTLE);
        self.status()
    }

    pub fn enable(&mut self, id: MotorId) -> Result<StatusCode> {
        info!("Enabling {}", id);
        let motor = &self.motors[id as usize];
        let channel = motor.channel();
        let controller = self
            .controllers
            .get_mut(motor.controller())
            .ok_or_else(|| ArmError::UnknownController(motor.controller().to_string()))?;
        let status = motor.enable(controller)?;
        Self::check(controller, format!("E {}", channel), status)
    }

    pub fn disable(&mut self, id: MotorId) -> Result<StatusCode> {
        info!("Disabling {}", id);
        let motor = &self.motors[id as usize];
        let channel = motor.channel();
        let controller = self
            .controllers
            .get_mut(motor.controller())
            .ok_or_else(|| ArmError::UnknownController(motor.controller().to_string()))?;
        let status = motor.disable(controller)?;
        Self::check(controller, format!("D {}", channel), status)
    }

    /// Drive a GPIO pin on the named controller
    pub fn set_pin(&mut self, controller: &str, pin: u8, state: u8) -> Result<StatusCode> {
        info!("Setting pin {} on {} to {}", pin, controller, state);
        let controller = self.controller_mut(controller)?;
        let status = controller.set_pin(pin, state)?;
        Self::check(controller, format!("P {} {}", pin, state), status)
    }

    fn check(controller: &MotorController, command: String, status: StatusCode) -> Result<StatusCode> {
        if status != STATUS_OK {
            return Err(ControllerError::Rejected {
                controller: controller.name().to_string(),
                command,
                status,
            }
            .into());
        }
        Ok(status)
    }

    /// Restart every controller and release its port.
    /// Keeps going after a failure and reports the first one.
    pub fn terminate(&mut self) -> Result<()> {
        info!("Terminating all motor controllers");
        let mut first_error = None;
        for (name, controller) in std::mem::take(&mut self.controllers) {
            if let Err(e) = controller.terminate() {
                warn!("Failed to terminate {}: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

impl Drop for RobotArm {
    fn drop(&mut self) {
        // Leave the controllers restarted if nobody terminated them
        if !self.controllers.is_empty() {
            if let Err(e) = self.terminate() {
                warn!("Failed to terminate controllers on drop: {}", e);
            }
        }
    }
}
