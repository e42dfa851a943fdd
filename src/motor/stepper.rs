// Per-joint stepper model: angle <-> step conversion and move timing

use std::f64::consts::PI;
use tracing::debug;

use super::controller::{MotorController, Result, StatusCode};
use crate::command::MotorId;
use crate::config::{JointEnvelope, MotorConfig};

/// Runtime state of one joint motor
#[derive(Debug, Clone)]
pub struct Motor {
    id: MotorId,
    controller: String,
    channel: u8,
    envelope: JointEnvelope,
    angle: f64,
    step_range: i32,
}

impl Motor {
    pub fn new(id: MotorId, config: &MotorConfig) -> Self {
        let mut motor = Self {
            id,
            controller: config.controller.clone(),
            channel: config.channel,
            envelope: config.envelope,
            angle: config.envelope.init_angle,
            step_range: 0,
        };
        motor.step_range = motor.angle_to_steps(motor.envelope.max_angle - motor.envelope.min_angle);
        motor
    }

    pub fn id(&self) -> MotorId {
        self.id
    }

    /// Name of the controller this motor is wired to
    pub fn controller(&self) -> &str {
        &self.controller
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn envelope(&self) -> &JointEnvelope {
        &self.envelope
    }

    /// Angle the motor was last commanded to, quantized to whole steps
    pub fn angle(&self) -> f64 {
        self.angle
    }

    /// Steps spanning the whole envelope
    pub fn step_range(&self) -> i32 {
        self.step_range
    }

    /// Steps needed to turn the joint by `angle` degrees. Truncates toward zero.
    pub fn angle_to_steps(&self, angle: f64) -> i32 {
        (angle / self.envelope.microstep * self.envelope.gear_ratio) as i32
    }

    pub fn steps_to_angle(&self, steps: i32) -> f64 {
        steps as f64 / self.envelope.gear_ratio * self.envelope.microstep
    }

    /// Time (ms) a move of `angle` degrees should take.
    ///
    /// Follows a quarter sine over the joint's step range, so short moves
    /// finish near `min_time` and full-range moves approach `max_time`.
    pub fn move_duration(&self, angle: f64) -> f64 {
        let steps = self.angle_to_steps(angle);
        let time_range = self.envelope.max_time - self.envelope.min_time;
        let time = time_range * ((steps.unsigned_abs() as f64 * PI) / (self.step_range as f64 * 2.0)).sin();
        time.clamp(self.envelope.min_time, self.envelope.max_time)
    }

    /// Time (ms) for a move from the current angle to `target`
    pub fn duration_to(&self, target: f64) -> f64 {
        self.move_duration(target - self.angle)
    }

    /// Queue a move to `target` degrees taking `millis` ms on the motor's controller.
    ///
    /// The stored angle advances by the whole steps actually issued, not to
    /// the exact target. Returns the worst status of the two queue requests.
    pub fn moveto(
        &mut self,
        controller: &mut MotorController,
        target: f64,
        millis: u32,
    ) -> Result<StatusCode> {
        let steps = self.angle_to_steps(target - self.angle);
        self.angle += self.steps_to_angle(steps);

        debug!(
            "Queue {} on {} channel {}: {} steps in {} ms",
            self.id, self.controller, self.channel, steps, millis
        );
        let steps_status = controller.set_steps(self.channel, steps)?;
        let time_status = controller.set_time(self.channel, millis)?;
        Ok(steps_status.max(time_status))
    }

    pub fn enable(&self, controller: &mut MotorController) -> Result<StatusCode> {
        controller.enable(self.channel)
    }

    pub fn disable(&self, controller: &mut MotorController) -> Result<StatusCode> {
        controller.disable(self.channel)
    }
}
