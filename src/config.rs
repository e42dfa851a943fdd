// Constants and the robot arm configuration file
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::command::MotorId;
use crate::motor::controller::ControllerError;

// Configuration file read when no path is given on the command line
pub const DEFAULT_CONFIG_PATH: &str = "robotarmconfig.json";

// Time a controller needs after a restart before it answers status queries
pub const RESTART_SETTLE: Duration = Duration::from_millis(200);

// Pause between startup connection attempts
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("Motor {motor} refers to unknown controller `{controller}`")]
    UnknownController { motor: MotorId, controller: String },

    #[error("Controller {controller} failed its startup check: {source}")]
    Unreachable {
        controller: String,
        #[source]
        source: ControllerError,
    },
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}

/// Serial settings for one motor controller
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ControllerConfig {
    pub port: String,
    pub baud: u32,
    /// Read timeout in seconds
    pub timeout: f64,
}

/// Per-joint motion limits and conversion factors
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct JointEnvelope {
    pub min_angle: f64,
    pub max_angle: f64,
    /// Degrees per controller pulse before gearing
    pub microstep: f64,
    #[serde(alias = "ratio")]
    pub gear_ratio: f64,
    /// Milliseconds
    pub min_time: f64,
    /// Milliseconds
    pub max_time: f64,
    pub init_angle: f64,
}

impl JointEnvelope {
    pub fn contains(&self, angle: f64) -> bool {
        angle >= self.min_angle && angle <= self.max_angle
    }

    fn validate(&self, motor: MotorId) -> Result<(), ConfigError> {
        let field = |name: &str| format!("motors.{}.{}", motor.config_key(), name);

        let finite = [
            self.min_angle,
            self.max_angle,
            self.microstep,
            self.gear_ratio,
            self.min_time,
            self.max_time,
            self.init_angle,
        ];
        if finite.iter().any(|v| !v.is_finite()) {
            return Err(invalid(field("*"), "all values must be finite"));
        }
        if self.min_angle >= self.max_angle {
            return Err(invalid(field("min_angle"), "must be below max_angle"));
        }
        if self.min_time < 0.0 || self.min_time >= self.max_time {
            return Err(invalid(field("min_time"), "must be non-negative and below max_time"));
        }
        if self.microstep <= 0.0 {
            return Err(invalid(field("microstep"), "must be positive"));
        }
        if self.gear_ratio <= 0.0 {
            return Err(invalid(field("gear_ratio"), "must be positive"));
        }
        if !self.contains(self.init_angle) {
            return Err(invalid(field("init_angle"), "must lie within [min_angle, max_angle]"));
        }
        // The time model divides by the step count of the full range
        let full_range = ((self.max_angle - self.min_angle) / self.microstep * self.gear_ratio).trunc();
        if full_range < 1.0 || full_range > i32::MAX as f64 {
            return Err(invalid(field("microstep"), "angle range must span at least one step"));
        }
        Ok(())
    }
}

/// Where a motor lives and how it moves
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MotorConfig {
    #[serde(rename = "motor_controller")]
    pub controller: String,
    #[serde(alias = "controller_channel")]
    pub channel: u8,
    #[serde(flatten)]
    pub envelope: JointEnvelope,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MotorsConfig {
    pub base_motor: MotorConfig,
    pub arm_a_motor: MotorConfig,
    pub arm_b_motor: MotorConfig,
    pub picker_motor: MotorConfig,
}

impl MotorsConfig {
    pub fn get(&self, id: MotorId) -> &MotorConfig {
        match id {
            MotorId::Base => &self.base_motor,
            MotorId::ArmA => &self.arm_a_motor,
            MotorId::ArmB => &self.arm_b_motor,
            MotorId::Picker => &self.picker_motor,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct LinkConfig {
    pub length: f64,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct ArmsConfig {
    pub arm_a: LinkConfig,
    pub arm_b: LinkConfig,
}

/// Link lengths and vertical offset of the shoulder joint
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArmGeometry {
    pub arm_a_length: f64,
    pub arm_b_length: f64,
    pub z_center_to_origin: f64,
}

/// Complete, validated robot arm configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ArmConfig {
    pub motor_controllers: BTreeMap<String, ControllerConfig>,
    pub motors: MotorsConfig,
    pub arms: ArmsConfig,
    pub z_center_to_origin: f64,
}

impl ArmConfig {
    /// Read and validate a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parse and validate a JSON configuration document
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: ArmConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn geometry(&self) -> ArmGeometry {
        ArmGeometry {
            arm_a_length: self.arms.arm_a.length,
            arm_b_length: self.arms.arm_b.length,
            z_center_to_origin: self.z_center_to_origin,
        }
    }

    pub fn motor(&self, id: MotorId) -> &MotorConfig {
        self.motors.get(id)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.motor_controllers.is_empty() {
            return Err(invalid("motor_controllers", "at least one controller is required"));
        }
        for (name, controller) in &self.motor_controllers {
            if controller.baud == 0 {
                return Err(invalid(format!("motor_controllers.{}.baud", name), "must be positive"));
            }
            if !(controller.timeout.is_finite() && controller.timeout > 0.0) {
                return Err(invalid(
                    format!("motor_controllers.{}.timeout", name),
                    "must be a positive number of seconds",
                ));
            }
        }

        for (label, length) in [("arms.arm_a.length", self.arms.arm_a.length), ("arms.arm_b.length", self.arms.arm_b.length)] {
            if !(length.is_finite() && length > 0.0) {
                return Err(invalid(label, "must be positive"));
            }
        }
        if !self.z_center_to_origin.is_finite() {
            return Err(invalid("z_center_to_origin", "must be finite"));
        }

        let mut used = Vec::with_capacity(MotorId::ALL.len());
        for id in MotorId::ALL {
            let motor = self.motor(id);
            if !self.motor_controllers.contains_key(&motor.controller) {
                return Err(ConfigError::UnknownController {
                    motor: id,
                    controller: motor.controller.clone(),
                });
            }
            let slot = (motor.controller.as_str(), motor.channel);
            if used.contains(&slot) {
                return Err(invalid(
                    format!("motors.{}.controller_channel", id.config_key()),
                    format!("channel {} on {} is already in use", motor.channel, motor.controller),
                ));
            }
            used.push(slot);
            motor.envelope.validate(id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Two controllers, picker on its own board. Matches the reference arm.
    pub(crate) const SAMPLE: &str = r#"{
        "motor_controllers": {
            "main":   { "port": "/dev/ttyUSB0", "baud": 115200, "timeout": 5 },
            "picker": { "port": "/dev/ttyUSB1", "baud": 115200, "timeout": 5 }
        },
        "motors": {
            "base_motor": {
                "motor_controller": "main", "controller_channel": 0,
                "microstep": 0.225, "ratio": 7.143,
                "min_angle": -45, "max_angle": 225,
                "min_time": 100, "max_time": 3000, "init_angle": 90
            },
            "arm_a_motor": {
                "motor_controller": "main", "controller_channel": 1,
                "microstep": 0.225, "ratio": 50,
                "min_angle": 0, "max_angle": 135,
                "min_time": 300, "max_time": 3000, "init_angle": 45
            },
            "arm_b_motor": {
                "motor_controller": "main", "controller_channel": 2,
                "microstep": 0.225, "ratio": 50,
                "min_angle": 15, "max_angle": 160,
                "min_time": 300, "max_time": 3000, "init_angle": 90
            },
            "picker_motor": {
                "motor_controller": "picker", "controller_channel": 0,
                "microstep": 0.225, "gear_ratio": 1,
                "min_angle": -90, "max_angle": 270,
                "min_time": 10, "max_time": 3000, "init_angle": 135
            }
        },
        "arms": { "arm_a": { "length": 320 }, "arm_b": { "length": 270 } },
        "z_center_to_origin": 50
    }"#;

    pub(crate) fn sample() -> ArmConfig {
        ArmConfig::from_json(SAMPLE).unwrap()
    }

    fn mutated(edit: impl FnOnce(&mut serde_json::Value)) -> Result<ArmConfig, ConfigError> {
        let mut value: serde_json::Value = serde_json::from_str(SAMPLE).unwrap();
        edit(&mut value);
        ArmConfig::from_json(&value.to_string())
    }

    #[test]
    fn test_parse_sample() {
        let config = sample();
        assert_eq!(config.motor_controllers.len(), 2);
        assert_eq!(config.motor_controllers["main"].baud, 115200);
        assert_eq!(config.motor(MotorId::Base).envelope.gear_ratio, 7.143);
        assert_eq!(config.motor(MotorId::Picker).controller, "picker");
        assert_eq!(config.motor(MotorId::ArmB).channel, 2);

        let geometry = config.geometry();
        assert_eq!(geometry.arm_a_length, 320.0);
        assert_eq!(geometry.arm_b_length, 270.0);
        assert_eq!(geometry.z_center_to_origin, 50.0);
    }

    #[test]
    fn test_missing_motor_rejected() {
        let err = mutated(|v| {
            v["motors"].as_object_mut().unwrap().remove("picker_motor");
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn test_inverted_angle_range_rejected() {
        let err = mutated(|v| v["motors"]["arm_a_motor"]["min_angle"] = 200.into()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_inverted_time_range_rejected() {
        let err = mutated(|v| v["motors"]["base_motor"]["max_time"] = 50.into()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_non_positive_ratio_rejected() {
        let err = mutated(|v| v["motors"]["arm_b_motor"]["ratio"] = 0.into()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        let err = mutated(|v| v["motors"]["arm_b_motor"]["microstep"] = (-0.2).into()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_init_angle_outside_envelope_rejected() {
        let err = mutated(|v| v["motors"]["base_motor"]["init_angle"] = 300.into()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_unknown_controller_rejected() {
        let err = mutated(|v| v["motors"]["arm_a_motor"]["motor_controller"] = "aux".into()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownController { motor: MotorId::ArmA, .. }
        ));
    }

    #[test]
    fn test_shared_channel_rejected() {
        let err = mutated(|v| v["motors"]["arm_b_motor"]["controller_channel"] = 1.into()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = mutated(|v| v["motor_controllers"]["main"]["timeout"] = 0.into()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
