// Operator commands
//
// A line such as "MOVE 100 0 250" is case-folded and split on whitespace
// into a `Command` (kind + raw args). `Command::action` then decodes the
// args into a typed `Action` for the executor.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("Empty command")]
    Empty,

    #[error("Unknown command: {0}")]
    Unknown(String),

    #[error("{command}: missing argument <{name}>")]
    MissingArgument { command: CommandKind, name: &'static str },

    #[error("{command}: invalid {name} `{value}`")]
    InvalidArgument {
        command: CommandKind,
        name: &'static str,
        value: String,
    },

    #[error("No checkpoint {0}")]
    NoSuchCheckpoint(i64),

    #[error("Checkpoint replay cannot start another replay")]
    NestedReplay,
}

/// Cartesian axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coord {
    X,
    Y,
    Z,
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Coord::X => "x",
            Coord::Y => "y",
            Coord::Z => "z",
        })
    }
}

/// The four joints of the arm
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MotorId {
    Base,
    ArmA,
    ArmB,
    Picker,
}

impl MotorId {
    pub const ALL: [MotorId; 4] = [MotorId::Base, MotorId::ArmA, MotorId::ArmB, MotorId::Picker];

    /// Key of this motor in the configuration file
    pub fn config_key(&self) -> &'static str {
        match self {
            MotorId::Base => "base_motor",
            MotorId::ArmA => "arm_a_motor",
            MotorId::ArmB => "arm_b_motor",
            MotorId::Picker => "picker_motor",
        }
    }
}

impl fmt::Display for MotorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.config_key())
    }
}

impl FromStr for MotorId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "base" | "base_motor" => Ok(MotorId::Base),
            "arm_a" | "arm_a_motor" | "a" => Ok(MotorId::ArmA),
            "arm_b" | "arm_b_motor" | "b" => Ok(MotorId::ArmB),
            "picker" | "picker_motor" => Ok(MotorId::Picker),
            _ => Err(()),
        }
    }
}

/// Recognised command words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Status,
    Restart,
    Coord(Coord),
    Move,
    Current,
    Enable,
    Disable,
    Pin,
    Checkpoint,
    Wait,
    Quit,
}

impl CommandKind {
    /// Canonical spelling, used when a command is printed back
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Status => "status",
            CommandKind::Restart => "restart",
            CommandKind::Coord(Coord::X) => "x",
            CommandKind::Coord(Coord::Y) => "y",
            CommandKind::Coord(Coord::Z) => "z",
            CommandKind::Move => "move",
            CommandKind::Current => "current",
            CommandKind::Enable => "enable",
            CommandKind::Disable => "disable",
            CommandKind::Pin => "pin",
            CommandKind::Checkpoint => "checkpoint",
            CommandKind::Wait => "wait",
            CommandKind::Quit => "quit",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CommandKind {
    type Err = CommandError;

    fn from_str(word: &str) -> Result<Self, Self::Err> {
        let kind = match word.to_lowercase().as_str() {
            "status" => CommandKind::Status,
            "restart" => CommandKind::Restart,
            "x" => CommandKind::Coord(Coord::X),
            "y" => CommandKind::Coord(Coord::Y),
            "z" => CommandKind::Coord(Coord::Z),
            "move" | "m" => CommandKind::Move,
            "current" | "c" => CommandKind::Current,
            "enable" | "e" => CommandKind::Enable,
            "disable" | "d" => CommandKind::Disable,
            "pin" | "p" => CommandKind::Pin,
            "checkpoint" | "cp" => CommandKind::Checkpoint,
            "wait" | "w" => CommandKind::Wait,
            "quit" | "q" => CommandKind::Quit,
            _ => return Err(CommandError::Unknown(word.to_string())),
        };
        Ok(kind)
    }
}

/// Checkpoint sub-commands
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CheckpointOp {
    List,
    Set(i64),
    Remove(i64),
    Renumber { from: i64, to: i64 },
    Play,
}

/// A command with its arguments decoded
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Status,
    Restart,
    GetCoord(Coord),
    SetCoord(Coord, f64),
    Move {
        x: f64,
        y: f64,
        z: f64,
        /// Milliseconds; derived from the joint time model when absent
        duration: Option<u32>,
    },
    Current,
    Enable(MotorId),
    Disable(MotorId),
    SetPin {
        controller: String,
        pin: u8,
        state: u8,
    },
    Checkpoint(CheckpointOp),
    Wait(Duration),
    Quit,
}

/// An operator command: kind plus its raw, case-folded arguments
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    kind: CommandKind,
    args: Vec<String>,
}

impl Command {
    pub fn new(kind: CommandKind, args: Vec<String>) -> Self {
        Self { kind, args }
    }

    /// Tokenise an input line
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let mut words = line.split_whitespace().map(str::to_lowercase);
        let first = words.next().ok_or(CommandError::Empty)?;
        let kind = first.parse()?;
        Ok(Self::new(kind, words.collect()))
    }

    /// A `move` to the given point
    pub fn move_to(x: f64, y: f64, z: f64) -> Self {
        Self::new(
            CommandKind::Move,
            vec![x.to_string(), y.to_string(), z.to_string()],
        )
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn arg(&self, index: usize, name: &'static str) -> Result<&str, CommandError> {
        self.args
            .get(index)
            .map(String::as_str)
            .ok_or(CommandError::MissingArgument {
                command: self.kind,
                name,
            })
    }

    fn parsed<T: FromStr>(&self, index: usize, name: &'static str) -> Result<T, CommandError> {
        let value = self.arg(index, name)?;
        value.parse().map_err(|_| CommandError::InvalidArgument {
            command: self.kind,
            name,
            value: value.to_string(),
        })
    }

    fn number(&self, index: usize, name: &'static str) -> Result<f64, CommandError> {
        let value: f64 = self.parsed(index, name)?;
        if !value.is_finite() {
            return Err(CommandError::InvalidArgument {
                command: self.kind,
                name,
                value: self.args[index].clone(),
            });
        }
        Ok(value)
    }

    fn motor(&self) -> Result<MotorId, CommandError> {
        self.parsed(0, "motor")
    }

    /// Decode the arguments for this command's kind
    pub fn action(&self) -> Result<Action, CommandError> {
        let action = match self.kind {
            CommandKind::Status => Action::Status,
            CommandKind::Restart => Action::Restart,
            CommandKind::Coord(coord) => match self.args.first() {
                None => Action::GetCoord(coord),
                Some(_) => Action::SetCoord(coord, self.number(0, "value")?),
            },
            CommandKind::Move => Action::Move {
                x: self.number(0, "x")?,
                y: self.number(1, "y")?,
                z: self.number(2, "z")?,
                duration: match self.args.get(3) {
                    None => None,
                    Some(_) => Some(self.parsed(3, "time")?),
                },
            },
            CommandKind::Current => Action::Current,
            CommandKind::Enable => Action::Enable(self.motor()?),
            CommandKind::Disable => Action::Disable(self.motor()?),
            CommandKind::Pin => Action::SetPin {
                controller: self.arg(0, "controller")?.to_string(),
                pin: self.parsed(1, "pin")?,
                state: self.parsed(2, "state")?,
            },
            CommandKind::Checkpoint => Action::Checkpoint(self.checkpoint_op()?),
            CommandKind::Wait => {
                let seconds = self.number(0, "seconds")?;
                let duration = Duration::try_from_secs_f64(seconds).map_err(|_| {
                    CommandError::InvalidArgument {
                        command: self.kind,
                        name: "seconds",
                        value: self.args[0].clone(),
                    }
                })?;
                Action::Wait(duration)
            }
            CommandKind::Quit => Action::Quit,
        };
        Ok(action)
    }

    fn checkpoint_op(&self) -> Result<CheckpointOp, CommandError> {
        let op = match self.args.first().map(String::as_str) {
            None => CheckpointOp::List,
            Some("rm") => CheckpointOp::Remove(self.parsed(1, "index")?),
            Some("mv") => CheckpointOp::Renumber {
                from: self.parsed(1, "from")?,
                to: self.parsed(2, "to")?,
            },
            Some("play") => CheckpointOp::Play,
            Some(_) => CheckpointOp::Set(self.parsed(0, "index")?),
        };
        Ok(op)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}
