// Command executor and interactive loop
//
// Each operator line is parsed into a `Command` and executed to completion
// before the next one is read. The executor remembers the last command that
// succeeded so it can be saved as a numbered checkpoint and replayed later.

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::thread::sleep;
use tracing::{info, warn};

// local imports
use crate::command::{Action, CheckpointOp, Command, CommandError, CommandKind, Coord};
use crate::config::{ArmConfig, CONNECT_RETRY_DELAY, ConfigError};
use crate::motor::{ArmError, JointAngles, Point, RobotArm, StatusCode};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Arm(#[from] ArmError),
}

/// What a successfully executed command produced
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Done,
    Status(StatusCode),
    Coord(Coord, f64),
    Current { pose: Point, angles: JointAngles },
    Checkpoints(Vec<(i64, Command)>),
    Quit,
}

pub struct Runtime {
    arm: RobotArm,
    checkpoints: BTreeMap<i64, Command>,
    last_command: Command,
}

impl Runtime {
    pub fn new(arm: RobotArm) -> Self {
        let pose = arm.pose();
        Self {
            arm,
            checkpoints: BTreeMap::new(),
            // Start with the home position so it can be checkpointed straight away
            last_command: Command::move_to(pose.x, pose.y, pose.z),
        }
    }

    pub fn arm(&self) -> &RobotArm {
        &self.arm
    }

    pub fn last_command(&self) -> &Command {
        &self.last_command
    }

    pub fn checkpoints(&self) -> &BTreeMap<i64, Command> {
        &self.checkpoints
    }

    /// Parse and execute one input line
    pub fn execute_line(&mut self, line: &str) -> Result<Reply, RuntimeError> {
        let command = Command::parse(line)?;
        self.execute(&command)
    }

    /// Execute a command. On success every non-checkpoint command becomes the last command.
    pub fn execute(&mut self, command: &Command) -> Result<Reply, RuntimeError> {
        let action = command.action()?;
        if let Action::Checkpoint(op) = action {
            return self.checkpoint(op);
        }

        let reply = self.perform(action)?;
        self.last_command = command.clone();
        Ok(reply)
    }

    fn perform(&mut self, action: Action) -> Result<Reply, RuntimeError> {
        let reply = match action {
            Action::Status => Reply::Status(self.arm.status()?),
            Action::Restart => Reply::Status(self.arm.restart()?),
            Action::GetCoord(coord) => Reply::Coord(coord, self.arm.coord(coord)),
            Action::SetCoord(coord, value) => {
                self.arm.set_coord(coord, value);
                Reply::Done
            }
            Action::Move { x, y, z, duration } => {
                // Blocks until the move completes
                self.arm.moveto(x, y, z, duration)?;
                Reply::Done
            }
            Action::Current => Reply::Current {
                pose: self.arm.pose(),
                angles: self.arm.angles(),
            },
            Action::Enable(id) => {
                self.arm.enable(id)?;
                Reply::Done
            }
            Action::Disable(id) => {
                self.arm.disable(id)?;
                Reply::Done
            }
            Action::SetPin {
                controller,
                pin,
                state,
            } => {
                self.arm.set_pin(&controller, pin, state)?;
                Reply::Done
            }
            Action::Wait(duration) => {
                sleep(duration);
                Reply::Done
            }
            Action::Quit => {
                self.arm.terminate()?;
                Reply::Quit
            }
            Action::Checkpoint(op) => return self.checkpoint(op),
        };
        Ok(reply)
    }

    fn checkpoint(&mut self, op: CheckpointOp) -> Result<Reply, RuntimeError> {
        match op {
            CheckpointOp::List => {
                let listing = self
                    .checkpoints
                    .iter()
                    .map(|(&index, command)| (index, command.clone()))
                    .collect();
                return Ok(Reply::Checkpoints(listing));
            }
            CheckpointOp::Set(index) => {
                info!("Setting checkpoint {} to {}", index, self.last_command);
                self.checkpoints.insert(index, self.last_command.clone());
            }
            CheckpointOp::Remove(index) => {
                self.checkpoints
                    .remove(&index)
                    .ok_or(CommandError::NoSuchCheckpoint(index))?;
            }
            CheckpointOp::Renumber { from, to } => {
                let command = self
                    .checkpoints
                    .remove(&from)
                    .ok_or(CommandError::NoSuchCheckpoint(from))?;
                self.checkpoints.insert(to, command);
            }
            CheckpointOp::Play => self.replay()?,
        }
        Ok(Reply::Done)
    }

    /// Re-execute every checkpoint in ascending index order, stopping at the first failure
    fn replay(&mut self) -> Result<(), RuntimeError> {
        let mut queue: VecDeque<(i64, Command)> = self
            .checkpoints
            .iter()
            .map(|(&index, command)| (index, command.clone()))
            .collect();
        info!("Executing {} checkpoints", queue.len());

        while let Some((index, command)) = queue.pop_front() {
            info!("Checkpoint {}: {}", index, command);
            let action = command.action()?;
            match action {
                Action::Checkpoint(CheckpointOp::Play) => {
                    return Err(CommandError::NestedReplay.into());
                }
                Action::Checkpoint(op) => {
                    self.checkpoint(op)?;
                }
                Action::Quit => {
                    warn!("Skipping quit stored in checkpoint {}", index);
                }
                action => {
                    self.perform(action)?;
                    self.last_command = command;
                }
            }
        }
        Ok(())
    }
}

fn print_reply(reply: &Reply) {
    match reply {
        Reply::Done | Reply::Quit => {}
        Reply::Status(status) => println!("Robot arm status: {}", status),
        Reply::Coord(coord, value) => println!("{}: {}", coord, value),
        Reply::Current { pose, angles } => {
            println!("Current coordinates: {}", pose);
            println!("Current angles: {}", angles);
        }
        Reply::Checkpoints(list) => {
            println!("Checkpoints:");
            for (index, command) in list {
                println!("{} {}", index, command);
            }
        }
    }
}

/// Connect the arm, retrying while a controller fails its startup check
fn connect(
    config: &ArmConfig,
    retries: u32,
) -> Result<RobotArm, Box<dyn std::error::Error + Send + Sync>> {
    let mut attempt = 0;
    loop {
        match RobotArm::connect(config) {
            Ok(arm) => return Ok(arm),
            Err(ConfigError::Unreachable { controller, source }) if attempt < retries => {
                warn!("Controller {} not ready: {}", controller, source);
            }
            Err(e) => return Err(e.into()),
        }
        attempt += 1;
        info!("Retrying ({}/{})...", attempt, retries);
        sleep(CONNECT_RETRY_DELAY);
    }
}

/// Load the configuration, connect, and run the read-execute loop on stdin until quit or EOF
pub fn run(
    config_path: &Path,
    retries: u32,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Loading configuration from {}", config_path.display());
    let config = ArmConfig::load(config_path)?;

    let arm = connect(&config, retries)?;
    let mut runtime = Runtime::new(arm);
    info!("Ready");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let Some(line) = lines.next() else {
            // EOF: leave the controllers restarted, as on quit
            runtime.execute(&Command::new(CommandKind::Quit, Vec::new()))?;
            return Ok(());
        };
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match runtime.execute_line(&line) {
            Ok(Reply::Quit) => return Ok(()),
            Ok(reply) => print_reply(&reply),
            Err(e) => println!("Error: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::MotorId;
    use crate::motor::driver::tests::{Rig, rig};
    use crate::motor::mock::MockTransport;
    use crate::motor::{ControllerError, KinematicError};

    fn runtime() -> (Runtime, MockTransport, MockTransport) {
        let Rig {
            arm, main, picker, ..
        } = rig();
        (Runtime::new(arm), main, picker)
    }

    fn times(mock: &MockTransport) -> Vec<String> {
        mock.frames()
            .into_iter()
            .filter(|f| f.starts_with('T'))
            .collect()
    }

    #[test]
    fn test_initial_last_command_is_home() {
        let (rt, _, _) = runtime();
        let pose = rt.arm().pose();
        assert_eq!(rt.last_command(), &Command::move_to(pose.x, pose.y, pose.z));
    }

    #[test]
    fn test_status_and_coordinates() {
        let (mut rt, _, picker) = runtime();
        assert_eq!(rt.execute_line("status").unwrap(), Reply::Status(0));
        picker.reply('?', "1");
        assert_eq!(rt.execute_line("STATUS").unwrap(), Reply::Status(1));

        rt.execute_line("z 75").unwrap();
        assert_eq!(rt.execute_line("z").unwrap(), Reply::Coord(Coord::Z, 75.0));
    }

    #[test]
    fn test_current_reports_pose_and_angles() {
        let (mut rt, _, _) = runtime();
        rt.execute_line("m 300 200 150").unwrap();
        match rt.execute_line("current").unwrap() {
            Reply::Current { pose, angles } => {
                assert_eq!(pose, Point::new(300.0, 200.0, 150.0));
                assert_eq!(angles, rt.arm().angles());
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_move_with_explicit_time() {
        let (mut rt, _, picker) = runtime();
        rt.execute_line("move 300 200 150 1800").unwrap();
        assert_eq!(times(&picker), ["T 0 1800"]);
    }

    #[test]
    fn test_unknown_command() {
        let (mut rt, _, _) = runtime();
        let err = rt.execute_line("fly 1 2 3").unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Command(CommandError::Unknown(_))
        ));
    }

    #[test]
    fn test_checkpoint_records_last_command() {
        let (mut rt, _, _) = runtime();
        rt.execute_line("m 300 200 150").unwrap();
        rt.execute_line("cp 1").unwrap();
        // Checkpoint commands themselves are never recorded
        rt.execute_line("cp").unwrap();
        rt.execute_line("cp 2").unwrap();

        let expected = Command::parse("m 300 200 150").unwrap();
        assert_eq!(rt.checkpoints().get(&1), Some(&expected));
        assert_eq!(rt.checkpoints().get(&2), Some(&expected));
    }

    #[test]
    fn test_failed_command_not_recorded() {
        let (mut rt, main, _) = runtime();
        rt.execute_line("m 300 200 150").unwrap();
        main.clear_frames();

        let err = rt.execute_line("m -150 -300 150").unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Arm(ArmError::Kinematic(KinematicError::OutOfRange { .. }))
        ));
        assert!(main.frames().is_empty());
        assert_eq!(rt.arm().pose(), Point::new(300.0, 200.0, 150.0));
        assert_eq!(rt.last_command(), &Command::parse("m 300 200 150").unwrap());
    }

    #[test]
    fn test_checkpoint_listing_is_sorted() {
        let (mut rt, _, _) = runtime();
        rt.execute_line("cp 9").unwrap();
        rt.execute_line("enable base").unwrap();
        rt.execute_line("cp 3").unwrap();

        match rt.execute_line("cp").unwrap() {
            Reply::Checkpoints(list) => {
                let indices: Vec<i64> = list.iter().map(|(i, _)| *i).collect();
                assert_eq!(indices, [3, 9]);
                assert_eq!(list[0].1.to_string(), "enable base");
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_checkpoint_move_overwrites_target() {
        let (mut rt, _, _) = runtime();
        rt.execute_line("enable base").unwrap();
        rt.execute_line("cp 1").unwrap();
        rt.execute_line("disable base").unwrap();
        rt.execute_line("cp 2").unwrap();

        rt.execute_line("cp mv 1 2").unwrap();
        assert!(!rt.checkpoints().contains_key(&1));
        assert_eq!(rt.checkpoints()[&2].to_string(), "enable base");
        assert_eq!(rt.checkpoints().len(), 1);
    }

    #[test]
    fn test_checkpoint_remove() {
        let (mut rt, _, _) = runtime();
        rt.execute_line("cp 4").unwrap();
        rt.execute_line("cp rm 4").unwrap();
        assert!(rt.checkpoints().is_empty());

        let err = rt.execute_line("cp rm 4").unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Command(CommandError::NoSuchCheckpoint(4))
        ));
        let err = rt.execute_line("cp mv 4 5").unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Command(CommandError::NoSuchCheckpoint(4))
        ));
    }

    #[test]
    fn test_play_runs_in_ascending_order() {
        let (mut rt, _, picker) = runtime();
        rt.execute_line("m 300 200 150 1111").unwrap();
        rt.execute_line("cp 5").unwrap();
        rt.execute_line("m 350 0 120 2222").unwrap();
        rt.execute_line("cp 2").unwrap();
        picker.clear_frames();

        rt.execute_line("cp play").unwrap();

        // Index 2 first, then 5, each a full move
        assert_eq!(times(&picker), ["T 0 2222", "T 0 1111"]);
        assert_eq!(rt.arm().pose(), Point::new(300.0, 200.0, 150.0));
        assert_eq!(rt.last_command().to_string(), "move 300 200 150 1111");
    }

    #[test]
    fn test_play_stops_at_first_failure() {
        let (mut rt, main, _) = runtime();
        rt.execute_line("enable base").unwrap();
        rt.execute_line("cp 1").unwrap();
        rt.execute_line("disable arm_a").unwrap();
        rt.execute_line("cp 2").unwrap();
        main.clear_frames();
        main.reply('E', "1");

        let err = rt.execute_line("cp play").unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Arm(ArmError::Controller(ControllerError::Rejected { .. }))
        ));
        assert_eq!(main.frames(), ["E 0"]);
    }

    #[test]
    fn test_nested_play_rejected() {
        let (mut rt, _, _) = runtime();
        rt.checkpoints
            .insert(1, Command::parse("cp play").unwrap());
        let err = rt.execute_line("cp play").unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Command(CommandError::NestedReplay)
        ));
    }

    #[test]
    fn test_enable_disable_and_pin() {
        let (mut rt, main, picker) = runtime();
        rt.execute_line("e arm_b").unwrap();
        rt.execute_line("d picker").unwrap();
        rt.execute_line("p main 7 1").unwrap();
        assert_eq!(main.frames(), ["E 2", "P 7 1"]);
        assert_eq!(picker.frames(), ["D 0"]);
        assert_eq!(rt.arm().motor(MotorId::ArmB).channel(), 2);
    }

    #[test]
    fn test_wait() {
        let (mut rt, _, _) = runtime();
        assert_eq!(rt.execute_line("w 0.01").unwrap(), Reply::Done);
        assert_eq!(rt.last_command().to_string(), "wait 0.01");
    }

    #[test]
    fn test_quit_terminates_controllers() {
        let (mut rt, main, picker) = runtime();
        assert_eq!(rt.execute_line("q").unwrap(), Reply::Quit);
        assert_eq!(main.frames(), ["R", "?"]);
        assert_eq!(picker.frames(), ["R", "?"]);
    }
}
