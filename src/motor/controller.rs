// Stepper motor controller line protocol
//
// Every request is a single ASCII line terminated by "\r\n\r\n" and every
// response is an integer status code terminated the same way:
//   ?            status
//   R            restart
//   S ch steps   queue steps on a channel
//   T ch ms      queue move time on a channel
//   E ch / D ch  enable / disable a channel
//   P pin state  drive a GPIO pin
//   G [ch]       start queued moves (all channels, or one)

use serialport::{self, ClearBuffer, SerialPort};
use std::fmt;
use std::io::{self, Read, Write};
use std::thread::sleep;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{ControllerConfig, RESTART_SETTLE};

/// Frame terminator for both requests and responses
pub const TERMINATOR: &[u8] = b"\r\n\r\n";

/// Responses longer than this are treated as garbage
pub const MAX_RESPONSE_LEN: usize = 64;

/// Status code reported by a controller. 0 means OK.
pub type StatusCode = i32;

pub const STATUS_OK: StatusCode = 0;

/// Error types for motor controller communication
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout waiting for response from controller {controller} to `{command}`")]
    Timeout { controller: String, command: String },

    #[error("Invalid response from controller {controller} to `{command}`: {raw:?}")]
    InvalidResponse {
        controller: String,
        command: String,
        raw: String,
    },

    #[error("Controller {controller} rejected `{command}` with status {status}")]
    Rejected {
        controller: String,
        command: String,
        status: StatusCode,
    },

    #[error("Controller {0} has a deferred acknowledgment outstanding")]
    AckPending(String),

    #[error("Controller {0} has no deferred acknowledgment to wait for")]
    NoPendingAck(String),
}

impl ControllerError {
    /// True for failures of the link itself rather than a status the controller reported
    pub fn is_transport(&self) -> bool {
        !matches!(self, ControllerError::Rejected { .. })
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;

/// Byte channel to a controller. Reads are expected to honour the
/// transport's configured timeout and fail with `TimedOut` when it elapses.
pub trait Transport: Read + Write {
    /// Discard anything already sitting in the receive buffer
    fn clear_input(&mut self) -> io::Result<()>;
}

impl Transport for Box<dyn SerialPort> {
    fn clear_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// Wire-level request. Rendered with `Display` exactly as sent, minus the terminator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Request {
    Status,
    Restart,
    SetSteps { channel: u8, steps: i32 },
    SetTime { channel: u8, millis: u32 },
    Enable { channel: u8 },
    Disable { channel: u8 },
    SetPin { pin: u8, state: u8 },
    TriggerAll,
    TriggerChannel { channel: u8 },
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Request::Status => write!(f, "?"),
            Request::Restart => write!(f, "R"),
            Request::SetSteps { channel, steps } => write!(f, "S {} {}", channel, steps),
            Request::SetTime { channel, millis } => write!(f, "T {} {}", channel, millis),
            Request::Enable { channel } => write!(f, "E {}", channel),
            Request::Disable { channel } => write!(f, "D {}", channel),
            Request::SetPin { pin, state } => write!(f, "P {} {}", pin, state),
            Request::TriggerAll => write!(f, "G"),
            Request::TriggerChannel { channel } => write!(f, "G {}", channel),
        }
    }
}

impl Request {
    /// Encode into a complete frame ready for the wire
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = self.to_string().into_bytes();
        frame.extend_from_slice(TERMINATOR);
        frame
    }
}

/// How a trigger should be acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// Block for the response right away
    Immediate,
    /// Return after sending; collect the response later with `wait_for_ack`
    Deferred,
}

/// One half-duplex request/response session with a physical controller
pub struct MotorController {
    name: String,
    port: Box<dyn Transport>,
    pending: Option<Request>,
    settle: Duration,
}

impl MotorController {
    /// Open the serial port described by `config` and verify the controller answers
    pub fn open(name: &str, config: &ControllerConfig) -> Result<Self> {
        info!(
            "Opening motor controller {} on {} at {} baud",
            name, config.port, config.baud
        );
        let port = serialport::new(&config.port, config.baud)
            .timeout(Duration::from_secs_f64(config.timeout))
            .open()?;
        port.clear(ClearBuffer::All)?;

        Self::connect(name, Box::new(port))
    }

    /// Wrap an already open transport and run the startup status check.
    /// A controller that reports a non-zero status is rejected.
    pub fn connect(name: &str, port: Box<dyn Transport>) -> Result<Self> {
        let mut controller = Self {
            name: name.to_string(),
            port,
            pending: None,
            settle: RESTART_SETTLE,
        };

        let status = controller.status()?;
        if status != STATUS_OK {
            return Err(controller.rejected(Request::Status, status));
        }
        debug!("Controller {} responding", name);
        Ok(controller)
    }

    /// Override the delay between a restart and the follow-up status query
    pub fn with_settle_delay(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a deferred trigger is still waiting to be acknowledged
    pub fn ack_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn rejected(&self, request: Request, status: StatusCode) -> ControllerError {
        ControllerError::Rejected {
            controller: self.name.clone(),
            command: request.to_string(),
            status,
        }
    }

    /// Flush stale input and write one request frame
    fn send(&mut self, request: Request) -> Result<()> {
        if self.pending.is_some() {
            // Clearing input now would swallow the outstanding acknowledgment
            return Err(ControllerError::AckPending(self.name.clone()));
        }
        self.port.flush()?;
        self.port.clear_input()?;

        debug!("TX {}: {}", self.name, request);
        self.port.write_all(&request.encode())?;
        self.port.flush()?;
        Ok(())
    }

    /// Block until a terminated response arrives and parse its status code
    fn receive(&mut self, request: Request) -> Result<StatusCode> {
        let mut raw = Vec::with_capacity(8);
        let mut byte = [0u8; 1];

        while !raw.ends_with(TERMINATOR) {
            if raw.len() >= MAX_RESPONSE_LEN {
                return Err(self.invalid(request, &raw));
            }
            match self.port.read(&mut byte) {
                Ok(0) => return Err(self.timeout(request)),
                Ok(_) => raw.push(byte[0]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    return Err(self.timeout(request));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ControllerError::Io(e)),
            }
        }

        let body = &raw[..raw.len() - TERMINATOR.len()];
        let status = std::str::from_utf8(body)
            .ok()
            .and_then(|text| text.trim().parse::<StatusCode>().ok())
            .ok_or_else(|| self.invalid(request, &raw))?;

        debug!("RX {}: {} -> {}", self.name, request, status);
        Ok(status)
    }

    fn timeout(&self, request: Request) -> ControllerError {
        warn!("Controller {} timed out on `{}`", self.name, request);
        ControllerError::Timeout {
            controller: self.name.clone(),
            command: request.to_string(),
        }
    }

    fn invalid(&self, request: Request, raw: &[u8]) -> ControllerError {
        ControllerError::InvalidResponse {
            controller: self.name.clone(),
            command: request.to_string(),
            raw: String::from_utf8_lossy(raw).into_owned(),
        }
    }

    /// Send a request and wait for its status
    fn round_trip(&mut self, request: Request) -> Result<StatusCode> {
        self.send(request)?;
        self.receive(request)
    }

    // === Protocol operations ===

    /// Query the controller status
    pub fn status(&mut self) -> Result<StatusCode> {
        self.round_trip(Request::Status)
    }

    /// Restart the controller, let it settle and re-query its status.
    /// A non-zero restart acknowledgment is an error.
    pub fn restart(&mut self) -> Result<StatusCode> {
        info!("Restarting controller {}", self.name);
        let status = self.round_trip(Request::Restart)?;
        if status != STATUS_OK {
            return Err(self.rejected(Request::Restart, status));
        }
        sleep(self.settle);
        self.status()
    }

    /// Queue a step count on a channel
    pub fn set_steps(&mut self, channel: u8, steps: i32) -> Result<StatusCode> {
        self.round_trip(Request::SetSteps { channel, steps })
    }

    /// Queue a move time (milliseconds) on a channel
    pub fn set_time(&mut self, channel: u8, millis: u32) -> Result<StatusCode> {
        self.round_trip(Request::SetTime { channel, millis })
    }

    pub fn enable(&mut self, channel: u8) -> Result<StatusCode> {
        self.round_trip(Request::Enable { channel })
    }

    pub fn disable(&mut self, channel: u8) -> Result<StatusCode> {
        self.round_trip(Request::Disable { channel })
    }

    pub fn set_pin(&mut self, pin: u8, state: u8) -> Result<StatusCode> {
        self.round_trip(Request::SetPin { pin, state })
    }

    /// Start all queued moves.
    /// With `Ack::Deferred` this returns `STATUS_OK` as soon as the frame is sent.
    pub fn trigger_all(&mut self, ack: Ack) -> Result<StatusCode> {
        self.trigger(Request::TriggerAll, ack)
    }

    /// Start the queued move on a single channel
    pub fn trigger_channel(&mut self, channel: u8, ack: Ack) -> Result<StatusCode> {
        self.trigger(Request::TriggerChannel { channel }, ack)
    }

    fn trigger(&mut self, request: Request, ack: Ack) -> Result<StatusCode> {
        match ack {
            Ack::Immediate => self.round_trip(request),
            Ack::Deferred => {
                self.send(request)?;
                self.pending = Some(request);
                Ok(STATUS_OK)
            }
        }
    }

    /// Block for the acknowledgment of a deferred trigger
    pub fn wait_for_ack(&mut self) -> Result<StatusCode> {
        let request = self
            .pending
            .take()
            .ok_or_else(|| ControllerError::NoPendingAck(self.name.clone()))?;
        self.receive(request)
    }

    /// Restart the controller and release the transport
    pub fn terminate(mut self) -> Result<()> {
        if self.pending.is_some() {
            // Drain the outstanding acknowledgment so the restart frame is answered cleanly
            if let Err(e) = self.wait_for_ack() {
                warn!("Dropping unacknowledged trigger on {}: {}", self.name, e);
            }
        }
        self.restart()?;
        info!("Controller {} terminated", self.name);
        Ok(())
    }
}
