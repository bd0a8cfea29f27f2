// Message types exchanged between clients and the runtime

use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::driver::{FirmwareStatus, LinkErrorKind};
use crate::protocol::LightPosition;

/// One speed directive for both wheels, created per control input.
/// `issued_at` is when the input arrived; the heartbeat it proves dates from then.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorCommand {
    pub left_speed: i32,
    pub right_speed: i32,
    pub issued_at: Instant,
}

impl MotorCommand {
    pub fn new(left_speed: i32, right_speed: i32) -> Self {
        Self {
            left_speed,
            right_speed,
            issued_at: Instant::now(),
        }
    }
}

/// Skid-steer direction shortcut
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Backward,
    Left,
    Right,
    Stop,
}

impl Direction {
    /// (left, right) for the given speed magnitude
    pub fn speeds(self, speed: i32) -> (i32, i32) {
        match self {
            Direction::Forward => (speed, speed),
            Direction::Backward => (-speed, -speed),
            Direction::Left => (-speed, speed),
            Direction::Right => (speed, -speed),
            Direction::Stop => (0, 0),
        }
    }
}

// Client -> runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Drive {
        left: i32,
        right: i32,
    },
    Move {
        direction: Direction,
        #[serde(default)]
        speed: Option<i32>,
    },
    Heartbeat,
    Stop,
    Lights {
        position: LightPosition,
        on: bool,
    },
}

/// A client message tagged with the session that sent it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEnvelope {
    pub session: String,
    /// Shared secret, when the backend requires one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// Coordinator state machine phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyPhase {
    Idle,
    Active,
    WatchdogTripped,
    LinkDown,
}

/// Deliberate safety actions and link changes, pushed to every client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SafetyEvent {
    /// No heartbeat within the coordinator timeout while moving
    WatchdogTripped { silent_ms: u64 },
    /// Last client session went away
    NoClients,
    /// A client asked for a stop
    OperatorStop { session: Option<String> },
    LinkDown { cause: String },
    LinkRestored,
    /// The firmware's own watchdog stopped the motors
    FirmwareEmergency,
    /// The device reported speeds other than the ones last applied
    FirmwareMismatch { left: i16, right: i16 },
    SelfTestFinished { passed: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSummary {
    pub device: String,
    pub connected: bool,
    pub last_error: Option<LinkErrorKind>,
    pub last_response_ms_ago: Option<u64>,
    pub emergencies: u64,
}

/// Status pushed to clients on every tick and every safety event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub phase: SafetyPhase,
    pub left: i16,
    pub right: i16,
    /// False whenever motion can't be commanded
    pub motion_enabled: bool,
    pub degraded: bool,
    pub clients: usize,
    pub link: LinkSummary,
    pub last_event: Option<SafetyEvent>,
}

/// Body of a synchronous request (stop, reconnect, self-test, firmware status).
/// Stop ignores the token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

/// Reply to synchronous requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestReply {
    pub ok: bool,
    pub msg: String,
    pub status: SystemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<FirmwareStatus>,
}
