// Timeouts, topics, serial configuration
use std::time::Duration;

// Serial port for the motor controller
pub const MOTOR_PORT: &str = "/dev/ttyUSB0";
pub const BAUD_RATE: u32 = 115_200;

// Actuator speed limits (both wheels, signed PWM duty)
pub const MAX_SPEED: i16 = 255;
pub const MIN_SPEED: i16 = -255;

// Speed used by direction commands that don't carry one
pub const DEFAULT_SPEED: i16 = 150;

// Zenoh topics
pub const TOPIC_CMD_DRIVE: &str = "rover/cmd/drive"; // movement intents
pub const TOPIC_CMD_STOP: &str = "rover/cmd/stop"; // synchronous stop (queryable)
pub const TOPIC_CMD_RECONNECT: &str = "rover/cmd/reconnect"; // queryable
pub const TOPIC_CMD_SELF_TEST: &str = "rover/cmd/self_test"; // queryable
pub const TOPIC_CMD_FIRMWARE: &str = "rover/cmd/firmware_status"; // queryable, read-only
pub const TOPIC_STATUS: &str = "rover/state/status"; // status push
pub const SESSION_PREFIX: &str = "rover/session"; // liveliness tokens, one per client
pub const SESSION_WILDCARD: &str = "rover/session/*";

// Client resend interval; every other deadline is derived from it
pub const CLIENT_RESEND: Duration = Duration::from_millis(500);

// Motor self-test: each step of the sweep is held this long at this speed
pub const SELF_TEST_SPEED: i16 = 100;
pub const SELF_TEST_STEP: Duration = Duration::from_millis(300);

// Upper bound for one write/read cycle on the serial link
pub const WIRE_TIMEOUT: Duration = Duration::from_secs(1);

/// The three watchdog layers plus the wire bound.
///
/// Client resend, coordinator timeout and firmware timeout keep a 1:3:4
/// ratio. Build through [`SafetyTimings::from_resend`] so the ratio holds
/// whatever base interval is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyTimings {
    /// Client re-emits a held movement command this often
    pub client_resend: Duration,
    /// Coordinator trips if no heartbeat arrives within this window
    pub heartbeat_timeout: Duration,
    /// Firmware zeroes the motors after this much silence
    pub firmware_timeout: Duration,
    /// Period of the coordinator's background check
    pub check_period: Duration,
    /// Bound on a single driver write/read cycle
    pub wire_timeout: Duration,
}

impl SafetyTimings {
    pub const fn from_resend(client_resend: Duration) -> Self {
        let ms = client_resend.as_millis() as u64;
        Self {
            client_resend,
            heartbeat_timeout: Duration::from_millis(ms * 3),
            firmware_timeout: Duration::from_millis(ms * 4),
            check_period: client_resend,
            wire_timeout: WIRE_TIMEOUT,
        }
    }
}

impl Default for SafetyTimings {
    fn default() -> Self {
        Self::from_resend(CLIENT_RESEND)
    }
}
