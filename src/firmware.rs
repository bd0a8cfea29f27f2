// Motor controller firmware model
//
// Mirrors the behaviour of the embedded controller: it applies directives,
// answers every line with a structured reply, and runs its own watchdog.
// If nothing arrives for `watchdog_timeout` while the motors turn, it zeroes
// both speeds and emits an unsolicited emergency notification.
//
// The simulated serial link drives this model; it is also the reference for
// what the real device must do.

use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::protocol::{
    speed_in_range, Directive, LightPosition, ProtocolError, Reply, ERR_INVALID_FORMAT,
    ERR_INVALID_SPEED_RANGE, ERR_UNKNOWN_COMMAND, REASON_STOP_COMMAND, REASON_WATCHDOG_TIMEOUT,
};

pub const FIRMWARE_WATCHDOG_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone)]
pub struct Firmware {
    left_speed: i16,
    right_speed: i16,
    front_light: bool,
    back_light: bool,
    booted_at: Instant,
    last_command_at: Instant,
    watchdog_timeout: Duration,
}

impl Firmware {
    pub fn new(now: Instant) -> Self {
        Self::with_watchdog(now, FIRMWARE_WATCHDOG_TIMEOUT)
    }

    pub fn with_watchdog(now: Instant, watchdog_timeout: Duration) -> Self {
        Self {
            left_speed: 0,
            right_speed: 0,
            front_light: false,
            back_light: false,
            booted_at: now,
            last_command_at: now,
            watchdog_timeout,
        }
    }

    pub fn speeds(&self) -> (i16, i16) {
        (self.left_speed, self.right_speed)
    }

    pub fn is_moving(&self) -> bool {
        self.left_speed != 0 || self.right_speed != 0
    }

    fn uptime_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.booted_at).as_millis() as u64
    }

    /// Handle one received line and produce the reply.
    ///
    /// Any line counts as activity for the watchdog, even one that is
    /// rejected.
    pub fn handle_line(&mut self, line: &str, now: Instant) -> Reply {
        let since_last = now.saturating_duration_since(self.last_command_at);
        self.last_command_at = now;

        let directive = match line.parse::<Directive>() {
            Ok(d) => d,
            Err(ProtocolError::UnknownDirective(keyword)) => {
                debug!("Firmware: unknown directive {}", keyword);
                return error_reply(ERR_UNKNOWN_COMMAND);
            }
            Err(e) => {
                debug!("Firmware: {}", e);
                return error_reply(ERR_INVALID_FORMAT);
            }
        };

        match directive {
            Directive::SetSpeed { left, right } => {
                if !speed_in_range(left) || !speed_in_range(right) {
                    return error_reply(ERR_INVALID_SPEED_RANGE);
                }
                self.left_speed = left as i16;
                self.right_speed = right as i16;
                Reply::Ack {
                    left: self.left_speed,
                    right: self.right_speed,
                    uptime_ms: self.uptime_ms(now),
                }
            }
            Directive::Stop => {
                self.left_speed = 0;
                self.right_speed = 0;
                Reply::Stopped {
                    reason: REASON_STOP_COMMAND.to_string(),
                    uptime_ms: self.uptime_ms(now),
                }
            }
            Directive::Status => Reply::Status {
                left: self.left_speed,
                right: self.right_speed,
                since_last_command_ms: since_last.as_millis() as u64,
                watchdog_timeout_ms: self.watchdog_timeout.as_millis() as u64,
                front_light: self.front_light,
                back_light: self.back_light,
            },
            Directive::Light { position, on } => {
                match position {
                    LightPosition::Front => self.front_light = on,
                    LightPosition::Back => self.back_light = on,
                }
                Reply::Light { position, on }
            }
        }
    }

    /// Run the watchdog; returns the emergency notification if it fired
    pub fn poll(&mut self, now: Instant) -> Option<Reply> {
        let silence = now.saturating_duration_since(self.last_command_at);
        if silence > self.watchdog_timeout && self.is_moving() {
            warn!(
                "Firmware watchdog: no directive for {:?}, stopping motors",
                silence
            );
            self.left_speed = 0;
            self.right_speed = 0;
            return Some(Reply::Emergency {
                reason: REASON_WATCHDOG_TIMEOUT.to_string(),
            });
        }
        None
    }
}

fn error_reply(code: &str) -> Reply {
    Reply::Error {
        error: code.to_string(),
    }
}
