// Line protocol between the backend and the motor controller
//
// Directives are plain text, one per line:
//   PWM <left> <right>        (legacy: MOTOR:L:<left>:R:<right>)
//   STOP
//   STATUS
//   LIGHT <FRONT|BACK> <ON|OFF>
//
// Replies are single-line JSON objects tagged by "type".

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::{MAX_SPEED, MIN_SPEED};

/// Firmware error code for speeds outside [MIN_SPEED, MAX_SPEED]
pub const ERR_INVALID_SPEED_RANGE: &str = "invalid_speed_range";
pub const ERR_INVALID_FORMAT: &str = "invalid_format";
pub const ERR_UNKNOWN_COMMAND: &str = "unknown_command";

/// Reason carried by the firmware's unsolicited emergency notification
pub const REASON_WATCHDOG_TIMEOUT: &str = "watchdog_timeout";
pub const REASON_STOP_COMMAND: &str = "stop_command";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ProtocolError {
    #[error("Empty line")]
    Empty,

    #[error("Unknown directive: {0}")]
    UnknownDirective(String),

    #[error("Malformed directive '{line}': {reason}")]
    MalformedDirective { line: String, reason: String },

    #[error("Malformed reply '{line}': {reason}")]
    MalformedReply { line: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightPosition {
    Front,
    Back,
}

impl LightPosition {
    fn as_wire(self) -> &'static str {
        match self {
            LightPosition::Front => "FRONT",
            LightPosition::Back => "BACK",
        }
    }
}

/// A directive as it travels on the wire.
///
/// Speeds are kept as `i32` so out-of-range values survive parsing and the
/// receiving side can reject them with a structured error instead of a
/// format error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    SetSpeed { left: i32, right: i32 },
    Stop,
    Status,
    Light { position: LightPosition, on: bool },
}

impl Directive {
    /// Wire line including the trailing newline
    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::SetSpeed { left, right } => write!(f, "PWM {} {}", left, right),
            Directive::Stop => write!(f, "STOP"),
            Directive::Status => write!(f, "STATUS"),
            Directive::Light { position, on } => write!(
                f,
                "LIGHT {} {}",
                position.as_wire(),
                if *on { "ON" } else { "OFF" }
            ),
        }
    }
}

impl FromStr for Directive {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ProtocolError::Empty);
        }

        if let Some(rest) = line.strip_prefix("MOTOR:") {
            return parse_legacy_motor(line, rest);
        }

        let mut parts = line.split_whitespace();
        let keyword = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();

        match keyword {
            "PWM" => {
                let [left, right] = args.as_slice() else {
                    return Err(malformed(line, "expected two speed values"));
                };
                Ok(Directive::SetSpeed {
                    left: parse_speed(line, left)?,
                    right: parse_speed(line, right)?,
                })
            }
            "STOP" if args.is_empty() => Ok(Directive::Stop),
            "STATUS" if args.is_empty() => Ok(Directive::Status),
            "LIGHT" => {
                let [position, state] = args.as_slice() else {
                    return Err(malformed(line, "expected position and state"));
                };
                let position = match *position {
                    "FRONT" => LightPosition::Front,
                    "BACK" => LightPosition::Back,
                    other => return Err(malformed(line, &format!("unknown light {}", other))),
                };
                let on = match *state {
                    "ON" => true,
                    "OFF" => false,
                    other => return Err(malformed(line, &format!("unknown state {}", other))),
                };
                Ok(Directive::Light { position, on })
            }
            "STOP" | "STATUS" => Err(malformed(line, "unexpected arguments")),
            other => Err(ProtocolError::UnknownDirective(other.to_string())),
        }
    }
}

// MOTOR:L:<left>:R:<right>
fn parse_legacy_motor(line: &str, rest: &str) -> Result<Directive, ProtocolError> {
    let fields: Vec<&str> = rest.split(':').collect();
    match fields.as_slice() {
        ["L", left, "R", right] => Ok(Directive::SetSpeed {
            left: parse_speed(line, left)?,
            right: parse_speed(line, right)?,
        }),
        _ => Err(malformed(line, "expected MOTOR:L:<left>:R:<right>")),
    }
}

fn parse_speed(line: &str, raw: &str) -> Result<i32, ProtocolError> {
    raw.trim()
        .parse::<i32>()
        .map_err(|_| malformed(line, &format!("invalid speed '{}'", raw)))
}

fn malformed(line: &str, reason: &str) -> ProtocolError {
    ProtocolError::MalformedDirective {
        line: line.to_string(),
        reason: reason.to_string(),
    }
}

pub fn speed_in_range(value: i32) -> bool {
    (MIN_SPEED as i32..=MAX_SPEED as i32).contains(&value)
}

/// Structured reply from the motor controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    /// Speed directive accepted, values echoed back
    Ack {
        left: i16,
        right: i16,
        uptime_ms: u64,
    },
    /// Motors zeroed on request
    Stopped { reason: String, uptime_ms: u64 },
    Status {
        left: i16,
        right: i16,
        since_last_command_ms: u64,
        watchdog_timeout_ms: u64,
        // Older firmware doesn't report lights
        #[serde(default)]
        front_light: bool,
        #[serde(default)]
        back_light: bool,
    },
    Light { position: LightPosition, on: bool },
    Error { error: String },
    /// Unsolicited: the firmware's own watchdog fired
    Emergency { reason: String },
}

impl Reply {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line.trim()).map_err(|e| ProtocolError::MalformedReply {
            line: line.trim().to_string(),
            reason: e.to_string(),
        })
    }

    pub fn to_line(&self) -> String {
        // Serializing a plain enum of strings and integers cannot fail
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("{}\n", json)
    }

    pub fn is_unsolicited(&self) -> bool {
        matches!(self, Reply::Emergency { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pwm_line_format() {
        let pwm = Directive::SetSpeed {
            left: 100,
            right: -50,
        };
        assert_eq!(pwm.to_line(), "PWM 100 -50\n");
        assert_eq!(Directive::Stop.to_line(), "STOP\n");
        assert_eq!(Directive::Status.to_line(), "STATUS\n");
        let light = Directive::Light {
            position: LightPosition::Back,
            on: true,
        };
        assert_eq!(light.to_line(), "LIGHT BACK ON\n");
    }

    #[test]
    fn test_parse_pwm_and_legacy() {
        assert_eq!(
            "PWM 100 -100".parse::<Directive>(),
            Ok(Directive::SetSpeed {
                left: 100,
                right: -100
            })
        );
        assert_eq!(
            "MOTOR:L:-100:R:100\n".parse::<Directive>(),
            Ok(Directive::SetSpeed {
                left: -100,
                right: 100
            })
        );
    }

    #[test]
    fn test_out_of_range_survives_parsing() {
        // Range is enforced by the receiver, not the parser
        let d: Directive = "MOTOR:L:300:R:100".parse().unwrap();
        assert_eq!(
            d,
            Directive::SetSpeed {
                left: 300,
                right: 100
            }
        );
        assert!(!speed_in_range(300));
        assert!(speed_in_range(-255));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "MOTOR:INVALID".parse::<Directive>(),
            Err(ProtocolError::MalformedDirective { .. })
        ));
        assert!(matches!(
            "PWM 10".parse::<Directive>(),
            Err(ProtocolError::MalformedDirective { .. })
        ));
        assert!(matches!(
            "PWM ten 10".parse::<Directive>(),
            Err(ProtocolError::MalformedDirective { .. })
        ));
        assert_eq!(
            "UNKNOWN_COMMAND".parse::<Directive>(),
            Err(ProtocolError::UnknownDirective("UNKNOWN_COMMAND".into()))
        );
        assert_eq!("   ".parse::<Directive>(), Err(ProtocolError::Empty));
    }

    #[test]
    fn test_reply_json_shape() {
        let ack = Reply::Ack {
            left: 100,
            right: 100,
            uptime_ms: 42,
        };
        assert_eq!(
            ack.to_line(),
            "{\"type\":\"ack\",\"left\":100,\"right\":100,\"uptime_ms\":42}\n"
        );

        let emergency = Reply::parse(r#"{"type":"emergency","reason":"watchdog_timeout"}"#).unwrap();
        assert!(emergency.is_unsolicited());
        assert_eq!(
            emergency,
            Reply::Emergency {
                reason: REASON_WATCHDOG_TIMEOUT.into()
            }
        );
    }

    #[test]
    fn test_garbage_reply_rejected() {
        assert!(matches!(
            Reply::parse("OK 100 100"),
            Err(ProtocolError::MalformedReply { .. })
        ));
    }
}
