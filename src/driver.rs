// Command channel to the motor controller
//
// Owns the single connection to the device. Every wire operation is one
// write followed by one structured reply, bounded by the wire timeout, and
// only one operation is on the wire at a time.
//
// Any wire fault (timeout, garbage, device gone) is treated as "the motors
// may still be turning": the channel sends a best-effort STOP on the same
// link before reporting the failure, then marks the link down.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{MAX_SPEED, MIN_SPEED};
use crate::link::{ConnectError, Connector, LineTransport};
use crate::protocol::{speed_in_range, Directive, LightPosition, ProtocolError, Reply};

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Speed out of range: left={left}, right={right} (allowed {}..={})", MIN_SPEED, MAX_SPEED)]
    InvalidRange { left: i32, right: i32 },

    #[error("Link failure: {cause} (stop confirmed: {stop_confirmed})")]
    LinkFailure { cause: String, stop_confirmed: bool },

    #[error("Device not found: {path}")]
    DeviceNotFound { path: String },

    #[error("Failed to open link: {0}")]
    Open(ConnectError),

    #[error("Link is down")]
    NotConnected,

    #[error("Motor controller rejected directive: {code}")]
    Rejected { code: String },

    #[error("Superseded by stop")]
    Preempted,
}

/// What went wrong on the link, kept in [`LinkState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkErrorKind {
    Timeout,
    MalformedReply,
    UnexpectedReply,
    Io,
    DeviceNotFound,
    OpenFailed,
}

/// Snapshot of the channel's view of the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkState {
    pub device: String,
    pub connected: bool,
    pub last_response_at: Option<Instant>,
    pub last_error: Option<LinkErrorKind>,
    /// Speeds last confirmed by the device
    pub left: i16,
    pub right: i16,
    /// Watchdog notifications received from the firmware
    pub emergencies: u64,
    pub last_emergency_at: Option<Instant>,
}

impl LinkState {
    fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            connected: false,
            last_response_at: None,
            last_error: None,
            left: 0,
            right: 0,
            emergencies: 0,
            last_emergency_at: None,
        }
    }
}

/// Accepted speed directive.
///
/// `seq` increases with every confirmed operation on the wire, so callers
/// can tell which of two results landed last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub left: i16,
    pub right: i16,
    pub uptime_ms: u64,
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Device confirmed the stop
    Stopped { seq: u64 },
    /// Link already known down; nothing to send
    LinkDown,
}

/// The device's own view, as answered to `STATUS`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareStatus {
    pub left: i16,
    pub right: i16,
    pub since_last_command_ms: u64,
    pub watchdog_timeout_ms: u64,
    pub front_light: bool,
    pub back_light: bool,
    /// Sequence number of the last speed-changing operation before the query
    pub seq: u64,
}

// Fault during one exchange
#[derive(Debug, thiserror::Error)]
enum WireFault {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Malformed(#[from] ProtocolError),
    #[error("unexpected reply {0:?}")]
    Unexpected(Reply),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl WireFault {
    fn kind(&self) -> LinkErrorKind {
        match self {
            WireFault::Timeout(_) => LinkErrorKind::Timeout,
            WireFault::Malformed(_) => LinkErrorKind::MalformedReply,
            WireFault::Unexpected(_) => LinkErrorKind::UnexpectedReply,
            WireFault::Io(_) => LinkErrorKind::Io,
        }
    }
}

type Wire = Option<Box<dyn LineTransport>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serialized access to the motor controller.
///
/// Blocking; call from a blocking context (e.g. `spawn_blocking`).
pub struct CommandChannel {
    connector: Box<dyn Connector>,
    wire: Mutex<Wire>,
    state: Mutex<LinkState>,
    // Bumped by every stop(); sends queued before the bump are dropped
    stop_epoch: AtomicU64,
    seq: AtomicU64,
    timeout: Duration,
}

impl CommandChannel {
    /// Create a channel with the link down; call [`reconnect`](Self::reconnect) to open it
    pub fn new(connector: Box<dyn Connector>, timeout: Duration) -> Self {
        let state = LinkState::new(connector.device());
        Self {
            connector,
            wire: Mutex::new(None),
            state: Mutex::new(state),
            stop_epoch: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            timeout,
        }
    }

    /// Create and open in one step
    pub fn open(connector: Box<dyn Connector>, timeout: Duration) -> Result<Self, LinkError> {
        let channel = Self::new(connector, timeout);
        channel.reconnect()?;
        Ok(channel)
    }

    /// Cached link state; never touches the wire
    pub fn status(&self) -> LinkState {
        lock(&self.state).clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    /// Set both wheel speeds and wait for the device to echo them back
    pub fn send_speeds(&self, left: i32, right: i32) -> Result<Ack, LinkError> {
        if !speed_in_range(left) || !speed_in_range(right) {
            return Err(LinkError::InvalidRange { left, right });
        }

        let epoch = self.stop_epoch.load(Ordering::SeqCst);
        let mut wire = lock(&self.wire);
        if self.stop_epoch.load(Ordering::SeqCst) != epoch {
            debug!("Dropping PWM {} {}: stop requested while queued", left, right);
            return Err(LinkError::Preempted);
        }
        let Some(link) = wire.as_mut() else {
            return Err(LinkError::NotConnected);
        };

        let directive = Directive::SetSpeed { left, right };
        match self.exchange(link.as_mut(), directive) {
            Ok(Reply::Ack {
                left,
                right,
                uptime_ms,
            }) => {
                let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
                let mut state = lock(&self.state);
                state.left = left;
                state.right = right;
                Ok(Ack {
                    left,
                    right,
                    uptime_ms,
                    seq,
                })
            }
            Ok(Reply::Error { error }) => {
                warn!("Motor controller rejected {}: {}", directive, error);
                Err(LinkError::Rejected { code: error })
            }
            Ok(other) => Err(self.fail_toward_safety(&mut wire, WireFault::Unexpected(other))),
            Err(fault) => Err(self.fail_toward_safety(&mut wire, fault)),
        }
    }

    /// Zero both speeds.
    ///
    /// Drops any send still waiting for the wire and waits at most one wire
    /// timeout for an in-flight operation. On a link already known down this
    /// is a successful no-op.
    pub fn stop(&self) -> Result<StopOutcome, LinkError> {
        self.stop_epoch.fetch_add(1, Ordering::SeqCst);
        let mut wire = lock(&self.wire);
        let Some(link) = wire.as_mut() else {
            debug!("Stop requested with link down, nothing to send");
            return Ok(StopOutcome::LinkDown);
        };

        match self.exchange(link.as_mut(), Directive::Stop) {
            Ok(Reply::Stopped { reason, .. }) => {
                debug!("Motor controller stopped ({})", reason);
                let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
                let mut state = lock(&self.state);
                state.left = 0;
                state.right = 0;
                Ok(StopOutcome::Stopped { seq })
            }
            Ok(other) => {
                let fault = WireFault::Unexpected(other);
                Err(self.mark_down(&mut wire, &fault, false))
            }
            Err(fault) => Err(self.mark_down(&mut wire, &fault, false)),
        }
    }

    /// Query the device's own view of speeds and watchdog
    pub fn query_firmware(&self) -> Result<FirmwareStatus, LinkError> {
        let mut wire = lock(&self.wire);
        let Some(link) = wire.as_mut() else {
            return Err(LinkError::NotConnected);
        };

        match self.exchange(link.as_mut(), Directive::Status) {
            Ok(Reply::Status {
                left,
                right,
                since_last_command_ms,
                watchdog_timeout_ms,
                front_light,
                back_light,
            }) => Ok(FirmwareStatus {
                left,
                right,
                since_last_command_ms,
                watchdog_timeout_ms,
                front_light,
                back_light,
                seq: self.seq.load(Ordering::SeqCst),
            }),
            Ok(other) => Err(self.fail_toward_safety(&mut wire, WireFault::Unexpected(other))),
            Err(fault) => Err(self.fail_toward_safety(&mut wire, fault)),
        }
    }

    pub fn set_light(&self, position: LightPosition, on: bool) -> Result<(), LinkError> {
        let mut wire = lock(&self.wire);
        let Some(link) = wire.as_mut() else {
            return Err(LinkError::NotConnected);
        };

        match self.exchange(link.as_mut(), Directive::Light { position, on }) {
            Ok(Reply::Light { .. }) => Ok(()),
            Ok(Reply::Error { error }) => Err(LinkError::Rejected { code: error }),
            Ok(other) => Err(self.fail_toward_safety(&mut wire, WireFault::Unexpected(other))),
            Err(fault) => Err(self.fail_toward_safety(&mut wire, fault)),
        }
    }

    /// Close and reopen the link, then stop the motors so a fresh link
    /// never resumes earlier motion
    pub fn reconnect(&self) -> Result<(), LinkError> {
        let mut wire = lock(&self.wire);
        *wire = None;
        *lock(&self.state) = LinkState::new(self.connector.device());

        info!("Opening motor link on {}", self.connector.device());
        let mut link = match self.connector.connect() {
            Ok(link) => link,
            Err(ConnectError::DeviceNotFound { path }) => {
                warn!("Motor controller not found at {}", path);
                lock(&self.state).last_error = Some(LinkErrorKind::DeviceNotFound);
                return Err(LinkError::DeviceNotFound { path });
            }
            Err(e) => {
                warn!("Failed to open motor link: {}", e);
                lock(&self.state).last_error = Some(LinkErrorKind::OpenFailed);
                return Err(LinkError::Open(e));
            }
        };

        match self.exchange(link.as_mut(), Directive::Stop) {
            Ok(Reply::Stopped { .. }) => {
                self.seq.fetch_add(1, Ordering::SeqCst);
                lock(&self.state).connected = true;
                *wire = Some(link);
                info!("Motor link up on {}", self.connector.device());
                Ok(())
            }
            Ok(other) => {
                let fault = WireFault::Unexpected(other);
                Err(self.mark_down(&mut wire, &fault, false))
            }
            Err(fault) => Err(self.mark_down(&mut wire, &fault, false)),
        }
    }

    /// Drain unsolicited lines (firmware emergencies) while the wire is idle.
    ///
    /// Returns immediately if an operation holds the wire; that operation
    /// consumes the notifications itself.
    pub fn poll_device(&self) {
        let Ok(mut wire) = self.wire.try_lock() else {
            return;
        };
        let Some(link) = wire.as_mut() else {
            return;
        };

        loop {
            match link.read_line(Duration::ZERO) {
                Ok(line) => match Reply::parse(&line) {
                    Ok(reply) if reply.is_unsolicited() => self.note_unsolicited(&reply),
                    Ok(reply) => debug!("Ignoring stray reply {:?}", reply),
                    Err(e) => debug!("Ignoring unparsable line: {}", e),
                },
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return,
                Err(e) => {
                    self.fail_toward_safety(&mut wire, WireFault::Io(e));
                    return;
                }
            }
        }
    }

    /// One directive, one reply. Unsolicited notifications arriving in
    /// between are recorded and skipped.
    fn exchange(
        &self,
        link: &mut dyn LineTransport,
        directive: Directive,
    ) -> Result<Reply, WireFault> {
        debug!("-> {}", directive);
        link.write_line(&directive.to_line())?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let line = match link.read_line(remaining) {
                Ok(line) => line,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(WireFault::Timeout(self.timeout));
                }
                Err(e) => return Err(WireFault::Io(e)),
            };
            debug!("<- {}", line);

            let reply = Reply::parse(&line)?;
            lock(&self.state).last_response_at = Some(Instant::now());
            if reply.is_unsolicited() {
                self.note_unsolicited(&reply);
                continue;
            }
            return Ok(reply);
        }
    }

    fn note_unsolicited(&self, reply: &Reply) {
        if let Reply::Emergency { reason } = reply {
            warn!("Motor controller emergency stop: {}", reason);
            let mut state = lock(&self.state);
            state.left = 0;
            state.right = 0;
            state.emergencies += 1;
            state.last_emergency_at = Some(Instant::now());
        }
    }

    /// Best-effort STOP on the failing link, then mark it down
    fn fail_toward_safety(&self, wire: &mut Wire, fault: WireFault) -> LinkError {
        warn!("Motor link fault: {}; sending best-effort stop", fault);
        let stop_confirmed = match wire.as_mut() {
            Some(link) => matches!(
                self.exchange(link.as_mut(), Directive::Stop),
                Ok(Reply::Stopped { .. })
            ),
            None => false,
        };
        if stop_confirmed {
            info!("Best-effort stop confirmed by motor controller");
        } else {
            warn!("Best-effort stop not confirmed, relying on firmware watchdog");
        }
        self.mark_down(wire, &fault, stop_confirmed)
    }

    fn mark_down(&self, wire: &mut Wire, fault: &WireFault, stop_confirmed: bool) -> LinkError {
        *wire = None;
        let mut state = lock(&self.state);
        state.connected = false;
        state.last_error = Some(fault.kind());
        if stop_confirmed {
            state.left = 0;
            state.right = 0;
        }
        warn!("Motor link down on {}", state.device);
        LinkError::LinkFailure {
            cause: fault.to_string(),
            stop_confirmed,
        }
    }
}
