// Motor safety coordinator: the backend-side watchdog
//
// Holds the only copy of the safety state (phase, heartbeat, last speeds,
// attached sessions). Request handlers and the scheduled watchdog task both
// go through the operations here; nothing else touches the state.
//
// Phases:
//   Idle             -> Active           accepted non-zero command
//   Active           -> Active           any command (heartbeat refresh)
//   Active           -> WatchdogTripped  heartbeat older than the timeout
//   WatchdogTripped  -> Idle             forced stop issued
//   *                -> Idle             stop / last session gone
//   *                -> LinkDown         driver failure; only reconnect leaves it
//
// A stop whose result arrives after a newer command was applied doesn't
// touch the speeds, and the phase follows the speeds that did land.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task;
use tracing::{debug, info, warn};

use crate::config::{SafetyTimings, SELF_TEST_SPEED};
use crate::driver::{Ack, CommandChannel, FirmwareStatus, LinkError, StopOutcome};
use crate::messages::{
    Direction, LinkSummary, MotorCommand, SafetyEvent, SafetyPhase, SystemStatus,
};
use crate::protocol::{speed_in_range, LightPosition};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Speed out of range: left={left}, right={right}")]
    InvalidRange { left: i32, right: i32 },

    #[error("Motor link is down, reconnect first")]
    LinkDown,

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Command superseded by stop")]
    Preempted,

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("Driver task failed: {0}")]
    Task(#[from] task::JoinError),
}

/// Coordinator-held safety record
#[derive(Debug, Clone)]
pub struct SafetyState {
    pub phase: SafetyPhase,
    pub last_heartbeat_at: Instant,
    pub last_known_speeds: (i16, i16),
    pub connected_clients: HashSet<String>,
    pub last_event: Option<SafetyEvent>,
    // Highest driver sequence number reflected in this state
    applied_seq: u64,
    // Firmware emergencies already accounted for
    seen_emergencies: u64,
}

impl SafetyState {
    fn new(phase: SafetyPhase) -> Self {
        Self {
            phase,
            last_heartbeat_at: Instant::now(),
            last_known_speeds: (0, 0),
            connected_clients: HashSet::new(),
            last_event: None,
            applied_seq: 0,
            seen_emergencies: 0,
        }
    }

    fn is_moving(&self) -> bool {
        self.last_known_speeds != (0, 0)
    }

    /// Zero speeds after a confirmed stop, unless a newer result already landed
    fn apply_stop(&mut self, seq: u64) {
        if seq > self.applied_seq {
            self.applied_seq = seq;
            self.last_known_speeds = (0, 0);
        }
        if self.phase != SafetyPhase::LinkDown {
            self.phase = if self.is_moving() {
                SafetyPhase::Active
            } else {
                SafetyPhase::Idle
            };
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MotorSafetyCoordinator {
    driver: Arc<CommandChannel>,
    state: Mutex<SafetyState>,
    timings: SafetyTimings,
    events: broadcast::Sender<SafetyEvent>,
}

impl MotorSafetyCoordinator {
    pub fn new(driver: Arc<CommandChannel>, timings: SafetyTimings) -> Self {
        let phase = if driver.is_connected() {
            SafetyPhase::Idle
        } else {
            SafetyPhase::LinkDown
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            driver,
            state: Mutex::new(SafetyState::new(phase)),
            timings,
            events,
        }
    }

    pub fn timings(&self) -> SafetyTimings {
        self.timings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SafetyEvent> {
        self.events.subscribe()
    }

    pub fn phase(&self) -> SafetyPhase {
        lock(&self.state).phase
    }

    pub fn speeds(&self) -> (i16, i16) {
        lock(&self.state).last_known_speeds
    }

    pub fn client_count(&self) -> usize {
        lock(&self.state).connected_clients.len()
    }

    pub fn safety_state(&self) -> SafetyState {
        lock(&self.state).clone()
    }

    /// Add a session; returns the number attached afterwards
    pub fn attach_session(&self, session: &str) -> usize {
        let mut state = lock(&self.state);
        state.connected_clients.insert(session.to_string());
        state.connected_clients.len()
    }

    /// Remove a session; `None` if it wasn't attached, otherwise the number left
    pub fn detach_session(&self, session: &str) -> Option<usize> {
        let mut state = lock(&self.state);
        if state.connected_clients.remove(session) {
            Some(state.connected_clients.len())
        } else {
            None
        }
    }

    /// Set wheel speeds on behalf of a session. Every accepted command is a
    /// heartbeat, including a repeat of the current speeds.
    pub async fn command(&self, session: &str, cmd: MotorCommand) -> Result<Ack, CommandError> {
        let MotorCommand {
            left_speed: left,
            right_speed: right,
            issued_at,
        } = cmd;
        if !speed_in_range(left) || !speed_in_range(right) {
            return Err(CommandError::InvalidRange { left, right });
        }
        self.admit(session)?;

        let driver = Arc::clone(&self.driver);
        let result = task::spawn_blocking(move || driver.send_speeds(left, right)).await?;

        match result {
            Ok(ack) => {
                let mut state = lock(&self.state);
                if ack.seq > state.applied_seq {
                    state.applied_seq = ack.seq;
                    state.last_known_speeds = (ack.left, ack.right);
                    state.last_heartbeat_at = state.last_heartbeat_at.max(issued_at);
                    state.phase = if state.is_moving() {
                        SafetyPhase::Active
                    } else {
                        SafetyPhase::Idle
                    };
                }
                Ok(ack)
            }
            Err(LinkError::Preempted) => Err(CommandError::Preempted),
            Err(LinkError::NotConnected) => {
                self.enter_link_down("link not connected".to_string());
                Err(CommandError::LinkDown)
            }
            Err(e @ LinkError::Rejected { .. }) => Err(CommandError::Link(e)),
            Err(e) => {
                self.enter_link_down(e.to_string());
                Err(CommandError::Link(e))
            }
        }
    }

    /// Explicit keep-alive without changing speeds
    pub fn heartbeat(&self, session: &str) -> Result<(), CommandError> {
        let mut state = lock(&self.state);
        if !state.connected_clients.contains(session) {
            return Err(CommandError::UnknownSession(session.to_string()));
        }
        if state.phase == SafetyPhase::Active {
            state.last_heartbeat_at = Instant::now();
        }
        Ok(())
    }

    /// Lights count as vehicle control and refresh the heartbeat
    pub async fn set_lights(
        &self,
        session: &str,
        position: LightPosition,
        on: bool,
    ) -> Result<(), CommandError> {
        self.admit(session)?;
        let driver = Arc::clone(&self.driver);
        match task::spawn_blocking(move || driver.set_light(position, on)).await? {
            Ok(()) => {
                let mut state = lock(&self.state);
                if state.phase == SafetyPhase::Active {
                    state.last_heartbeat_at = Instant::now();
                }
                Ok(())
            }
            Err(LinkError::NotConnected) => {
                self.enter_link_down("link not connected".to_string());
                Err(CommandError::LinkDown)
            }
            Err(e @ LinkError::Rejected { .. }) => Err(CommandError::Link(e)),
            Err(e) => {
                self.enter_link_down(e.to_string());
                Err(CommandError::Link(e))
            }
        }
    }

    /// Operator-requested stop; succeeds as a no-op while the link is down
    pub async fn operator_stop(&self, session: Option<String>) -> Result<(), CommandError> {
        self.stop_with(SafetyEvent::OperatorStop { session }).await
    }

    /// Immediate stop when no session is left to command movement
    pub async fn force_stop(&self) -> Result<(), CommandError> {
        self.stop_with(SafetyEvent::NoClients).await
    }

    async fn stop_with(&self, event: SafetyEvent) -> Result<(), CommandError> {
        let driver = Arc::clone(&self.driver);
        let outcome = task::spawn_blocking(move || driver.stop()).await?;
        match outcome {
            Ok(StopOutcome::Stopped { seq }) => {
                lock(&self.state).apply_stop(seq);
                self.publish(event);
                Ok(())
            }
            Ok(StopOutcome::LinkDown) => {
                {
                    let mut state = lock(&self.state);
                    state.phase = SafetyPhase::LinkDown;
                    state.last_known_speeds = (0, 0);
                }
                self.publish(event);
                Ok(())
            }
            Err(e) => {
                self.enter_link_down(e.to_string());
                Err(CommandError::Link(e))
            }
        }
    }

    /// Bounded motor sweep: forward, backward, left, right, then stop.
    ///
    /// Each step is an ordinary command from `session`, so admission and the
    /// watchdog apply as usual. The sweep aborts with `Preempted` as soon as
    /// anything else lands in between. It always ends with a stop.
    pub async fn self_test(&self, session: &str, step: Duration) -> Result<(), CommandError> {
        info!("Motor self-test requested by {}", session);
        let result = self.sweep(session, step).await;
        if let Err(e) = &result {
            warn!("Motor self-test aborted: {}", e);
        }
        let stopped = self
            .stop_with(SafetyEvent::SelfTestFinished {
                passed: result.is_ok(),
            })
            .await;
        result.and(stopped)
    }

    async fn sweep(&self, session: &str, step: Duration) -> Result<(), CommandError> {
        let speed = SELF_TEST_SPEED as i32;
        for direction in [
            Direction::Forward,
            Direction::Backward,
            Direction::Left,
            Direction::Right,
        ] {
            let (left, right) = direction.speeds(speed);
            let ack = self.command(session, MotorCommand::new(left, right)).await?;
            tokio::time::sleep(step).await;
            if lock(&self.state).applied_seq != ack.seq {
                return Err(CommandError::Preempted);
            }
        }
        Ok(())
    }

    /// Ask the device for its own view and cross-check it against ours.
    ///
    /// On request only: a `STATUS` line feeds the firmware watchdog like any
    /// other directive. If the device disagrees with the last applied speeds
    /// the motors are stopped.
    pub async fn firmware_status(&self) -> Result<FirmwareStatus, CommandError> {
        if self.phase() == SafetyPhase::LinkDown {
            return Err(CommandError::LinkDown);
        }
        let driver = Arc::clone(&self.driver);
        let firmware = match task::spawn_blocking(move || driver.query_firmware()).await? {
            Ok(firmware) => firmware,
            Err(LinkError::NotConnected) => {
                self.enter_link_down("link not connected".to_string());
                return Err(CommandError::LinkDown);
            }
            Err(e) => {
                self.enter_link_down(e.to_string());
                return Err(CommandError::Link(e));
            }
        };

        // Only comparable once every wire result up to the query is applied
        let diverged = {
            let state = lock(&self.state);
            state.phase != SafetyPhase::LinkDown
                && state.applied_seq >= firmware.seq
                && (firmware.left, firmware.right) != state.last_known_speeds
        };
        if diverged {
            warn!(
                "Firmware reports {} {}, expected {:?}; stopping motors",
                firmware.left,
                firmware.right,
                self.speeds()
            );
            self.stop_with(SafetyEvent::FirmwareMismatch {
                left: firmware.left,
                right: firmware.right,
            })
            .await?;
        }
        Ok(firmware)
    }

    /// Trip the watchdog if the heartbeat is stale while moving.
    ///
    /// Only this check moves `Active` to `WatchdogTripped`. Once tripped the
    /// phase is no longer `Active`, so later checks issue no further stops.
    pub async fn check_watchdog(&self, now: Instant) -> Option<SafetyEvent> {
        let silent = {
            let mut state = lock(&self.state);
            if state.phase != SafetyPhase::Active || !state.is_moving() {
                return None;
            }
            let silent = now.saturating_duration_since(state.last_heartbeat_at);
            if silent <= self.timings.heartbeat_timeout {
                return None;
            }
            state.phase = SafetyPhase::WatchdogTripped;
            silent
        };

        warn!(
            "No heartbeat for {:?} (timeout {:?}), stopping motors",
            silent, self.timings.heartbeat_timeout
        );
        let event = SafetyEvent::WatchdogTripped {
            silent_ms: silent.as_millis() as u64,
        };

        let driver = Arc::clone(&self.driver);
        match task::spawn_blocking(move || driver.stop()).await {
            Ok(Ok(StopOutcome::Stopped { seq })) => lock(&self.state).apply_stop(seq),
            Ok(Ok(StopOutcome::LinkDown)) => {
                self.enter_link_down("link down during watchdog stop".to_string())
            }
            Ok(Err(e)) => self.enter_link_down(e.to_string()),
            Err(e) => {
                warn!("Watchdog stop task failed: {}", e);
                self.enter_link_down(e.to_string());
            }
        }

        self.publish(event.clone());
        Some(event)
    }

    /// One pass of the scheduled safety task
    pub async fn tick(&self, now: Instant) -> Vec<SafetyEvent> {
        let mut events = Vec::new();

        let driver = Arc::clone(&self.driver);
        if let Err(e) = task::spawn_blocking(move || driver.poll_device()).await {
            warn!("Device poll task failed: {}", e);
        }
        let link = self.driver.status();

        // Firmware stopped on its own; mirror it
        let emergency = {
            let mut state = lock(&self.state);
            if link.emergencies > state.seen_emergencies {
                state.seen_emergencies = link.emergencies;
                state.last_known_speeds = (0, 0);
                if matches!(state.phase, SafetyPhase::Active | SafetyPhase::WatchdogTripped) {
                    state.phase = SafetyPhase::Idle;
                }
                true
            } else {
                false
            }
        };
        if emergency {
            warn!("Firmware watchdog stopped the motors");
            self.publish(SafetyEvent::FirmwareEmergency);
            events.push(SafetyEvent::FirmwareEmergency);
        }

        if !link.connected && self.phase() != SafetyPhase::LinkDown {
            let cause = match link.last_error {
                Some(kind) => format!("{:?}", kind),
                None => "link closed".to_string(),
            };
            self.enter_link_down(cause.clone());
            events.push(SafetyEvent::LinkDown { cause });
        }

        // Backstop for the edge-triggered stop on last disconnect
        let orphaned = {
            let state = lock(&self.state);
            state.connected_clients.is_empty() && state.is_moving()
        };
        if orphaned {
            warn!("Motors moving with no client attached, stopping");
            if self.force_stop().await.is_ok() {
                events.push(SafetyEvent::NoClients);
            }
        }

        if let Some(event) = self.check_watchdog(now).await {
            events.push(event);
        }
        events
    }

    /// Reopen the link; leaves `LinkDown` only on success
    pub async fn reconnect(&self) -> Result<(), CommandError> {
        let driver = Arc::clone(&self.driver);
        if let Err(e) = task::spawn_blocking(move || driver.reconnect()).await? {
            self.enter_link_down(e.to_string());
            return Err(CommandError::Link(e));
        }

        {
            let mut state = lock(&self.state);
            state.phase = SafetyPhase::Idle;
            state.last_known_speeds = (0, 0);
            state.seen_emergencies = 0;
        }
        info!("Motor link restored");
        self.publish(SafetyEvent::LinkRestored);
        Ok(())
    }

    pub fn status(&self) -> SystemStatus {
        let link = self.driver.status();
        let state = lock(&self.state);
        let (left, right) = state.last_known_speeds;
        SystemStatus {
            phase: state.phase,
            left,
            right,
            motion_enabled: state.phase != SafetyPhase::LinkDown
                && !state.connected_clients.is_empty(),
            degraded: state.phase == SafetyPhase::LinkDown || !link.connected,
            clients: state.connected_clients.len(),
            link: LinkSummary {
                device: link.device,
                connected: link.connected,
                last_error: link.last_error,
                last_response_ms_ago: link
                    .last_response_at
                    .map(|t| t.elapsed().as_millis() as u64),
                emergencies: link.emergencies,
            },
            last_event: state.last_event.clone(),
        }
    }

    fn admit(&self, session: &str) -> Result<(), CommandError> {
        let state = lock(&self.state);
        if !state.connected_clients.contains(session) {
            return Err(CommandError::UnknownSession(session.to_string()));
        }
        if state.phase == SafetyPhase::LinkDown {
            return Err(CommandError::LinkDown);
        }
        Ok(())
    }

    fn enter_link_down(&self, cause: String) {
        {
            let mut state = lock(&self.state);
            if state.phase == SafetyPhase::LinkDown {
                return;
            }
            state.phase = SafetyPhase::LinkDown;
            state.last_known_speeds = (0, 0);
        }
        warn!("Motor link down: {}", cause);
        self.publish(SafetyEvent::LinkDown { cause });
    }

    fn publish(&self, event: SafetyEvent) {
        debug!("Safety event: {:?}", event);
        lock(&self.state).last_event = Some(event.clone());
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::Firmware;
    use crate::link::{SimConnector, SimControls};
    use crate::sessions::SessionMonitor;
    use std::time::Duration;

    fn setup() -> (Arc<MotorSafetyCoordinator>, SimConnector, SimControls) {
        setup_with_firmware(Firmware::new(Instant::now()))
    }

    fn setup_with_firmware(
        firmware: Firmware,
    ) -> (Arc<MotorSafetyCoordinator>, SimConnector, SimControls) {
        let connector = SimConnector::new(firmware);
        let controls = connector.controls();
        let driver =
            CommandChannel::open(Box::new(connector.clone()), Duration::from_millis(200)).unwrap();
        let coordinator = MotorSafetyCoordinator::new(Arc::new(driver), SafetyTimings::default());
        (Arc::new(coordinator), connector, controls)
    }

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[tokio::test]
    async fn test_drive_then_watchdog_trip() {
        let (coordinator, connector, _) = setup();
        coordinator.attach_session("a");

        coordinator.command("a", MotorCommand::new(100, 100)).await.unwrap();
        let status = coordinator.status();
        assert_eq!((status.left, status.right), (100, 100));
        assert_eq!(status.phase, SafetyPhase::Active);

        let event = coordinator.check_watchdog(Instant::now() + secs(1.6)).await;
        assert!(matches!(event, Some(SafetyEvent::WatchdogTripped { .. })));

        let status = coordinator.status();
        assert_eq!((status.left, status.right), (0, 0));
        assert_eq!(status.phase, SafetyPhase::Idle);
        assert_eq!(connector.firmware_speeds(), (0, 0));
    }

    #[tokio::test]
    async fn test_watchdog_stops_exactly_once() {
        let (coordinator, _, controls) = setup();
        coordinator.attach_session("a");
        coordinator.command("a", MotorCommand::new(80, 80)).await.unwrap();
        let stops_before = controls.count_written("STOP");

        let base = Instant::now();
        assert!(coordinator.check_watchdog(base + secs(1.6)).await.is_some());
        assert!(coordinator.check_watchdog(base + secs(2.1)).await.is_none());
        assert!(coordinator.check_watchdog(base + secs(5.0)).await.is_none());
        coordinator.tick(base + secs(6.0)).await;

        assert_eq!(controls.count_written("STOP"), stops_before + 1);
    }

    #[tokio::test]
    async fn test_fresh_heartbeat_does_not_trip() {
        let (coordinator, _, _) = setup();
        coordinator.attach_session("a");
        coordinator.command("a", MotorCommand::new(60, 60)).await.unwrap();
        assert!(coordinator.check_watchdog(Instant::now() + secs(1.0)).await.is_none());
        assert_eq!(coordinator.phase(), SafetyPhase::Active);
    }

    #[tokio::test]
    async fn test_repeated_identical_command_refreshes_heartbeat() {
        let (coordinator, _, _) = setup();
        coordinator.attach_session("a");
        coordinator.command("a", MotorCommand::new(60, 60)).await.unwrap();
        let first = coordinator.safety_state().last_heartbeat_at;

        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.command("a", MotorCommand::new(60, 60)).await.unwrap();
        let second = coordinator.safety_state().last_heartbeat_at;
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_idle_never_trips() {
        let (coordinator, _, controls) = setup();
        coordinator.attach_session("a");
        coordinator.command("a", MotorCommand::new(0, 0)).await.unwrap();
        assert_eq!(coordinator.phase(), SafetyPhase::Idle);
        let stops = controls.count_written("STOP");
        assert!(coordinator.check_watchdog(Instant::now() + secs(10.0)).await.is_none());
        assert_eq!(controls.count_written("STOP"), stops);
    }

    #[tokio::test]
    async fn test_invalid_range_leaves_state_untouched() {
        let (coordinator, _, controls) = setup();
        coordinator.attach_session("a");
        coordinator.command("a", MotorCommand::new(40, 40)).await.unwrap();
        let before = coordinator.safety_state();
        let link_before = coordinator.status().link;
        let written = controls.written().len();

        assert!(matches!(
            coordinator.command("a", MotorCommand::new(300, 0)).await,
            Err(CommandError::InvalidRange { left: 300, right: 0 })
        ));

        let after = coordinator.safety_state();
        assert_eq!(after.last_known_speeds, before.last_known_speeds);
        assert_eq!(after.last_heartbeat_at, before.last_heartbeat_at);
        assert_eq!(after.phase, before.phase);
        assert_eq!(coordinator.status().link.connected, link_before.connected);
        assert_eq!(controls.written().len(), written);
    }

    #[tokio::test]
    async fn test_unknown_session_rejected() {
        let (coordinator, _, controls) = setup();
        let written = controls.written().len();
        assert!(matches!(
            coordinator.command("ghost", MotorCommand::new(10, 10)).await,
            Err(CommandError::UnknownSession(_))
        ));
        assert_eq!(controls.written().len(), written);
    }

    #[tokio::test]
    async fn test_last_disconnect_stops_immediately() {
        let (coordinator, connector, _) = setup();
        let monitor = SessionMonitor::new(Arc::clone(&coordinator));
        monitor.on_connect("a");
        coordinator.command("a", MotorCommand::new(120, 120)).await.unwrap();

        monitor.on_disconnect("a").await;
        assert_eq!(coordinator.phase(), SafetyPhase::Idle);
        assert_eq!(coordinator.speeds(), (0, 0));
        assert_eq!(connector.firmware_speeds(), (0, 0));
        assert_eq!(coordinator.status().last_event, Some(SafetyEvent::NoClients));
    }

    #[tokio::test]
    async fn test_non_last_disconnect_keeps_moving() {
        let (coordinator, connector, controls) = setup();
        let monitor = SessionMonitor::new(Arc::clone(&coordinator));
        monitor.on_connect("a");
        monitor.on_connect("b");

        coordinator.command("a", MotorCommand::new(50, -50)).await.unwrap();
        let stops = controls.count_written("STOP");
        monitor.on_disconnect("a").await;
        coordinator.heartbeat("b").unwrap();

        assert!(coordinator.check_watchdog(Instant::now() + secs(1.0)).await.is_none());
        assert_eq!(coordinator.speeds(), (50, -50));
        assert_eq!(connector.firmware_speeds(), (50, -50));
        assert_eq!(controls.count_written("STOP"), stops);

        // B's heartbeat lapses
        let event = coordinator.check_watchdog(Instant::now() + secs(1.6)).await;
        assert!(matches!(event, Some(SafetyEvent::WatchdogTripped { .. })));
        assert_eq!(coordinator.speeds(), (0, 0));
    }

    #[tokio::test]
    async fn test_link_failure_enters_link_down() {
        let (coordinator, _, controls) = setup();
        let mut events = coordinator.subscribe();
        coordinator.attach_session("a");
        coordinator.command("a", MotorCommand::new(100, 100)).await.unwrap();

        controls.set_mute(true);
        assert!(matches!(
            coordinator.command("a", MotorCommand::new(110, 110)).await,
            Err(CommandError::Link(LinkError::LinkFailure { .. }))
        ));
        assert_eq!(coordinator.phase(), SafetyPhase::LinkDown);
        let status = coordinator.status();
        assert!(status.degraded);
        assert!(!status.motion_enabled);
        assert_eq!((status.left, status.right), (0, 0));
        assert!(matches!(events.recv().await, Ok(SafetyEvent::LinkDown { .. })));

        // New speeds refused, stop accepted as a no-op
        assert!(matches!(
            coordinator.command("a", MotorCommand::new(10, 10)).await,
            Err(CommandError::LinkDown)
        ));
        coordinator.operator_stop(Some("a".into())).await.unwrap();
        coordinator.operator_stop(None).await.unwrap();
        assert_eq!(coordinator.phase(), SafetyPhase::LinkDown);

        controls.set_mute(false);
        coordinator.reconnect().await.unwrap();
        assert_eq!(coordinator.phase(), SafetyPhase::Idle);
        coordinator.command("a", MotorCommand::new(10, 10)).await.unwrap();
        assert_eq!(coordinator.phase(), SafetyPhase::Active);
    }

    #[tokio::test]
    async fn test_reconnect_missing_device_stays_down() {
        let (coordinator, _, controls) = setup();
        controls.set_unplugged(true);
        assert!(matches!(
            coordinator.reconnect().await,
            Err(CommandError::Link(LinkError::DeviceNotFound { .. }))
        ));
        coordinator.tick(Instant::now()).await;
        assert_eq!(coordinator.phase(), SafetyPhase::LinkDown);
    }

    #[tokio::test]
    async fn test_watchdog_event_broadcast() {
        let (coordinator, _, _) = setup();
        let mut events = coordinator.subscribe();
        coordinator.attach_session("a");
        coordinator.command("a", MotorCommand::new(30, 30)).await.unwrap();
        coordinator.tick(Instant::now() + secs(2.0)).await;
        assert!(matches!(
            events.recv().await,
            Ok(SafetyEvent::WatchdogTripped { .. })
        ));
    }

    #[tokio::test]
    async fn test_firmware_emergency_reflected_in_status() {
        let firmware = Firmware::with_watchdog(Instant::now(), Duration::from_millis(30));
        let (coordinator, _, _) = setup_with_firmware(firmware);
        coordinator.attach_session("a");
        coordinator.command("a", MotorCommand::new(100, 100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let events = coordinator.tick(Instant::now()).await;
        assert!(events.contains(&SafetyEvent::FirmwareEmergency));
        assert_eq!(coordinator.speeds(), (0, 0));
        assert_eq!(coordinator.phase(), SafetyPhase::Idle);
        assert_eq!(coordinator.status().link.emergencies, 1);
    }

    #[tokio::test]
    async fn test_tick_stops_orphaned_motion() {
        let (coordinator, connector, _) = setup();
        coordinator.attach_session("a");
        coordinator.command("a", MotorCommand::new(70, 70)).await.unwrap();
        // Detach without going through the monitor
        coordinator.detach_session("a");

        let events = coordinator.tick(Instant::now()).await;
        assert!(events.contains(&SafetyEvent::NoClients));
        assert_eq!(connector.firmware_speeds(), (0, 0));
    }

    #[tokio::test]
    async fn test_lights_refresh_heartbeat() {
        let (coordinator, _, controls) = setup();
        coordinator.attach_session("a");
        coordinator.command("a", MotorCommand::new(40, 40)).await.unwrap();
        let first = coordinator.safety_state().last_heartbeat_at;
        tokio::time::sleep(Duration::from_millis(20)).await;

        coordinator
            .set_lights("a", LightPosition::Back, true)
            .await
            .unwrap();
        assert!(coordinator.safety_state().last_heartbeat_at > first);
        assert_eq!(controls.count_written("LIGHT BACK ON"), 1);
    }

    #[tokio::test]
    async fn test_stale_stop_result_keeps_watchdog_armed() {
        let (coordinator, connector, _) = setup();
        coordinator.attach_session("a");
        coordinator
            .command("a", MotorCommand::new(100, 100))
            .await
            .unwrap();

        // The stop goes out first, but a newer command is applied before it
        let StopOutcome::Stopped { seq } = coordinator.driver.stop().unwrap() else {
            panic!("link unexpectedly down");
        };
        coordinator
            .command("a", MotorCommand::new(80, 80))
            .await
            .unwrap();
        lock(&coordinator.state).apply_stop(seq);

        assert_eq!(coordinator.speeds(), (80, 80));
        assert_eq!(coordinator.phase(), SafetyPhase::Active);

        let event = coordinator.check_watchdog(Instant::now() + secs(10.0)).await;
        assert!(matches!(event, Some(SafetyEvent::WatchdogTripped { .. })));
        assert_eq!(coordinator.speeds(), (0, 0));
        assert_eq!(connector.firmware_speeds(), (0, 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_commands_stops_and_watchdog_agree() {
        let (coordinator, connector, controls) = setup();
        controls.set_reply_delay(Duration::from_millis(3));
        coordinator.attach_session("a");

        let mut tasks = task::JoinSet::new();
        for i in 0..20 {
            let c = Arc::clone(&coordinator);
            tasks.spawn(async move {
                let speed = 50 + i;
                let _ = c.command("a", MotorCommand::new(speed, -speed)).await;
            });
            let c = Arc::clone(&coordinator);
            tasks.spawn(async move {
                // Always stale, so it trips whenever the phase is Active
                c.check_watchdog(Instant::now() + secs(10.0)).await;
            });
            if i % 5 == 0 {
                let c = Arc::clone(&coordinator);
                tasks.spawn(async move {
                    let _ = c.operator_stop(None).await;
                });
            }
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        let state = coordinator.safety_state();
        assert_ne!(state.phase, SafetyPhase::LinkDown);
        assert_eq!(state.last_known_speeds, connector.firmware_speeds());
        if state.is_moving() {
            assert_eq!(state.phase, SafetyPhase::Active);
            assert!(coordinator.check_watchdog(Instant::now() + secs(10.0)).await.is_some());
        } else {
            assert_eq!(state.phase, SafetyPhase::Idle);
        }
        assert_eq!(connector.firmware_speeds(), (0, 0));
    }

    #[tokio::test]
    async fn test_self_test_sweeps_and_ends_stopped() {
        let (coordinator, connector, controls) = setup();
        let mut events = coordinator.subscribe();
        coordinator.attach_session("a");

        coordinator
            .self_test("a", Duration::from_millis(10))
            .await
            .unwrap();

        let written = controls.written();
        let pwm: Vec<&str> = written
            .iter()
            .map(String::as_str)
            .filter(|l| l.starts_with("PWM"))
            .collect();
        assert_eq!(
            pwm,
            vec!["PWM 100 100", "PWM -100 -100", "PWM -100 100", "PWM 100 -100"]
        );
        assert_eq!(written.last().map(String::as_str), Some("STOP"));
        assert_eq!(connector.firmware_speeds(), (0, 0));
        assert_eq!(coordinator.phase(), SafetyPhase::Idle);
        assert_eq!(
            events.recv().await.unwrap(),
            SafetyEvent::SelfTestFinished { passed: true }
        );
    }

    #[tokio::test]
    async fn test_self_test_aborts_on_operator_stop() {
        let (coordinator, connector, controls) = setup();
        coordinator.attach_session("a");

        let sweep = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.self_test("a", Duration::from_millis(150)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.operator_stop(Some("b".into())).await.unwrap();

        assert!(matches!(sweep.await.unwrap(), Err(CommandError::Preempted)));
        let pwm = controls
            .written()
            .iter()
            .filter(|l| l.starts_with("PWM"))
            .count();
        assert_eq!(pwm, 1);
        assert_eq!(controls.written().last().map(String::as_str), Some("STOP"));
        assert_eq!(connector.firmware_speeds(), (0, 0));
        assert_eq!(
            coordinator.status().last_event,
            Some(SafetyEvent::SelfTestFinished { passed: false })
        );
    }

    #[tokio::test]
    async fn test_self_test_needs_attached_session() {
        let (coordinator, _, controls) = setup();
        assert!(matches!(
            coordinator.self_test("ghost", Duration::from_millis(10)).await,
            Err(CommandError::UnknownSession(_))
        ));
        assert!(!controls.written().iter().any(|l| l.starts_with("PWM")));
    }

    #[tokio::test]
    async fn test_firmware_status_agrees_with_applied_speeds() {
        let (coordinator, _, controls) = setup();
        coordinator.attach_session("a");
        coordinator
            .command("a", MotorCommand::new(30, -30))
            .await
            .unwrap();
        let stops = controls.count_written("STOP");

        let firmware = coordinator.firmware_status().await.unwrap();
        assert_eq!((firmware.left, firmware.right), (30, -30));
        assert_eq!(firmware.watchdog_timeout_ms, 2000);
        assert_eq!(controls.count_written("STOP"), stops);
        assert_eq!(coordinator.phase(), SafetyPhase::Active);
    }

    #[tokio::test]
    async fn test_firmware_status_mismatch_stops() {
        let firmware = Firmware::with_watchdog(Instant::now(), Duration::from_millis(30));
        let (coordinator, connector, _) = setup_with_firmware(firmware);
        coordinator.attach_session("a");
        coordinator
            .command("a", MotorCommand::new(100, 100))
            .await
            .unwrap();
        // The device zeroes itself before anything upstream notices
        tokio::time::sleep(Duration::from_millis(60)).await;

        let firmware = coordinator.firmware_status().await.unwrap();
        assert_eq!((firmware.left, firmware.right), (0, 0));
        assert_eq!(coordinator.speeds(), (0, 0));
        assert_eq!(coordinator.phase(), SafetyPhase::Idle);
        assert_eq!(connector.firmware_speeds(), (0, 0));
        assert_eq!(
            coordinator.status().last_event,
            Some(SafetyEvent::FirmwareMismatch { left: 0, right: 0 })
        );
    }

    #[tokio::test]
    async fn test_firmware_status_refused_while_link_down() {
        let (coordinator, _, controls) = setup();
        controls.set_unplugged(true);
        let _ = coordinator.reconnect().await;
        assert!(matches!(
            coordinator.firmware_status().await,
            Err(CommandError::LinkDown)
        ));
    }
}
