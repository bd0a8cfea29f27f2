// Runtime wiring: zenoh session channel <-> safety coordinator
//
// Each input stream runs in its own task so a slow wire operation on one
// never delays the others. The watchdog check runs on a dedicated interval
// task and is the only place the heartbeat timeout is enforced.
//
// Clients:
// - declare a liveliness token under rover/session/<id> (connect/disconnect)
// - publish ClientEnvelope JSON on rover/cmd/drive
// - query rover/cmd/stop for a synchronous stop (used during teardown)
// - query rover/cmd/reconnect, rover/cmd/self_test, rover/cmd/firmware_status
// - subscribe to rover/state/status
//
// With an access token configured, every control message and request must
// carry it. Stops are never gated.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use zenoh::query::Query;
use zenoh::sample::SampleKind;

use crate::config::{
    SafetyTimings, DEFAULT_SPEED, SELF_TEST_STEP, SESSION_PREFIX, SESSION_WILDCARD,
    TOPIC_CMD_DRIVE, TOPIC_CMD_FIRMWARE, TOPIC_CMD_RECONNECT, TOPIC_CMD_SELF_TEST,
    TOPIC_CMD_STOP, TOPIC_STATUS,
};
use crate::coordinator::{CommandError, MotorSafetyCoordinator};
use crate::driver::CommandChannel;
use crate::messages::{
    ClientEnvelope, ClientMessage, ControlRequest, Direction, MotorCommand, RequestReply,
};
use crate::sessions::SessionMonitor;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Extract the session id from a liveliness key (rover/session/<id>)
pub fn session_id_from_key(key: &str) -> Option<&str> {
    let id = key.strip_prefix(SESSION_PREFIX)?.strip_prefix('/')?;
    if id.is_empty() || id.contains('/') {
        None
    } else {
        Some(id)
    }
}

/// Shared secret required on control requests; `None` leaves them open
#[derive(Debug, Clone, Default)]
pub struct AccessToken(Option<String>);

impl AccessToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.is_empty()))
    }

    pub fn is_required(&self) -> bool {
        self.0.is_some()
    }

    pub fn check(&self, presented: Option<&str>) -> Result<(), CommandError> {
        match &self.0 {
            Some(expected) if presented != Some(expected.as_str()) => {
                Err(CommandError::Unauthorized)
            }
            _ => Ok(()),
        }
    }
}

/// Apply one client message to the coordinator
pub async fn handle_client_message(
    coordinator: &MotorSafetyCoordinator,
    access: &AccessToken,
    envelope: ClientEnvelope,
) -> Result<(), CommandError> {
    let session = envelope.session;
    match envelope.message {
        ClientMessage::Move {
            direction: Direction::Stop,
            ..
        }
        | ClientMessage::Stop => {
            coordinator.operator_stop(Some(session)).await?;
            return Ok(());
        }
        _ => access.check(envelope.token.as_deref())?,
    }

    match envelope.message {
        ClientMessage::Drive { left, right } => {
            coordinator
                .command(&session, MotorCommand::new(left, right))
                .await?;
        }
        ClientMessage::Move { direction, speed } => {
            // A magnitude; the direction carries the sign
            let speed = speed.unwrap_or(DEFAULT_SPEED as i32);
            if speed < 0 {
                return Err(CommandError::InvalidRange {
                    left: speed,
                    right: speed,
                });
            }
            let (left, right) = direction.speeds(speed);
            coordinator
                .command(&session, MotorCommand::new(left, right))
                .await?;
        }
        ClientMessage::Stop => {}
        ClientMessage::Heartbeat => coordinator.heartbeat(&session)?,
        ClientMessage::Lights { position, on } => {
            coordinator.set_lights(&session, position, on).await?;
        }
    }
    Ok(())
}

fn request_reply(
    coordinator: &MotorSafetyCoordinator,
    result: Result<(), CommandError>,
    ok_msg: &str,
) -> RequestReply {
    let (ok, msg) = match result {
        Ok(()) => (true, ok_msg.to_string()),
        Err(e) => (false, e.to_string()),
    };
    RequestReply {
        ok,
        msg,
        status: coordinator.status(),
        firmware: None,
    }
}

fn control_request(query: &Query) -> ControlRequest {
    query
        .payload()
        .and_then(|p| serde_json::from_slice::<ControlRequest>(&p.to_bytes()).ok())
        .unwrap_or_default()
}

async fn send_reply(query: &Query, reply: &RequestReply) {
    match serde_json::to_string(reply) {
        Ok(json) => {
            if let Err(e) = query.reply(query.key_expr().clone(), json).await {
                warn!("Failed to reply on {}: {}", query.key_expr(), e);
            }
        }
        Err(e) => error!("Failed to encode reply: {}", e),
    }
}

pub async fn run(
    driver: CommandChannel,
    timings: SafetyTimings,
    access: AccessToken,
) -> Result<(), BoxError> {
    let coordinator = Arc::new(MotorSafetyCoordinator::new(Arc::new(driver), timings));
    let monitor = Arc::new(SessionMonitor::new(Arc::clone(&coordinator)));

    if let Err(e) = coordinator.reconnect().await {
        warn!("Motor link unavailable at startup ({}), starting with link down", e);
    }

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers, subscribers and queryables...");
    let drive_sub = session.declare_subscriber(TOPIC_CMD_DRIVE).await?;
    let sessions_sub = session
        .liveliness()
        .declare_subscriber(SESSION_WILDCARD)
        .history(true)
        .await?;
    let stop_queryable = session.declare_queryable(TOPIC_CMD_STOP).await?;
    let reconnect_queryable = session.declare_queryable(TOPIC_CMD_RECONNECT).await?;
    let self_test_queryable = session.declare_queryable(TOPIC_CMD_SELF_TEST).await?;
    let firmware_queryable = session.declare_queryable(TOPIC_CMD_FIRMWARE).await?;
    let pub_status = session.declare_publisher(TOPIC_STATUS).await?;

    info!(
        "Runtime started: {}ms check period, {}ms heartbeat timeout, {}ms firmware timeout",
        timings.check_period.as_millis(),
        timings.heartbeat_timeout.as_millis(),
        timings.firmware_timeout.as_millis()
    );
    info!("Subscribed to: {}, {}", TOPIC_CMD_DRIVE, SESSION_WILDCARD);
    info!(
        "Serving: {}, {}, {}, {}",
        TOPIC_CMD_STOP, TOPIC_CMD_RECONNECT, TOPIC_CMD_SELF_TEST, TOPIC_CMD_FIRMWARE
    );
    if access.is_required() {
        info!("Control requests require the access token");
    } else {
        warn!("No access token configured, control requests are open");
    }
    info!("Publishing to: {}", TOPIC_STATUS);

    let mut tasks: JoinSet<()> = JoinSet::new();

    // Watchdog: the only task that trips Active -> WatchdogTripped
    {
        let coordinator = Arc::clone(&coordinator);
        tasks.spawn(async move {
            let mut tick = interval(coordinator.timings().check_period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                coordinator.tick(Instant::now()).await;
            }
        });
    }

    // Status push: periodic and on every safety event
    {
        let coordinator = Arc::clone(&coordinator);
        let mut events = coordinator.subscribe();
        tasks.spawn(async move {
            let mut tick = interval(coordinator.timings().check_period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    event = events.recv() => match event {
                        Ok(event) => info!("Safety event: {:?}", event),
                        Err(RecvError::Lagged(n)) => debug!("Status task skipped {} events", n),
                        Err(RecvError::Closed) => break,
                    },
                }

                let status = coordinator.status();
                match serde_json::to_string(&status) {
                    Ok(json) => {
                        if let Err(e) = pub_status.put(json).await {
                            warn!("Failed to publish status: {}", e);
                        }
                    }
                    Err(e) => error!("Failed to encode status: {}", e),
                }
            }
        });
    }

    // Session tracking via liveliness tokens
    {
        let monitor = Arc::clone(&monitor);
        tasks.spawn(async move {
            while let Ok(sample) = sessions_sub.recv_async().await {
                let key = sample.key_expr().as_str();
                let Some(id) = session_id_from_key(key) else {
                    debug!("Ignoring liveliness key {}", key);
                    continue;
                };
                match sample.kind() {
                    SampleKind::Put => monitor.on_connect(id),
                    SampleKind::Delete => monitor.on_disconnect(id).await,
                }
            }
        });
    }

    // Movement intents, applied in arrival order
    {
        let coordinator = Arc::clone(&coordinator);
        let access = access.clone();
        tasks.spawn(async move {
            while let Ok(sample) = drive_sub.recv_async().await {
                let payload = sample.payload().to_bytes();
                let envelope = match serde_json::from_slice::<ClientEnvelope>(&payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!("Failed to parse client message: {}", e);
                        continue;
                    }
                };
                let session = envelope.session.clone();
                match handle_client_message(&coordinator, &access, envelope).await {
                    Ok(()) => {}
                    Err(CommandError::Preempted) => debug!("Command from {} superseded by stop", session),
                    Err(e) => warn!("Command from {} refused: {}", session, e),
                }
            }
        });
    }

    // Synchronous stop
    {
        let coordinator = Arc::clone(&coordinator);
        tasks.spawn(async move {
            while let Ok(query) = stop_queryable.recv_async().await {
                let request = control_request(&query);
                info!("Stop requested by {:?}", request.session);
                let result = coordinator.operator_stop(request.session).await;
                let reply = request_reply(&coordinator, result, "Motors stopped");
                send_reply(&query, &reply).await;
            }
        });
    }

    // Reconnect
    {
        let coordinator = Arc::clone(&coordinator);
        let access = access.clone();
        tasks.spawn(async move {
            while let Ok(query) = reconnect_queryable.recv_async().await {
                let request = control_request(&query);
                info!("Reconnect requested by {:?}", request.session);
                let result = match access.check(request.token.as_deref()) {
                    Ok(()) => coordinator.reconnect().await,
                    Err(e) => Err(e),
                };
                let reply = request_reply(&coordinator, result, "Motors reconnected");
                send_reply(&query, &reply).await;
            }
        });
    }

    // Motor self-test, on behalf of an attached session
    {
        let coordinator = Arc::clone(&coordinator);
        let access = access.clone();
        tasks.spawn(async move {
            while let Ok(query) = self_test_queryable.recv_async().await {
                let request = control_request(&query);
                let result = match (access.check(request.token.as_deref()), request.session) {
                    (Err(e), _) => Err(e),
                    (Ok(()), None) => Err(CommandError::UnknownSession(String::new())),
                    (Ok(()), Some(session)) => {
                        coordinator.self_test(&session, SELF_TEST_STEP).await
                    }
                };
                let reply = request_reply(&coordinator, result, "Motor test complete");
                send_reply(&query, &reply).await;
            }
        });
    }

    // Device's own view; read-only, not gated
    {
        let coordinator = Arc::clone(&coordinator);
        tasks.spawn(async move {
            while let Ok(query) = firmware_queryable.recv_async().await {
                let (result, firmware) = match coordinator.firmware_status().await {
                    Ok(firmware) => (Ok(()), Some(firmware)),
                    Err(e) => (Err(e), None),
                };
                let mut reply = request_reply(&coordinator, result, "Firmware status");
                reply.firmware = firmware;
                send_reply(&query, &reply).await;
            }
        });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
        Some(result) = tasks.join_next() => {
            error!("Runtime task exited unexpectedly: {:?}", result);
        }
    }

    tasks.abort_all();
    // Restart must never resume motion; leave the motors stopped
    if let Err(e) = coordinator.operator_stop(None).await {
        warn!("Stop on shutdown failed: {}", e);
    }
    session.close().await?;
    Ok(())
}
