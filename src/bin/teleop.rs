// Keyboard teleop: WASD move, space stop, R/F speed, L/B lights, Q quit
//
// Movement is only sent while a key is held. Releasing the key, losing
// terminal focus, losing the status stream or quitting all send a stop.
use clap::Parser;
use crossterm::{
    event::{
        self, DisableFocusChange, EnableFocusChange, Event, KeyCode, KeyEvent, KeyEventKind,
        KeyModifiers, KeyboardEnhancementFlags, PopKeyboardEnhancementFlags,
        PushKeyboardEnhancementFlags,
    },
    execute,
    terminal::{self, disable_raw_mode, enable_raw_mode},
};
use std::io::stdout;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use rover_safety_runtime::client::{ClientAction, ClientInput, ClientSafety};
use rover_safety_runtime::config::{
    CLIENT_RESEND, DEFAULT_SPEED, SESSION_PREFIX, SafetyTimings, TOPIC_CMD_DRIVE, TOPIC_CMD_STOP,
    TOPIC_STATUS,
};
use rover_safety_runtime::messages::{
    ClientEnvelope, ClientMessage, ControlRequest, Direction, RequestReply, SystemStatus,
};
use rover_safety_runtime::protocol::LightPosition;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const SPEED_STEP: i32 = 25;
// Without release events, a key counts as released after this much quiet.
// Must cover the terminal's initial auto-repeat delay.
const HOLD_GRACE_MS: u64 = 600;
const STOP_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(about = "Keyboard teleop for the rover drive base")]
struct Args {
    #[arg(long, default_value_t = DEFAULT_SPEED as i32)]
    speed: i32,

    #[arg(long, default_value_t = CLIENT_RESEND.as_millis() as u64, value_parser = clap::value_parser!(u64).range(50..))]
    resend_ms: u64,

    /// Access token, if the backend was started with one
    #[arg(long)]
    token: Option<String>,
}

struct Teleop {
    session: zenoh::Session,
    publisher: zenoh::pubsub::Publisher<'static>,
    session_id: String,
    token: Option<String>,
    front_light: bool,
    back_light: bool,
}

impl Teleop {
    async fn send(&self, message: ClientMessage) -> Result<(), BoxError> {
        let envelope = ClientEnvelope {
            session: self.session_id.clone(),
            token: self.token.clone(),
            message,
        };
        self.publisher.put(serde_json::to_string(&envelope)?).await?;
        Ok(())
    }

    /// Stop request that waits for the backend's answer
    async fn stop_blocking(&self) -> Result<(), BoxError> {
        let request = ControlRequest {
            session: Some(self.session_id.clone()),
            token: self.token.clone(),
        };
        let replies = self
            .session
            .get(TOPIC_CMD_STOP)
            .payload(serde_json::to_string(&request)?)
            .timeout(STOP_REQUEST_TIMEOUT)
            .await?;

        let mut answered = false;
        while let Ok(reply) = replies.recv_async().await {
            match reply.result() {
                Ok(sample) => {
                    let reply: RequestReply = serde_json::from_slice(&sample.payload().to_bytes())?;
                    info!("Stop acknowledged: ok={} ({})", reply.ok, reply.msg);
                    answered = true;
                }
                Err(err) => warn!("Stop request failed: {:?}", err),
            }
        }
        if !answered {
            warn!("No backend answered the stop request");
        }
        Ok(())
    }

    async fn apply(&self, action: ClientAction) -> Result<(), BoxError> {
        match action {
            ClientAction::Drive { left, right } => {
                self.send(ClientMessage::Drive { left, right }).await
            }
            ClientAction::Stop { blocking: true } => self.stop_blocking().await,
            ClientAction::Stop { blocking: false } => self.send(ClientMessage::Stop).await,
        }
    }

    async fn toggle_light(&mut self, position: LightPosition) {
        let on = match position {
            LightPosition::Front => {
                self.front_light = !self.front_light;
                self.front_light
            }
            LightPosition::Back => {
                self.back_light = !self.back_light;
                self.back_light
            }
        };
        if let Err(e) = self.send(ClientMessage::Lights { position, on }).await {
            warn!("Light command not sent: {}", e);
        }
    }
}

fn direction_for(code: KeyCode) -> Option<Direction> {
    match code {
        KeyCode::Char('w') => Some(Direction::Forward),
        KeyCode::Char('s') => Some(Direction::Backward),
        KeyCode::Char('a') => Some(Direction::Left),
        KeyCode::Char('d') => Some(Direction::Right),
        KeyCode::Char(' ') => Some(Direction::Stop),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();
    let timings = SafetyTimings::from_resend(Duration::from_millis(args.resend_ms));

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let session_id = session.zid().to_string();
    let token = session
        .liveliness()
        .declare_token(format!("{}/{}", SESSION_PREFIX, session_id))
        .await?;
    let publisher = session.declare_publisher(TOPIC_CMD_DRIVE).await?;
    let status_sub = session.declare_subscriber(TOPIC_STATUS).await?;

    let mut teleop = Teleop {
        session: session.clone(),
        publisher,
        session_id,
        token: args.token,
        front_light: false,
        back_light: false,
    };

    info!("Session: {}", teleop.session_id);
    info!("Controls: WASD=move (hold), space=stop, R/F=speed, L/B=lights, Q=quit");

    enable_raw_mode()?;
    let release_events = terminal::supports_keyboard_enhancement().unwrap_or(false);
    if release_events {
        execute!(
            stdout(),
            PushKeyboardEnhancementFlags(KeyboardEnhancementFlags::REPORT_EVENT_TYPES)
        )?;
    } else {
        info!("Terminal does not report key releases, using a {}ms hold grace", HOLD_GRACE_MS);
    }
    execute!(stdout(), EnableFocusChange)?;

    let mut client = ClientSafety::new(args.speed, timings.client_resend);
    if !release_events {
        client = client.with_hold_grace(Duration::from_millis(HOLD_GRACE_MS));
    }
    let result = run_teleop(&mut teleop, &mut client, &status_sub, timings).await;
    if let Err(e) = &result {
        // The loop bailed out before its own stop; make sure the rover halts
        warn!("Teleop loop failed ({}), stopping the rover", e);
        if let Err(e) = teleop.stop_blocking().await {
            warn!("Stop after failure not delivered: {}", e);
        }
    }

    if release_events {
        let _ = execute!(stdout(), PopKeyboardEnhancementFlags);
    }
    let _ = execute!(stdout(), DisableFocusChange);
    disable_raw_mode()?;

    token.undeclare().await?;
    session.close().await?;
    result
}

async fn run_teleop(
    teleop: &mut Teleop,
    client: &mut ClientSafety,
    status_sub: &zenoh::pubsub::Subscriber<zenoh::handlers::FifoChannelHandler<zenoh::sample::Sample>>,
    timings: SafetyTimings,
) -> Result<(), BoxError> {
    let mut last_status = Instant::now();
    let mut transport_lost = false;
    let mut last_phase = None;

    loop {
        let now = Instant::now();
        let mut input = None;

        // Poll for key with 20ms timeout
        if event::poll(Duration::from_millis(20))? {
            match event::read()? {
                Event::FocusLost => input = Some(ClientInput::FocusLost),
                Event::Key(KeyEvent {
                    code, kind, modifiers, ..
                }) => {
                    let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;
                    match code {
                        KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => {
                            input = Some(ClientInput::Unload)
                        }
                        KeyCode::Char('q') | KeyCode::Esc if pressed => {
                            input = Some(ClientInput::Unload)
                        }
                        KeyCode::Char('r') if pressed => {
                            client.set_speed(client.speed() + SPEED_STEP);
                            info!("Speed: {}", client.speed());
                        }
                        KeyCode::Char('f') if pressed => {
                            client.set_speed(client.speed() - SPEED_STEP);
                            info!("Speed: {}", client.speed());
                        }
                        KeyCode::Char('l') if pressed => {
                            teleop.toggle_light(LightPosition::Front).await
                        }
                        KeyCode::Char('b') if pressed => {
                            teleop.toggle_light(LightPosition::Back).await
                        }
                        code => {
                            if let Some(direction) = direction_for(code) {
                                input = Some(match kind {
                                    KeyEventKind::Release => ClientInput::KeyUp(direction),
                                    _ => ClientInput::KeyDown(direction),
                                });
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        // Status push doubles as the transport liveness signal
        while let Ok(Some(sample)) = status_sub.try_recv() {
            last_status = now;
            if transport_lost {
                info!("Status stream restored");
                transport_lost = false;
            }
            if let Ok(status) = serde_json::from_slice::<SystemStatus>(&sample.payload().to_bytes()) {
                if last_phase != Some(status.phase) {
                    info!("Rover phase: {:?} (link connected: {})", status.phase, status.link.connected);
                    last_phase = Some(status.phase);
                }
            }
        }
        if input.is_none()
            && !transport_lost
            && now.saturating_duration_since(last_status) > timings.heartbeat_timeout
        {
            warn!("No status from the rover, treating the transport as lost");
            transport_lost = true;
            input = Some(ClientInput::TransportLost);
        }

        let quitting = input == Some(ClientInput::Unload);
        if let Some(input) = input {
            if let Some(action) = client.handle(input, now) {
                apply_logged(teleop, action).await;
            }
        }
        if quitting {
            break;
        }

        if let Some(action) = client.poll(now) {
            apply_logged(teleop, action).await;
        }
    }

    Ok(())
}

/// A failed publish must not end the loop: the quit path still has to run
async fn apply_logged(teleop: &Teleop, action: ClientAction) {
    if let Err(e) = teleop.apply(action).await {
        warn!("{:?} not delivered: {}", action, e);
    }
}
