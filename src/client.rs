// Client-side safety wiring
//
// Turns raw input signals into drive/stop actions. Every signal that means
// the operator may have lost control (key release, focus or visibility loss,
// teardown, transport loss) produces an immediate stop, without waiting for
// the backend watchdog. While a movement key stays held the current command
// is re-emitted every `resend` interval; that re-emission is the heartbeat
// the backend depends on.

use std::time::{Duration, Instant};

use crate::config::MAX_SPEED;
use crate::messages::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientInput {
    KeyDown(Direction),
    KeyUp(Direction),
    VisibilityLost,
    FocusLost,
    /// Page/app teardown
    Unload,
    /// The control channel dropped
    TransportLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAction {
    Drive { left: i32, right: i32 },
    /// `blocking` asks for a synchronous request that completes before
    /// teardown continues; otherwise fire-and-forget
    Stop { blocking: bool },
}

#[derive(Debug, Clone, Copy)]
struct Held {
    direction: Direction,
    last_sent: Instant,
    last_seen: Instant,
}

#[derive(Debug, Clone)]
pub struct ClientSafety {
    speed: i32,
    resend: Duration,
    // Treat a key as released if it isn't reported again within this window.
    // For inputs that never report releases.
    hold_grace: Option<Duration>,
    held: Option<Held>,
}

impl ClientSafety {
    pub fn new(speed: i32, resend: Duration) -> Self {
        Self {
            speed: speed.clamp(0, MAX_SPEED as i32),
            resend,
            hold_grace: None,
            held: None,
        }
    }

    pub fn with_hold_grace(mut self, grace: Duration) -> Self {
        self.hold_grace = Some(grace);
        self
    }

    pub fn speed(&self) -> i32 {
        self.speed
    }

    /// Takes effect on the next emission
    pub fn set_speed(&mut self, speed: i32) {
        self.speed = speed.clamp(0, MAX_SPEED as i32);
    }

    pub fn held(&self) -> Option<Direction> {
        self.held.map(|h| h.direction)
    }

    fn drive(&self, direction: Direction) -> ClientAction {
        let (left, right) = direction.speeds(self.speed);
        ClientAction::Drive { left, right }
    }

    fn release(&mut self, blocking: bool) -> ClientAction {
        self.held = None;
        ClientAction::Stop { blocking }
    }

    pub fn handle(&mut self, input: ClientInput, now: Instant) -> Option<ClientAction> {
        match input {
            ClientInput::KeyDown(Direction::Stop) => Some(self.release(false)),
            ClientInput::KeyDown(direction) => match self.held.as_mut() {
                // Auto-repeat of the held key; resend timing is handled by poll()
                Some(held) if held.direction == direction => {
                    held.last_seen = now;
                    None
                }
                _ => {
                    self.held = Some(Held {
                        direction,
                        last_sent: now,
                        last_seen: now,
                    });
                    Some(self.drive(direction))
                }
            },
            ClientInput::KeyUp(_) => Some(self.release(false)),
            ClientInput::VisibilityLost | ClientInput::FocusLost | ClientInput::TransportLost => {
                Some(self.release(false))
            }
            ClientInput::Unload => Some(self.release(true)),
        }
    }

    /// Call regularly; emits the heartbeat resend or a synthesized release
    pub fn poll(&mut self, now: Instant) -> Option<ClientAction> {
        let held = self.held?;

        if let Some(grace) = self.hold_grace {
            if now.saturating_duration_since(held.last_seen) > grace {
                return Some(self.release(false));
            }
        }

        if now.saturating_duration_since(held.last_sent) >= self.resend {
            if let Some(h) = self.held.as_mut() {
                h.last_sent = now;
            }
            return Some(self.drive(held.direction));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESEND: Duration = Duration::from_millis(500);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_press_drives_immediately() {
        let t0 = Instant::now();
        let mut client = ClientSafety::new(150, RESEND);
        assert_eq!(
            client.handle(ClientInput::KeyDown(Direction::Forward), t0),
            Some(ClientAction::Drive {
                left: 150,
                right: 150
            })
        );
        assert_eq!(client.held(), Some(Direction::Forward));
    }

    #[test]
    fn test_held_key_resends_every_interval() {
        let t0 = Instant::now();
        let mut client = ClientSafety::new(100, RESEND);
        client.handle(ClientInput::KeyDown(Direction::Left), t0);

        assert_eq!(client.poll(t0 + ms(200)), None);
        assert_eq!(
            client.poll(t0 + ms(500)),
            Some(ClientAction::Drive {
                left: -100,
                right: 100
            })
        );
        assert_eq!(client.poll(t0 + ms(700)), None);
        assert!(client.poll(t0 + ms(1000)).is_some());
    }

    #[test]
    fn test_auto_repeat_does_not_flood() {
        let t0 = Instant::now();
        let mut client = ClientSafety::new(100, RESEND);
        client.handle(ClientInput::KeyDown(Direction::Forward), t0);
        for i in 1..10 {
            assert_eq!(
                client.handle(ClientInput::KeyDown(Direction::Forward), t0 + ms(i * 30)),
                None
            );
        }
    }

    #[test]
    fn test_every_loss_signal_stops() {
        let t0 = Instant::now();
        for signal in [
            ClientInput::KeyUp(Direction::Forward),
            ClientInput::VisibilityLost,
            ClientInput::FocusLost,
            ClientInput::TransportLost,
        ] {
            let mut client = ClientSafety::new(100, RESEND);
            client.handle(ClientInput::KeyDown(Direction::Forward), t0);
            assert_eq!(
                client.handle(signal, t0),
                Some(ClientAction::Stop { blocking: false }),
                "{:?} must stop",
                signal
            );
            assert_eq!(client.held(), None);
            assert_eq!(client.poll(t0 + ms(2000)), None);
        }
    }

    #[test]
    fn test_unload_stop_is_blocking() {
        let mut client = ClientSafety::new(100, RESEND);
        assert_eq!(
            client.handle(ClientInput::Unload, Instant::now()),
            Some(ClientAction::Stop { blocking: true })
        );
    }

    #[test]
    fn test_stop_emitted_even_when_idle() {
        let mut client = ClientSafety::new(100, RESEND);
        assert_eq!(
            client.handle(ClientInput::FocusLost, Instant::now()),
            Some(ClientAction::Stop { blocking: false })
        );
    }

    #[test]
    fn test_direction_change_sends_at_once() {
        let t0 = Instant::now();
        let mut client = ClientSafety::new(80, RESEND);
        client.handle(ClientInput::KeyDown(Direction::Forward), t0);
        assert_eq!(
            client.handle(ClientInput::KeyDown(Direction::Right), t0 + ms(100)),
            Some(ClientAction::Drive {
                left: 80,
                right: -80
            })
        );
    }

    #[test]
    fn test_hold_grace_synthesizes_release() {
        let t0 = Instant::now();
        let mut client = ClientSafety::new(100, RESEND).with_hold_grace(ms(600));
        client.handle(ClientInput::KeyDown(Direction::Backward), t0);
        client.handle(ClientInput::KeyDown(Direction::Backward), t0 + ms(400));

        assert!(matches!(
            client.poll(t0 + ms(500)),
            Some(ClientAction::Drive { .. })
        ));
        assert_eq!(
            client.poll(t0 + ms(1100)),
            Some(ClientAction::Stop { blocking: false })
        );
        assert_eq!(client.held(), None);
    }

    #[test]
    fn test_speed_clamped() {
        let mut client = ClientSafety::new(400, RESEND);
        assert_eq!(client.speed(), 255);
        client.set_speed(-5);
        assert_eq!(client.speed(), 0);
    }
}
