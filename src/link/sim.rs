// Simulated motor controller link
//
// Runs the firmware model in-process. Replies are produced synchronously when
// a line is written, so an empty outbox on read means the device stayed
// silent and the read times out immediately rather than sleeping.
//
// `SimControls` injects faults: a muted device never answers, a garbled one
// answers with noise, a slow one holds each reply back for a fixed delay, an
// unplugged one fails every operation and can't be reconnected.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{ConnectError, Connector, LineTransport};
use crate::firmware::Firmware;

pub const SIM_DEVICE: &str = "sim://esp32";

#[derive(Debug, Default)]
struct Faults {
    mute: AtomicBool,
    garble: AtomicBool,
    unplugged: AtomicBool,
    reply_delay_ms: AtomicU64,
    // Every line written to the device, in order
    written: Mutex<Vec<String>>,
}

/// Shared fault switches and write log for a simulated device
#[derive(Debug, Clone, Default)]
pub struct SimControls {
    faults: Arc<Faults>,
}

impl SimControls {
    pub fn set_mute(&self, mute: bool) {
        self.faults.mute.store(mute, Ordering::SeqCst);
    }

    pub fn set_garble(&self, garble: bool) {
        self.faults.garble.store(garble, Ordering::SeqCst);
    }

    pub fn set_unplugged(&self, unplugged: bool) {
        self.faults.unplugged.store(unplugged, Ordering::SeqCst);
    }

    /// Hold every reply back; a delay past the read timeout reads as silence
    pub fn set_reply_delay(&self, delay: Duration) {
        self.faults
            .reply_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn reply_delay(&self) -> Duration {
        Duration::from_millis(self.faults.reply_delay_ms.load(Ordering::SeqCst))
    }

    fn unplugged(&self) -> bool {
        self.faults.unplugged.load(Ordering::SeqCst)
    }

    /// Lines the device has received so far
    pub fn written(&self) -> Vec<String> {
        lock(&self.faults.written).clone()
    }

    pub fn count_written(&self, line: &str) -> usize {
        lock(&self.faults.written)
            .iter()
            .filter(|l| l.as_str() == line)
            .count()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unplugged_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged")
}

pub struct SimulatedLink {
    firmware: Arc<Mutex<Firmware>>,
    outbox: VecDeque<String>,
    controls: SimControls,
}

impl LineTransport for SimulatedLink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        if self.controls.unplugged() {
            return Err(unplugged_error());
        }
        let line = line.trim();
        lock(&self.controls.faults.written).push(line.to_string());

        let reply = {
            let mut firmware = lock(&self.firmware);
            let now = Instant::now();
            // The device's watchdog runs during silence, before this line lands
            if let Some(emergency) = firmware.poll(now) {
                self.outbox.push_back(emergency.to_line().trim().to_string());
            }
            firmware.handle_line(line, now)
        };
        if self.controls.faults.mute.load(Ordering::SeqCst) {
            debug!("Sim: muted, dropping reply to '{}'", line);
            return Ok(());
        }
        if self.controls.faults.garble.load(Ordering::SeqCst) {
            self.outbox.push_back("\u{fffd}#?garbled".to_string());
            return Ok(());
        }
        self.outbox.push_back(reply.to_line().trim().to_string());
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> io::Result<String> {
        if self.controls.unplugged() {
            return Err(unplugged_error());
        }
        let delay = self.controls.reply_delay();
        if !delay.is_zero() && !self.outbox.is_empty() {
            if delay > timeout {
                thread::sleep(timeout);
                return Err(io::Error::new(io::ErrorKind::TimedOut, "simulated device slow"));
            }
            thread::sleep(delay);
        }
        if let Some(emergency) = lock(&self.firmware).poll(Instant::now()) {
            self.outbox.push_front(emergency.to_line().trim().to_string());
        }
        self.outbox
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "simulated device silent"))
    }
}

/// Hands out [`SimulatedLink`]s sharing one firmware instance, so device
/// state survives reconnects the way real hardware does
#[derive(Clone)]
pub struct SimConnector {
    firmware: Arc<Mutex<Firmware>>,
    controls: SimControls,
}

impl SimConnector {
    pub fn new(firmware: Firmware) -> Self {
        Self {
            firmware: Arc::new(Mutex::new(firmware)),
            controls: SimControls::default(),
        }
    }

    pub fn controls(&self) -> SimControls {
        self.controls.clone()
    }

    /// Current speeds as the device sees them
    pub fn firmware_speeds(&self) -> (i16, i16) {
        lock(&self.firmware).speeds()
    }
}

impl Default for SimConnector {
    fn default() -> Self {
        Self::new(Firmware::new(Instant::now()))
    }
}

impl Connector for SimConnector {
    fn device(&self) -> &str {
        SIM_DEVICE
    }

    fn connect(&self) -> Result<Box<dyn LineTransport>, ConnectError> {
        if self.controls.unplugged() {
            return Err(ConnectError::DeviceNotFound {
                path: SIM_DEVICE.to_string(),
            });
        }
        Ok(Box::new(SimulatedLink {
            firmware: Arc::clone(&self.firmware),
            outbox: VecDeque::new(),
            controls: self.controls.clone(),
        }))
    }
}
