// Serial link to the ESP32 motor controller
//
// Lines are ASCII terminated by '\n' (a trailing '\r' is tolerated).
// The port is opened with a short poll timeout; `read_line` keeps polling
// until its own deadline so one call is bounded by the caller's timeout.

use serialport::{self, ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{ConnectError, Connector, LineTransport};

/// Poll granularity for a single read on the port
const POLL_TIMEOUT_MS: u64 = 20;

/// Drop anything longer than this without a newline
const MAX_LINE_LEN: usize = 512;

pub struct SerialLink {
    port: Box<dyn SerialPort>,
    pending: Vec<u8>,
}

impl SerialLink {
    /// Open the device, failing fast if the path doesn't exist
    pub fn open(path: &str, baudrate: u32) -> Result<Self, ConnectError> {
        if !Path::new(path).exists() {
            return Err(ConnectError::DeviceNotFound {
                path: path.to_string(),
            });
        }

        let port = serialport::new(path, baudrate)
            .timeout(Duration::from_millis(POLL_TIMEOUT_MS))
            .open()?;

        // Discard boot chatter and anything left from a previous session
        port.clear(ClearBuffer::All)?;

        Ok(Self {
            port,
            pending: Vec::with_capacity(MAX_LINE_LEN),
        })
    }

    /// Take one complete line out of the pending buffer, if there is one
    fn take_line(&mut self) -> Option<String> {
        loop {
            let pos = self.pending.iter().position(|&b| b == b'\n')?;
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                return Some(line);
            }
        }
    }
}

impl LineTransport for SerialLink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.port.write_all(line.as_bytes())?;
        self.port.flush()
    }

    fn read_line(&mut self, timeout: Duration) -> io::Result<String> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 64];

        loop {
            if let Some(line) = self.take_line() {
                return Ok(line);
            }

            // At least one poll even with a zero timeout
            match self.port.read(&mut buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "serial port closed",
                    ));
                }
                Ok(n) => {
                    self.pending.extend_from_slice(&buf[..n]);
                    if self.pending.len() > MAX_LINE_LEN && !self.pending.contains(&b'\n') {
                        debug!("Discarding {} bytes without newline", self.pending.len());
                        self.pending.clear();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                return match self.take_line() {
                    Some(line) => Ok(line),
                    None => Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "no reply from motor controller",
                    )),
                };
            }
        }
    }
}

/// Opens [`SerialLink`]s on a fixed device path
#[derive(Debug, Clone)]
pub struct SerialConnector {
    path: String,
    baudrate: u32,
}

impl SerialConnector {
    pub fn new(path: impl Into<String>, baudrate: u32) -> Self {
        Self {
            path: path.into(),
            baudrate,
        }
    }
}

impl Connector for SerialConnector {
    fn device(&self) -> &str {
        &self.path
    }

    fn connect(&self) -> Result<Box<dyn LineTransport>, ConnectError> {
        let link = SerialLink::open(&self.path, self.baudrate)?;
        Ok(Box::new(link))
    }
}
