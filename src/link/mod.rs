// Physical link to the motor controller
//
// Provides:
// - Line-oriented transport abstraction used by the command channel
// - Serial implementation for the real device
// - Simulated implementation backed by the firmware model

pub mod serial;
pub mod sim;

use std::io;
use std::time::Duration;

pub use serial::{SerialConnector, SerialLink};
pub use sim::{SimConnector, SimControls, SimulatedLink};

/// A half-duplex, newline-delimited byte channel.
pub trait LineTransport: Send {
    /// Write one line; `line` must already end with `\n`
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Read the next non-empty line without its terminator.
    ///
    /// Returns an error of kind [`io::ErrorKind::TimedOut`] if no complete
    /// line arrives within `timeout`.
    fn read_line(&mut self, timeout: Duration) -> io::Result<String>;
}

/// Opens a fresh transport to the device
pub trait Connector: Send + Sync {
    /// Device path or label, for logs and errors
    fn device(&self) -> &str;

    fn connect(&self) -> Result<Box<dyn LineTransport>, ConnectError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Device not found: {path}")]
    DeviceNotFound { path: String },

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
