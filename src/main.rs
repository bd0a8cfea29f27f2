use clap::Parser;
use std::time::{Duration, Instant};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use rover_safety_runtime::config::{BAUD_RATE, CLIENT_RESEND, MOTOR_PORT, SafetyTimings};
use rover_safety_runtime::driver::CommandChannel;
use rover_safety_runtime::firmware::Firmware;
use rover_safety_runtime::link::{Connector, SerialConnector, SimConnector};
use rover_safety_runtime::runtime::AccessToken;

#[derive(Parser, Debug)]
#[command(about = "Motor safety runtime for the rover drive base")]
struct Args {
    /// Serial device of the motor controller
    #[arg(long, default_value = MOTOR_PORT)]
    port: String,

    #[arg(long, default_value_t = BAUD_RATE)]
    baud: u32,

    /// Run against the in-process firmware model instead of hardware
    #[arg(long)]
    simulate: bool,

    /// Client resend interval; the backend and firmware timeouts derive from it
    #[arg(long, default_value_t = CLIENT_RESEND.as_millis() as u64, value_parser = clap::value_parser!(u64).range(50..))]
    resend_ms: u64,

    /// Shared secret clients must present for motion and control requests
    #[arg(long)]
    token: Option<String>,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init(); // installs the subscriber globally

    let args = Args::parse();
    let timings = SafetyTimings::from_resend(Duration::from_millis(args.resend_ms));

    let connector: Box<dyn Connector> = if args.simulate {
        warn!("Simulation mode: no hardware will move");
        Box::new(SimConnector::new(Firmware::with_watchdog(
            Instant::now(),
            timings.firmware_timeout,
        )))
    } else {
        Box::new(SerialConnector::new(args.port, args.baud))
    };
    let driver = CommandChannel::new(connector, timings.wire_timeout);

    if let Err(e) = rover_safety_runtime::runtime::run(driver, timings, AccessToken::new(args.token)).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
