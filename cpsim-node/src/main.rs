//! Charge point simulator node - console front end
//!
//! Runs the simulated OCPP 2.0.1 charge point against a CSMS and takes
//! operator commands on stdin.
//!
//! # Usage
//!
//! ```bash
//! # Manual (synthetic) power, three ports
//! cpsim-node --station station-001 --csms-url ws://localhost:8080/ocpp
//!
//! # Framed sensor on a serial line
//! cpsim-node --station station-001 --serial-port /dev/ttyUSB0 --baud 2400
//! ```
//!
//! # Commands
//!
//! ```text
//! start <port> <power>   start charging, e.g. `start 1 3kW`
//! stop <port>            stop charging
//! connect | disconnect   toggle the CSMS link
//! auth <token>           Authorize an idToken
//! quit                   shut down
//! ```

use std::collections::HashMap;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use cpsim_ocpp::ocpp::ConnectorStatus;
use cpsim_ocpp::station::SHUTDOWN_GRACE;
use cpsim_ocpp::{
    format_power, parse_power, OcppClient, SensorSource, SimulatorConfig, Station, StationHandle,
    StationObserver,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Simulated OCPP 2.0.1 charge point
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// OCPP station ID
    #[arg(short, long, default_value = "station-001")]
    station: String,

    /// OCPP CSMS WebSocket URL (station ID is appended)
    #[arg(long, default_value = "ws://localhost:8080/ocpp")]
    csms_url: String,

    /// Number of ports (EVSEs)
    #[arg(long, default_value = "3")]
    ports: u32,

    /// Serial device of the framed power sensor (manual mode when absent)
    #[arg(long)]
    serial_port: Option<String>,

    /// Serial baud rate
    #[arg(long, default_value = "2400")]
    baud: u32,

    /// Vendor name
    #[arg(long, default_value = "Quarterback")]
    vendor: String,

    /// Model name
    #[arg(long, default_value = "R1")]
    model: String,

    /// idToken carried in transaction events
    #[arg(long, default_value = "token001")]
    id_token: String,

    /// Main loop period in milliseconds
    #[arg(long, default_value = "500")]
    poll_ms: u64,

    /// Meter reporting period in milliseconds
    #[arg(long, default_value = "1000")]
    report_ms: u64,

    /// Retries after the first send attempt
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Delay between send attempts in milliseconds
    #[arg(long, default_value = "2000")]
    retry_delay_ms: u64,

    /// Reply timeout in seconds
    #[arg(long, default_value_t = 10)]
    reply_timeout: u64,

    /// Do not substitute synthetic samples when a sensor frame is invalid
    #[arg(long)]
    no_fallback: bool,

    /// Maximum log level (trace, debug, info, warn or error)
    #[arg(short, long, default_value = "info")]
    log_level: Level,
}

/// Prints station notifications to the console
#[derive(Default)]
struct ConsoleObserver {
    last_power: Mutex<HashMap<u32, f64>>,
}

impl StationObserver for ConsoleObserver {
    fn on_log(&self, text: &str) {
        println!("  {}", text);
    }

    fn on_status(&self, port: u32, status: ConnectorStatus) {
        println!("[port {}] status {}", port, status);
    }

    fn on_power(&self, port: u32, watts: f64) {
        let previous = self.last_power.lock().insert(port, watts);
        if previous != Some(watts) {
            println!("[port {}] power {}", port, format_power(watts));
        }
    }

    fn on_settlement(&self, port: u32, amount: Option<f64>) {
        match amount {
            Some(amount) => println!("[port {}] settlement {:.2}", port, amount),
            None => println!("[port {}] settlement unknown", port),
        }
    }

    fn on_price(&self, price_per_wh: f64) {
        println!("price {} per Wh", price_per_wh);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder()
            .with_max_level(args.log_level)
            .with_target(false)
            .finish(),
    )?;

    println!("cpsim-node: OCPP 2.0.1 charge point simulator");
    println!("  station  {}", args.station);
    println!("  csms     {}", args.csms_url);
    println!("  ports    {}", args.ports);
    println!(
        "  sensor   {}",
        args.serial_port.as_deref().unwrap_or("manual")
    );
    println!();

    let mut config = SimulatorConfig::new(&args.station, &args.csms_url)
        .with_vendor(&args.vendor, &args.model)
        .with_ports(args.ports)
        .with_poll_interval(Duration::from_millis(args.poll_ms))
        .with_report_interval(Duration::from_millis(args.report_ms))
        .with_retries(args.max_retries, Duration::from_millis(args.retry_delay_ms))
        .with_reply_timeout(Duration::from_secs(args.reply_timeout));

    if let Some(path) = &args.serial_port {
        config = config.with_serial_sensor(path, args.baud);
    }
    config.ocpp.id_token = args.id_token.clone();
    config.sensor.fallback_on_invalid = !args.no_fallback;

    let cancel = CancellationToken::new();
    let client = Arc::new(OcppClient::websocket(config.ocpp.clone(), cancel.clone()));
    let sensor = SensorSource::from_config(&config.sensor);

    let station = Station::new(
        config,
        client,
        sensor,
        Arc::new(ConsoleObserver::default()),
        cancel.clone(),
    );
    let handle = station.handle();

    spawn_console(handle, tokio::runtime::Handle::current());

    info!("Starting station...");
    let mut station_task = tokio::spawn(station.run());

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Ctrl-C received, shutting down");
            cancel.cancel();
        }
        _ = cancel.cancelled() => {}
        _ = &mut station_task => return Ok(()),
    }

    if tokio::time::timeout(SHUTDOWN_GRACE, station_task).await.is_err() {
        warn!("Station did not stop within {:?}", SHUTDOWN_GRACE);
    }

    Ok(())
}

/// Read operator commands on a dedicated thread and hand them to the station
fn spawn_console(handle: StationHandle, runtime: tokio::runtime::Handle) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if !run_command(&handle, &runtime, line.trim()) {
                break;
            }
        }
    });
}

/// Returns `false` once the console should stop reading
fn run_command(handle: &StationHandle, runtime: &tokio::runtime::Handle, line: &str) -> bool {
    let parts: Vec<&str> = line.split_whitespace().collect();

    match parts.as_slice() {
        [] => {}
        ["start", port, power] => match (port.parse::<u32>(), parse_power(power)) {
            (Ok(port), Some(power)) => handle.start(port, power),
            _ => eprintln!("usage: start <port> <power>"),
        },
        ["stop", port] => match port.parse::<u32>() {
            Ok(port) => handle.stop(port),
            Err(_) => eprintln!("usage: stop <port>"),
        },
        ["connect"] => handle.connect(),
        ["disconnect"] => handle.disconnect(),
        ["auth", token] => match runtime.block_on(handle.authorize(token)) {
            Ok(status) => println!("authorize {}: {:?}", token, status),
            Err(e) => eprintln!("authorize {} failed: {}", token, e),
        },
        ["quit"] | ["exit"] => {
            handle.shutdown();
            return false;
        }
        _ => eprintln!("commands: start <port> <power> | stop <port> | connect | disconnect | auth <token> | quit"),
    }

    true
}
