//! # Charge Point Simulator Core
//!
//! OCPP 2.0.1 charge point simulator: drives per-port charging transactions
//! from measured (or synthetic) power and reports them to a CSMS.
//!
//! ## Architecture
//!
//! ```text
//!  Sensor source ──► Station loop ──► Port state machines
//!  (framed serial        │                    │ effects
//!   or manual)           ▼                    ▼
//!                  OutboundQueue (one in flight, bounded retry)
//!                        │
//!                        ▼
//!                    Transport ◄──► CSMS (WebSocket, ocpp2.0.1)
//!                        │
//!                        ▼
//!                   Correlator ──► replies by message id
//!                        └──────► Dispatcher ──► StationHandle (ChangeAvailability,
//!                                                RequestStopTransaction)
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use cpsim_ocpp::{OcppClient, SensorSource, SimulatorConfig, Station, StationObserver};
//! use cpsim_ocpp::ocpp::ConnectorStatus;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Print;
//!
//! impl StationObserver for Print {
//!     fn on_log(&self, text: &str) { println!("{}", text); }
//!     fn on_status(&self, port: u32, status: ConnectorStatus) { println!("{}: {}", port, status); }
//!     fn on_power(&self, _port: u32, _watts: f64) {}
//!     fn on_settlement(&self, port: u32, amount: Option<f64>) { println!("{}: {:?}", port, amount); }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SimulatorConfig::new("station-001", "ws://localhost:8080/ocpp");
//!     let cancel = CancellationToken::new();
//!     let client = Arc::new(OcppClient::websocket(config.ocpp.clone(), cancel.clone()));
//!     let sensor = SensorSource::from_config(&config.sensor);
//!
//!     let station = Station::new(config, client, sensor, Arc::new(Print), cancel);
//!     let handle = station.handle();
//!     handle.start(1, 3000.0);
//!     station.run().await;
//! }
//! ```

pub mod config;
pub mod ocpp;
pub mod sensor;
pub mod station;
pub mod units;

pub use config::{OcppConfig, SensorConfig, SimulatorConfig, StationConfig};
pub use ocpp::{OcppClient, OcppError};
pub use sensor::{SensorError, SensorSource};
pub use station::{Station, StationHandle, StationObserver};
pub use units::{format_power, parse_power};
