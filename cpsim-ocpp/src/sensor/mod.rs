//! Sensor sources
//!
//! Per-port (voltage, current) samples come either from a framed ASCII sensor
//! on a serial line or from the manual source that synthesizes them from the
//! power requested for each port.

pub mod frame;
pub mod manual;
pub mod serial;

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::config::SensorConfig;

pub use frame::{FramedSensor, SensorLink};
pub use manual::ManualSource;
pub use serial::open_serial;

/// Sensor failures. A failed read leaves the previous values unused for that cycle.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("no start marker within {0:?}")]
    StartTimeout(Duration),

    #[error("no end marker within {0:?}")]
    EndTimeout(Duration),

    #[error("empty frame")]
    EmptyFrame,

    #[error("sensor stream closed")]
    Closed,

    #[error("sensor I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open serial port {path}: {reason}")]
    Open { path: String, reason: String },
}

/// One electrical sample for a port
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sample {
    pub voltage: f64,
    pub current: f64,
}

impl Sample {
    pub fn new(voltage: f64, current: f64) -> Self {
        Self { voltage, current }
    }

    pub fn power(&self) -> f64 {
        self.voltage * self.current
    }
}

/// What the station currently asks of a port
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PortDemand {
    pub charging_active: bool,
    pub manual_power: f64,
}

/// Samples of one read cycle, indexed by port (port 1 first)
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    /// Decoded from a sensor frame
    Framed(Vec<Sample>),
    /// Produced by the manual source
    Synthetic(Vec<Sample>),
}

impl Reading {
    pub fn samples(&self) -> &[Sample] {
        match self {
            Reading::Framed(samples) | Reading::Synthetic(samples) => samples,
        }
    }

    pub fn is_framed(&self) -> bool {
        matches!(self, Reading::Framed(_))
    }
}

/// Power attributed to a port: zero unless charging, and zero below the noise floor
pub fn port_power(sample: &Sample, charging_active: bool, noise_floor: f64) -> f64 {
    if !charging_active {
        return 0.0;
    }
    let watts = sample.power().round();
    if watts < noise_floor {
        0.0
    } else {
        watts
    }
}

/// Sensor strategy selected at startup
pub enum SensorSource {
    Framed(FramedSensor),
    Manual(ManualSource),
}

impl SensorSource {
    /// Framed sensor on the configured serial device, or the manual source
    /// when none is configured or it cannot be opened
    pub fn from_config(config: &SensorConfig) -> Self {
        let manual = || SensorSource::Manual(ManualSource::new(config.nominal_voltage, config.jitter));

        let Some(path) = config.serial_port.as_deref() else {
            return manual();
        };

        match open_serial(path, config.baud_rate, config.frame_timeout) {
            Ok(sensor) => SensorSource::Framed(sensor),
            Err(e) => {
                warn!("{}; switching to manual mode", e);
                manual()
            }
        }
    }

    /// Read one cycle of samples for `demand.len()` ports
    pub async fn read(&mut self, demand: &[PortDemand]) -> Result<Reading, SensorError> {
        match self {
            SensorSource::Framed(sensor) => sensor.read(demand.len()).await.map(Reading::Framed),
            SensorSource::Manual(source) => Ok(Reading::Synthetic(source.samples(demand))),
        }
    }

    /// Switch power to a port on or off. The manual source has nothing to switch.
    pub async fn set_power(&mut self, port: u32, enable: bool) -> Result<(), SensorError> {
        match self {
            SensorSource::Framed(sensor) => sensor.set_power(port, enable).await,
            SensorSource::Manual(_) => Ok(()),
        }
    }

    pub fn is_framed(&self) -> bool {
        matches!(self, SensorSource::Framed(_))
    }
}
