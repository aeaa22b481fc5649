//! Configuration for the charge point simulator
//!
//! Combines settings for the OCPP link, the sensor source and the station loop.

use std::time::Duration;

use crate::ocpp::queue::RetryPolicy;
use crate::ocpp::transport::build_ocpp_url;

/// Complete simulator configuration
#[derive(Debug, Clone, Default)]
pub struct SimulatorConfig {
    pub ocpp: OcppConfig,
    pub sensor: SensorConfig,
    pub station: StationConfig,
}

/// CSMS link and station identity
#[derive(Debug, Clone)]
pub struct OcppConfig {
    /// Base URL; the station id is appended as the last path segment
    pub csms_url: String,

    pub station_id: String,

    /// Reported in BootNotification as `vendorName` / `model`
    pub vendor: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,

    /// How long to wait for a correlated reply
    pub reply_timeout: Duration,

    /// Retries after the first attempt
    pub max_retries: u32,

    /// Pause between attempts
    pub retry_delay: Duration,

    /// Bound on the Authorize round trip
    pub authorize_timeout: Duration,

    /// Price per Wh until the CSMS sends one
    pub default_price: f64,

    /// idToken carried in TransactionEvents
    pub id_token: String,
}

/// Sensor source configuration
#[derive(Debug, Clone)]
pub struct SensorConfig {
    /// Serial device of the framed sensor; `None` selects the manual source
    pub serial_port: Option<String>,

    pub baud_rate: u32,

    /// Timeout for each phase of a frame read
    pub frame_timeout: Duration,

    /// Voltage reported by the synthetic source
    pub nominal_voltage: f64,

    /// Voltage above which a cable counts as connected
    pub cable_threshold: f64,

    /// Amplitude of the synthetic jitter in watts
    pub jitter: f64,

    /// Substitute jittered synthetic samples when a frame read fails
    pub fallback_on_invalid: bool,
}

/// Station loop configuration
#[derive(Debug, Clone)]
pub struct StationConfig {
    pub port_count: u32,

    /// Period of the main loop
    pub poll_interval: Duration,

    /// Spacing of Updated + MeterValues while charging
    pub report_interval: Duration,

    /// Heartbeat period until BootNotification supplies one
    pub heartbeat_interval: Duration,

    /// Bound on the wait for a settlement after Ended
    pub settlement_wait: Duration,

    /// Power below this many watts counts as zero
    pub noise_floor: f64,
}

impl Default for OcppConfig {
    fn default() -> Self {
        Self {
            csms_url: "ws://localhost:8080/ocpp".to_string(),
            station_id: "station-001".to_string(),
            vendor: "Quarterback".to_string(),
            model: "R1".to_string(),
            serial_number: None,
            firmware_version: None,
            reply_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            authorize_timeout: Duration::from_secs(5),
            default_price: 10.0,
            id_token: "token001".to_string(),
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            serial_port: None,
            baud_rate: 2400,
            frame_timeout: Duration::from_secs(1),
            nominal_voltage: 220.0,
            cable_threshold: 50.0,
            jitter: 200.0,
            fallback_on_invalid: true,
        }
    }
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            port_count: 3,
            poll_interval: Duration::from_millis(500),
            report_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(60),
            settlement_wait: Duration::from_secs(3),
            noise_floor: 100.0,
        }
    }
}

impl OcppConfig {
    /// Full WebSocket URL including the station id
    pub fn url(&self) -> String {
        build_ocpp_url(&self.csms_url, &self.station_id)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            reply_timeout: self.reply_timeout,
        }
    }
}

impl SimulatorConfig {
    /// Defaults everywhere except the station id and CSMS URL
    pub fn new(station_id: impl Into<String>, csms_url: impl Into<String>) -> Self {
        Self {
            ocpp: OcppConfig {
                csms_url: csms_url.into(),
                station_id: station_id.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_vendor(mut self, vendor: &str, model: &str) -> Self {
        vendor.clone_into(&mut self.ocpp.vendor);
        model.clone_into(&mut self.ocpp.model);
        self
    }

    pub fn with_serial(mut self, serial: &str) -> Self {
        self.ocpp.serial_number = Some(serial.to_owned());
        self
    }

    pub fn with_firmware(mut self, version: &str) -> Self {
        self.ocpp.firmware_version = Some(version.to_owned());
        self
    }

    /// Outbound queue retries after the first attempt
    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.ocpp.max_retries = max_retries;
        self.ocpp.retry_delay = retry_delay;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.ocpp.reply_timeout = timeout;
        self
    }

    /// Read samples from a framed sensor on this serial device
    pub fn with_serial_sensor(mut self, path: impl Into<String>, baud_rate: u32) -> Self {
        self.sensor.serial_port = Some(path.into());
        self.sensor.baud_rate = baud_rate;
        self
    }

    pub fn with_ports(mut self, count: u32) -> Self {
        self.station.port_count = count;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.station.poll_interval = interval;
        self
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.station.report_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.station.heartbeat_interval = interval;
        self
    }

    pub fn with_settlement_wait(mut self, wait: Duration) -> Self {
        self.station.settlement_wait = wait;
        self
    }
}
