//! Notifications from the station to its front end

use crate::ocpp::types::ConnectorStatus;

/// Receives everything the station reports. Implementations must not block.
pub trait StationObserver: Send + Sync {
    /// Human-readable activity line
    fn on_log(&self, text: &str);

    /// Connector status changed
    fn on_status(&self, port: u32, status: ConnectorStatus);

    /// Power measured on a port this cycle
    fn on_power(&self, port: u32, watts: f64);

    /// Amount owed for a finished transaction; `None` when the CSMS sent none in time
    fn on_settlement(&self, port: u32, amount: Option<f64>);

    /// Unit price changed
    fn on_price(&self, _price_per_wh: f64) {}
}
