//! Registration and heartbeat state
//!
//! ```text
//! Disconnected ─connect─► Connected ─boot sent─► BootPending ─Accepted─► Registered
//!                                                 │    ▲
//!                                     Rejected /  ▼    │ retry after interval
//!                                     no reply    Rejected
//! ```
//!
//! Heartbeats are only due while Registered.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::types::ChargingStationInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    /// Boot in flight, or Pending with a retry scheduled
    BootPending,
    Registered,
    /// Rejected or unanswered; a retry is scheduled
    Rejected,
}

/// Inputs to the session state machine
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    BootSent,
    BootAccepted { interval: i32 },
    BootPending { interval: i32 },
    BootRejected { interval: i32 },
    BootUnanswered,
    HeartbeatSent,
}

/// Identity reported in BootNotification
#[derive(Debug, Clone)]
struct Identity {
    station_id: String,
    vendor: String,
    model: String,
    serial_number: Option<String>,
    firmware_version: Option<String>,
}

#[derive(Debug)]
pub struct Session {
    identity: Identity,
    state: SessionState,
    heartbeat_interval: Duration,
    last_heartbeat: Option<Instant>,
    next_boot_at: Option<Instant>,
}

impl Session {
    pub fn new(
        station_id: impl Into<String>,
        vendor: impl Into<String>,
        model: impl Into<String>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            identity: Identity {
                station_id: station_id.into(),
                vendor: vendor.into(),
                model: model.into(),
                serial_number: None,
                firmware_version: None,
            },
            state: SessionState::Disconnected,
            heartbeat_interval,
            last_heartbeat: None,
            next_boot_at: None,
        }
    }

    pub fn with_serial(mut self, serial_number: Option<String>) -> Self {
        self.identity.serial_number = serial_number;
        self
    }

    pub fn with_firmware(mut self, firmware_version: Option<String>) -> Self {
        self.identity.firmware_version = firmware_version;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Apply `event`, observed at `now`
    pub fn handle_event(&mut self, event: SessionEvent, now: Instant) {
        debug!(state = ?self.state, ?event, "Session event");

        self.state = match event {
            SessionEvent::Connected => SessionState::Connected,

            SessionEvent::Disconnected => {
                self.next_boot_at = None;
                if self.state != SessionState::Disconnected {
                    warn!("Session lost");
                }
                SessionState::Disconnected
            }

            SessionEvent::BootSent => {
                self.next_boot_at = None;
                SessionState::BootPending
            }

            SessionEvent::BootAccepted { interval } => {
                if let Some(interval) = positive_secs(interval) {
                    self.heartbeat_interval = interval;
                }
                self.last_heartbeat = Some(now);
                self.next_boot_at = None;
                info!("Registered with CSMS, heartbeat every {:?}", self.heartbeat_interval);
                SessionState::Registered
            }

            SessionEvent::BootPending { interval } => {
                let delay = self.boot_delay(interval);
                self.next_boot_at = Some(now + delay);
                info!("Registration pending, booting again in {:?}", delay);
                SessionState::BootPending
            }

            SessionEvent::BootRejected { interval } => {
                let delay = self.boot_delay(interval);
                self.next_boot_at = Some(now + delay);
                warn!("Registration rejected, booting again in {:?}", delay);
                SessionState::Rejected
            }

            SessionEvent::BootUnanswered => {
                self.next_boot_at = Some(now + self.heartbeat_interval);
                warn!("BootNotification got no reply");
                SessionState::Rejected
            }

            SessionEvent::HeartbeatSent => {
                self.last_heartbeat = Some(now);
                self.state
            }
        };
    }

    /// Server interval when given, otherwise the heartbeat interval
    fn boot_delay(&self, interval: i32) -> Duration {
        positive_secs(interval).unwrap_or(self.heartbeat_interval)
    }

    pub fn heartbeat_due(&self, now: Instant) -> bool {
        self.state == SessionState::Registered
            && self
                .last_heartbeat
                .map_or(true, |last| now.duration_since(last) >= self.heartbeat_interval)
    }

    pub fn boot_retry_due(&self, now: Instant) -> bool {
        matches!(self.state, SessionState::BootPending | SessionState::Rejected)
            && self.next_boot_at.is_some_and(|at| now >= at)
    }

    pub fn charging_station_info(&self) -> ChargingStationInfo {
        let id = &self.identity;
        ChargingStationInfo {
            model: id.model.clone(),
            vendor_name: id.vendor.clone(),
            serial_number: id.serial_number.clone(),
            firmware_version: id.firmware_version.clone(),
        }
    }

    /// `customData` carried by BootNotification
    pub fn boot_custom_data(&self) -> Value {
        json!({
            "vendorId": self.identity.vendor,
            "stationId": self.identity.station_id,
        })
    }
}

fn positive_secs(interval: i32) -> Option<Duration> {
    u64::try_from(interval)
        .ok()
        .filter(|&secs| secs > 0)
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("station-001", "Quarterback", "R1", Duration::from_secs(60))
    }

    #[test]
    fn test_registration() {
        let now = Instant::now();
        let mut session = session();
        assert_eq!(session.state(), SessionState::Disconnected);

        session.handle_event(SessionEvent::Connected, now);
        assert_eq!(session.state(), SessionState::Connected);

        session.handle_event(SessionEvent::BootSent, now);
        assert_eq!(session.state(), SessionState::BootPending);
        assert!(!session.boot_retry_due(now + Duration::from_secs(600)));

        session.handle_event(SessionEvent::BootAccepted { interval: 300 }, now);
        assert_eq!(session.state(), SessionState::Registered);
        assert_eq!(session.heartbeat_interval(), Duration::from_secs(300));

        session.handle_event(SessionEvent::Disconnected, now);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.heartbeat_due(now + Duration::from_secs(600)));
    }

    #[test]
    fn test_heartbeat_only_when_registered() {
        let now = Instant::now();
        let mut session = session();
        assert!(!session.heartbeat_due(now));

        session.handle_event(SessionEvent::BootAccepted { interval: 0 }, now);
        assert_eq!(session.heartbeat_interval(), Duration::from_secs(60));
        assert!(!session.heartbeat_due(now + Duration::from_secs(59)));
        assert!(session.heartbeat_due(now + Duration::from_secs(60)));

        session.handle_event(SessionEvent::HeartbeatSent, now + Duration::from_secs(60));
        assert_eq!(session.state(), SessionState::Registered);
        assert!(!session.heartbeat_due(now + Duration::from_secs(90)));
    }

    #[test]
    fn test_boot_retry_after_server_interval() {
        let now = Instant::now();
        let mut session = session();

        session.handle_event(SessionEvent::BootRejected { interval: 30 }, now);
        assert_eq!(session.state(), SessionState::Rejected);
        assert!(!session.boot_retry_due(now + Duration::from_secs(29)));
        assert!(session.boot_retry_due(now + Duration::from_secs(30)));

        session.handle_event(SessionEvent::BootPending { interval: -5 }, now);
        assert!(!session.boot_retry_due(now + Duration::from_secs(59)));
        assert!(session.boot_retry_due(now + Duration::from_secs(60)));

        session.handle_event(SessionEvent::BootUnanswered, now);
        assert_eq!(session.state(), SessionState::Rejected);
        assert!(session.boot_retry_due(now + Duration::from_secs(60)));
    }

    #[test]
    fn test_boot_payload_parts() {
        let session = session().with_serial(Some("SN-1".into()));
        let data = session.boot_custom_data();
        assert_eq!(data["vendorId"], "Quarterback");
        assert_eq!(data["stationId"], "station-001");

        let info = session.charging_station_info();
        assert_eq!(info.vendor_name, "Quarterback");
        assert_eq!(info.serial_number.as_deref(), Some("SN-1"));
        assert!(info.firmware_version.is_none());
    }
}
