//! Per-port transaction state machine
//!
//! ```text
//! AVAILABLE --start--> PENDING_START --power>0--> CHARGING --power=0 / stop--> AVAILABLE
//!     any  --ChangeAvailability(Inoperative)--> UNAVAILABLE (ends CHARGING first)
//! ```
//!
//! Transitions return [`PortEffect`]s; the orchestrator turns them into OCPP
//! requests and sensor commands.

use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::ocpp::types::{ConnectorStatus, StoppedReason, TriggerReason};

/// Rejected port requests
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("unknown port {0}")]
    UnknownPort(u32),

    #[error("port {0} is unavailable")]
    Unavailable(u32),

    #[error("port {0} already has a transaction")]
    AlreadyStarted(u32),

    #[error("port {0} is not charging")]
    NotCharging(u32),
}

/// Why a transaction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Power fell to zero
    EvDisconnected,
    /// Stop from the local operator
    Local,
    /// RequestStopTransaction from the CSMS
    Remote,
    /// ChangeAvailability(Inoperative) from the CSMS
    Unavailable,
}

impl StopReason {
    pub fn trigger(self) -> TriggerReason {
        match self {
            StopReason::EvDisconnected => TriggerReason::EVDisconnected,
            StopReason::Local => TriggerReason::StopAuthorized,
            StopReason::Remote => TriggerReason::RemoteStop,
            StopReason::Unavailable => TriggerReason::Deauthorized,
        }
    }

    pub fn stopped_reason(self) -> StoppedReason {
        match self {
            StopReason::EvDisconnected => StoppedReason::EVDisconnected,
            StopReason::Local => StoppedReason::Local,
            StopReason::Remote => StoppedReason::Remote,
            StopReason::Unavailable => StoppedReason::Other,
        }
    }
}

/// Outbound work produced by a transition
#[derive(Debug, Clone, PartialEq)]
pub enum PortEffect {
    Status(ConnectorStatus),
    Started {
        transaction_id: u32,
        seq_no: u32,
        power: f64,
    },
    Updated {
        transaction_id: u32,
        seq_no: u32,
        power: f64,
    },
    MeterValues {
        power: f64,
    },
    Ended {
        transaction_id: u32,
        seq_no: u32,
        power: f64,
        reason: StopReason,
    },
    EnablePower,
    CutPower,
}

/// Process-wide transaction id allocator
#[derive(Debug)]
pub struct TransactionIds {
    next: Mutex<u32>,
}

impl Default for TransactionIds {
    fn default() -> Self {
        Self { next: Mutex::new(1) }
    }
}

impl TransactionIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next id; never returns the same id twice
    pub fn allocate(&self) -> u32 {
        let mut next = self.next.lock();
        let id = *next;
        *next = next.saturating_add(1);
        id
    }

    /// Account for an id the CSMS has seen so it is never allocated again
    pub fn observe_server_id(&self, id: u32) {
        let mut next = self.next.lock();
        if id >= *next {
            *next = id.saturating_add(1);
            debug!("Transaction counter advanced to {}", *next);
        }
    }

    pub fn peek(&self) -> u32 {
        *self.next.lock()
    }
}

/// One physical charging position
#[derive(Debug, Clone)]
pub struct Port {
    id: u32,
    connector_status: ConnectorStatus,
    cable_connected: bool,
    charging_active: bool,
    pending_start: bool,
    transaction_id: Option<u32>,
    sequence_number: u32,
    last_reported_power: f64,
    manual_power: f64,
    last_report_at: Option<Instant>,
    report_interval: Duration,
}

impl Port {
    pub fn new(id: u32, report_interval: Duration) -> Self {
        Self {
            id,
            connector_status: ConnectorStatus::Available,
            cable_connected: false,
            charging_active: false,
            pending_start: false,
            transaction_id: None,
            sequence_number: 1,
            last_reported_power: 0.0,
            manual_power: 0.0,
            last_report_at: None,
            report_interval,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn connector_status(&self) -> ConnectorStatus {
        self.connector_status
    }

    pub fn cable_connected(&self) -> bool {
        self.cable_connected
    }

    pub fn charging_active(&self) -> bool {
        self.charging_active
    }

    pub fn pending_start(&self) -> bool {
        self.pending_start
    }

    pub fn transaction_id(&self) -> Option<u32> {
        self.transaction_id
    }

    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    pub fn last_reported_power(&self) -> f64 {
        self.last_reported_power
    }

    pub fn manual_power(&self) -> f64 {
        self.manual_power
    }

    /// Command charging at `power` watts; the transaction starts once power is seen
    pub fn request_start(&mut self, power: f64) -> Result<Vec<PortEffect>, PortError> {
        if self.connector_status == ConnectorStatus::Unavailable {
            return Err(PortError::Unavailable(self.id));
        }
        if self.charging_active {
            info!("Port {}: start ignored, already started", self.id);
            return Err(PortError::AlreadyStarted(self.id));
        }

        self.charging_active = true;
        self.pending_start = true;
        self.manual_power = power;
        info!("Port {}: start requested at {} W", self.id, power);

        Ok(vec![PortEffect::EnablePower])
    }

    /// Advance on a measured power. `power` is already floored (below the noise floor means 0).
    pub fn observe_power(
        &mut self,
        power: f64,
        now: Instant,
        ids: &TransactionIds,
    ) -> Vec<PortEffect> {
        if self.pending_start {
            if power <= 0.0 {
                return Vec::new();
            }

            let transaction_id = ids.allocate();
            self.pending_start = false;
            self.transaction_id = Some(transaction_id);
            self.sequence_number = 1;
            self.connector_status = ConnectorStatus::Occupied;
            self.last_reported_power = power;
            self.last_report_at = Some(now);
            info!("Port {}: transaction {} started", self.id, transaction_id);

            return vec![
                PortEffect::Status(ConnectorStatus::Occupied),
                PortEffect::Started {
                    transaction_id,
                    seq_no: self.sequence_number,
                    power,
                },
            ];
        }

        let Some(transaction_id) = self.transaction_id else {
            return Vec::new();
        };

        if power <= 0.0 {
            return self.end(StopReason::EvDisconnected, ConnectorStatus::Available);
        }

        self.last_reported_power = power;

        let due = self
            .last_report_at
            .map_or(true, |at| now.duration_since(at) >= self.report_interval);
        if !due {
            return Vec::new();
        }

        self.last_report_at = Some(now);
        self.sequence_number += 1;

        vec![
            PortEffect::Updated {
                transaction_id,
                seq_no: self.sequence_number,
                power,
            },
            PortEffect::MeterValues { power },
        ]
    }

    /// Stop charging. Ends the transaction, or cancels a start that never saw power.
    pub fn request_stop(&mut self, reason: StopReason) -> Result<Vec<PortEffect>, PortError> {
        if self.transaction_id.is_some() {
            return Ok(self.end(reason, ConnectorStatus::Available));
        }

        if self.pending_start {
            self.pending_start = false;
            self.charging_active = false;
            self.manual_power = 0.0;
            info!("Port {}: pending start cancelled", self.id);
            return Ok(vec![PortEffect::CutPower]);
        }

        Err(PortError::NotCharging(self.id))
    }

    /// Apply ChangeAvailability. Going inoperative ends any transaction first.
    pub fn set_availability(&mut self, operative: bool) -> Vec<PortEffect> {
        if operative {
            if self.connector_status != ConnectorStatus::Unavailable {
                return Vec::new();
            }
            self.connector_status = ConnectorStatus::Available;
            info!("Port {}: operative", self.id);
            return vec![PortEffect::Status(ConnectorStatus::Available)];
        }

        if self.connector_status == ConnectorStatus::Unavailable {
            return Vec::new();
        }

        info!("Port {}: inoperative", self.id);
        if self.transaction_id.is_some() {
            return self.end(StopReason::Unavailable, ConnectorStatus::Unavailable);
        }

        let mut effects = Vec::new();
        if self.pending_start {
            self.pending_start = false;
            self.charging_active = false;
            self.manual_power = 0.0;
            effects.push(PortEffect::CutPower);
        }
        self.connector_status = ConnectorStatus::Unavailable;
        effects.push(PortEffect::Status(ConnectorStatus::Unavailable));
        effects
    }

    /// Cable detection from a framed voltage sample.
    /// A newly connected cable on a port that is not charging gets its power cut.
    pub fn observe_voltage(&mut self, voltage: f64, threshold: f64) -> Vec<PortEffect> {
        let connected = voltage > threshold;
        let mut effects = Vec::new();

        if connected && !self.cable_connected {
            info!("Port {}: cable connected", self.id);
            if !self.charging_active {
                effects.push(PortEffect::CutPower);
            }
        } else if !connected && self.cable_connected {
            info!("Port {}: cable disconnected", self.id);
        }

        self.cable_connected = connected;
        effects
    }

    fn end(&mut self, reason: StopReason, status: ConnectorStatus) -> Vec<PortEffect> {
        let Some(transaction_id) = self.transaction_id.take() else {
            return Vec::new();
        };

        self.sequence_number += 1;
        let seq_no = self.sequence_number;
        let power = self.last_reported_power;

        self.charging_active = false;
        self.pending_start = false;
        self.manual_power = 0.0;
        self.last_report_at = None;
        self.last_reported_power = 0.0;
        self.connector_status = status;
        info!(
            "Port {}: transaction {} ended ({:?})",
            self.id, transaction_id, reason
        );

        vec![
            PortEffect::CutPower,
            PortEffect::Ended {
                transaction_id,
                seq_no,
                power,
                reason,
            },
            PortEffect::Status(status),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: Duration = Duration::from_secs(1);

    fn charging_port(ids: &TransactionIds, now: Instant) -> Port {
        let mut port = Port::new(1, REPORT);
        port.request_start(3000.0).unwrap();
        port.observe_power(3000.0, now, ids);
        port
    }

    #[test]
    fn test_start_waits_for_power() {
        let ids = TransactionIds::new();
        let now = Instant::now();
        let mut port = Port::new(1, REPORT);

        assert_eq!(port.request_start(3000.0).unwrap(), vec![PortEffect::EnablePower]);
        assert!(port.pending_start());
        assert_eq!(port.connector_status(), ConnectorStatus::Available);

        assert!(port.observe_power(0.0, now, &ids).is_empty());
        assert!(port.pending_start());

        let effects = port.observe_power(2992.0, now, &ids);
        assert_eq!(
            effects,
            vec![
                PortEffect::Status(ConnectorStatus::Occupied),
                PortEffect::Started {
                    transaction_id: 1,
                    seq_no: 1,
                    power: 2992.0
                },
            ]
        );
        assert_eq!(port.transaction_id(), Some(1));
        assert_eq!(port.connector_status(), ConnectorStatus::Occupied);
    }

    #[test]
    fn test_second_start_rejected() {
        let ids = TransactionIds::new();
        let mut port = charging_port(&ids, Instant::now());
        assert_eq!(port.request_start(1000.0), Err(PortError::AlreadyStarted(1)));
        assert_eq!(port.transaction_id(), Some(1));
    }

    #[test]
    fn test_updates_spaced_by_report_interval() {
        let ids = TransactionIds::new();
        let now = Instant::now();
        let mut port = charging_port(&ids, now);

        assert!(port
            .observe_power(3000.0, now + Duration::from_millis(500), &ids)
            .is_empty());

        let effects = port.observe_power(3100.0, now + Duration::from_secs(1), &ids);
        assert_eq!(
            effects,
            vec![
                PortEffect::Updated {
                    transaction_id: 1,
                    seq_no: 2,
                    power: 3100.0
                },
                PortEffect::MeterValues { power: 3100.0 },
            ]
        );
    }

    #[test]
    fn test_power_drop_ends_once() {
        let ids = TransactionIds::new();
        let now = Instant::now();
        let mut port = charging_port(&ids, now);
        port.observe_power(2500.0, now + Duration::from_secs(1), &ids);

        let effects = port.observe_power(0.0, now + Duration::from_secs(2), &ids);
        assert_eq!(
            effects,
            vec![
                PortEffect::CutPower,
                PortEffect::Ended {
                    transaction_id: 1,
                    seq_no: 3,
                    power: 2500.0,
                    reason: StopReason::EvDisconnected
                },
                PortEffect::Status(ConnectorStatus::Available),
            ]
        );
        assert_eq!(port.transaction_id(), None);
        assert!(!port.charging_active());

        assert!(port
            .observe_power(0.0, now + Duration::from_secs(3), &ids)
            .is_empty());
        assert!(port
            .observe_power(3000.0, now + Duration::from_secs(4), &ids)
            .is_empty());
    }

    #[test]
    fn test_stop() {
        let ids = TransactionIds::new();
        let mut port = charging_port(&ids, Instant::now());

        let effects = port.request_stop(StopReason::Local).unwrap();
        assert!(matches!(
            effects[1],
            PortEffect::Ended {
                reason: StopReason::Local,
                power,
                ..
            } if power == 3000.0
        ));
        assert_eq!(port.request_stop(StopReason::Local), Err(PortError::NotCharging(1)));
    }

    #[test]
    fn test_stop_cancels_pending_start() {
        let mut port = Port::new(2, REPORT);
        port.request_start(2000.0).unwrap();
        assert_eq!(port.request_stop(StopReason::Local).unwrap(), vec![PortEffect::CutPower]);
        assert!(!port.charging_active());
    }

    #[test]
    fn test_inoperative_stops_and_blocks_start() {
        let ids = TransactionIds::new();
        let mut port = charging_port(&ids, Instant::now());

        let effects = port.set_availability(false);
        assert!(matches!(
            effects[1],
            PortEffect::Ended {
                reason: StopReason::Unavailable,
                ..
            }
        ));
        assert_eq!(effects[2], PortEffect::Status(ConnectorStatus::Unavailable));
        assert_eq!(port.connector_status(), ConnectorStatus::Unavailable);

        assert_eq!(port.request_start(3000.0), Err(PortError::Unavailable(1)));

        assert_eq!(
            port.set_availability(true),
            vec![PortEffect::Status(ConnectorStatus::Available)]
        );
        assert!(port.request_start(3000.0).is_ok());
    }

    #[test]
    fn test_sequence_resets_on_new_transaction() {
        let ids = TransactionIds::new();
        let now = Instant::now();
        let mut port = charging_port(&ids, now);
        port.observe_power(3000.0, now + Duration::from_secs(1), &ids);
        port.request_stop(StopReason::Local).unwrap();

        port.request_start(3000.0).unwrap();
        let effects = port.observe_power(3000.0, now + Duration::from_secs(2), &ids);
        assert_eq!(
            effects[1],
            PortEffect::Started {
                transaction_id: 2,
                seq_no: 1,
                power: 3000.0
            }
        );
    }

    #[test]
    fn test_cable_detection() {
        let mut port = Port::new(1, REPORT);
        assert_eq!(port.observe_voltage(220.0, 50.0), vec![PortEffect::CutPower]);
        assert!(port.cable_connected());
        assert!(port.observe_voltage(221.0, 50.0).is_empty());
        assert!(port.observe_voltage(10.0, 50.0).is_empty());
        assert!(!port.cable_connected());

        port.request_start(3000.0).unwrap();
        assert!(port.observe_voltage(220.0, 50.0).is_empty());
    }

    #[test]
    fn test_transaction_ids() {
        let ids = TransactionIds::new();
        assert_eq!(ids.allocate(), 1);
        assert_eq!(ids.allocate(), 2);

        ids.observe_server_id(7);
        assert_eq!(ids.allocate(), 8);

        // Never moves backwards
        ids.observe_server_id(3);
        assert_eq!(ids.allocate(), 9);
    }
}
