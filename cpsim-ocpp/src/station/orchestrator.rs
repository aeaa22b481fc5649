//! Station main loop
//!
//! Every poll interval the loop:
//! 1. re-establishes the CSMS channel if it dropped and sends BootNotification + a
//!    status per port on every channel not yet booted
//! 2. reads the sensor source, falling back to jittered samples on a failed frame
//!    when configured to; otherwise the failed cycle is skipped for the ports only
//! 3. advances each port's state machine and turns the effects into OCPP requests
//! 4. sends a heartbeat when due
//!
//! Commands from the front end and from the CSMS are applied between ticks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handle::{ControlCommand, StationHandle};
use super::observer::StationObserver;
use super::port::{Port, PortEffect, PortError, StopReason, TransactionIds};
use crate::config::SimulatorConfig;
use crate::ocpp::dispatcher::StopTarget;
use crate::ocpp::messages::{Call, OcppError};
use crate::ocpp::queue::DeliveryOutcome;
use crate::ocpp::session::{Session, SessionEvent};
use crate::ocpp::types::{
    format_transaction_id, parse_transaction_id, BootNotificationResponse, BootReason,
    ConnectorStatus, GenericStatus, IdToken, Measurand, MeterValue, RegistrationStatus,
    TransactionEventRequest, TransactionEventType, TransactionInfo, TriggerReason, EVSE,
};
use crate::ocpp::OcppClient;
use crate::sensor::{port_power, ManualSource, PortDemand, Reading, SensorSource};

/// Signal fired once an Ended event has been delivered (or given up on)
type EndedSignal = oneshot::Receiver<()>;

/// The charge point: ports, sensor and OCPP link driven by one loop
pub struct Station {
    config: SimulatorConfig,
    client: Arc<OcppClient>,
    sensor: SensorSource,
    fallback: ManualSource,
    ports: Vec<Port>,
    ids: Arc<TransactionIds>,
    session: Session,
    observer: Arc<dyn StationObserver>,
    commands: mpsc::UnboundedReceiver<ControlCommand>,
    handle: StationHandle,
    cancel: CancellationToken,
    link_enabled: bool,
    /// Channel epoch the current boot sequence was sent on
    booted_epoch: Option<u64>,
    pending_boot: Option<oneshot::Receiver<DeliveryOutcome>>,
    last_price: f64,
}

impl Station {
    pub fn new(
        config: SimulatorConfig,
        client: Arc<OcppClient>,
        sensor: SensorSource,
        observer: Arc<dyn StationObserver>,
        cancel: CancellationToken,
    ) -> Self {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let handle = StationHandle::new(commands_tx, client.clone());

        let ports = (1..=config.station.port_count)
            .map(|id| Port::new(id, config.station.report_interval))
            .collect();

        let session = Session::new(
            config.ocpp.station_id.clone(),
            config.ocpp.vendor.clone(),
            config.ocpp.model.clone(),
            config.station.heartbeat_interval,
        )
        .with_serial(config.ocpp.serial_number.clone())
        .with_firmware(config.ocpp.firmware_version.clone());

        let fallback = ManualSource::new(config.sensor.nominal_voltage, config.sensor.jitter);
        let last_price = client.prices().price_per_wh();

        Self {
            config,
            client,
            sensor,
            fallback,
            ports,
            ids: Arc::new(TransactionIds::new()),
            session,
            observer,
            commands,
            handle,
            cancel,
            link_enabled: true,
            booted_epoch: None,
            pending_boot: None,
            last_price,
        }
    }

    /// Handle for front ends; cloneable and usable from any thread
    pub fn handle(&self) -> StationHandle {
        self.handle.clone()
    }

    pub fn transaction_ids(&self) -> Arc<TransactionIds> {
        self.ids.clone()
    }

    /// Run until cancelled or shut down through the handle
    pub async fn run(mut self) {
        self.client.start(Arc::new(self.handle.clone()));
        self.log("Station started");

        let mut ticker = tokio::time::interval(self.config.station.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(command) = self.commands.recv() => self.apply_command(command).await,
                _ = ticker.tick() => self.tick().await,
            }
        }

        self.client.shutdown().await;
        self.log("Station stopped");
    }

    async fn tick(&mut self) {
        let now = Instant::now();

        if self.link_enabled && !self.ensure_link().await {
            return;
        }

        self.poll_boot(now);
        self.sync_prices();

        let demand: Vec<PortDemand> = self
            .ports
            .iter()
            .map(|p| PortDemand {
                charging_active: p.charging_active(),
                manual_power: p.manual_power(),
            })
            .collect();

        let reading = match self.sensor.read(&demand).await {
            Ok(reading) => Some(reading),
            Err(e) if self.sensor.is_framed() && self.config.sensor.fallback_on_invalid => {
                self.log(&format!("Sensor read failed ({}), using synthetic data", e));
                Some(Reading::Synthetic(self.fallback.jittered(&demand)))
            }
            Err(e) => {
                self.log(&format!("Sensor read failed: {}", e));
                None
            }
        };

        if let Some(reading) = reading {
            self.apply_reading(reading, now).await;
        }

        if self.client.is_connected() && self.session.heartbeat_due(now) {
            self.queue(Call::heartbeat());
            self.session.handle_event(SessionEvent::HeartbeatSent, now);
        }
    }

    /// Feed one set of samples through the port state machines
    async fn apply_reading(&mut self, reading: Reading, now: Instant) {
        let framed = reading.is_framed();
        for (idx, sample) in reading.samples().iter().enumerate() {
            let Some(port) = self.ports.get_mut(idx) else {
                break;
            };
            let port_id = port.id();

            let mut effects = Vec::new();
            if framed {
                effects.extend(port.observe_voltage(sample.voltage, self.config.sensor.cable_threshold));
            }

            let power = port_power(sample, port.charging_active(), self.config.station.noise_floor);
            effects.extend(port.observe_power(power, now, &self.ids));

            self.observer.on_power(port_id, power);
            self.apply_effects(port_id, effects).await;
        }
    }

    /// Reconnect if the channel dropped and boot on any channel not yet booted.
    /// Returns whether the link is up.
    async fn ensure_link(&mut self) -> bool {
        if !self.client.is_connected() {
            if self.booted_epoch.take().is_some() {
                self.pending_boot = None;
                self.session.handle_event(SessionEvent::Disconnected, Instant::now());
                self.log("Connection to CSMS lost, reconnecting");
            }

            if !self.client.connect().await {
                return false;
            }
        }

        // A send may have redialled since the last tick
        let epoch = self.client.link_epoch();
        if self.booted_epoch == Some(epoch) {
            return true;
        }
        if self.booted_epoch.is_some() {
            self.pending_boot = None;
            self.session.handle_event(SessionEvent::Disconnected, Instant::now());
            self.log("Channel to CSMS was re-established");
        }

        self.booted_epoch = Some(epoch);
        self.session.handle_event(SessionEvent::Connected, Instant::now());
        self.log("Connected to CSMS");

        self.send_boot();
        for idx in 0..self.ports.len() {
            let port = &self.ports[idx];
            let (id, status) = (port.id(), port.connector_status());
            self.queue(Call::status_notification(id as i32, 1, status));
        }

        true
    }

    fn send_boot(&mut self) {
        let call = Call::boot_notification(
            self.session.charging_station_info(),
            BootReason::PowerUp,
            Some(self.session.boot_custom_data()),
        );

        if let Some(outcome) = self.queue_tracked(call, None) {
            self.pending_boot = Some(outcome);
            self.session.handle_event(SessionEvent::BootSent, Instant::now());
        }
    }

    fn poll_boot(&mut self, now: Instant) {
        if let Some(pending) = self.pending_boot.as_mut() {
            let event = match pending.try_recv() {
                Ok(DeliveryOutcome::Acknowledged(result)) => {
                    match result.parse_payload::<BootNotificationResponse>() {
                        Ok(response) => match response.status {
                            RegistrationStatus::Accepted => SessionEvent::BootAccepted {
                                interval: response.interval,
                            },
                            RegistrationStatus::Pending => SessionEvent::BootPending {
                                interval: response.interval,
                            },
                            RegistrationStatus::Rejected => SessionEvent::BootRejected {
                                interval: response.interval,
                            },
                        },
                        Err(e) => {
                            warn!("Unreadable BootNotification response: {}", e);
                            SessionEvent::BootRejected { interval: 0 }
                        }
                    }
                }
                Ok(DeliveryOutcome::Rejected { .. }) => SessionEvent::BootRejected { interval: 0 },
                Ok(DeliveryOutcome::Abandoned) => SessionEvent::BootUnanswered,
                Err(oneshot::error::TryRecvError::Empty) => return,
                Err(oneshot::error::TryRecvError::Closed) => SessionEvent::BootUnanswered,
            };

            self.pending_boot = None;
            if let SessionEvent::BootAccepted { .. } = event {
                self.log("BootNotification accepted");
            }
            self.session.handle_event(event, now);
        }

        if self.pending_boot.is_none() && self.client.is_connected() && self.session.boot_retry_due(now) {
            info!("Retrying BootNotification");
            self.send_boot();
        }
    }

    fn sync_prices(&mut self) {
        let prices = self.client.prices();

        let price = prices.price_per_wh();
        if price != self.last_price {
            self.last_price = price;
            self.log(&format!("Price updated: {} per Wh", price));
            self.observer.on_price(price);
        }

        if let Some(n) = prices
            .last_transaction_id()
            .and_then(|label| parse_transaction_id(&label))
        {
            self.ids.observe_server_id(n);
        }
    }

    async fn apply_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::Start { port, power, reply } => {
                let result = match self.port_index(port) {
                    Some(idx) => self.ports[idx].request_start(power),
                    None => Err(PortError::UnknownPort(port)),
                };
                let result = match result {
                    Ok(effects) => {
                        self.log(&format!("Port {}: charging requested at {} W", port, power));
                        self.apply_effects(port, effects).await;
                        Ok(())
                    }
                    Err(e) => {
                        self.log(&format!("Start rejected: {}", e));
                        Err(e)
                    }
                };
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }

            ControlCommand::Stop { port, reply } => {
                let result = self.stop_port(port, StopReason::Local).await.map(|_| ());
                if let Err(e) = &result {
                    self.log(&format!("Stop rejected: {}", e));
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }

            ControlCommand::Connect => {
                self.link_enabled = true;
                if !self.ensure_link().await {
                    self.log("Connect failed, will keep retrying");
                }
            }

            ControlCommand::Disconnect => {
                self.link_enabled = false;
                self.booted_epoch = None;
                self.pending_boot = None;
                self.client.disconnect().await;
                self.session.handle_event(SessionEvent::Disconnected, Instant::now());
                self.log("Disconnected from CSMS");
            }

            ControlCommand::ChangeAvailability {
                port,
                operative,
                reply,
            } => {
                let targets: Vec<usize> = match port {
                    None => (0..self.ports.len()).collect(),
                    Some(id) => match self.port_index(id) {
                        Some(idx) => vec![idx],
                        None => {
                            self.log(&format!("ChangeAvailability for unknown port {}", id));
                            let _ = reply.send(GenericStatus::Rejected);
                            return;
                        }
                    },
                };

                let mut ended = Vec::new();
                for idx in targets {
                    let port_id = self.ports[idx].id();
                    let effects = self.ports[idx].set_availability(operative);
                    ended.extend(self.apply_effects(port_id, effects).await);
                }

                self.log(&format!(
                    "ChangeAvailability {}: {}",
                    port.map_or("all".to_string(), |p| p.to_string()),
                    if operative { "Operative" } else { "Inoperative" }
                ));
                reply_after(ended, reply, GenericStatus::Accepted);
            }

            ControlCommand::RemoteStop { target, reply } => {
                let port = match &target {
                    StopTarget::Port(id) => Some(*id),
                    StopTarget::Transaction(label) => parse_transaction_id(label).and_then(|n| {
                        self.ports
                            .iter()
                            .find(|p| p.transaction_id() == Some(n))
                            .map(|p| p.id())
                    }),
                };

                let stopped = match port {
                    Some(port) => self.stop_port(port, StopReason::Remote).await,
                    None => Err(PortError::NotCharging(0)),
                };

                match stopped {
                    Ok(ended) => {
                        self.log(&format!("Remote stop accepted: {:?}", target));
                        reply_after(ended, reply, GenericStatus::Accepted);
                    }
                    Err(e) => {
                        self.log(&format!("Remote stop rejected ({:?}): {}", target, e));
                        let _ = reply.send(GenericStatus::Rejected);
                    }
                }
            }

            ControlCommand::Shutdown => {
                self.log("Shutdown requested");
                self.cancel.cancel();
            }
        }
    }

    async fn stop_port(&mut self, port: u32, reason: StopReason) -> Result<Vec<EndedSignal>, PortError> {
        let idx = self.port_index(port).ok_or(PortError::UnknownPort(port))?;
        let effects = self.ports[idx].request_stop(reason)?;
        Ok(self.apply_effects(port, effects).await)
    }

    fn port_index(&self, port: u32) -> Option<usize> {
        self.ports.iter().position(|p| p.id() == port)
    }

    /// Turn transition effects into OCPP requests and sensor commands.
    /// Returns one signal per Ended event, fired once it has been delivered.
    async fn apply_effects(&mut self, port: u32, effects: Vec<PortEffect>) -> Vec<EndedSignal> {
        let mut ended = Vec::new();

        for effect in effects {
            match effect {
                PortEffect::Status(status) => {
                    self.observer.on_status(port, status);
                    self.queue(Call::status_notification(port as i32, 1, status));
                }

                PortEffect::Started {
                    transaction_id,
                    seq_no,
                    power,
                } => {
                    self.log(&format!(
                        "Port {}: transaction {} started ({} W)",
                        port,
                        format_transaction_id(transaction_id),
                        power
                    ));
                    let request = self.transaction_event(
                        TransactionEventType::Started,
                        TriggerReason::CablePluggedIn,
                        port,
                        transaction_id,
                        seq_no,
                        None,
                    );
                    self.queue(Call::transaction_event(request));
                }

                PortEffect::Updated {
                    transaction_id,
                    seq_no,
                    power,
                } => {
                    let request = self.transaction_event(
                        TransactionEventType::Updated,
                        TriggerReason::MeterValuePeriodic,
                        port,
                        transaction_id,
                        seq_no,
                        Some(power),
                    );
                    self.queue(Call::transaction_event(request));
                }

                PortEffect::MeterValues { power } => {
                    self.queue(Call::meter_values(
                        port as i32,
                        vec![MeterValue::power(power, Some(Measurand::PowerActiveImport))],
                    ));
                }

                PortEffect::Ended {
                    transaction_id,
                    seq_no,
                    power,
                    reason,
                } => {
                    let label = format_transaction_id(transaction_id);
                    self.log(&format!(
                        "Port {}: transaction {} ended ({:?}, last {} W)",
                        port, label, reason, power
                    ));

                    let mut request = self.transaction_event(
                        TransactionEventType::Ended,
                        reason.trigger(),
                        port,
                        transaction_id,
                        seq_no,
                        Some(power),
                    );
                    request.transaction_info.stopped_reason = Some(reason.stopped_reason());

                    let delivery = self.queue_tracked(Call::transaction_event(request), Some(label.clone()));
                    ended.push(self.settle(port, label, delivery));
                }

                PortEffect::EnablePower => self.switch_power(port, true).await,
                PortEffect::CutPower => self.switch_power(port, false).await,
            }
        }

        ended
    }

    /// Wait for the Ended delivery, then for its settlement, off the loop
    fn settle(
        &self,
        port: u32,
        label: String,
        delivery: Option<oneshot::Receiver<DeliveryOutcome>>,
    ) -> EndedSignal {
        let (delivered_tx, delivered_rx) = oneshot::channel();
        let observer = self.observer.clone();
        let prices = self.client.prices().clone();
        let wait = self.config.station.settlement_wait;

        tokio::spawn(async move {
            let acknowledged = match delivery {
                Some(delivery) => delivery.await.map_or(false, |o| o.is_acknowledged()),
                None => false,
            };
            let _ = delivered_tx.send(());

            let amount = if acknowledged {
                prices.wait_settlement(&label, wait).await
            } else {
                prices.take_settlement(&label)
            };

            match amount {
                Some(amount) => {
                    info!("Settlement for {}: {}", label, amount);
                    observer.on_log(&format!("Port {}: settlement {} for {}", port, amount, label));
                }
                None => {
                    warn!("No settlement for {} within {:?}", label, wait);
                    observer.on_log(&format!("Port {}: settlement for {} unknown", port, label));
                }
            }
            observer.on_settlement(port, amount);
        });

        delivered_rx
    }

    fn transaction_event(
        &self,
        event_type: TransactionEventType,
        trigger_reason: TriggerReason,
        port: u32,
        transaction_id: u32,
        seq_no: u32,
        power: Option<f64>,
    ) -> TransactionEventRequest {
        TransactionEventRequest {
            event_type,
            timestamp: chrono::Utc::now(),
            trigger_reason,
            seq_no,
            transaction_info: TransactionInfo {
                transaction_id: format_transaction_id(transaction_id),
                stopped_reason: None,
            },
            evse: Some(EVSE {
                id: port as i32,
                connector_id: Some(1),
            }),
            id_token: Some(IdToken::central(self.config.ocpp.id_token.clone())),
            meter_value: power.map(|watts| vec![MeterValue::power(watts, None)]),
        }
    }

    async fn switch_power(&mut self, port: u32, enable: bool) {
        if let Err(e) = self.sensor.set_power(port, enable).await {
            self.log(&format!("Port {}: power command failed: {}", port, e));
        }
    }

    /// Queue a request unless the link was switched off
    fn queue(&self, call: Result<Call, OcppError>) {
        if !self.link_enabled {
            if let Ok(call) = &call {
                debug!("Offline, not sending {}", call.action);
            }
            return;
        }

        match call.and_then(|call| self.client.submit(call)) {
            Ok(()) => {}
            Err(e) => warn!("Failed to queue request: {}", e),
        }
    }

    fn queue_tracked(
        &self,
        call: Result<Call, OcppError>,
        transaction_id: Option<String>,
    ) -> Option<oneshot::Receiver<DeliveryOutcome>> {
        if !self.link_enabled {
            return None;
        }

        match call.and_then(|call| self.client.submit_tracked(call, transaction_id)) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!("Failed to queue request: {}", e);
                None
            }
        }
    }

    fn log(&self, text: &str) {
        info!("{}", text);
        self.observer.on_log(text);
    }

    /// Connector status per port, port 1 first
    pub fn statuses(&self) -> Vec<ConnectorStatus> {
        self.ports.iter().map(|p| p.connector_status()).collect()
    }
}

/// Answer a CSMS command once every Ended it caused has gone out
fn reply_after(ended: Vec<EndedSignal>, reply: oneshot::Sender<GenericStatus>, status: GenericStatus) {
    if ended.is_empty() {
        let _ = reply.send(status);
        return;
    }

    tokio::spawn(async move {
        for signal in ended {
            let _ = signal.await;
        }
        let _ = reply.send(status);
    });
}

/// Bound used by callers that wait on a whole station shutdown
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
