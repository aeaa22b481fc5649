//! Command hand-off into the station loop
//!
//! [`StationHandle`] is the only way in: front ends (on any thread) and the
//! OCPP dispatcher push [`ControlCommand`]s, and the station loop applies them
//! between ticks.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use super::port::PortError;
use crate::ocpp::dispatcher::{RemoteControl, StopTarget};
use crate::ocpp::messages::OcppError;
use crate::ocpp::types::{AuthorizationStatus, GenericStatus};
use crate::ocpp::OcppClient;

/// Commands applied by the station loop
#[derive(Debug)]
pub enum ControlCommand {
    Start {
        port: u32,
        power: f64,
        reply: Option<oneshot::Sender<Result<(), PortError>>>,
    },
    Stop {
        port: u32,
        reply: Option<oneshot::Sender<Result<(), PortError>>>,
    },
    Connect,
    Disconnect,
    ChangeAvailability {
        port: Option<u32>,
        operative: bool,
        reply: oneshot::Sender<GenericStatus>,
    },
    RemoteStop {
        target: StopTarget,
        reply: oneshot::Sender<GenericStatus>,
    },
    Shutdown,
}

/// Cloneable handle for driving a running station
#[derive(Clone)]
pub struct StationHandle {
    commands: mpsc::UnboundedSender<ControlCommand>,
    client: Arc<OcppClient>,
}

impl StationHandle {
    pub(crate) fn new(commands: mpsc::UnboundedSender<ControlCommand>, client: Arc<OcppClient>) -> Self {
        Self { commands, client }
    }

    /// Start charging `port` at `power` watts
    pub fn start(&self, port: u32, power: f64) {
        self.send(ControlCommand::Start {
            port,
            power,
            reply: None,
        });
    }

    /// Stop charging `port`
    pub fn stop(&self, port: u32) {
        self.send(ControlCommand::Stop { port, reply: None });
    }

    /// Start and report whether the port accepted it
    pub async fn request_start(&self, port: u32, power: f64) -> Result<(), PortError> {
        let (tx, rx) = oneshot::channel();
        self.send(ControlCommand::Start {
            port,
            power,
            reply: Some(tx),
        });
        rx.await.unwrap_or(Err(PortError::UnknownPort(port)))
    }

    /// Stop and report whether there was anything to stop
    pub async fn request_stop(&self, port: u32) -> Result<(), PortError> {
        let (tx, rx) = oneshot::channel();
        self.send(ControlCommand::Stop {
            port,
            reply: Some(tx),
        });
        rx.await.unwrap_or(Err(PortError::UnknownPort(port)))
    }

    pub fn connect(&self) {
        self.send(ControlCommand::Connect);
    }

    pub fn disconnect(&self) {
        self.send(ControlCommand::Disconnect);
    }

    pub fn shutdown(&self) {
        self.send(ControlCommand::Shutdown);
    }

    /// Check an idToken with the CSMS
    pub async fn authorize(&self, id_token: &str) -> Result<AuthorizationStatus, OcppError> {
        self.client.authorize(id_token).await
    }

    fn send(&self, command: ControlCommand) {
        if self.commands.send(command).is_err() {
            warn!("Station loop is not running; command dropped");
        }
    }
}

#[async_trait]
impl RemoteControl for StationHandle {
    async fn change_availability(&self, port: Option<u32>, operative: bool) -> GenericStatus {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::ChangeAvailability {
            port,
            operative,
            reply,
        });
        rx.await.unwrap_or(GenericStatus::Rejected)
    }

    async fn remote_stop(&self, target: StopTarget) -> GenericStatus {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::RemoteStop { target, reply });
        rx.await.unwrap_or(GenericStatus::Rejected)
    }
}
