//! OCPP 2.0.1 client
//!
//! Ties the protocol pieces together:
//! - [`Transport`] for the WebSocket channel
//! - [`Correlator`] for request/response matching
//! - [`OutboundQueue`] for serialized delivery with retry
//! - the dispatcher for CSMS-initiated calls

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::correlator::{Correlator, Inbound};
use super::dispatcher::{run_dispatcher, RemoteControl};
use super::messages::{Call, OcppError, OcppMessage};
use super::pricing::PriceBoard;
use super::queue::{DeliveryOutcome, OutboundQueue};
use super::transport::{Dialer, Transport, WebSocketDialer};
use super::types::{AuthorizationStatus, AuthorizeResponse, IdToken};
use crate::config::OcppConfig;

/// OCPP WebSocket client
pub struct OcppClient {
    config: OcppConfig,
    transport: Arc<Transport>,
    correlator: Arc<Correlator>,
    queue: OutboundQueue,
    prices: Arc<PriceBoard>,
    cancel: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl OcppClient {
    /// Create a client over any channel dialer
    pub fn new(config: OcppConfig, dialer: Arc<dyn Dialer>, cancel: CancellationToken) -> Self {
        let prices = Arc::new(PriceBoard::with_price(config.default_price));
        let transport = Arc::new(Transport::new(dialer));
        let correlator = Arc::new(Correlator::new(prices.clone()));
        let queue = OutboundQueue::new(
            transport.clone(),
            correlator.clone(),
            config.retry_policy(),
            cancel.clone(),
        );

        Self {
            config,
            transport,
            correlator,
            queue,
            prices,
            cancel,
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Create a client connecting to the configured CSMS over WebSocket
    pub fn websocket(config: OcppConfig, cancel: CancellationToken) -> Self {
        let url = config.url();
        info!("CSMS endpoint: {}", url);
        Self::new(config, Arc::new(WebSocketDialer::new(url)), cancel)
    }

    pub fn config(&self) -> &OcppConfig {
        &self.config
    }

    pub fn prices(&self) -> &Arc<PriceBoard> {
        &self.prices
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Identifies the current channel; changes on every reconnect,
    /// including the implicit ones made by a send
    pub fn link_epoch(&self) -> u64 {
        self.transport.epoch()
    }

    /// Spawn the receive loop and the dispatcher
    pub fn start(&self, control: Arc<dyn RemoteControl>) {
        let (calls_tx, calls_rx) = mpsc::unbounded_channel();

        let receiver = tokio::spawn(receive_loop(
            self.transport.clone(),
            self.correlator.clone(),
            calls_tx,
            self.cancel.clone(),
        ));
        let dispatcher = tokio::spawn(run_dispatcher(
            calls_rx,
            control,
            self.transport.clone(),
            self.cancel.clone(),
        ));

        self.tasks.lock().extend([receiver, dispatcher]);
    }

    /// Open the channel and make sure the outbound worker runs
    pub async fn connect(&self) -> bool {
        let connected = self.transport.connect().await;
        if connected {
            self.queue.ensure_running();
        }
        connected
    }

    /// Close the channel; no implicit reconnect until [`connect`](Self::connect)
    pub async fn disconnect(&self) {
        self.transport.close().await;
    }

    /// Queue a request whose outcome is only logged
    pub fn submit(&self, call: Call) -> Result<(), OcppError> {
        self.queue.submit(call, None)
    }

    /// Queue a request and receive its final outcome.
    /// `transaction_id` attributes a settlement in the reply to that transaction.
    pub fn submit_tracked(
        &self,
        call: Call,
        transaction_id: Option<String>,
    ) -> Result<oneshot::Receiver<DeliveryOutcome>, OcppError> {
        self.queue.submit_tracked(call, transaction_id)
    }

    /// Authorize an idToken with the CSMS
    pub async fn authorize(&self, id_token: &str) -> Result<AuthorizationStatus, OcppError> {
        let call = Call::authorize(IdToken::central(id_token))?;
        let outcome = self.submit_tracked(call, None)?;

        let outcome = tokio::time::timeout(self.config.authorize_timeout, outcome)
            .await
            .map_err(|_| OcppError::Timeout)?
            .map_err(|_| OcppError::ConnectionClosed)?;

        match outcome {
            DeliveryOutcome::Acknowledged(result) => {
                let response: AuthorizeResponse = result.parse_payload()?;
                info!("Authorize {}: {:?}", id_token, response.id_token_info.status);
                Ok(response.id_token_info.status)
            }
            DeliveryOutcome::Rejected { code, description } => Err(OcppError::RemoteError {
                code,
                description,
                details: serde_json::Value::Null,
            }),
            DeliveryOutcome::Abandoned => Err(OcppError::Timeout),
        }
    }

    /// Cancel background work and close the channel
    pub async fn shutdown(&self) {
        info!("Shutting down OCPP client");
        self.cancel.cancel();
        self.correlator.abandon_all();
        self.transport.close().await;

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                debug!("Background task ended abnormally: {}", e);
            }
        }
    }
}

async fn receive_loop(
    transport: Arc<Transport>,
    correlator: Arc<Correlator>,
    calls: mpsc::UnboundedSender<Call>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = transport.receive() => frame,
        };

        let text = match frame {
            Ok(text) => text,
            Err(e) => {
                debug!("Receive loop: {}", e);
                continue;
            }
        };

        match correlator.on_frame(&text) {
            Some(Inbound::Call(call)) => {
                if calls.send(call).is_err() {
                    break;
                }
            }
            Some(Inbound::Refuse(error)) => {
                let reply = OcppMessage::CallError(error).to_text();
                match reply {
                    Ok(text) => {
                        if let Err(e) = transport.send(text).await {
                            warn!("Failed to send CALLERROR: {}", e);
                        }
                    }
                    Err(e) => warn!("Failed to encode CALLERROR: {}", e),
                }
            }
            None => {}
        }
    }

    debug!("Receive loop stopped");
}
