//! Server-initiated call handling
//!
//! ChangeAvailability and RequestStopTransaction are answered by invoking the
//! station through [`RemoteControl`] and replying directly on the transport.
//! Each call runs on its own task so the receive loop never waits on a handler.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::messages::{Action, Call, CallError, CallResult, ErrorCode, OcppError, OcppMessage};
use super::transport::Transport;
use super::types::{
    ChangeAvailabilityRequest, GenericStatus, OperationalStatus, RequestStopTransactionRequest,
    StatusInfo,
};

/// Which transaction a remote stop targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopTarget {
    /// Wire transaction id, e.g. `tx-004`
    Transaction(String),
    /// Port (EVSE) id
    Port(u32),
}

/// Station operations the CSMS may trigger
#[async_trait]
pub trait RemoteControl: Send + Sync {
    /// `port == None` addresses the whole station
    async fn change_availability(&self, port: Option<u32>, operative: bool) -> GenericStatus;

    async fn remote_stop(&self, target: StopTarget) -> GenericStatus;
}

/// Drain inbound calls until cancelled, answering each on its own task
pub async fn run_dispatcher(
    mut calls: mpsc::UnboundedReceiver<Call>,
    control: Arc<dyn RemoteControl>,
    transport: Arc<Transport>,
    cancel: CancellationToken,
) {
    loop {
        let call = tokio::select! {
            _ = cancel.cancelled() => break,
            next = calls.recv() => match next {
                Some(call) => call,
                None => break,
            },
        };

        let control = control.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            let message_id = call.message_id.clone();
            let reply = answer(control, call).await;

            match reply.to_text() {
                Ok(text) => {
                    if let Err(e) = transport.send(text).await {
                        warn!("Failed to reply to {}: {}", message_id, e);
                    }
                }
                Err(e) => warn!("Failed to encode reply to {}: {}", message_id, e),
            }
        });
    }

    debug!("Dispatcher stopped");
}

/// Build the reply for one server-initiated call
pub async fn answer(control: Arc<dyn RemoteControl>, call: Call) -> OcppMessage {
    info!("CSMS request: {} ({})", call.action, call.message_id);

    let reply = match call.action {
        Action::ChangeAvailability => change_availability(control, &call).await,
        Action::RequestStopTransaction => request_stop(control, &call).await,
        _ => {
            return OcppMessage::CallError(CallError::new(
                call.message_id,
                ErrorCode::NotSupported,
                format!("{} is not accepted by a charge point", call.action),
            ))
        }
    };

    match reply {
        Ok(result) => OcppMessage::CallResult(result),
        Err(e) => OcppMessage::CallError(CallError::new(
            call.message_id,
            ErrorCode::InternalError,
            e.to_string(),
        )),
    }
}

async fn change_availability(
    control: Arc<dyn RemoteControl>,
    call: &Call,
) -> Result<CallResult, OcppError> {
    let request: ChangeAvailabilityRequest = match call.parse_payload() {
        Ok(request) => request,
        Err(e) => {
            warn!("Malformed ChangeAvailability: {}", e);
            return CallResult::change_availability(
                call.message_id.clone(),
                GenericStatus::Rejected,
                Some(StatusInfo::reason("InvalidPayload")),
            );
        }
    };

    // EVSE 0 or no EVSE addresses the whole station
    let port = match request.evse.map(|evse| evse.id) {
        None | Some(0) => None,
        Some(id) => match u32::try_from(id) {
            Ok(id) => Some(id),
            Err(_) => {
                return CallResult::change_availability(
                    call.message_id.clone(),
                    GenericStatus::Rejected,
                    Some(StatusInfo::reason("UnknownEvse")),
                )
            }
        },
    };
    let operative = request.operational_status == OperationalStatus::Operative;

    let status = guarded(async move { control.change_availability(port, operative).await }).await;
    CallResult::change_availability(call.message_id.clone(), status, None)
}

async fn request_stop(
    control: Arc<dyn RemoteControl>,
    call: &Call,
) -> Result<CallResult, OcppError> {
    let request: RequestStopTransactionRequest = match call.parse_payload() {
        Ok(request) => request,
        Err(e) => {
            warn!("Malformed RequestStopTransaction: {}", e);
            return CallResult::request_stop_transaction(
                call.message_id.clone(),
                GenericStatus::Rejected,
                Some(StatusInfo::reason("InvalidPayload")),
            );
        }
    };

    let target = match (request.transaction_id, request.evse_id) {
        (Some(tx), _) => StopTarget::Transaction(tx),
        (None, Some(evse)) if evse > 0 => StopTarget::Port(evse as u32),
        _ => {
            return CallResult::request_stop_transaction(
                call.message_id.clone(),
                GenericStatus::Rejected,
                Some(StatusInfo::reason("NoTarget")),
            )
        }
    };

    let status = guarded(async move { control.remote_stop(target).await }).await;
    CallResult::request_stop_transaction(call.message_id.clone(), status, None)
}

/// Run a handler on its own task; a panic degrades to `Rejected`
async fn guarded<F>(handler: F) -> GenericStatus
where
    F: std::future::Future<Output = GenericStatus> + Send + 'static,
{
    match tokio::spawn(handler).await {
        Ok(status) => status,
        Err(e) => {
            warn!("Remote command handler failed: {}", e);
            GenericStatus::Rejected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        availability: Mutex<Vec<(Option<u32>, bool)>>,
        stops: Mutex<Vec<StopTarget>>,
    }

    #[async_trait]
    impl RemoteControl for Recorder {
        async fn change_availability(&self, port: Option<u32>, operative: bool) -> GenericStatus {
            self.availability.lock().push((port, operative));
            match port {
                Some(p) if p > 3 => GenericStatus::Rejected,
                _ => GenericStatus::Accepted,
            }
        }

        async fn remote_stop(&self, target: StopTarget) -> GenericStatus {
            self.stops.lock().push(target.clone());
            if target == StopTarget::Port(1) {
                GenericStatus::Accepted
            } else {
                GenericStatus::Rejected
            }
        }
    }

    struct Panicking;

    #[async_trait]
    impl RemoteControl for Panicking {
        async fn change_availability(&self, _port: Option<u32>, _operative: bool) -> GenericStatus {
            panic!("handler blew up");
        }

        async fn remote_stop(&self, _target: StopTarget) -> GenericStatus {
            panic!("handler blew up");
        }
    }

    fn call(action: Action, payload: serde_json::Value) -> Call {
        Call {
            message_id: "srv-1".to_string(),
            action,
            payload,
        }
    }

    fn status_of(reply: &OcppMessage) -> String {
        match reply {
            OcppMessage::CallResult(result) => {
                assert_eq!(result.message_id, "srv-1");
                result.payload["status"].as_str().unwrap().to_string()
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_change_availability() {
        let recorder = Arc::new(Recorder::default());
        let reply = answer(
            recorder.clone(),
            call(
                Action::ChangeAvailability,
                json!({"operationalStatus": "Inoperative", "evse": {"id": 2}}),
            ),
        )
        .await;

        assert_eq!(status_of(&reply), "Accepted");
        assert_eq!(recorder.availability.lock().as_slice(), &[(Some(2), false)]);
    }

    #[tokio::test]
    async fn test_change_availability_whole_station() {
        let recorder = Arc::new(Recorder::default());
        let reply = answer(
            recorder.clone(),
            call(Action::ChangeAvailability, json!({"operationalStatus": "Operative"})),
        )
        .await;

        assert_eq!(status_of(&reply), "Accepted");
        assert_eq!(recorder.availability.lock().as_slice(), &[(None, true)]);
    }

    #[tokio::test]
    async fn test_change_availability_unknown_port_rejected() {
        let recorder = Arc::new(Recorder::default());
        let reply = answer(
            recorder.clone(),
            call(
                Action::ChangeAvailability,
                json!({"operationalStatus": "Inoperative", "evse": {"id": 7}}),
            ),
        )
        .await;
        assert_eq!(status_of(&reply), "Rejected");
    }

    #[tokio::test]
    async fn test_malformed_payload_rejected() {
        let recorder = Arc::new(Recorder::default());
        let reply = answer(
            recorder.clone(),
            call(Action::ChangeAvailability, json!({"operationalStatus": "Sideways"})),
        )
        .await;

        assert_eq!(status_of(&reply), "Rejected");
        assert!(recorder.availability.lock().is_empty());
    }

    #[tokio::test]
    async fn test_remote_stop_targets() {
        let recorder = Arc::new(Recorder::default());

        let reply = answer(
            recorder.clone(),
            call(Action::RequestStopTransaction, json!({"evseId": 1})),
        )
        .await;
        assert_eq!(status_of(&reply), "Accepted");

        let reply = answer(
            recorder.clone(),
            call(Action::RequestStopTransaction, json!({"transactionId": "tx-009"})),
        )
        .await;
        assert_eq!(status_of(&reply), "Rejected");

        let reply = answer(recorder.clone(), call(Action::RequestStopTransaction, json!({}))).await;
        assert_eq!(status_of(&reply), "Rejected");

        assert_eq!(
            recorder.stops.lock().as_slice(),
            &[StopTarget::Port(1), StopTarget::Transaction("tx-009".into())]
        );
    }

    #[tokio::test]
    async fn test_handler_panic_degrades_to_rejected() {
        let reply = answer(
            Arc::new(Panicking),
            call(Action::RequestStopTransaction, json!({"evseId": 1})),
        )
        .await;
        assert_eq!(status_of(&reply), "Rejected");
    }

    #[tokio::test]
    async fn test_non_remote_action_refused() {
        let reply = answer(Arc::new(Recorder::default()), call(Action::Heartbeat, json!({}))).await;
        match reply {
            OcppMessage::CallError(error) => assert_eq!(error.error_code, ErrorCode::NotSupported),
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}
