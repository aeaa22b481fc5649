//! Response correlation
//!
//! Every outstanding request is registered under its message id. An inbound
//! CALLRESULT or CALLERROR resolves only the request with the same id; replies
//! to unknown ids are logged and dropped. Server-initiated CALLs are handed back
//! to the caller for dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::messages::{Action, Call, CallError, CallResult, ErrorCode, OcppError, OcppMessage};
use super::pricing::PriceBoard;
use super::types::ReplyCustomData;

/// Reply (or failure) delivered to the waiting sender
pub type ReplySlot = oneshot::Sender<Result<CallResult, OcppError>>;

/// Outstanding request awaiting its reply
struct PendingRequest {
    action: Action,
    transaction_id: Option<String>,
    reply_tx: ReplySlot,
}

/// What the receive loop must do with a frame after correlation
#[derive(Debug)]
pub enum Inbound {
    /// Server-initiated call for the dispatcher
    Call(Call),
    /// Immediate CALLERROR answer for a call we cannot handle
    Refuse(CallError),
}

/// Matches inbound frames to pending requests
pub struct Correlator {
    pending: Mutex<HashMap<String, PendingRequest>>,
    prices: Arc<PriceBoard>,
}

impl Correlator {
    pub fn new(prices: Arc<PriceBoard>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            prices,
        }
    }

    /// Register a request before it is sent
    pub fn register(
        &self,
        message_id: &str,
        action: Action,
        transaction_id: Option<String>,
    ) -> oneshot::Receiver<Result<CallResult, OcppError>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(
            message_id.to_string(),
            PendingRequest {
                action,
                transaction_id,
                reply_tx,
            },
        );
        reply_rx
    }

    /// Drop a registration after a timeout or failed send
    pub fn forget(&self, message_id: &str) {
        self.pending.lock().remove(message_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Fail every outstanding request; used on shutdown
    pub fn abandon_all(&self) {
        for (_, pending) in self.pending.lock().drain() {
            let _ = pending.reply_tx.send(Err(OcppError::ConnectionClosed));
        }
    }

    /// Correlate one inbound text frame
    pub fn on_frame(&self, text: &str) -> Option<Inbound> {
        match OcppMessage::parse(text) {
            Ok(OcppMessage::Call(call)) => {
                if call.action.is_server_initiated() {
                    Some(Inbound::Call(call))
                } else {
                    warn!("CSMS sent {} which a charge point does not accept", call.action);
                    Some(Inbound::Refuse(CallError::new(
                        call.message_id,
                        ErrorCode::NotSupported,
                        format!("{} is not accepted by a charge point", call.action),
                    )))
                }
            }
            Ok(OcppMessage::CallResult(result)) => {
                self.resolve_result(result);
                None
            }
            Ok(OcppMessage::CallError(error)) => {
                self.resolve_error(error);
                None
            }
            Err(OcppError::UnsupportedCall { message_id, action }) => {
                warn!("Unsupported action from CSMS: {}", action);
                Some(Inbound::Refuse(CallError::new(
                    message_id,
                    ErrorCode::NotImplemented,
                    format!("Action {} not implemented", action),
                )))
            }
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                None
            }
        }
    }

    fn resolve_result(&self, result: CallResult) {
        let pending = self.pending.lock().remove(&result.message_id);

        let context_tx = pending.as_ref().and_then(|p| p.transaction_id.clone());
        if let Some(custom) = ReplyCustomData::from_payload(&result.payload) {
            self.prices.absorb(&custom, context_tx.as_deref());
        }

        match pending {
            Some(pending) => {
                debug!("{} acknowledged ({})", pending.action, result.message_id);
                let _ = pending.reply_tx.send(Ok(result));
            }
            None => {
                debug!("Reply for unknown message: {}", result.message_id);
            }
        }
    }

    fn resolve_error(&self, error: CallError) {
        let pending = self.pending.lock().remove(&error.message_id);

        match pending {
            Some(pending) => {
                warn!(
                    "{} failed: {:?} - {}",
                    pending.action, error.error_code, error.error_description
                );
                let _ = pending.reply_tx.send(Err(OcppError::RemoteError {
                    code: error.error_code,
                    description: error.error_description,
                    details: error.error_details,
                }));
            }
            None => {
                debug!("Error for unknown message: {}", error.message_id);
            }
        }
    }
}
