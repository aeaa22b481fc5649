//! OCPP-J framing
//!
//! Every frame is a JSON array whose first element is the frame type:
//!
//! ```text
//! [2, "<id>", "<Action>", {payload}]                  CALL
//! [3, "<id>", {payload}]                              CALLRESULT
//! [4, "<id>", "<ErrorCode>", "<description>", {...}]  CALLERROR
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use super::transport::ChannelError;
use super::types::*;

const CALL: u64 = 2;
const CALL_RESULT: u64 = 3;
const CALL_ERROR: u64 = 4;

/// CALLERROR codes defined by OCPP-J
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
}

/// Actions this charge point sends or accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    BootNotification,
    Heartbeat,
    StatusNotification,
    TransactionEvent,
    MeterValues,
    Authorize,
    ChangeAvailability,
    RequestStopTransaction,
}

impl Action {
    const ALL: [Action; 8] = [
        Action::BootNotification,
        Action::Heartbeat,
        Action::StatusNotification,
        Action::TransactionEvent,
        Action::MeterValues,
        Action::Authorize,
        Action::ChangeAvailability,
        Action::RequestStopTransaction,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Action::BootNotification => "BootNotification",
            Action::Heartbeat => "Heartbeat",
            Action::StatusNotification => "StatusNotification",
            Action::TransactionEvent => "TransactionEvent",
            Action::MeterValues => "MeterValues",
            Action::Authorize => "Authorize",
            Action::ChangeAvailability => "ChangeAvailability",
            Action::RequestStopTransaction => "RequestStopTransaction",
        }
    }

    /// Sent by the CSMS rather than by the charge point
    pub fn is_server_initiated(self) -> bool {
        matches!(self, Action::ChangeAvailability | Action::RequestStopTransaction)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Action {
    type Err = OcppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|action| action.name() == s)
            .ok_or_else(|| OcppError::UnknownAction(s.to_string()))
    }
}

/// Protocol-level failures
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a valid OCPP-J array")]
    InvalidFormat,

    #[error("unknown action {0}")]
    UnknownAction(String),

    #[error("call {action} ({message_id}) is not supported")]
    UnsupportedCall { message_id: String, action: String },

    #[error("unknown frame type {0}")]
    UnknownMessageType(u64),

    #[error("CSMS answered {code:?}: {description}")]
    RemoteError {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("no reply in time")]
    Timeout,

    #[error("channel closed before a reply arrived")]
    ConnectionClosed,

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Fresh message id of the form `msg-xxxxxxxx`
pub fn new_message_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("msg-{}", &uuid[..8])
}

fn decode<T: DeserializeOwned>(payload: &Value) -> Result<T, OcppError> {
    Ok(T::deserialize(payload)?)
}

/// Request frame
#[derive(Debug, Clone)]
pub struct Call {
    pub message_id: String,
    pub action: Action,
    pub payload: Value,
}

impl Call {
    pub fn new(action: Action, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: new_message_id(),
            action,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn boot_notification(
        charging_station: ChargingStationInfo,
        reason: BootReason,
        custom_data: Option<Value>,
    ) -> Result<Self, OcppError> {
        let request = BootNotificationRequest {
            charging_station,
            reason,
            custom_data,
        };
        Self::new(Action::BootNotification, request)
    }

    pub fn heartbeat() -> Result<Self, OcppError> {
        Self::new(Action::Heartbeat, HeartbeatRequest {})
    }

    pub fn status_notification(
        evse_id: i32,
        connector_id: i32,
        connector_status: ConnectorStatus,
    ) -> Result<Self, OcppError> {
        let request = StatusNotificationRequest {
            timestamp: chrono::Utc::now(),
            connector_status,
            evse_id,
            connector_id,
        };
        Self::new(Action::StatusNotification, request)
    }

    pub fn transaction_event(request: TransactionEventRequest) -> Result<Self, OcppError> {
        Self::new(Action::TransactionEvent, request)
    }

    pub fn meter_values(evse_id: i32, meter_value: Vec<MeterValue>) -> Result<Self, OcppError> {
        Self::new(Action::MeterValues, MeterValuesRequest { evse_id, meter_value })
    }

    pub fn authorize(id_token: IdToken) -> Result<Self, OcppError> {
        Self::new(Action::Authorize, AuthorizeRequest { id_token })
    }

    /// Decode the payload into a typed request
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, OcppError> {
        decode(&self.payload)
    }
}

/// Successful reply frame
#[derive(Debug, Clone)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    pub fn new(message_id: String, payload: impl Serialize) -> Result<Self, OcppError> {
        let payload = serde_json::to_value(payload)?;
        Ok(Self { message_id, payload })
    }

    pub fn change_availability(
        message_id: String,
        status: GenericStatus,
        status_info: Option<StatusInfo>,
    ) -> Result<Self, OcppError> {
        Self::new(message_id, ChangeAvailabilityResponse { status, status_info })
    }

    pub fn request_stop_transaction(
        message_id: String,
        status: GenericStatus,
        status_info: Option<StatusInfo>,
    ) -> Result<Self, OcppError> {
        Self::new(message_id, RequestStopTransactionResponse { status, status_info })
    }

    /// Decode the payload into a typed response
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, OcppError> {
        decode(&self.payload)
    }
}

/// Error reply frame
#[derive(Debug, Clone)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    pub fn new(message_id: String, error_code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            message_id,
            error_code,
            error_description: description.into(),
            error_details: json!({}),
        }
    }
}

/// Any OCPP-J frame
#[derive(Debug, Clone)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Decode a text frame.
    ///
    /// A well-formed CALL naming an action this charge point does not know
    /// yields [`OcppError::UnsupportedCall`] so the caller can still answer it.
    pub fn parse(text: &str) -> Result<Self, OcppError> {
        let frame: Vec<Value> = serde_json::from_str(text)?;

        let (kind, message_id, rest) = match frame.as_slice() {
            [kind, Value::String(id), rest @ ..] => {
                (kind.as_u64().ok_or(OcppError::InvalidFormat)?, id.clone(), rest)
            }
            _ => return Err(OcppError::InvalidFormat),
        };

        match (kind, rest) {
            (CALL, [Value::String(action), payload]) => {
                let action = action.parse::<Action>().map_err(|_| OcppError::UnsupportedCall {
                    message_id: message_id.clone(),
                    action: action.clone(),
                })?;
                Ok(OcppMessage::Call(Call {
                    message_id,
                    action,
                    payload: payload.clone(),
                }))
            }

            (CALL_RESULT, [payload]) => Ok(OcppMessage::CallResult(CallResult {
                message_id,
                payload: payload.clone(),
            })),

            (CALL_ERROR, [Value::String(code), description, details]) => {
                let error_code = ErrorCode::deserialize(Value::String(code.clone()))
                    .unwrap_or(ErrorCode::GenericError);
                Ok(OcppMessage::CallError(CallError {
                    message_id,
                    error_code,
                    error_description: description.as_str().unwrap_or_default().to_string(),
                    error_details: details.clone(),
                }))
            }

            (CALL | CALL_RESULT | CALL_ERROR, _) => Err(OcppError::InvalidFormat),
            (other, _) => Err(OcppError::UnknownMessageType(other)),
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(call) => &call.message_id,
            OcppMessage::CallResult(result) => &result.message_id,
            OcppMessage::CallError(error) => &error.message_id,
        }
    }

    /// The frame as a JSON array
    pub fn to_value(&self) -> Result<Value, OcppError> {
        Ok(match self {
            OcppMessage::Call(call) => {
                json!([CALL, call.message_id, call.action.name(), call.payload])
            }
            OcppMessage::CallResult(result) => json!([CALL_RESULT, result.message_id, result.payload]),
            OcppMessage::CallError(error) => json!([
                CALL_ERROR,
                error.message_id,
                serde_json::to_value(error.error_code)?,
                error.error_description,
                error.error_details
            ]),
        })
    }

    /// The text frame sent over the channel
    pub fn to_text(&self) -> Result<String, OcppError> {
        Ok(serde_json::to_string(&self.to_value()?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_frame() {
        let call = Call::heartbeat().unwrap();
        let id = call.message_id.clone();
        let value = OcppMessage::Call(call).to_value().unwrap();
        assert_eq!(value, json!([2, id, "Heartbeat", {}]));
    }

    #[test]
    fn test_message_id_shape() {
        let id = new_message_id();
        assert!(id.starts_with("msg-"));
        assert_eq!(id.len(), 12);
        assert_ne!(id, new_message_id());
    }

    #[test]
    fn test_action_names() {
        for action in Action::ALL {
            assert_eq!(action.name().parse::<Action>().unwrap(), action);
        }
        assert!(matches!("Reset".parse::<Action>(), Err(OcppError::UnknownAction(_))));
        assert!(Action::ChangeAvailability.is_server_initiated());
        assert!(!Action::Heartbeat.is_server_initiated());
    }

    #[test]
    fn test_parse_change_availability() {
        let frame = r#"[2, "srv-4", "ChangeAvailability", {"operationalStatus": "Inoperative", "evse": {"id": 2}}]"#;

        let OcppMessage::Call(call) = OcppMessage::parse(frame).unwrap() else {
            panic!("expected a CALL");
        };
        assert_eq!(call.message_id, "srv-4");
        assert_eq!(call.action, Action::ChangeAvailability);

        let request: ChangeAvailabilityRequest = call.parse_payload().unwrap();
        assert_eq!(request.operational_status, OperationalStatus::Inoperative);
        assert_eq!(request.evse.map(|e| e.id), Some(2));
    }

    #[test]
    fn test_unknown_action_keeps_message_id() {
        match OcppMessage::parse(r#"[2, "srv-9", "UpdateFirmware", {}]"#) {
            Err(OcppError::UnsupportedCall { message_id, action }) => {
                assert_eq!(message_id, "srv-9");
                assert_eq!(action, "UpdateFirmware");
            }
            other => panic!("expected UnsupportedCall, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_result_and_error() {
        let result = OcppMessage::parse(r#"[3, "msg-1", {"status": "Accepted"}]"#).unwrap();
        assert_eq!(result.message_id(), "msg-1");
        assert!(matches!(result, OcppMessage::CallResult(_)));

        let OcppMessage::CallError(error) =
            OcppMessage::parse(r#"[4, "msg-2", "NotSupported", "no", {}]"#).unwrap()
        else {
            panic!("expected a CALLERROR");
        };
        assert_eq!(error.error_code, ErrorCode::NotSupported);
        assert_eq!(error.error_description, "no");

        // Codes outside OCPP-J degrade to GenericError
        let OcppMessage::CallError(error) =
            OcppMessage::parse(r#"[4, "msg-3", "Teapot", "", {}]"#).unwrap()
        else {
            panic!("expected a CALLERROR");
        };
        assert_eq!(error.error_code, ErrorCode::GenericError);
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(OcppMessage::parse("[]"), Err(OcppError::InvalidFormat)));
        assert!(matches!(OcppMessage::parse(r#"[3, "only-id"]"#), Err(OcppError::InvalidFormat)));
        assert!(matches!(OcppMessage::parse(r#"[3, 17, {}]"#), Err(OcppError::InvalidFormat)));
        assert!(matches!(
            OcppMessage::parse(r#"[7, "x", {}]"#),
            Err(OcppError::UnknownMessageType(7))
        ));
        assert!(matches!(OcppMessage::parse("not json"), Err(OcppError::Json(_))));
    }

    #[test]
    fn test_reply_text() {
        let result =
            CallResult::change_availability("srv-1".to_string(), GenericStatus::Accepted, None).unwrap();
        assert_eq!(
            OcppMessage::CallResult(result).to_text().unwrap(),
            r#"[3,"srv-1",{"status":"Accepted"}]"#
        );

        let error = CallError::new("srv-2".to_string(), ErrorCode::NotImplemented, "Reset");
        assert_eq!(
            OcppMessage::CallError(error).to_text().unwrap(),
            r#"[4,"srv-2","NotImplemented","Reset",{}]"#
        );
    }
}
