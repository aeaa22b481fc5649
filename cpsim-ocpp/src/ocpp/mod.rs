//! OCPP 2.0.1 protocol implementation
//!
//! - `types`: OCPP message types and data structures
//! - `messages`: JSON-RPC framing (CALL, CALLRESULT, CALLERROR)
//! - `transport`: reconnecting text-frame channel to the CSMS
//! - `correlator`: reply matching by message id
//! - `queue`: single-flight outbound queue with bounded retry
//! - `dispatcher`: CSMS-initiated calls
//! - `pricing`: price and settlement state carried in replies
//! - `session`: registration and heartbeat state machine
//! - `client`: the pieces above wired together

pub mod types;
pub mod messages;
pub mod transport;
pub mod correlator;
pub mod queue;
pub mod dispatcher;
pub mod pricing;
pub mod session;
pub mod client;

pub use types::*;
pub use messages::*;
pub use transport::{build_ocpp_url, ChannelError, Dialer, Transport, WebSocketDialer};
pub use queue::{DeliveryOutcome, RetryPolicy};
pub use dispatcher::{RemoteControl, StopTarget};
pub use pricing::PriceBoard;
pub use session::{Session, SessionEvent, SessionState};
pub use client::OcppClient;
