//! Charge point station: ports, their transaction state machines and the main loop

pub mod port;
pub mod observer;
pub mod handle;
pub mod orchestrator;

pub use port::{Port, PortEffect, PortError, StopReason, TransactionIds};
pub use observer::StationObserver;
pub use handle::{ControlCommand, StationHandle};
pub use orchestrator::{Station, SHUTDOWN_GRACE};
