//! MedSim Link - device communication core for the bedside monitor simulator
//!
//! The monitor talks to a microcontroller over a serial link, which relays
//! data to a cloud endpoint. This crate owns that conversation:
//! - Line framing and JSON message codec over a partially-buffered byte stream
//! - Transport session with link status supervision
//! - Heartbeat liveness probing of the device
//! - Inbound command ledger with acknowledgement
//! - Periodic vitals telemetry
//! - Link / device / cloud status arbitration into a single readiness flag
//!
//! Everything is tied together by [`DeviceLink`].

pub mod codec;
pub mod frame;
pub mod inbox;
pub mod link;
pub mod liveness;
pub mod port;
pub mod session;
pub mod status;
pub mod telemetry;
pub mod vitals;

mod emitter;

pub use codec::{InboundMessage, OutboundMessage};
pub use frame::LineDecoder;
pub use inbox::{AckOutcome, CommandInbox, CommandPriority, ReceivedCommand, SimulatedCommand};
pub use link::{DeviceLink, LinkBuilder, LinkError};
pub use liveness::{LivenessMonitor, HEARTBEAT_INTERVAL};
pub use port::{DevicePort, PortError, PortReader, PortStreams, PortWriter};
#[cfg(feature = "serial")]
pub use port::SerialDevicePort;
pub use session::{MessageHandler, Session, BAUD_RATE};
pub use status::{
    CloudStatus, DeviceStatus, Hop, HopState, LinkStatus, Pathway, SetupIssue, StatusBoard,
    StatusSnapshot, SystemHealth,
};
pub use telemetry::{TelemetryError, TelemetryPublisher};
pub use vitals::{Channel, Reading, VitalsError, VitalsTable};
