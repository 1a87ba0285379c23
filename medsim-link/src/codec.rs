//! JSON message codec for the device link
//!
//! Device → monitor: `READY`, `NOT_READY`, `HEARTBEAT`, `CLOUD_STATUS`,
//! `COMMAND`, `ERROR`. Anything else (including non-JSON noise such as boot
//! banners) becomes [`InboundMessage::Unknown`] and is never fatal.
//!
//! Monitor → device: `BOOTSTRAP`, `TEST_CLOUD`, `HEARTBEAT`, `VITALS`,
//! `STOP_TRANSMISSION`, `ACK`, one JSON object per line.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::status::CloudStatus;
use crate::vitals::Reading;

/// Typed message received from the device
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Ready,
    NotReady,
    Heartbeat,
    CloudStatus { status: CloudStatus },
    Command { name: String, payload: Value },
    Error { detail: String },
    Unknown { raw: String },
}

/// Wire shape of device messages (matches the device firmware contract)
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum DeviceFrame {
    Ready,
    NotReady,
    Heartbeat,
    CloudStatus {
        status: CloudStatus,
    },
    Command {
        command: String,
        #[serde(default)]
        data: Value,
    },
    Error {
        #[serde(default)]
        error: Value,
    },
}

impl From<DeviceFrame> for InboundMessage {
    fn from(frame: DeviceFrame) -> Self {
        match frame {
            DeviceFrame::Ready => InboundMessage::Ready,
            DeviceFrame::NotReady => InboundMessage::NotReady,
            DeviceFrame::Heartbeat => InboundMessage::Heartbeat,
            DeviceFrame::CloudStatus { status } => InboundMessage::CloudStatus { status },
            DeviceFrame::Command { command, data } => InboundMessage::Command {
                name: command,
                payload: data,
            },
            DeviceFrame::Error { error } => InboundMessage::Error {
                detail: match error {
                    Value::String(s) => s,
                    other => other.to_string(),
                },
            },
        }
    }
}

/// Message sent to the device
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundMessage {
    Bootstrap {
        #[serde(rename = "cloudEndpoint")]
        cloud_endpoint: String,
        /// Milliseconds since the Unix epoch
        timestamp: i64,
    },
    TestCloud {
        endpoint: String,
    },
    Heartbeat,
    Vitals {
        timestamp: i64,
        #[serde(rename = "data")]
        readings: BTreeMap<String, Reading>,
    },
    StopTransmission,
    #[serde(rename = "ACK")]
    Acknowledge {
        #[serde(rename = "commandId")]
        command_id: u64,
    },
}

impl OutboundMessage {
    /// Wire `type` tag, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Bootstrap { .. } => "BOOTSTRAP",
            OutboundMessage::TestCloud { .. } => "TEST_CLOUD",
            OutboundMessage::Heartbeat => "HEARTBEAT",
            OutboundMessage::Vitals { .. } => "VITALS",
            OutboundMessage::StopTransmission => "STOP_TRANSMISSION",
            OutboundMessage::Acknowledge { .. } => "ACK",
        }
    }
}

/// Parse one trimmed line from the device
pub fn decode(line: &str) -> InboundMessage {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "non-JSON line from device: {}", line);
            return InboundMessage::Unknown { raw: line.to_string() };
        }
    };

    match serde_json::from_value::<DeviceFrame>(value) {
        Ok(frame) => frame.into(),
        Err(e) => {
            warn!(error = %e, "unrecognised device message: {}", line);
            InboundMessage::Unknown { raw: line.to_string() }
        }
    }
}

/// Serialize a message into one newline-terminated line
pub fn encode(message: &OutboundMessage) -> String {
    let mut line = serde_json::to_string(message).unwrap_or_default();
    line.push('\n');
    line
}
