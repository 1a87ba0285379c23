//! Inbound command ledger
//!
//! Commands pushed by the device are kept newest first and capped at
//! [`LEDGER_CAPACITY`]; the oldest entries fall off silently.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;

/// Maximum number of commands kept
pub const LEDGER_CAPACITY: usize = 100;

/// Handling urgency derived from the command name
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandPriority {
    Critical,
    Elevated,
    Routine,
}

impl CommandPriority {
    pub fn of(name: &str) -> Self {
        match name {
            "ALARM" | "EMERGENCY" => CommandPriority::Critical,
            "INSULIN_PUMP" | "VENTILATOR" => CommandPriority::Elevated,
            _ => CommandPriority::Routine,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedCommand {
    pub id: u64,
    pub received_at: DateTime<Utc>,
    pub name: String,
    pub payload: Value,
    pub acknowledged: bool,
}

impl ReceivedCommand {
    pub fn priority(&self) -> CommandPriority {
        CommandPriority::of(&self.name)
    }
}

/// Result of an acknowledge call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// First acknowledgement, the ACK should go out
    Acknowledged,
    AlreadyAcknowledged,
    NotFound,
}

/// Locally injected commands, for exercising the ledger without a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedCommand {
    InsulinPump,
    StretcherMode,
    Alarm,
    Ventilator,
}

impl SimulatedCommand {
    pub const ALL: [SimulatedCommand; 4] = [
        SimulatedCommand::InsulinPump,
        SimulatedCommand::StretcherMode,
        SimulatedCommand::Alarm,
        SimulatedCommand::Ventilator,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SimulatedCommand::InsulinPump => "INSULIN_PUMP",
            SimulatedCommand::StretcherMode => "STRETCHER_MODE",
            SimulatedCommand::Alarm => "ALARM",
            SimulatedCommand::Ventilator => "VENTILATOR",
        }
    }

    pub fn payload(self) -> Value {
        match self {
            SimulatedCommand::InsulinPump => {
                json!({"action": "deliver", "units": 5.0, "patientId": "P12345"})
            }
            SimulatedCommand::StretcherMode => json!({"position": "elevated", "angle": 30}),
            SimulatedCommand::Alarm => {
                json!({"level": "critical", "message": "Immediate attention required"})
            }
            SimulatedCommand::Ventilator => json!({"mode": "assist", "rate": 14, "volume": 500}),
        }
    }
}

#[derive(Default)]
struct Ledger {
    entries: VecDeque<ReceivedCommand>,
    last_id: u64,
}

impl Ledger {
    fn next_id(&mut self, now: DateTime<Utc>) -> u64 {
        let millis = u64::try_from(now.timestamp_millis()).unwrap_or(0);
        self.last_id = millis.max(self.last_id + 1);
        self.last_id
    }
}

/// Bounded, newest-first command ledger
#[derive(Default)]
pub struct CommandInbox {
    ledger: Mutex<Ledger>,
}

impl CommandInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a command, returning the stored entry
    pub fn receive(&self, name: impl Into<String>, payload: Value) -> ReceivedCommand {
        let now = Utc::now();
        let mut ledger = self.ledger.lock();
        let command = ReceivedCommand {
            id: ledger.next_id(now),
            received_at: now,
            name: name.into(),
            payload,
            acknowledged: false,
        };
        ledger.entries.push_front(command.clone());
        ledger.entries.truncate(LEDGER_CAPACITY);
        command
    }

    /// Mark a command acknowledged; only the first call reports `Acknowledged`
    pub fn acknowledge(&self, id: u64) -> AckOutcome {
        let mut ledger = self.ledger.lock();
        match ledger.entries.iter_mut().find(|c| c.id == id) {
            Some(command) if command.acknowledged => AckOutcome::AlreadyAcknowledged,
            Some(command) => {
                command.acknowledged = true;
                AckOutcome::Acknowledged
            }
            None => AckOutcome::NotFound,
        }
    }

    pub fn simulate(&self, kind: SimulatedCommand) -> ReceivedCommand {
        self.receive(kind.name(), kind.payload())
    }

    /// Newest first
    pub fn commands(&self) -> Vec<ReceivedCommand> {
        self.ledger.lock().entries.iter().cloned().collect()
    }

    pub fn get(&self, id: u64) -> Option<ReceivedCommand> {
        self.ledger.lock().entries.iter().find(|c| c.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.ledger.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ledger.lock().entries.is_empty()
    }

    pub fn unacknowledged_count(&self) -> usize {
        self.ledger.lock().entries.iter().filter(|c| !c.acknowledged).count()
    }
}
