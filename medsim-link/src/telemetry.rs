//! Periodic vitals telemetry
//!
//! Each tick snapshots the enabled channels and sends one `VITALS` batch.
//! Publishing is best effort: a failed send is logged and the next tick
//! runs as scheduled.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::OutboundMessage;
use crate::emitter::Emitter;
use crate::session::Session;
use crate::vitals::VitalsTable;

pub const DEFAULT_PERIOD: Duration = Duration::from_millis(1000);
pub const MIN_PERIOD: Duration = Duration::from_millis(100);
pub const MAX_PERIOD: Duration = Duration::from_millis(5000);
pub const PERIOD_STEP: Duration = Duration::from_millis(100);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("Invalid transmission period {0:?} (100ms to 5s, in 100ms steps)")]
    InvalidPeriod(Duration),
    #[error("Transmission is running, stop it first")]
    Running,
}

/// Check a period against the allowed range and step
pub fn validate_period(period: Duration) -> Result<Duration, TelemetryError> {
    let in_range = (MIN_PERIOD..=MAX_PERIOD).contains(&period);
    let on_step = period.as_nanos() % PERIOD_STEP.as_nanos() == 0;
    if in_range && on_step {
        Ok(period)
    } else {
        Err(TelemetryError::InvalidPeriod(period))
    }
}

struct PublisherState {
    period: Duration,
    running: Option<Emitter>,
}

impl PublisherState {
    fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(Emitter::is_active)
    }
}

pub struct TelemetryPublisher {
    session: Session,
    vitals: Arc<Mutex<VitalsTable>>,
    state: Mutex<PublisherState>,
    root: CancellationToken,
}

impl TelemetryPublisher {
    /// `period` is expected to have passed [`validate_period`]
    pub fn new(
        session: Session,
        vitals: Arc<Mutex<VitalsTable>>,
        period: Duration,
        root: CancellationToken,
    ) -> Self {
        Self {
            session,
            vitals,
            state: Mutex::new(PublisherState {
                period,
                running: None,
            }),
            root,
        }
    }

    pub fn period(&self) -> Duration {
        self.state.lock().period
    }

    /// Change the period; only allowed while stopped
    pub fn set_period(&self, period: Duration) -> Result<(), TelemetryError> {
        let mut state = self.state.lock();
        if state.is_running() {
            return Err(TelemetryError::Running);
        }
        state.period = validate_period(period)?;
        Ok(())
    }

    /// Start publishing at the configured period
    ///
    /// Returns `false` when a publisher is already running.
    pub fn start(&self) -> bool {
        let mut state = self.state.lock();
        if state.is_running() {
            return false;
        }

        let period = state.period;
        let session = self.session.clone();
        let vitals = self.vitals.clone();
        state.running = Some(Emitter::spawn(&self.root, move |cancel| {
            publish_loop(session, vitals, period, cancel)
        }));
        info!("Vitals transmission started every {:?}", period);
        true
    }

    /// Stop publishing and tell the device; no-op when not running
    pub async fn stop(&self) -> bool {
        if !self.halt().await {
            return false;
        }
        if !self.session.send(&OutboundMessage::StopTransmission).await {
            warn!("STOP_TRANSMISSION could not be delivered");
        }
        info!("Vitals transmission stopped");
        true
    }

    /// Stop publishing without notifying the device
    pub(crate) async fn halt(&self) -> bool {
        let running = self.state.lock().running.take();
        match running {
            Some(emitter) => {
                let was_active = emitter.is_active();
                emitter.shutdown().await;
                was_active
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_running()
    }
}

/// One `VITALS` message from the enabled channels
pub fn vitals_message(table: &VitalsTable) -> OutboundMessage {
    OutboundMessage::Vitals {
        timestamp: Utc::now().timestamp_millis(),
        readings: table.snapshot(),
    }
}

async fn publish_loop(
    session: Session,
    vitals: Arc<Mutex<VitalsTable>>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let message = vitals_message(&vitals.lock());
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            sent = session.send(&message) => sent,
        };
        if sent {
            debug!("VITALS published");
        } else {
            warn!("VITALS publish failed, continuing");
        }
    }
}
