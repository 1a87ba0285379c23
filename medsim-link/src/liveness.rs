//! Heartbeat liveness probing
//!
//! While the link is up and the device has shown itself at least once, a
//! `HEARTBEAT` goes out every [`HEARTBEAT_INTERVAL`]. A single failed send
//! marks the device unreachable. The ticker restarts on every link or
//! device status change and idles while the guard does not hold.

use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{InboundMessage, OutboundMessage};
use crate::emitter::Emitter;
use crate::session::Session;
use crate::status::{DeviceStatus, LinkStatus, StatusBoard, StatusSnapshot};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// Device status implied by an inbound message, if any
///
/// Any sign of life counts as readiness.
pub fn device_transition(message: &InboundMessage) -> Option<DeviceStatus> {
    match message {
        InboundMessage::Ready | InboundMessage::Heartbeat => Some(DeviceStatus::Ready),
        InboundMessage::NotReady => Some(DeviceStatus::NotReady),
        _ => None,
    }
}

/// Guard under which heartbeats are emitted
pub fn should_probe(snapshot: &StatusSnapshot) -> bool {
    snapshot.link == LinkStatus::Ready && snapshot.device != DeviceStatus::Disconnected
}

pub struct LivenessMonitor {
    session: Session,
    status: StatusBoard,
    root: CancellationToken,
    emitter: parking_lot::Mutex<Option<Emitter>>,
}

impl LivenessMonitor {
    pub fn new(session: Session, status: StatusBoard, root: CancellationToken) -> Self {
        Self {
            session,
            status,
            root,
            emitter: parking_lot::Mutex::new(None),
        }
    }

    /// Start supervising; a running monitor is left alone
    pub fn start(&self) {
        let mut slot = self.emitter.lock();
        if slot.as_ref().is_some_and(Emitter::is_active) {
            return;
        }
        let session = self.session.clone();
        let status = self.status.clone();
        *slot = Some(Emitter::spawn(&self.root, move |cancel| {
            supervise(session, status, cancel)
        }));
    }

    pub async fn stop(&self) {
        let emitter = self.emitter.lock().take();
        if let Some(emitter) = emitter {
            emitter.shutdown().await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.emitter.lock().as_ref().is_some_and(Emitter::is_active)
    }
}

async fn supervise(session: Session, status: StatusBoard, cancel: CancellationToken) {
    let mut rx = status.subscribe();

    loop {
        let guarded = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            ok = async { rx.wait_for(should_probe).await.is_ok() } => ok,
        };
        if !guarded {
            return;
        }

        let key = {
            let snapshot = rx.borrow_and_update();
            (snapshot.link, snapshot.device)
        };
        debug!(link = ?key.0, device = ?key.1, "heartbeat ticker (re)started");

        let mut ticker = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let snapshot = *rx.borrow_and_update();
                    if (snapshot.link, snapshot.device) != key {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    // a blocked write must not hold up close
                    let sent = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        sent = session.send(&OutboundMessage::Heartbeat) => sent,
                    };
                    if !sent {
                        warn!("Heartbeat failed, device unreachable");
                        status.set_device(DeviceStatus::Unreachable);
                    }
                }
            }
        }
    }
}
