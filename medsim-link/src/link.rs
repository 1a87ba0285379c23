//! Device link aggregate
//!
//! [`DeviceLink`] owns the session, the liveness monitor, the command inbox,
//! the telemetry publisher, the channel table and the status board. It is a
//! cheap `Clone` handle; dropping the last handle cancels every background
//! task bound to it.
//!
//! Lifecycle: `build -> open -> (run) -> close`, reopenable after close.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::codec::{InboundMessage, OutboundMessage};
use crate::inbox::{AckOutcome, CommandInbox, ReceivedCommand, SimulatedCommand};
use crate::liveness::{self, LivenessMonitor};
use crate::port::DevicePort;
use crate::session::{MessageHandler, Session};
use crate::status::{CloudStatus, DeviceStatus, LinkStatus, StatusBoard, StatusSnapshot};
use crate::telemetry::{validate_period, TelemetryError, TelemetryPublisher, DEFAULT_PERIOD};
use crate::vitals::VitalsTable;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Link on {0} is already open")]
    AlreadyOpen(String),
    #[error("Link is not open")]
    NotOpen,
    #[error("System not ready ({0})")]
    NotReady(StatusSnapshot),
    #[error("No cloud endpoint configured")]
    MissingEndpoint,
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
}

#[derive(Clone)]
pub struct DeviceLink {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    status: StatusBoard,
    session: Session,
    liveness: LivenessMonitor,
    telemetry: TelemetryPublisher,
    inbox: Arc<CommandInbox>,
    vitals: Arc<Mutex<VitalsTable>>,
    cloud_endpoint: Mutex<String>,
    _teardown: DropGuard,
}

pub struct LinkBuilder {
    port: Arc<dyn DevicePort>,
    vitals: VitalsTable,
    cloud_endpoint: String,
    transmission_period: Duration,
}

impl LinkBuilder {
    pub fn vitals(mut self, vitals: VitalsTable) -> Self {
        self.vitals = vitals;
        self
    }

    pub fn cloud_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.cloud_endpoint = endpoint.into();
        self
    }

    pub fn transmission_period(mut self, period: Duration) -> Self {
        self.transmission_period = period;
        self
    }

    pub fn build(mut self) -> Result<DeviceLink, LinkError> {
        self.transmission_period = validate_period(self.transmission_period)?;
        Ok(self.assemble())
    }

    fn assemble(self) -> DeviceLink {
        let root = CancellationToken::new();
        let status = StatusBoard::new();
        let session = Session::new(self.port, status.clone(), root.clone());
        let vitals = Arc::new(Mutex::new(self.vitals));

        let liveness = LivenessMonitor::new(session.clone(), status.clone(), root.clone());
        let telemetry = TelemetryPublisher::new(
            session.clone(),
            vitals.clone(),
            self.transmission_period,
            root.clone(),
        );

        DeviceLink {
            inner: Arc::new(LinkInner {
                status,
                session,
                liveness,
                telemetry,
                inbox: Arc::new(CommandInbox::new()),
                vitals,
                cloud_endpoint: Mutex::new(self.cloud_endpoint),
                _teardown: root.drop_guard(),
            }),
        }
    }
}

/// Routes decoded messages to status, inbox and logs
struct Dispatcher {
    status: StatusBoard,
    inbox: Arc<CommandInbox>,
}

impl MessageHandler for Dispatcher {
    fn handle(&self, message: InboundMessage) {
        if let Some(device) = liveness::device_transition(&message) {
            self.status.set_device(device);
            return;
        }

        match message {
            InboundMessage::CloudStatus { status } => {
                info!("Cloud status reported by device: {:?}", status);
                self.status.set_cloud(status);
            }
            InboundMessage::Command { name, payload } => {
                let command = self.inbox.receive(name, payload);
                info!(
                    id = command.id,
                    priority = ?command.priority(),
                    "Command received: {}", command.name
                );
            }
            InboundMessage::Error { detail } => {
                error!("Device error: {}", detail);
            }
            InboundMessage::Unknown { raw } => {
                debug!("Ignoring unrecognised device line: {}", raw);
            }
            InboundMessage::Ready | InboundMessage::NotReady | InboundMessage::Heartbeat => {}
        }
    }
}

impl DeviceLink {
    pub fn builder(port: Arc<dyn DevicePort>) -> LinkBuilder {
        LinkBuilder {
            port,
            vitals: VitalsTable::default(),
            cloud_endpoint: String::new(),
            transmission_period: DEFAULT_PERIOD,
        }
    }

    /// Link with default channels and no endpoint
    pub fn new(port: Arc<dyn DevicePort>) -> Self {
        Self::builder(port).assemble()
    }

    pub fn port_name(&self) -> &str {
        self.inner.session.port_name()
    }

    /// Open the port; the resulting link status is returned
    pub async fn open(&self) -> Result<LinkStatus, LinkError> {
        let dispatcher = Arc::new(Dispatcher {
            status: self.inner.status.clone(),
            inbox: self.inner.inbox.clone(),
        });
        let status = self.inner.session.open(dispatcher).await?;
        if status == LinkStatus::Ready {
            self.inner.liveness.start();
        }
        Ok(status)
    }

    /// Stop heartbeat and telemetry, release the port, reset status
    ///
    /// Idempotent. Telemetry is halted without `STOP_TRANSMISSION`.
    pub async fn close(&self) {
        self.inner.liveness.stop().await;
        if self.inner.telemetry.halt().await {
            debug!("Transmission halted by close");
        }
        self.inner.session.close().await;
    }

    pub async fn send(&self, message: &OutboundMessage) -> bool {
        self.inner.session.send(message).await
    }

    pub fn status(&self) -> StatusSnapshot {
        self.inner.status.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.inner.status.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.status().readiness()
    }

    /// Send `BOOTSTRAP`; the device is then considered initialising
    pub async fn deploy_bootstrap(&self) -> Result<bool, LinkError> {
        if self.status().link != LinkStatus::Ready {
            return Err(LinkError::NotOpen);
        }
        let message = OutboundMessage::Bootstrap {
            cloud_endpoint: self.cloud_endpoint(),
            timestamp: Utc::now().timestamp_millis(),
        };
        let sent = self.send(&message).await;
        if sent {
            info!("Bootstrap deployed to {}", self.port_name());
            self.inner.status.set_device(DeviceStatus::NotReady);
        } else {
            warn!("Bootstrap could not be sent to {}", self.port_name());
        }
        Ok(sent)
    }

    pub fn set_cloud_endpoint(&self, endpoint: impl Into<String>) {
        *self.inner.cloud_endpoint.lock() = endpoint.into();
    }

    pub fn cloud_endpoint(&self) -> String {
        self.inner.cloud_endpoint.lock().clone()
    }

    /// Ask the device to probe the cloud endpoint
    ///
    /// Cloud status goes to `Testing` whether or not the probe went out;
    /// the device answers with `CLOUD_STATUS`.
    pub async fn test_cloud(&self) -> Result<bool, LinkError> {
        let endpoint = self.cloud_endpoint();
        if endpoint.trim().is_empty() {
            return Err(LinkError::MissingEndpoint);
        }
        self.inner.status.set_cloud(CloudStatus::Testing);
        let sent = self.send(&OutboundMessage::TestCloud { endpoint }).await;
        if !sent {
            warn!("Cloud test probe could not be sent");
        }
        Ok(sent)
    }

    /// Acknowledge a received command, sending `ACK` on first acknowledgement
    pub async fn acknowledge(&self, id: u64) -> AckOutcome {
        let outcome = self.inner.inbox.acknowledge(id);
        match outcome {
            AckOutcome::Acknowledged => {
                if !self.send(&OutboundMessage::Acknowledge { command_id: id }).await {
                    warn!("ACK for command {} not delivered", id);
                }
            }
            AckOutcome::AlreadyAcknowledged => debug!("Command {} already acknowledged", id),
            AckOutcome::NotFound => debug!("Acknowledge for unknown command {}", id),
        }
        outcome
    }

    pub fn simulate_command(&self, kind: SimulatedCommand) -> ReceivedCommand {
        self.inner.inbox.simulate(kind)
    }

    pub fn commands(&self) -> Vec<ReceivedCommand> {
        self.inner.inbox.commands()
    }

    pub fn unacknowledged_count(&self) -> usize {
        self.inner.inbox.unacknowledged_count()
    }

    /// Edit the channel table under its lock
    pub fn update_vitals<R>(&self, edit: impl FnOnce(&mut VitalsTable) -> R) -> R {
        let mut table = self.inner.vitals.lock();
        edit(&mut *table)
    }

    pub fn vitals_snapshot(&self) -> VitalsTable {
        self.inner.vitals.lock().clone()
    }

    /// Start `VITALS` transmission; requires full readiness
    ///
    /// Returns `false` when already transmitting.
    pub fn start_transmission(&self) -> Result<bool, LinkError> {
        let status = self.status();
        if !status.readiness() {
            return Err(LinkError::NotReady(status));
        }
        Ok(self.inner.telemetry.start())
    }

    pub async fn stop_transmission(&self) -> bool {
        self.inner.telemetry.stop().await
    }

    pub fn set_transmission_period(&self, period: Duration) -> Result<(), LinkError> {
        Ok(self.inner.telemetry.set_period(period)?)
    }

    pub fn transmission_period(&self) -> Duration {
        self.inner.telemetry.period()
    }

    pub fn transmitting(&self) -> bool {
        self.inner.telemetry.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::testing::DuplexPort;
    use crate::port::PortError;
    use serde_json::Value;

    fn dispatcher() -> (Dispatcher, StatusBoard, Arc<CommandInbox>) {
        let status = StatusBoard::new();
        let inbox = Arc::new(CommandInbox::new());
        let dispatcher = Dispatcher { status: status.clone(), inbox: inbox.clone() };
        (dispatcher, status, inbox)
    }

    #[test]
    fn test_dispatch_device_and_cloud() {
        let (dispatcher, status, _inbox) = dispatcher();
        dispatcher.handle(InboundMessage::NotReady);
        assert_eq!(status.snapshot().device, DeviceStatus::NotReady);
        dispatcher.handle(InboundMessage::Heartbeat);
        assert_eq!(status.snapshot().device, DeviceStatus::Ready);

        dispatcher.handle(InboundMessage::CloudStatus { status: CloudStatus::Error });
        let snapshot = status.snapshot();
        assert_eq!(snapshot.cloud, CloudStatus::Error);
        assert_eq!(snapshot.device, DeviceStatus::Ready);
    }

    #[test]
    fn test_dispatch_command_and_noise() {
        let (dispatcher, status, inbox) = dispatcher();
        dispatcher.handle(InboundMessage::Command { name: "ALARM".to_string(), payload: Value::Null });
        dispatcher.handle(InboundMessage::Error { detail: "sensor fault".to_string() });
        dispatcher.handle(InboundMessage::Unknown { raw: "boot".to_string() });

        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox.commands()[0].name, "ALARM");
        assert_eq!(status.snapshot(), StatusSnapshot::default());
    }

    #[tokio::test]
    async fn test_bootstrap_requires_open_link() {
        let link = DeviceLink::new(Arc::new(DuplexPort::new()));
        assert!(matches!(link.deploy_bootstrap().await, Err(LinkError::NotOpen)));

        link.open().await.unwrap();
        assert!(link.deploy_bootstrap().await.unwrap());
        assert_eq!(link.status().device, DeviceStatus::NotReady);
        link.close().await;
    }

    #[tokio::test]
    async fn test_cloud_test_needs_endpoint() {
        let link = DeviceLink::new(Arc::new(DuplexPort::new()));
        assert!(matches!(link.test_cloud().await, Err(LinkError::MissingEndpoint)));

        link.set_cloud_endpoint("broker.example.com");
        // not open, the probe fails but the test cycle still starts
        assert!(!link.test_cloud().await.unwrap());
        assert_eq!(link.status().cloud, CloudStatus::Testing);
    }

    #[tokio::test]
    async fn test_transmission_gated_on_readiness() {
        let link = DeviceLink::new(Arc::new(DuplexPort::new()));
        assert!(matches!(link.start_transmission(), Err(LinkError::NotReady(_))));
        assert!(!link.transmitting());
        assert!(!link.stop_transmission().await);
    }

    #[tokio::test]
    async fn test_builder_rejects_bad_period() {
        let result = DeviceLink::builder(Arc::new(DuplexPort::new()))
            .transmission_period(Duration::from_millis(42))
            .build();
        assert!(matches!(result, Err(LinkError::Telemetry(TelemetryError::InvalidPeriod(_)))));
    }

    #[tokio::test]
    async fn test_dropping_link_releases_port() {
        use tokio::io::AsyncReadExt;

        let port = Arc::new(DuplexPort::new());
        let link = DeviceLink::new(port.clone());
        link.open().await.unwrap();
        link.inner.status.set_device(DeviceStatus::Ready);
        let mut device = port.take_device();

        drop(link);
        let mut buf = Vec::new();
        // heartbeats may still be in flight, then end of stream
        tokio::time::timeout(Duration::from_secs(2), device.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_busy_port_leaves_link_closed() {
        let link = DeviceLink::new(Arc::new(DuplexPort::refusing(PortError::Busy)));
        assert_eq!(link.open().await.unwrap(), LinkStatus::Busy);
        assert_eq!(link.status().link, LinkStatus::Busy);
        assert!(!link.send(&OutboundMessage::Heartbeat).await);

        link.close().await;
        assert_eq!(link.status().link, LinkStatus::Untested);
    }
}
