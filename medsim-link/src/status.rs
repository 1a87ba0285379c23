//! Connection status state machines and readiness arbitration
//!
//! Three independent statuses gate the monitor:
//! - [`LinkStatus`] - the serial port itself
//! - [`DeviceStatus`] - the microcontroller on the other end
//! - [`CloudStatus`] - the cloud relay reachable through the device
//!
//! [`StatusBoard`] owns them and publishes every change as one consistent
//! [`StatusSnapshot`]. Readiness, the pathway view and the overall health
//! are pure functions of a snapshot.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Serial port status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Untested,
    Ready,
    Busy,
    Unreachable,
}

/// Microcontroller status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceStatus {
    Disconnected,
    NotReady,
    Ready,
    Unreachable,
}

/// Cloud relay status, as last reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudStatus {
    Untested,
    Testing,
    Connected,
    Error,
    Disconnected,
}

/// One consistent view of the three statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub link: LinkStatus,
    pub device: DeviceStatus,
    pub cloud: CloudStatus,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            link: LinkStatus::Untested,
            device: DeviceStatus::Disconnected,
            cloud: CloudStatus::Untested,
        }
    }
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link={:?} device={:?} cloud={:?}", self.link, self.device, self.cloud)
    }
}

/// True iff link, device and cloud are all in their ready state
pub fn readiness(snapshot: &StatusSnapshot) -> bool {
    snapshot.link == LinkStatus::Ready
        && snapshot.device == DeviceStatus::Ready
        && snapshot.cloud == CloudStatus::Connected
}

/// Indicator state of one hop on the pathway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HopState {
    Ready,
    Warning,
    Error,
    Untested,
}

/// The five hops from the operator console to the cloud
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Hop {
    Console,
    Link,
    Device,
    Relay,
    Cloud,
}

impl Hop {
    pub const ALL: [Hop; 5] = [Hop::Console, Hop::Link, Hop::Device, Hop::Relay, Hop::Cloud];

    pub fn label(self) -> &'static str {
        match self {
            Hop::Console => "Monitor Console",
            Hop::Link => "Serial Port",
            Hop::Device => "Microcontroller",
            Hop::Relay => "WiFi Relay",
            Hop::Cloud => "Cloud IoT",
        }
    }
}

/// Directed chain of hops with per-edge connectivity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pathway {
    pub hops: [(Hop, HopState); 5],
    /// `edges[i]` connects `hops[i]` to `hops[i + 1]`
    pub edges: [bool; 4],
}

impl Pathway {
    pub fn all_ready(&self) -> bool {
        self.hops.iter().all(|(_, state)| *state == HopState::Ready)
    }
}

/// Dashboard-level summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemHealth {
    Operational,
    Partial,
    Offline,
}

/// Next setup step the operator still has to complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SetupIssue {
    LinkNotConnected,
    DeviceNotReady,
    CloudNotConnected,
}

impl fmt::Display for SetupIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupIssue::LinkNotConnected => write!(f, "serial port not connected - select and test a port"),
            SetupIssue::DeviceNotReady => write!(f, "device not ready - deploy bootstrap to the device"),
            SetupIssue::CloudNotConnected => write!(f, "cloud not connected - configure and test the endpoint"),
        }
    }
}

fn link_hop(status: LinkStatus) -> HopState {
    match status {
        LinkStatus::Ready => HopState::Ready,
        LinkStatus::Busy => HopState::Error,
        LinkStatus::Unreachable => HopState::Warning,
        LinkStatus::Untested => HopState::Untested,
    }
}

fn device_hop(status: DeviceStatus) -> HopState {
    match status {
        DeviceStatus::Ready => HopState::Ready,
        DeviceStatus::NotReady => HopState::Warning,
        DeviceStatus::Unreachable => HopState::Error,
        DeviceStatus::Disconnected => HopState::Untested,
    }
}

fn cloud_hop(status: CloudStatus) -> HopState {
    match status {
        CloudStatus::Connected => HopState::Ready,
        CloudStatus::Error => HopState::Error,
        CloudStatus::Testing => HopState::Warning,
        CloudStatus::Untested | CloudStatus::Disconnected => HopState::Untested,
    }
}

impl StatusSnapshot {
    pub fn readiness(&self) -> bool {
        readiness(self)
    }

    pub fn pathway(&self) -> Pathway {
        let hops = Hop::ALL.map(|hop| {
            let state = match hop {
                Hop::Console => HopState::Ready,
                Hop::Link => link_hop(self.link),
                Hop::Device => device_hop(self.device),
                // the relay only reports through the cloud status
                Hop::Relay | Hop::Cloud => cloud_hop(self.cloud),
            };
            (hop, state)
        });

        let mut edges = [false; 4];
        for (i, edge) in edges.iter_mut().enumerate() {
            *edge = hops[i].1 == HopState::Ready && hops[i + 1].1 == HopState::Ready;
        }

        Pathway { hops, edges }
    }

    pub fn health(&self) -> SystemHealth {
        if self.readiness() {
            SystemHealth::Operational
        } else if self.link == LinkStatus::Ready && self.device == DeviceStatus::Ready {
            SystemHealth::Partial
        } else {
            SystemHealth::Offline
        }
    }

    pub fn issues(&self) -> Vec<SetupIssue> {
        let mut issues = Vec::new();
        if self.link != LinkStatus::Ready {
            issues.push(SetupIssue::LinkNotConnected);
        }
        if self.link == LinkStatus::Ready && self.device != DeviceStatus::Ready {
            issues.push(SetupIssue::DeviceNotReady);
        }
        if self.device == DeviceStatus::Ready && self.cloud != CloudStatus::Connected {
            issues.push(SetupIssue::CloudNotConnected);
        }
        issues
    }
}

/// Owner of the three statuses
///
/// Every transition replaces the snapshot atomically, so readers never see
/// a half-applied change. Transitions to the current value do not notify.
#[derive(Clone)]
pub struct StatusBoard {
    tx: Arc<watch::Sender<StatusSnapshot>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StatusSnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }

    pub fn set_link(&self, link: LinkStatus) {
        self.transition(|s| s.link = link);
    }

    pub fn set_device(&self, device: DeviceStatus) {
        self.transition(|s| s.device = device);
    }

    pub fn set_cloud(&self, cloud: CloudStatus) {
        self.transition(|s| s.cloud = cloud);
    }

    /// Link closed: port untested, device gone, cloud unknown unless never tested
    pub fn reset_after_close(&self) {
        self.transition(|s| {
            s.link = LinkStatus::Untested;
            s.device = DeviceStatus::Disconnected;
            if s.cloud != CloudStatus::Untested {
                s.cloud = CloudStatus::Disconnected;
            }
        });
    }

    fn transition(&self, apply: impl FnOnce(&mut StatusSnapshot)) {
        self.tx.send_if_modified(|snapshot| {
            let before = *snapshot;
            apply(snapshot);
            if *snapshot == before {
                return false;
            }
            info!(from = %before, to = %snapshot, ready = snapshot.readiness(), "status changed");
            true
        });
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINKS: [LinkStatus; 4] = [
        LinkStatus::Untested,
        LinkStatus::Ready,
        LinkStatus::Busy,
        LinkStatus::Unreachable,
    ];
    const DEVICES: [DeviceStatus; 4] = [
        DeviceStatus::Disconnected,
        DeviceStatus::NotReady,
        DeviceStatus::Ready,
        DeviceStatus::Unreachable,
    ];
    const CLOUDS: [CloudStatus; 5] = [
        CloudStatus::Untested,
        CloudStatus::Testing,
        CloudStatus::Connected,
        CloudStatus::Error,
        CloudStatus::Disconnected,
    ];

    fn ready_snapshot() -> StatusSnapshot {
        StatusSnapshot {
            link: LinkStatus::Ready,
            device: DeviceStatus::Ready,
            cloud: CloudStatus::Connected,
        }
    }

    #[test]
    fn test_readiness_requires_all_three() {
        for link in LINKS {
            for device in DEVICES {
                for cloud in CLOUDS {
                    let snapshot = StatusSnapshot { link, device, cloud };
                    let expected = link == LinkStatus::Ready
                        && device == DeviceStatus::Ready
                        && cloud == CloudStatus::Connected;
                    assert_eq!(readiness(&snapshot), expected, "{}", snapshot);
                }
            }
        }
    }

    #[test]
    fn test_board_flip_breaks_readiness() {
        let board = StatusBoard::new();
        board.set_link(LinkStatus::Ready);
        board.set_device(DeviceStatus::Ready);
        board.set_cloud(CloudStatus::Connected);
        assert!(board.snapshot().readiness());

        board.set_device(DeviceStatus::Unreachable);
        assert!(!board.snapshot().readiness());
        board.set_device(DeviceStatus::Ready);
        assert!(board.snapshot().readiness());

        board.set_cloud(CloudStatus::Error);
        assert!(!board.snapshot().readiness());
    }

    #[test]
    fn test_same_value_does_not_notify() {
        let board = StatusBoard::new();
        let mut rx = board.subscribe();
        rx.mark_unchanged();

        board.set_link(LinkStatus::Untested);
        assert!(!rx.has_changed().unwrap());

        board.set_link(LinkStatus::Busy);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().link, LinkStatus::Busy);
    }

    #[test]
    fn test_reset_after_close() {
        let board = StatusBoard::new();
        board.set_link(LinkStatus::Ready);
        board.set_device(DeviceStatus::Ready);
        board.reset_after_close();
        assert_eq!(board.snapshot(), StatusSnapshot::default());

        board.set_link(LinkStatus::Ready);
        board.set_device(DeviceStatus::Ready);
        board.set_cloud(CloudStatus::Connected);
        board.reset_after_close();
        let snapshot = board.snapshot();
        assert_eq!(snapshot.link, LinkStatus::Untested);
        assert_eq!(snapshot.device, DeviceStatus::Disconnected);
        assert_eq!(snapshot.cloud, CloudStatus::Disconnected);
    }

    #[test]
    fn test_pathway_edges() {
        let pathway = ready_snapshot().pathway();
        assert!(pathway.all_ready());
        assert_eq!(pathway.edges, [true; 4]);

        let pathway = StatusSnapshot { cloud: CloudStatus::Testing, ..ready_snapshot() }.pathway();
        assert_eq!(pathway.hops[3], (Hop::Relay, HopState::Warning));
        assert_eq!(pathway.edges, [true, true, false, false]);

        let pathway = StatusSnapshot {
            link: LinkStatus::Busy,
            device: DeviceStatus::Disconnected,
            cloud: CloudStatus::Untested,
        }
        .pathway();
        assert_eq!(pathway.hops[0], (Hop::Console, HopState::Ready));
        assert_eq!(pathway.hops[1], (Hop::Link, HopState::Error));
        assert_eq!(pathway.hops[2], (Hop::Device, HopState::Untested));
        assert_eq!(pathway.edges, [false; 4]);
    }

    #[test]
    fn test_health_and_issues() {
        assert_eq!(ready_snapshot().health(), SystemHealth::Operational);
        assert!(ready_snapshot().issues().is_empty());

        let partial = StatusSnapshot { cloud: CloudStatus::Untested, ..ready_snapshot() };
        assert_eq!(partial.health(), SystemHealth::Partial);
        assert_eq!(partial.issues(), vec![SetupIssue::CloudNotConnected]);

        let offline = StatusSnapshot::default();
        assert_eq!(offline.health(), SystemHealth::Offline);
        assert_eq!(offline.issues(), vec![SetupIssue::LinkNotConnected]);

        let booting = StatusSnapshot { device: DeviceStatus::NotReady, ..ready_snapshot() };
        assert_eq!(booting.issues(), vec![SetupIssue::DeviceNotReady]);
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(serde_json::to_string(&DeviceStatus::NotReady).unwrap(), "\"not-ready\"");
        let status: CloudStatus = serde_json::from_str("\"connected\"").unwrap();
        assert_eq!(status, CloudStatus::Connected);
    }
}
