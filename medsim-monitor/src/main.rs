//! MedSim Monitor - headless bedside monitor
//!
//! Drives a MedSim device over its serial link:
//! - Opens the configured port and deploys the bootstrap
//! - Tests the cloud endpoint once the device reports ready
//! - Transmits vitals once the whole pathway is ready
//! - Logs status, setup issues and pending commands until Ctrl-C

mod config;

use anyhow::{bail, Context, Result};
use config::MonitorConfig;
use medsim_link::{
    CloudStatus, DeviceLink, DeviceStatus, LinkStatus, SerialDevicePort, StatusSnapshot,
};
use std::sync::Arc;
use tokio::time::interval;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "medsim_monitor=info,medsim_link=info";

/// Side effects to run for a new status snapshot
#[derive(Debug, Default, PartialEq, Eq)]
struct Reaction {
    test_cloud: bool,
    start_transmission: bool,
}

/// Status-driven automation, independent of any I/O
#[derive(Debug)]
struct Autopilot {
    test_on_ready: bool,
    auto_start: bool,
    // cloud already probed during the current device-ready episode
    cloud_probed: bool,
}

impl Autopilot {
    fn new(config: &MonitorConfig) -> Self {
        Self {
            test_on_ready: config.cloud.test_on_ready && !config.cloud.endpoint.trim().is_empty(),
            auto_start: config.telemetry.auto_start,
            cloud_probed: false,
        }
    }

    fn react(&mut self, snapshot: &StatusSnapshot, transmitting: bool) -> Reaction {
        if snapshot.device != DeviceStatus::Ready {
            self.cloud_probed = false;
        }

        let mut reaction = Reaction::default();
        let cloud_idle = matches!(snapshot.cloud, CloudStatus::Untested | CloudStatus::Disconnected);
        if self.test_on_ready && !self.cloud_probed && snapshot.device == DeviceStatus::Ready && cloud_idle {
            self.cloud_probed = true;
            reaction.test_cloud = true;
        }
        if self.auto_start && snapshot.readiness() && !transmitting {
            reaction.start_transmission = true;
        }
        reaction
    }
}

async fn supervise(link: DeviceLink, mut autopilot: Autopilot) {
    let mut rx = link.subscribe();

    loop {
        let snapshot = *rx.borrow_and_update();
        info!(health = ?snapshot.health(), "{}", snapshot);
        for issue in snapshot.issues() {
            info!("Setup: {}", issue);
        }

        let reaction = autopilot.react(&snapshot, link.transmitting());
        if reaction.test_cloud {
            match link.test_cloud().await {
                Ok(true) => info!("Cloud test sent for {}", link.cloud_endpoint()),
                Ok(false) => warn!("Cloud test could not be sent"),
                Err(e) => warn!("Cloud test skipped: {}", e),
            }
        }
        if reaction.start_transmission {
            if let Err(e) = link.start_transmission() {
                warn!("Transmission not started: {}", e);
            }
        } else if link.transmitting() && !snapshot.readiness() {
            warn!("Pathway degraded while transmitting");
        }

        let pending = link.unacknowledged_count();
        if pending > 0 {
            info!("{} command(s) awaiting acknowledgement", pending);
        }

        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Jitter enabled channels every period, mimicking live sensors
async fn randomize_vitals(link: DeviceLink) {
    let mut ticker = interval(link.transmission_period());
    loop {
        ticker.tick().await;
        if link.transmitting() {
            link.update_vitals(|table| table.randomize_all());
            debug!("Vitals randomised");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    info!("MedSim Monitor v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = MonitorConfig::load().await.context("Failed to load configuration")?;
    let vitals = config.vitals_table()?;
    info!(
        "{} of {} vitals channels enabled",
        vitals.enabled_count(),
        vitals.len()
    );

    let port = Arc::new(SerialDevicePort::new(&config.serial.path));
    let link = DeviceLink::builder(port)
        .vitals(vitals)
        .cloud_endpoint(&config.cloud.endpoint)
        .transmission_period(config.telemetry.interval())
        .build()
        .context("Failed to build device link")?;

    match link.open().await.context("Failed to open device link")? {
        LinkStatus::Ready => {}
        status => bail!(
            "Serial port {} not usable ({:?}); available ports: {:?}",
            config.serial.path,
            status,
            SerialDevicePort::available()
        ),
    }

    if !link.deploy_bootstrap().await? {
        warn!("Bootstrap not delivered, waiting for the device to announce itself");
    }

    let supervisor = tokio::spawn(supervise(link.clone(), Autopilot::new(&config)));
    let randomizer = config
        .telemetry
        .randomize
        .then(|| tokio::spawn(randomize_vitals(link.clone())));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down...");

    supervisor.abort();
    if let Some(randomizer) = randomizer {
        randomizer.abort();
    }
    link.stop_transmission().await;
    link.close().await;

    Ok(())
}
