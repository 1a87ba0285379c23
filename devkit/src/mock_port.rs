/*!
Port série simulé pour développement sans carte

Chaque ouverture crée un tube duplex en mémoire: le côté hôte est rendu au
`DeviceLink`, le côté appareil est récupéré par le test via `take_device`.
Permet de simuler un port occupé, injoignable ou des écritures en échec.
*/

use async_trait::async_trait;
use medsim_link::{DevicePort, PortError, PortStreams};
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, DuplexStream, WriteHalf};

/// Taille du tampon du tube duplex
pub const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Default)]
struct MockState {
    claimed_elsewhere: bool,
    unreachable: Option<String>,
    open: bool,
    device: Option<DuplexStream>,
    opens: usize,
    closes: usize,
}

/// Port simulé, clonable (état partagé)
#[derive(Clone)]
pub struct MockPort {
    name: String,
    state: Arc<Mutex<MockState>>,
    fail_writes: Arc<AtomicBool>,
}

impl MockPort {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MockState::default())),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simule un autre programme qui tient déjà le port
    pub fn claim_externally(&self, claimed: bool) {
        self.state.lock().claimed_elsewhere = claimed;
    }

    /// Simule un port absent ou débranché
    pub fn set_unreachable<S: Into<String>>(&self, reason: Option<S>) {
        self.state.lock().unreachable = reason.map(Into::into);
    }

    /// Toutes les écritures suivantes échouent (et la liaison aussi)
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
        log::info!("🔧 [MOCK] write faults {}", if fail { "on" } else { "off" });
    }

    /// Récupère le côté appareil de la dernière ouverture
    pub fn take_device(&self) -> Option<DuplexStream> {
        self.state.lock().device.take()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().opens
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }
}

impl Default for MockPort {
    fn default() -> Self {
        Self::new("mock0")
    }
}

#[async_trait]
impl DevicePort for MockPort {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self, baud_rate: u32) -> Result<PortStreams, PortError> {
        let mut state = self.state.lock();
        if state.claimed_elsewhere || state.open {
            log::info!("🔒 [MOCK] {} busy", self.name);
            return Err(PortError::Busy);
        }
        if let Some(reason) = &state.unreachable {
            return Err(PortError::Unreachable(reason.clone()));
        }

        let (host, device) = tokio::io::duplex(PIPE_CAPACITY);
        state.device = Some(device);
        state.open = true;
        state.opens += 1;

        let (reader, writer) = tokio::io::split(host);
        let writer = FaultyWriter {
            inner: writer,
            fail: self.fail_writes.clone(),
        };
        log::info!("🔌 [MOCK] {} opened at {} baud", self.name, baud_rate);
        Ok(PortStreams::new(reader, writer))
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        state.open = false;
        state.closes += 1;
        log::info!("🔌 [MOCK] {} closed", self.name);
    }
}

/// Côté écriture avec pannes injectables
struct FaultyWriter {
    inner: WriteHalf<DuplexStream>,
    fail: Arc<AtomicBool>,
}

impl FaultyWriter {
    fn fault(&self) -> Option<io::Error> {
        self.fail
            .load(Ordering::SeqCst)
            .then(|| io::Error::new(io::ErrorKind::BrokenPipe, "injected write fault"))
    }
}

impl AsyncWrite for FaultyWriter {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if let Some(err) = self.fault() {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(err) = self.fault() {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
