//! Transport session over a [`DevicePort`]
//!
//! One session owns at most one open port: a single read loop feeding the
//! message handler and a single shared write handle behind an async mutex,
//! so heartbeat, telemetry and acknowledgements serialize their writes.

use futures::StreamExt;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{self, InboundMessage, OutboundMessage};
use crate::emitter::Emitter;
use crate::frame::LineDecoder;
use crate::link::LinkError;
use crate::port::{DevicePort, PortError, PortReader, PortWriter};
use crate::status::{LinkStatus, StatusBoard};

/// Fixed symbol rate of the device link
pub const BAUD_RATE: u32 = 115_200;

/// Receives every decoded inbound message, in arrival order
///
/// Called from the read loop; must not block.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, message: InboundMessage);
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    port: Arc<dyn DevicePort>,
    writer: tokio::sync::Mutex<Option<PortWriter>>,
    reader: parking_lot::Mutex<Option<Emitter>>,
    status: StatusBoard,
    root: CancellationToken,
}

impl Session {
    pub fn new(port: Arc<dyn DevicePort>, status: StatusBoard, root: CancellationToken) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                port,
                writer: tokio::sync::Mutex::new(None),
                reader: parking_lot::Mutex::new(None),
                status,
                root,
            }),
        }
    }

    pub fn port_name(&self) -> &str {
        self.inner.port.name()
    }

    pub async fn is_open(&self) -> bool {
        self.inner.writer.lock().await.is_some()
    }

    /// Open the port and start the read loop
    ///
    /// Port failures are not errors here: they become `Busy` or
    /// `Unreachable` link status, which is also returned.
    pub async fn open(&self, handler: Arc<dyn MessageHandler>) -> Result<LinkStatus, LinkError> {
        let mut writer = self.inner.writer.lock().await;
        if writer.is_some() {
            return Err(LinkError::AlreadyOpen(self.port_name().to_string()));
        }

        let streams = match self.inner.port.open(BAUD_RATE).await {
            Ok(streams) => streams,
            Err(PortError::Busy) => {
                warn!("Port {} is busy", self.port_name());
                self.inner.status.set_link(LinkStatus::Busy);
                return Ok(LinkStatus::Busy);
            }
            Err(PortError::Unreachable(reason)) => {
                error!("Port {} unreachable: {}", self.port_name(), reason);
                self.inner.status.set_link(LinkStatus::Unreachable);
                return Ok(LinkStatus::Unreachable);
            }
        };

        *writer = Some(streams.writer);
        let port_name = self.port_name().to_string();
        let reader = streams.reader;
        let emitter = Emitter::spawn(&self.inner.root, move |cancel| {
            read_loop(reader, handler, cancel, port_name)
        });
        *self.inner.reader.lock() = Some(emitter);
        drop(writer);

        info!("Link open on {} at {} baud", self.port_name(), BAUD_RATE);
        self.inner.status.set_link(LinkStatus::Ready);
        Ok(LinkStatus::Ready)
    }

    /// Encode and write one message; `false` on any write fault
    pub async fn send(&self, message: &OutboundMessage) -> bool {
        let line = codec::encode(message);
        let mut guard = self.inner.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            debug!("{} dropped, link not open", message.kind());
            return false;
        };

        let written = match writer.write_all(line.as_bytes()).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => {
                debug!(kind = message.kind(), bytes = line.len(), "sent");
                true
            }
            Err(e) => {
                warn!("Failed to send {}: {}", message.kind(), e);
                false
            }
        }
    }

    /// Release read side, write side and port, then reset status
    ///
    /// Idempotent. Callers stop their own emitters first.
    pub(crate) async fn close(&self) {
        let reader = self.inner.reader.lock().take();
        if let Some(reader) = reader {
            reader.shutdown().await;
        }

        let writer = self.inner.writer.lock().await.take();
        if let Some(mut writer) = writer {
            // the peer may already be gone
            let _ = writer.shutdown().await;
            self.inner.port.close().await;
            info!("Link on {} closed", self.port_name());
        }

        self.inner.status.reset_after_close();
    }
}

async fn read_loop(
    reader: PortReader,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
    port_name: String,
) {
    let mut lines = FramedRead::new(reader, LineDecoder::new());

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Read loop on {} cancelled", port_name);
                return;
            }
            next = lines.next() => next,
        };

        match next {
            Some(Ok(line)) => {
                if line.is_empty() {
                    continue;
                }
                handler.handle(codec::decode(&line));
            }
            Some(Err(e)) => {
                warn!("Read error on {}: {}", port_name, e);
                return;
            }
            None => {
                info!("Port {} reached end of stream", port_name);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::testing::DuplexPort;
    use crate::status::DeviceStatus;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<InboundMessage>);

    impl MessageHandler for Forward {
        fn handle(&self, message: InboundMessage) {
            let _ = self.0.send(message);
        }
    }

    fn session_with(port: Arc<DuplexPort>) -> (Session, StatusBoard) {
        let status = StatusBoard::new();
        let session = Session::new(port, status.clone(), CancellationToken::new());
        (session, status)
    }

    #[tokio::test]
    async fn test_open_send_receive() {
        let port = Arc::new(DuplexPort::new());
        let (session, status) = session_with(port.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert_eq!(session.open(Arc::new(Forward(tx))).await.unwrap(), LinkStatus::Ready);
        assert_eq!(status.snapshot().link, LinkStatus::Ready);

        let device = port.take_device();
        let (device_rd, mut device_wr) = tokio::io::split(device);
        let mut device_lines = BufReader::new(device_rd).lines();

        assert!(session.send(&OutboundMessage::Heartbeat).await);
        assert_eq!(device_lines.next_line().await.unwrap().unwrap(), r#"{"type":"HEARTBEAT"}"#);

        device_wr.write_all(b"{\"type\":\"RE").await.unwrap();
        device_wr.write_all(b"ADY\"}\n\n  \nnoise\n").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), InboundMessage::Ready);
        assert_eq!(rx.recv().await.unwrap(), InboundMessage::Unknown { raw: "noise".to_string() });
    }

    #[tokio::test]
    async fn test_open_twice_rejected() {
        let port = Arc::new(DuplexPort::new());
        let (session, status) = session_with(port);
        let (tx, _rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn MessageHandler> = Arc::new(Forward(tx));

        session.open(handler.clone()).await.unwrap();
        assert!(matches!(session.open(handler).await, Err(LinkError::AlreadyOpen(_))));
        assert_eq!(status.snapshot().link, LinkStatus::Ready);
    }

    #[tokio::test]
    async fn test_open_failures_become_status() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn MessageHandler> = Arc::new(Forward(tx));

        let (session, status) = session_with(Arc::new(DuplexPort::refusing(PortError::Busy)));
        assert_eq!(session.open(handler.clone()).await.unwrap(), LinkStatus::Busy);
        assert_eq!(status.snapshot().link, LinkStatus::Busy);
        assert!(!session.send(&OutboundMessage::Heartbeat).await);

        let refused = DuplexPort::refusing(PortError::Unreachable("gone".to_string()));
        let (session, status) = session_with(Arc::new(refused));
        assert_eq!(session.open(handler).await.unwrap(), LinkStatus::Unreachable);
        assert_eq!(status.snapshot().link, LinkStatus::Unreachable);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_resets() {
        let port = Arc::new(DuplexPort::new());
        let (session, status) = session_with(port.clone());
        let (tx, _rx) = mpsc::unbounded_channel();

        session.open(Arc::new(Forward(tx))).await.unwrap();
        status.set_device(DeviceStatus::Ready);
        let _device = port.take_device();

        session.close().await;
        session.close().await;
        assert!(!session.is_open().await);
        assert_eq!(status.snapshot().link, LinkStatus::Untested);
        assert_eq!(status.snapshot().device, DeviceStatus::Disconnected);
        assert!(!session.send(&OutboundMessage::Heartbeat).await);
    }

    #[tokio::test]
    async fn test_send_fails_when_peer_gone() {
        let port = Arc::new(DuplexPort::new());
        let (session, _status) = session_with(port.clone());
        let (tx, _rx) = mpsc::unbounded_channel();

        session.open(Arc::new(Forward(tx))).await.unwrap();
        drop(port.take_device());
        assert!(!session.send(&OutboundMessage::Heartbeat).await);
    }
}
