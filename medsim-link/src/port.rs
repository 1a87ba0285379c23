//! Byte-stream port abstraction
//!
//! The core never touches a device driver directly. A [`DevicePort`] hands
//! back one read half and one write half per successful open; a read of
//! zero bytes is end-of-stream and a failed write is a write fault.

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub type PortReader = Box<dyn AsyncRead + Send + Unpin>;
pub type PortWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Both halves of an opened port
pub struct PortStreams {
    pub reader: PortReader,
    pub writer: PortWriter,
}

impl PortStreams {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("Port is already claimed by another session")]
    Busy,
    #[error("Port unreachable: {0}")]
    Unreachable(String),
}

#[async_trait]
pub trait DevicePort: Send + Sync {
    /// Human readable port name, for logs
    fn name(&self) -> &str;

    /// Claim the port at the given baud rate
    async fn open(&self, baud_rate: u32) -> Result<PortStreams, PortError>;

    /// Release the claim taken by `open`
    async fn close(&self) {}
}

#[cfg(feature = "serial")]
pub use serial::SerialDevicePort;

#[cfg(feature = "serial")]
mod serial {
    use super::*;
    use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};
    use tracing::{debug, info};

    /// Real serial port, 8N1 without flow control
    pub struct SerialDevicePort {
        path: String,
    }

    impl SerialDevicePort {
        pub fn new(path: impl Into<String>) -> Self {
            Self { path: path.into() }
        }

        /// Serial ports visible on this machine
        pub fn available() -> Vec<String> {
            match tokio_serial::available_ports() {
                Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
                Err(e) => {
                    debug!("Unable to enumerate serial ports: {}", e);
                    Vec::new()
                }
            }
        }
    }

    #[async_trait]
    impl DevicePort for SerialDevicePort {
        fn name(&self) -> &str {
            &self.path
        }

        async fn open(&self, baud_rate: u32) -> Result<PortStreams, PortError> {
            let stream = tokio_serial::new(&self.path, baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .flow_control(FlowControl::None)
                .open_native_async()
                .map_err(classify_open_error)?;

            info!("Serial port {} opened at {} baud", self.path, baud_rate);
            let (reader, writer) = tokio::io::split(stream);
            Ok(PortStreams::new(reader, writer))
        }
    }

    pub(super) fn classify_open_error(err: tokio_serial::Error) -> PortError {
        let busy = matches!(
            err.kind(),
            tokio_serial::ErrorKind::Io(std::io::ErrorKind::AddrInUse)
        ) || err.description.to_lowercase().contains("busy");

        if busy {
            PortError::Busy
        } else {
            PortError::Unreachable(err.description)
        }
    }

}

/// In-memory port for unit tests inside this crate
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use tokio::io::DuplexStream;

    pub(crate) struct DuplexPort {
        device: Mutex<Option<DuplexStream>>,
        refuse: Option<PortError>,
    }

    impl DuplexPort {
        pub(crate) fn new() -> Self {
            Self { device: Mutex::new(None), refuse: None }
        }

        pub(crate) fn refusing(err: PortError) -> Self {
            Self { device: Mutex::new(None), refuse: Some(err) }
        }

        /// Device end of the last opened stream
        pub(crate) fn take_device(&self) -> DuplexStream {
            self.device.lock().take().expect("port was not opened")
        }
    }

    #[async_trait]
    impl DevicePort for DuplexPort {
        fn name(&self) -> &str {
            "duplex"
        }

        async fn open(&self, _baud_rate: u32) -> Result<PortStreams, PortError> {
            if let Some(err) = &self.refuse {
                return Err(err.clone());
            }
            let (host, device) = tokio::io::duplex(64 * 1024);
            *self.device.lock() = Some(device);
            let (reader, writer) = tokio::io::split(host);
            Ok(PortStreams::new(reader, writer))
        }
    }
}
