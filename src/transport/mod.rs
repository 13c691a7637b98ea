//! Byte-level link to the supply.
//!
//! A [`Transport`] owns at most one open link. Opening a link starts a reader
//! task that appends every received byte to an inbound buffer; the command
//! engine clears that buffer before a command and drains it after the settle
//! time. Any `AsyncRead + AsyncWrite` stream can be attached, which is how the
//! simulated supply and `tokio::io::duplex` test links stand in for hardware.

pub mod sim;

use crate::error::{PsuError, PsuResult, TransportError};
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}
pub type DynSerial = Box<dyn SerialPortIO>;

/// An available serial port. Ports lacking any field are not listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortDescriptor {
    /// OS name of the port (e.g., "/dev/ttyACM0", "COM3")
    pub system_name: String,
    pub manufacturer_description: String,
    pub product_id: u16,
}

/// Enumerate USB serial ports with a known manufacturer.
#[cfg(feature = "instrument_serial")]
pub fn list_ports() -> PsuResult<Vec<PortDescriptor>> {
    use serialport::SerialPortType;

    let ports = serialport::available_ports().map_err(|e| PsuError::Enumeration(e.to_string()))?;
    let descriptors = ports
        .into_iter()
        .filter_map(|port| match port.port_type {
            SerialPortType::UsbPort(usb) => usb.manufacturer.map(|manufacturer| PortDescriptor {
                system_name: port.port_name,
                manufacturer_description: manufacturer,
                product_id: usb.pid,
            }),
            _ => None,
        })
        .collect();
    Ok(descriptors)
}

#[cfg(not(feature = "instrument_serial"))]
pub fn list_ports() -> PsuResult<Vec<PortDescriptor>> {
    Err(PsuError::FeatureNotEnabled("instrument_serial".to_string()))
}

/// Open a serial port with fixed 8-N-1 framing.
#[cfg(feature = "instrument_serial")]
fn open_port(port_name: &str, baud_rate: u32) -> Result<DynSerial, TransportError> {
    use tokio_serial::SerialPortBuilderExt;

    let port = tokio_serial::new(port_name, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| TransportError::Open {
            port: port_name.to_string(),
            reason: e.to_string(),
        })?;

    Ok(Box::new(port))
}

struct Link {
    name: String,
    writer: WriteHalf<DynSerial>,
    reader: JoinHandle<()>,
}

/// Owner of the single open link and its inbound buffer.
pub struct Transport {
    link: Mutex<Option<Link>>,
    inbound: Arc<SyncMutex<Vec<u8>>>,
    online: Arc<AtomicBool>,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    pub fn new() -> Self {
        Self {
            link: Mutex::new(None),
            inbound: Arc::new(SyncMutex::new(Vec::new())),
            online: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Open `port_name` at `baud_rate`, releasing any previous link first.
    #[cfg(feature = "instrument_serial")]
    pub async fn open(&self, port_name: &str, baud_rate: u32) -> PsuResult<()> {
        let name = port_name.to_string();
        let port = tokio::task::spawn_blocking(move || open_port(&name, baud_rate))
            .await
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))??;

        info!(port = port_name, baud_rate, "Serial port opened");
        self.attach(port_name, port).await;
        Ok(())
    }

    #[cfg(not(feature = "instrument_serial"))]
    pub async fn open(&self, _port_name: &str, _baud_rate: u32) -> PsuResult<()> {
        Err(PsuError::FeatureNotEnabled("instrument_serial".to_string()))
    }

    /// Bind an already-open stream as the link, releasing any previous one.
    pub async fn attach(&self, name: &str, io: DynSerial) {
        let mut link = self.link.lock().await;
        if let Some(previous) = link.take() {
            debug!(port = %previous.name, "Releasing previous link");
            previous.reader.abort();
            // the old reader must not touch the buffer or flag once the new link is up
            let _ = previous.reader.await;
        }

        let (reader, writer) = tokio::io::split(io);
        self.inbound.lock().clear();
        self.online.store(true, Ordering::SeqCst);

        let reader = tokio::spawn(accumulate(
            name.to_string(),
            reader,
            self.inbound.clone(),
            self.online.clone(),
        ));

        *link = Some(Link {
            name: name.to_string(),
            writer,
            reader,
        });
    }

    /// Write `bytes`, failing if no link is open or the write takes longer than `limit`.
    pub async fn write(&self, bytes: &[u8], limit: Duration) -> Result<(), TransportError> {
        let mut guard = self.link.lock().await;
        let Link { name, writer, .. } = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let write = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        };
        let result = tokio::time::timeout(limit, write).await;

        match result {
            Ok(Ok(())) => {
                trace!(port = %name, bytes = bytes.len(), "Wrote to link");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(port = %name, error = %e, "Write failed");
                self.online.store(false, Ordering::SeqCst);
                Err(TransportError::Io(e))
            }
            Err(_) => {
                warn!(port = %name, ?limit, "Write timed out");
                self.online.store(false, Ordering::SeqCst);
                Err(TransportError::WriteTimeout(limit))
            }
        }
    }

    /// Discard everything received so far.
    pub fn clear_inbound(&self) {
        self.inbound.lock().clear();
    }

    /// Number of bytes received since the last clear.
    pub fn inbound_len(&self) -> usize {
        self.inbound.lock().len()
    }

    /// Take everything received since the last clear.
    pub fn take_inbound(&self) -> Vec<u8> {
        std::mem::take(&mut *self.inbound.lock())
    }

    /// True while a link is bound and neither side has reported a failure.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Release the link. Safe to call when nothing is open.
    pub async fn close(&self) {
        let mut link = self.link.lock().await;
        self.online.store(false, Ordering::SeqCst);
        if let Some(mut previous) = link.take() {
            previous.reader.abort();
            let _ = (&mut previous.reader).await;
            if let Err(e) = previous.writer.shutdown().await {
                debug!(port = %previous.name, error = %e, "Shutdown of link failed");
            }
            info!(port = %previous.name, "Link closed");
        }
    }
}

async fn accumulate(
    name: String,
    mut reader: ReadHalf<DynSerial>,
    inbound: Arc<SyncMutex<Vec<u8>>>,
    online: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 256];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!(port = %name, "Link reached EOF");
                break;
            }
            Ok(n) => {
                trace!(port = %name, bytes = n, "Received from link");
                inbound.lock().extend_from_slice(&buf[..n]);
            }
            Err(e) => {
                warn!(port = %name, error = %e, "Read from link failed");
                break;
            }
        }
    }
    online.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_without_link_is_not_connected() {
        let transport = Transport::new();
        assert!(!transport.is_online());
        let err = transport
            .write(b"VSET1?", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn attached_link_accumulates_inbound_bytes() {
        let (mut device, host) = tokio::io::duplex(64);
        let transport = Transport::new();
        transport.attach("duplex", Box::new(host)).await;
        assert!(transport.is_online());

        transport.write(b"VSET1?", Duration::from_millis(100)).await.unwrap();
        let mut buf = [0u8; 16];
        let n = device.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"VSET1?");

        device.write_all(b"12.").await.unwrap();
        device.write_all(b"50").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.take_inbound(), b"12.50");
        assert!(transport.take_inbound().is_empty());
    }

    #[tokio::test]
    async fn peer_hangup_marks_offline() {
        let (device, host) = tokio::io::duplex(64);
        let transport = Transport::new();
        transport.attach("duplex", Box::new(host)).await;
        drop(device);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!transport.is_online());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (_device, host) = tokio::io::duplex(64);
        let transport = Transport::new();
        transport.close().await;
        transport.attach("duplex", Box::new(host)).await;
        transport.close().await;
        transport.close().await;
        assert!(!transport.is_online());
        assert!(matches!(
            transport.write(b"OUT1", Duration::from_millis(50)).await,
            Err(TransportError::NotConnected)
        ));
    }
}
