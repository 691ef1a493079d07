//! IO devices to read and write data from.
use crate::error::FrameCheckError;
use crate::Frame;
use async_trait::async_trait;
use bytes::BytesMut;
use log::debug;
use std::marker::PhantomData;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Opens a fresh byte channel to the device.
#[async_trait]
pub trait Connector: Send + Sync {
    type Port: AsyncRead + AsyncWrite + Unpin + Send;

    async fn open(&self) -> Result<Self::Port, error::DeviceError>;
}

/// Request/response channel on an IO device
///
/// Writes request frames and collects the matching response frame from the device stream.
pub struct FramedPort<P, F> {
    port: P,
    buffer: BytesMut,
    timeout: Duration,
    frame_type: PhantomData<F>,
}

impl<P, F: Frame> FramedPort<P, F> {
    pub fn new(port: P, timeout: Duration) -> FramedPort<P, F> {
        FramedPort {
            port,
            // Allocate buffer with 256 bytes
            buffer: BytesMut::with_capacity(256),
            timeout,
            frame_type: PhantomData,
        }
    }

    /// Take whatever arrived as the response once the device went quiet.
    fn parse_partial(&mut self) -> anyhow::Result<F> {
        match F::check(&mut self.buffer) {
            Ok(frame_data) => Ok(F::parse(frame_data)?),
            Err(FrameCheckError::Incomplete) => Ok(F::parse(self.buffer.split())?),
        }
    }
}

impl<P, F> FramedPort<P, F>
where
    P: AsyncRead + AsyncWrite + Unpin,
    F: Frame,
{
    /// Send a request and read its response.
    ///
    /// Reading stops once a full frame is buffered or the port stayed silent for the timeout.
    /// A response cut short by the timeout is still handed to the frame parser.
    pub async fn transact(&mut self, request: &[u8]) -> anyhow::Result<F> {
        // forget bytes already read past the end of the previous frame;
        // anything still queued in the OS buffer shows up in this response
        self.buffer.clear();

        debug!("-> {:02x?}", request);
        self.port
            .write_all(request)
            .await
            .map_err(error::DeviceError::Io)?;
        self.port.flush().await.map_err(error::DeviceError::Io)?;

        let deadline = tokio::time::Instant::now() + self.timeout;
        while self.buffer.len() < F::LEN {
            match tokio::time::timeout_at(deadline, self.port.read_buf(&mut self.buffer)).await {
                Ok(Ok(0)) => {
                    // stream closed. If buffer empty, the device is gone.
                    if self.buffer.is_empty() {
                        return Err(error::DeviceError::ConnectionLost)?;
                    }
                    break;
                }
                Ok(Ok(_)) => (),
                Ok(Err(ref e)) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Ok(Err(e)) => return Err(error::DeviceError::Io(e))?,
                Err(_elapsed) => break,
            }
        }

        if self.buffer.is_empty() {
            return Err(error::DeviceError::Timeout(self.timeout))?;
        }
        debug!("<- {:02x?}", &self.buffer[..]);
        self.parse_partial()
    }
}

/// Serial devices such as USB
pub mod serial {
    use super::{error::DeviceError, Connector};
    use async_trait::async_trait;
    use log::debug;
    use std::time::Duration;
    use tokio_serial::{SerialPortBuilderExt, SerialStream};

    /// Opens a serial port with fixed line settings.
    #[derive(Debug, Clone)]
    pub struct SerialConnector {
        path: String,
        baud_rate: u32,
        timeout: Duration,
    }

    impl SerialConnector {
        pub fn new(path: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
            SerialConnector {
                path: path.into(),
                baud_rate,
                timeout,
            }
        }

        pub fn path(&self) -> &str {
            &self.path
        }
    }

    #[async_trait]
    impl Connector for SerialConnector {
        type Port = SerialStream;

        async fn open(&self) -> Result<SerialStream, DeviceError> {
            debug!("Open port {} at {} Bd", self.path, self.baud_rate);
            #[allow(unused_mut)]
            let mut port = tokio_serial::new(self.path.as_str(), self.baud_rate)
                .timeout(self.timeout)
                .open_native_async()
                .map_err(|source| DeviceError::Open {
                    path: self.path.clone(),
                    source,
                })?;

            #[cfg(unix)]
            port.set_exclusive(false).map_err(|source| DeviceError::Open {
                path: self.path.clone(),
                source,
            })?;

            Ok(port)
        }
    }

    /// Names of the serial ports present on this machine.
    pub fn available_ports() -> Result<Vec<String>, DeviceError> {
        let ports = serialport::available_ports().map_err(DeviceError::ListPorts)?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }
}

pub mod error {
    use std::time::Duration;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum DeviceError {
        #[error("Cannot open port {path}: {source}")]
        Open {
            path: String,
            source: serialport::Error,
        },
        #[error("Cannot list serial ports: {0}")]
        ListPorts(serialport::Error),
        #[error("IO error on device: {0}")]
        Io(#[from] std::io::Error),
        #[error("No response from device within {0:?}")]
        Timeout(Duration),
        #[error("Connection lost to device")]
        ConnectionLost,
        #[error("Cancelled while waiting for device")]
        Cancelled,
    }
}

#[cfg(test)]
mod test {
    use super::{error::DeviceError, FramedPort};
    use crate::devices::sgp30::{Register, Sgp30Frame};
    use crate::error::DecodeError;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn test_transact_reads_short_reply_after_timeout() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mut port = FramedPort::<_, Sgp30Frame>::new(local, TIMEOUT);

        let device = tokio::spawn(async move {
            let mut request = [0u8; 8];
            remote.read_exact(&mut request).await.unwrap();
            remote.write_all(&[5, 4, 2, 0x01, 0xC2, 0, 0]).await.unwrap();
            (request, remote)
        });

        let frame = port.transact(Register::Co2eq.request()).await.unwrap();
        let (request, _remote) = device.await.unwrap();
        assert_eq!(&request, Register::Co2eq.request());
        assert_eq!(frame.value, 450);
        assert!(frame.is_ok());
    }

    #[test]
    fn test_list_ports_error_is_not_an_open_error() {
        let err = DeviceError::ListPorts(serialport::Error::new(
            serialport::ErrorKind::NoDevice,
            "no udev",
        ));
        assert_eq!(err.to_string(), "Cannot list serial ports: no udev");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transact_forgets_tail_of_overlong_reply() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mut port = FramedPort::<_, Sgp30Frame>::new(local, TIMEOUT);

        let device = tokio::spawn(async move {
            let mut request = [0u8; 8];
            remote.read_exact(&mut request).await.unwrap();
            remote
                .write_all(&[5, 4, 2, 0x01, 0xC2, 0, 0, 0, 0, 0, 0xEE, 0xEE])
                .await
                .unwrap();
            remote.read_exact(&mut request).await.unwrap();
            remote.write_all(&[5, 4, 2, 0x00, 0x14, 0, 0]).await.unwrap();
            remote
        });

        let first = port.transact(Register::Co2eq.request()).await.unwrap();
        let second = port.transact(Register::Tvoc.request()).await.unwrap();
        let _remote = device.await.unwrap();
        assert_eq!(first.value, 450);
        assert_eq!((second.status, second.value), (4, 20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transact_silent_device_times_out() {
        let (local, _remote) = tokio::io::duplex(64);
        let mut port = FramedPort::<_, Sgp30Frame>::new(local, TIMEOUT);

        let err = port.transact(Register::Tvoc.request()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeviceError>(),
            Some(DeviceError::Timeout(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transact_truncated_reply_is_decode_error() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mut port = FramedPort::<_, Sgp30Frame>::new(local, TIMEOUT);
        remote.write_all(&[5, 4, 2]).await.unwrap();

        let err = port.transact(Register::Tvoc.request()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DecodeError>(),
            Some(DecodeError::Truncated { got: 3, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transact_closed_stream_is_connection_lost() {
        let (local, remote) = tokio::io::duplex(64);
        drop(remote);
        let mut port = FramedPort::<_, Sgp30Frame>::new(local, TIMEOUT);

        let err = port.transact(Register::Tvoc.request()).await.unwrap_err();
        assert!(err.downcast_ref::<DeviceError>().is_some());
    }
}
