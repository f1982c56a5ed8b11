//! Serial-attached camera transport (`transport_serial` feature).
//!
//! Some controller boards expose the same wire protocol over an FTDI-style
//! serial bridge. The `serialport` API is blocking, so every call is pushed
//! through `spawn_blocking` to keep the runtime free.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serialport::SerialPort;
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::transport::Transport;

type SharedPort = Arc<Mutex<Box<dyn SerialPort>>>;

/// A camera reachable through a serial bridge.
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    timeout: Duration,
    port: Option<SharedPort>,
}

impl SerialTransport {
    /// Describe a serial-attached camera. The port opens on `connect`.
    pub fn new(path: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            timeout,
            port: None,
        }
    }

    fn shared_port(&self) -> Result<SharedPort, TransportError> {
        self.port
            .as_ref()
            .cloned()
            .ok_or_else(|| TransportError::Disconnected(format!("{} not open", self.path)))
    }
}

fn lock_port(port: &SharedPort) -> std::sync::MutexGuard<'_, Box<dyn SerialPort>> {
    match port.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn map_io(path: &str, err: std::io::Error) -> TransportError {
    if err.kind() == std::io::ErrorKind::TimedOut {
        TransportError::Timeout
    } else {
        TransportError::Disconnected(format!("{path}: {err}"))
    }
}

async fn blocking<T: Send + 'static>(
    path: &str,
    task: impl FnOnce() -> Result<T, TransportError> + Send + 'static,
) -> Result<T, TransportError> {
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| TransportError::Disconnected(format!("{path}: io task failed: {e}")))?
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.path
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let path = self.path.clone();
        let baud_rate = self.baud_rate;
        let timeout = self.timeout;
        let port = blocking(&self.path, move || {
            serialport::new(&path, baud_rate)
                .timeout(timeout)
                .open()
                .map_err(|e| TransportError::Disconnected(format!("{path}: {e}")))
        })
        .await?;
        debug!(path = %self.path, baud = self.baud_rate, "serial port open");
        self.port = Some(Arc::new(Mutex::new(port)));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_some() {
            debug!(path = %self.path, "serial port closed");
        }
        Ok(())
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let port = self.shared_port()?;
        let path = self.path.clone();
        let buf = bytes.to_vec();
        blocking(&self.path, move || {
            let mut guard = lock_port(&port);
            let written = guard.write(&buf).map_err(|e| map_io(&path, e))?;
            if written < buf.len() {
                return Err(TransportError::ShortWrite {
                    expected: buf.len(),
                    written,
                });
            }
            guard.flush().map_err(|e| map_io(&path, e))?;
            trace!(path = %path, bytes = buf.len(), "serial write");
            Ok(())
        })
        .await
    }

    async fn read_chunk(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        let port = self.shared_port()?;
        let path = self.path.clone();
        blocking(&self.path, move || {
            let mut buf = vec![0u8; len];
            let mut guard = lock_port(&port);
            match guard.read(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    trace!(path = %path, bytes = n, "serial read");
                    Ok(buf)
                }
                // A timed-out read means the device has nothing more to say
                // for this command; the caller decides if that is an error.
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
                Err(e) => Err(map_io(&path, e)),
            }
        })
        .await
    }
}
