//! Serial port transport built on serial2-tokio.
use async_trait::async_trait;
use serial2_tokio::SerialPort;
use std::io;
use std::sync::Arc;
use tokio::sync::watch;

use super::{Connector, Transport, closed_error};

pub struct SerialTransport {
    port: SerialPort,
    closed: watch::Sender<bool>,
}

impl SerialTransport {
    /// Open the port and raise DTR/RTS so boards that reset on DTR boot up.
    pub fn open(path: &str, baud: u32) -> io::Result<Self> {
        let port = SerialPort::open(path, baud)?;
        port.set_dtr(true)?;
        port.set_rts(true)?;
        let (closed, _) = watch::channel(false);
        Ok(Self { port, closed })
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(closed_error());
        }
        tokio::select! {
            result = self.port.read(buf) => result,
            _ = closed.wait_for(|c| *c) => Err(closed_error()),
        }
    }

    async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.port.write_all(buf).await
    }

    async fn close(&self) -> io::Result<()> {
        // The descriptor itself is released when the last handle drops.
        if !self.closed.send_replace(true) {
            tracing::debug!("Serial transport closed");
        }
        Ok(())
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Opens a [`SerialTransport`] on every connect.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    pub port: String,
    pub baud: u32,
}

impl SerialConnector {
    pub fn new(port: impl Into<String>, baud: u32) -> Self {
        Self { port: port.into(), baud }
    }
}

#[async_trait]
impl Connector for SerialConnector {
    async fn open(&self) -> io::Result<Arc<dyn Transport>> {
        tracing::info!("Opening serial port {} at {} baud", self.port, self.baud);
        let transport = SerialTransport::open(&self.port, self.baud)?;
        Ok(Arc::new(transport))
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.port, self.baud)
    }
}
