//! Byte-stream transports the printer engine talks through.
//!
//! The engine never opens ports itself: it asks a [`Connector`] for a fresh
//! [`Transport`] on every `connect()` and owns that handle exclusively until the
//! connection is released.

pub mod mock;
pub mod serial;

use async_trait::async_trait;
use std::io;
use std::sync::Arc;

pub use mock::{MockConnector, MockTransport};
pub use serial::{SerialConnector, SerialTransport};

/// A full-duplex byte stream to one printer.
///
/// All methods take `&self`: the reader task and the writer tasks share one
/// handle behind an `Arc`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Suspends until at least one byte is available, then copies everything
    /// already buffered (up to `buf.len()`). `Ok(0)` means end of stream.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    async fn write_all(&self, buf: &[u8]) -> io::Result<()>;

    /// Closes the stream. Must be idempotent and must wake a pending `read`.
    async fn close(&self) -> io::Result<()>;
}

/// Produces transports for a single physical printer.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> io::Result<Arc<dyn Transport>>;

    /// Human readable endpoint, used in logs.
    fn describe(&self) -> String;
}

pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport closed")
}
