#![allow(dead_code)]

use async_trait::async_trait;
use marlin_host::communication::Direction;
use marlin_host::transport::{Connector, MockConnector, MockTransport, Transport};
use marlin_host::{Printer, PrinterEvent, ProtocolConfig};
use std::io::Write;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

pub const WAIT: Duration = Duration::from_secs(3);

pub fn settings() -> ProtocolConfig {
    ProtocolConfig {
        handshake_timeout_ms: 1_000,
        drain_timeout_ms: 200,
        ..ProtocolConfig::default()
    }
}

pub fn printer_on(mock: &Arc<MockTransport>, settings: ProtocolConfig) -> Printer {
    Printer::new("test", settings, Box::new(MockConnector::new(mock.clone())))
}

/// A silent mock that has already answered the handshake.
pub async fn connected_silent(settings: ProtocolConfig) -> (Printer, Arc<MockTransport>) {
    let mock = MockTransport::new();
    mock.feed_line("ok");
    let printer = printer_on(&mock, settings);
    printer.connect().await.expect("connect");
    settle(&printer).await;
    mock.clear_written();
    (printer, mock)
}

/// Wait until the reader has consumed the handshake reply.
pub async fn settle(printer: &Printer) {
    eventually("handshake reply", || {
        printer.command_history().iter().any(|e| e.direction == Direction::Received)
    })
    .await;
}

pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn next_matching(
    events: &mut broadcast::Receiver<PrinterEvent>,
    mut wanted: impl FnMut(&PrinterEvent) -> bool,
) -> PrinterEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("event did not arrive")
}

/// Every event already published, without waiting.
pub fn drain_events(events: &mut broadcast::Receiver<PrinterEvent>) -> Vec<PrinterEvent> {
    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => seen.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => return seen,
        }
    }
}

pub fn gcode_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".gcode").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

pub fn numbered_lines(count: usize) -> String {
    (1..=count).map(|i| format!("G1 X{}\n", i)).collect()
}

/// Wraps a mock and parks any write starting with `prefix` until released.
pub struct HeldTransport {
    inner: Arc<MockTransport>,
    prefix: &'static [u8],
    hold: watch::Receiver<bool>,
}

#[async_trait]
impl Transport for HeldTransport {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).await
    }

    async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        if buf.starts_with(self.prefix) {
            let mut hold = self.hold.clone();
            let _ = hold.wait_for(|held| !*held).await;
        }
        self.inner.write_all(buf).await
    }

    async fn close(&self) -> io::Result<()> {
        self.inner.close().await
    }
}

pub struct HeldConnector(Arc<HeldTransport>);

#[async_trait]
impl Connector for HeldConnector {
    async fn open(&self) -> io::Result<Arc<dyn Transport>> {
        Ok(self.0.clone())
    }

    fn describe(&self) -> String {
        "held mock".to_string()
    }
}

/// A printer whose writes starting with `prefix` block until the returned
/// sender is set to `false`.
pub async fn connected_held(prefix: &'static [u8]) -> (Printer, Arc<MockTransport>, watch::Sender<bool>) {
    let mock = MockTransport::new();
    mock.feed_line("ok");
    let (release, hold) = watch::channel(true);
    let transport = Arc::new(HeldTransport { inner: mock.clone(), prefix, hold });
    let printer = Printer::new("held", settings(), Box::new(HeldConnector(transport)));
    printer.connect().await.expect("connect");
    settle(&printer).await;
    mock.clear_written();
    (printer, mock, release)
}
