//! In-memory transport for tests and the `mock` connection type.
//!
//! Inbound bytes are fed by the test (or by the optional firmware emulation);
//! every `write_all` call is recorded verbatim so tests can assert exact wire
//! order.
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

use super::{Connector, Transport, closed_error};

struct Inbound {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
}

/// Just enough Marlin behaviour to drive the engine end to end.
#[derive(Debug, Default)]
struct Firmware {
    partial: String,
    uploading: Option<String>,
    sd_files: Vec<String>,
}

impl Firmware {
    fn reply_to(&mut self, line: &str) -> String {
        let line = line.trim();
        if let Some(name) = &self.uploading {
            if line.starts_with("M29") {
                self.sd_files.push(name.clone());
                self.uploading = None;
                return "Done saving file.\nok\n".to_string();
            }
            return "ok\n".to_string();
        }
        let mut words = line.splitn(2, ' ');
        let command = words.next().unwrap_or("");
        let argument = words.next().unwrap_or("").trim();
        match command {
            "M20" => {
                let mut reply = String::from("Begin file list\n");
                for name in &self.sd_files {
                    reply.push_str(name);
                    reply.push('\n');
                }
                reply.push_str("End file list\nok\n");
                reply
            }
            "M23" => format!("File opened: {}\nFile selected\nok\n", argument),
            "M24" => "ok\nDone printing file\n".to_string(),
            "M28" => {
                self.uploading = Some(argument.to_string());
                format!("Writing to file: {}\nok\n", argument)
            }
            "M105" => "ok T:21.0 /0.0 B:21.0 /0.0\n".to_string(),
            _ => "ok\n".to_string(),
        }
    }
}

pub struct MockTransport {
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound: tokio::sync::Mutex<Inbound>,
    written: Mutex<Vec<String>>,
    closed: watch::Sender<bool>,
    close_count: AtomicUsize,
    fail_writes: AtomicBool,
    firmware: Option<Mutex<Firmware>>,
}

impl MockTransport {
    /// A silent printer: nothing arrives unless the test feeds it.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// A printer that acknowledges every line and understands the SD commands.
    pub fn emulated() -> Arc<Self> {
        Arc::new(Self::build(Some(Mutex::new(Firmware::default()))))
    }

    fn build(firmware: Option<Mutex<Firmware>>) -> Self {
        let (inbound_tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        Self {
            inbound_tx,
            inbound: tokio::sync::Mutex::new(Inbound { rx, pending: Vec::new() }),
            written: Mutex::new(Vec::new()),
            closed,
            close_count: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            firmware,
        }
    }

    pub fn feed(&self, bytes: impl Into<Vec<u8>>) {
        // The receiver lives as long as `self`, so this cannot fail.
        let _ = self.inbound_tx.send(bytes.into());
    }

    pub fn feed_line(&self, line: &str) {
        self.feed(format!("{}\n", line));
    }

    /// Every `write_all` call so far, in order.
    pub fn written(&self) -> Vec<String> {
        self.written.lock().map(|w| w.clone()).unwrap_or_default()
    }

    pub fn clear_written(&self) {
        if let Ok(mut written) = self.written.lock() {
            written.clear();
        }
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Simulates the cable being pulled: pending and future reads fail.
    pub fn hang_up(&self) {
        self.closed.send_replace(true);
    }

    fn reopen(&self) {
        self.closed.send_replace(false);
    }

    fn emulate(&self, bytes: &[u8]) {
        let Some(firmware) = &self.firmware else { return };
        let Ok(mut firmware) = firmware.lock() else { return };
        firmware.partial.push_str(&String::from_utf8_lossy(bytes));
        while let Some(pos) = firmware.partial.find('\n') {
            let line: String = firmware.partial.drain(..=pos).collect();
            if line.trim().is_empty() {
                continue;
            }
            let reply = firmware.reply_to(&line);
            self.feed(reply);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(closed_error());
        }
        let mut inbound = self.inbound.lock().await;
        if inbound.pending.is_empty() {
            let chunk = tokio::select! {
                chunk = inbound.rx.recv() => chunk,
                _ = closed.wait_for(|c| *c) => return Err(closed_error()),
            };
            let Some(chunk) = chunk else { return Ok(0) };
            inbound.pending = chunk;
            while let Ok(more) = inbound.rx.try_recv() {
                inbound.pending.extend_from_slice(&more);
            }
        }
        let n = buf.len().min(inbound.pending.len());
        buf[..n].copy_from_slice(&inbound.pending[..n]);
        inbound.pending.drain(..n);
        Ok(n)
    }

    async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write failure"));
        }
        if let Ok(mut written) = self.written.lock() {
            written.push(String::from_utf8_lossy(buf).into_owned());
        }
        self.emulate(buf);
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        if !self.closed.send_replace(true) {
            self.close_count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Hands out the same [`MockTransport`] on every open, reopening it if needed.
#[derive(Clone)]
pub struct MockConnector {
    transport: Arc<MockTransport>,
    fail_open: Arc<AtomicBool>,
    opens: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new(transport: Arc<MockTransport>) -> Self {
        Self {
            transport,
            fail_open: Arc::new(AtomicBool::new(false)),
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self) -> io::Result<Arc<dyn Transport>> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "mock port unavailable"));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.transport.reopen();
        Ok(self.transport.clone())
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}
