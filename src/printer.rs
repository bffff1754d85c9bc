// src/printer.rs - protocol engine for one Marlin printer
use futures_util::StreamExt;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::communication::{
    CommandHistory, Direction, EventBus, HistoryEntry, LineFramer, PrinterEvent, Response, ResponseParser,
    line_stream,
};
use crate::communication::parser::Anomaly;
use crate::config::ProtocolConfig;
use crate::flow_control::CreditGate;
use crate::gcode::{LIST_SD_FILES, START_SD_PRINT, select_sd_file};
use crate::print_job::{PrintEnd, PrintProgress, PrintSession, StatusReport, StreamingPrint};
use crate::state::{PrinterStatus, StatusCell, TransitionError};
use crate::transport::{Connector, Transport};
use crate::upload::{UploadJob, UploadQueue};
use crate::writer::spawn_writer;

#[derive(Debug, Error)]
pub enum PrinterError {
    #[error("Connectivity error: {0}")]
    Connectivity(#[from] io::Error),
    #[error("Printer is not connected")]
    NotConnected,
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Cannot read {path}: {source}")]
    FileAccess {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl From<TransitionError> for PrinterError {
    fn from(e: TransitionError) -> Self {
        PrinterError::InvalidState(e.to_string())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An open transport plus the reader task draining it.
struct Link {
    id: u64,
    transport: Arc<dyn Transport>,
    stop: watch::Sender<bool>,
    reader: JoinHandle<()>,
}

impl Link {
    async fn shut(self) {
        self.stop.send_replace(true);
        if let Err(e) = self.transport.close().await {
            tracing::warn!("Error closing transport: {}", e);
        }
    }
}

/// State shared by the public handle, the reader task and the writer tasks.
pub(crate) struct Engine {
    name: String,
    pub(crate) settings: ProtocolConfig,
    connector: Box<dyn Connector>,
    pub(crate) status: StatusCell,
    pub(crate) events: EventBus,
    history: CommandHistory,
    pub(crate) credits: CreditGate,
    pub(crate) uploads: UploadQueue,
    link: Mutex<Option<Link>>,
    next_link_id: AtomicU64,
    /// Serializes connect and disconnect.
    lifecycle: tokio::sync::Mutex<()>,
    /// Keeps each outbound line a single uninterrupted write.
    write_lock: tokio::sync::Mutex<()>,
    session: Mutex<Option<PrintSession>>,
    progress: Mutex<Option<PrintProgress>>,
    listing: RwLock<Option<Vec<String>>>,
    anomalies: AtomicU64,
}

impl Engine {
    pub(crate) fn is_connected(&self) -> bool {
        lock(&self.link).is_some()
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        lock(&self.link).as_ref().map(|link| link.transport.clone())
    }

    /// Id of the open link. Writers pin it so they never outlive their link.
    pub(crate) fn link_id(&self) -> Option<u64> {
        lock(&self.link).as_ref().map(|link| link.id)
    }

    fn streaming(&self) -> bool {
        lock(&self.session).is_some()
    }

    /// Write `line` plus the terminator in one call.
    pub(crate) async fn write_line(&self, line: &str) -> Result<(), PrinterError> {
        let transport = self.transport().ok_or(PrinterError::NotConnected)?;
        self.send(transport, line).await
    }

    /// Like `write_line`, but only on link `link_id`; a newer link is left alone.
    pub(crate) async fn write_line_on(&self, link_id: u64, line: &str) -> Result<(), PrinterError> {
        let transport = lock(&self.link)
            .as_ref()
            .filter(|link| link.id == link_id)
            .map(|link| link.transport.clone());
        self.send(transport.ok_or(PrinterError::NotConnected)?, line).await
    }

    async fn send(&self, transport: Arc<dyn Transport>, line: &str) -> Result<(), PrinterError> {
        let mut wire = String::with_capacity(line.len() + 1);
        wire.push_str(line);
        wire.push('\n');
        {
            let _guard = self.write_lock.lock().await;
            transport.write_all(wire.as_bytes()).await?;
        }
        tracing::debug!("{} <- {}", self.name, line);
        self.history.record(Direction::Sent, line);
        self.events.publish(PrinterEvent::LineSent { line: line.to_string() });
        Ok(())
    }

    pub(crate) fn record_progress(&self, progress: PrintProgress) {
        *lock(&self.progress) = Some(progress);
        if self.settings.report_progress {
            self.events.publish(PrinterEvent::Progress(progress));
        }
    }

    fn record_anomaly(&self, anomaly: Anomaly) {
        self.anomalies.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("{}: protocol anomaly: {}", self.name, anomaly);
        self.events.publish(PrinterEvent::anomaly(&anomaly));
    }

    pub(crate) fn kick_uploads(self: &Arc<Self>) {
        self.uploads.kick(self);
    }

    fn cancel_session(&self) {
        if let Some(session) = lock(&self.session).as_ref() {
            if session.cancel() {
                tracing::info!("Cancelling print of {}", session.file);
            }
        }
    }

    fn handle_line(self: &Arc<Self>, parser: &mut ResponseParser, line: String) {
        tracing::debug!("{} -> {}", self.name, line);
        self.history.record(Direction::Received, &line);
        let response = parser.handle(&line);
        self.events.publish(PrinterEvent::LineReceived { line });
        match response {
            Response::Acknowledgment => {
                if self.credits.is_active() && !self.credits.release() {
                    self.record_anomaly(Anomaly::UnsolicitedAck);
                }
            }
            Response::FileList(files) => {
                tracing::info!("{}: {} files on SD card", self.name, files.len());
                if let Ok(mut listing) = self.listing.write() {
                    *listing = Some(files.clone());
                }
                self.events.publish(PrinterEvent::FileListReceived { files });
            }
            Response::PrintDone => self.print_done(),
            Response::Anomaly(anomaly) => self.record_anomaly(anomaly),
            Response::FileListStarted | Response::FileListEntry | Response::Other => {}
        }
    }

    fn print_done(self: &Arc<Self>) {
        if self.streaming() {
            tracing::debug!("{}: firmware reported completion during a streamed print", self.name);
            return;
        }
        // Only an SD print completes here; an upload worker owns `Uploading`.
        match self.status.transition(PrinterStatus::Printing, PrinterStatus::Online) {
            Ok(_) => {
                self.events.publish(PrinterEvent::PrintComplete { file: None });
                self.kick_uploads();
            }
            Err(_) => self.record_anomaly(Anomaly::UnexpectedCompletion),
        }
    }

    /// Tear down link `link_id` after a read or write failure. Only the first
    /// report for that link has any effect; a newer link is never touched.
    pub(crate) async fn connection_lost(&self, link_id: u64, reason: String) {
        let link = {
            let mut slot = lock(&self.link);
            if slot.as_ref().is_some_and(|link| link.id == link_id) { slot.take() } else { None }
        };
        let Some(link) = link else {
            return;
        };
        tracing::error!("{}: connection lost: {}", self.name, reason);
        link.shut().await;
        self.cancel_session();
        self.credits.deactivate();
        self.status.force_offline();
        self.events.publish(PrinterEvent::ConnectionLost { reason });
    }

    pub(crate) async fn report_writer_failure(&self, link_id: u64, error: &PrinterError) {
        let reason = error.to_string();
        self.events.publish(PrinterEvent::WriterFailed { reason: reason.clone() });
        if let PrinterError::Connectivity(_) = error {
            self.connection_lost(link_id, reason).await;
        }
    }

    /// Drop link `link_id` without changing status; `connect` may reopen it.
    async fn release_link(&self, link_id: u64) {
        let link = {
            let mut slot = lock(&self.link);
            if slot.as_ref().is_some_and(|link| link.id == link_id) { slot.take() } else { None }
        };
        if let Some(link) = link {
            tracing::info!("{}: releasing {}", self.name, self.connector.describe());
            link.shut().await;
        }
    }

    pub(crate) async fn finish_print(self: &Arc<Self>, link_id: u64, file: &str, end: PrintEnd) {
        if self.link_id() == Some(link_id) && !self.credits.drain(self.settings.drain_timeout()).await {
            tracing::warn!("{}: closing with unacknowledged lines", self.name);
        }
        self.credits.deactivate();
        if self.settings.close_after_print {
            self.release_link(link_id).await;
        }
        *lock(&self.session) = None;
        let _ = self.status.transition(PrinterStatus::Printing, PrinterStatus::Online);
        let file = Some(file.to_string());
        match end {
            PrintEnd::Completed => {
                tracing::info!("{}: print complete", self.name);
                self.events.publish(PrinterEvent::PrintComplete { file });
            }
            PrintEnd::Cancelled => {
                tracing::info!("{}: print cancelled", self.name);
                self.events.publish(PrinterEvent::PrintCancelled { file });
            }
        }
        self.kick_uploads();
    }

    pub(crate) async fn abandon_print(&self, link_id: u64, file: &str, error: &PrinterError) {
        self.credits.deactivate();
        *lock(&self.session) = None;
        self.report_writer_failure(link_id, error).await;
        let _ = self.status.transition(PrinterStatus::Printing, PrinterStatus::Online);
        self.events.publish(PrinterEvent::PrintCancelled { file: Some(file.to_string()) });
    }

    async fn handshake(&self, transport: &Arc<dyn Transport>, framer: &mut LineFramer) -> Result<Vec<String>, PrinterError> {
        let command = &self.settings.handshake_command;
        transport.write_all(format!("{}\n", command).as_bytes()).await?;
        self.history.record(Direction::Sent, command);

        let mut buf = [0u8; 256];
        let n = tokio::time::timeout(self.settings.handshake_timeout(), transport.read(&mut buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no reply to handshake"))??;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "port closed during handshake").into());
        }
        Ok(framer.push(&buf[..n]))
    }
}

async fn read_loop(
    engine: Arc<Engine>,
    link_id: u64,
    transport: Arc<dyn Transport>,
    framer: LineFramer,
    seed: Vec<String>,
    mut stop: watch::Receiver<bool>,
) {
    let mut parser = ResponseParser::new(engine.settings.ack_prefix.clone());
    let lines = line_stream(transport, framer, seed);
    futures_util::pin_mut!(lines);
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => break,
            next = lines.next() => next,
        };
        match next {
            Some(Ok(line)) => engine.handle_line(&mut parser, line),
            Some(Err(e)) => {
                if !*stop.borrow() {
                    engine.connection_lost(link_id, e.to_string()).await;
                }
                break;
            }
            None => break,
        }
    }
    tracing::debug!("{}: reader stopped", engine.name);
}

/// Cloneable handle to one printer's protocol engine.
#[derive(Clone)]
pub struct Printer {
    engine: Arc<Engine>,
}

impl std::fmt::Debug for Printer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Printer")
            .field("name", &self.engine.name)
            .field("status", &self.engine.status.get())
            .finish()
    }
}

impl Printer {
    pub fn new(name: impl Into<String>, settings: ProtocolConfig, connector: Box<dyn Connector>) -> Self {
        let events = EventBus::new(settings.event_buffer);
        let engine = Engine {
            name: name.into(),
            status: StatusCell::new(events.clone()),
            events,
            history: CommandHistory::new(settings.history_capacity),
            credits: CreditGate::new(settings.buffer_depth),
            uploads: UploadQueue::default(),
            link: Mutex::new(None),
            next_link_id: AtomicU64::new(0),
            lifecycle: tokio::sync::Mutex::new(()),
            write_lock: tokio::sync::Mutex::new(()),
            session: Mutex::new(None),
            progress: Mutex::new(None),
            listing: RwLock::new(None),
            anomalies: AtomicU64::new(0),
            connector,
            settings,
        };
        Self { engine: Arc::new(engine) }
    }

    pub fn name(&self) -> &str {
        &self.engine.name
    }

    pub fn is_connected(&self) -> bool {
        self.engine.is_connected()
    }

    /// Open the transport, exchange the handshake and start the reader.
    pub async fn connect(&self) -> Result<(), PrinterError> {
        let engine = &self.engine;
        let _lifecycle = engine.lifecycle.lock().await;
        if engine.is_connected() {
            return Err(PrinterError::InvalidState("already connected".to_string()));
        }
        tracing::info!("{}: connecting to {}", engine.name, engine.connector.describe());
        let transport = engine.connector.open().await?;
        let mut framer = LineFramer::new();
        let seed = match engine.handshake(&transport, &mut framer).await {
            Ok(seed) => seed,
            Err(e) => {
                tracing::error!("{}: handshake failed: {}", engine.name, e);
                let _ = transport.close().await;
                return Err(e);
            }
        };

        if let Err(e) = engine
            .status
            .transition_from(&[PrinterStatus::Offline, PrinterStatus::Online], PrinterStatus::Online)
        {
            let _ = transport.close().await;
            return Err(e.into());
        }

        let id = engine.next_link_id.fetch_add(1, Ordering::Relaxed);
        let (stop, stop_rx) = watch::channel(false);
        {
            let mut slot = lock(&engine.link);
            let reader = tokio::spawn(read_loop(engine.clone(), id, transport.clone(), framer, seed, stop_rx));
            *slot = Some(Link { id, transport, stop, reader });
        }
        tracing::info!("{}: online", engine.name);
        engine.kick_uploads();
        Ok(())
    }

    /// Stop the reader, cancel any streamed print and close the transport.
    pub async fn disconnect(&self) -> Result<(), PrinterError> {
        let engine = &self.engine;
        let _lifecycle = engine.lifecycle.lock().await;
        engine.cancel_session();
        let link = lock(&engine.link).take();
        if let Some(link) = link {
            link.stop.send_replace(true);
            let closed = link.transport.close().await;
            if let Err(e) = link.reader.await {
                tracing::warn!("{}: reader task ended abnormally: {}", engine.name, e);
            }
            closed?;
            tracing::info!("{}: disconnected", engine.name);
        }
        engine.credits.deactivate();
        engine.status.force_offline();
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), PrinterError> {
        self.engine.uploads.stop_worker();
        self.disconnect().await
    }

    /// Write one raw command line.
    pub async fn send_command(&self, line: &str) -> Result<(), PrinterError> {
        let engine = &self.engine;
        if !engine.is_connected() {
            return Err(PrinterError::NotConnected);
        }
        match engine.status.get() {
            PrinterStatus::Uploading => {
                return Err(PrinterError::InvalidState("an upload is in progress".to_string()));
            }
            PrinterStatus::Printing if engine.streaming() => {
                return Err(PrinterError::InvalidState("a streamed print is in progress".to_string()));
            }
            _ => {}
        }
        engine.write_line(line.trim()).await
    }

    /// Stream a local G-code file under acknowledgment credits.
    pub async fn start_print(&self, path: impl AsRef<Path>) -> Result<(), PrinterError> {
        let engine = &self.engine;
        let path = path.as_ref();
        let access = |source| PrinterError::FileAccess { path: path.display().to_string(), source };
        let file = tokio::fs::File::open(path).await.map_err(access)?;
        let total_bytes = file.metadata().await.map_err(access)?.len();

        let link_id = engine.link_id().ok_or(PrinterError::NotConnected)?;
        engine.status.transition(PrinterStatus::Online, PrinterStatus::Printing)?;

        let (job, session) = StreamingPrint::new(link_id, path.to_path_buf(), file, total_bytes);
        *lock(&engine.session) = Some(session);
        *lock(&engine.progress) = None;
        engine.credits.activate();
        tracing::info!("{}: starting print of {}", engine.name, path.display());
        spawn_writer(engine.clone(), Box::new(job));
        Ok(())
    }

    /// Print a file already stored on the SD card.
    pub async fn start_sd_print(&self, file_name: &str) -> Result<(), PrinterError> {
        let engine = &self.engine;
        let link_id = engine.link_id().ok_or(PrinterError::NotConnected)?;
        engine.status.transition(PrinterStatus::Online, PrinterStatus::Printing)?;
        *lock(&engine.progress) = None;
        let sent = async {
            engine.write_line_on(link_id, &select_sd_file(file_name)).await?;
            engine.write_line_on(link_id, START_SD_PRINT).await
        };
        if let Err(e) = sent.await {
            engine.report_writer_failure(link_id, &e).await;
            let _ = engine.status.transition(PrinterStatus::Printing, PrinterStatus::Online);
            return Err(e);
        }
        tracing::info!("{}: printing {} from SD card", engine.name, file_name);
        Ok(())
    }

    /// Ask the firmware for its SD listing; the reply arrives as a
    /// `FileListReceived` event.
    pub async fn request_file_listing(&self) -> Result<(), PrinterError> {
        if self.engine.status.get() == PrinterStatus::Uploading {
            return Err(PrinterError::InvalidState("an upload is in progress".to_string()));
        }
        self.engine.write_line(LIST_SD_FILES).await
    }

    /// Idempotent. Waits for a streamed print to wind down; aborts an SD print.
    pub async fn cancel_print(&self) -> Result<(), PrinterError> {
        let engine = &self.engine;
        let done = lock(&engine.session).as_ref().map(|session| {
            if session.cancel() {
                tracing::info!("{}: cancelling print of {}", engine.name, session.file);
            }
            session.done()
        });
        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
            return Ok(());
        }

        if engine.status.get() == PrinterStatus::Printing {
            engine.write_line(&engine.settings.sd_abort_command).await?;
            if engine.status.transition(PrinterStatus::Printing, PrinterStatus::Online).is_ok() {
                tracing::info!("{}: SD print aborted", engine.name);
                engine.events.publish(PrinterEvent::PrintCancelled { file: None });
                engine.kick_uploads();
            }
        }
        Ok(())
    }

    /// Queue a whole file for SD upload. Returns the job id.
    pub fn submit_upload(&self, file_name: &str, lines: Vec<String>) -> Result<uuid::Uuid, PrinterError> {
        let file_name = file_name.trim();
        if file_name.is_empty() || file_name.contains(char::is_whitespace) {
            return Err(PrinterError::InvalidState(format!("'{}' is not a valid SD file name", file_name)));
        }
        Ok(self.submit_job(UploadJob::new(file_name, lines)))
    }

    pub fn submit_job(&self, job: UploadJob) -> uuid::Uuid {
        let id = job.id;
        self.engine.uploads.submit(job, &self.engine);
        id
    }

    pub fn get_status(&self) -> PrinterStatus {
        self.engine.status.get()
    }

    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            name: self.engine.name.clone(),
            status: self.engine.status.get(),
            connected: self.engine.is_connected(),
            progress: *lock(&self.engine.progress),
        }
    }

    pub fn progress(&self) -> Option<PrintProgress> {
        *lock(&self.engine.progress)
    }

    pub fn get_file_listing(&self) -> Option<Vec<String>> {
        self.engine.listing.read().ok().and_then(|listing| listing.clone())
    }

    pub fn command_history(&self) -> Vec<HistoryEntry> {
        self.engine.history.snapshot()
    }

    pub fn anomaly_count(&self) -> u64 {
        self.engine.anomalies.load(Ordering::Relaxed)
    }

    pub fn upload_queue_len(&self) -> usize {
        self.engine.uploads.len()
    }

    pub fn upload_worker_running(&self) -> bool {
        self.engine.uploads.worker_running()
    }

    pub fn credits_outstanding(&self) -> usize {
        self.engine.credits.outstanding()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PrinterEvent> {
        self.engine.events.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<PrinterStatus> {
        self.engine.status.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockConnector, MockTransport};
    use std::time::Duration;

    fn settings() -> ProtocolConfig {
        ProtocolConfig {
            handshake_timeout_ms: 500,
            drain_timeout_ms: 200,
            ..ProtocolConfig::default()
        }
    }

    fn printer(mock: &Arc<MockTransport>) -> Printer {
        Printer::new("test", settings(), Box::new(MockConnector::new(mock.clone())))
    }

    #[tokio::test]
    async fn test_handshake_reply_is_not_lost() {
        let mock = MockTransport::new();
        mock.feed("ok T:20.0\nBegin file list\nA.GCO\nEnd file list\n");
        let printer = printer(&mock);
        printer.connect().await.unwrap();
        assert_eq!(printer.get_status(), PrinterStatus::Online);
        tokio::time::timeout(Duration::from_secs(1), async {
            while printer.get_file_listing().is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(printer.get_file_listing(), Some(vec!["A.GCO".to_string()]));
        assert_eq!(mock.written(), vec!["M105\n"]);
    }

    #[tokio::test]
    async fn test_handshake_timeout_closes_transport() {
        let mock = MockTransport::new();
        let printer = printer(&mock);
        let err = printer.connect().await.unwrap_err();
        assert!(matches!(err, PrinterError::Connectivity(_)));
        assert_eq!(printer.get_status(), PrinterStatus::Offline);
        assert!(mock.is_closed());
        assert!(!printer.is_connected());
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let mock = MockTransport::emulated();
        let printer = printer(&mock);
        printer.connect().await.unwrap();
        assert!(matches!(printer.connect().await, Err(PrinterError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_commands_need_a_connection() {
        let mock = MockTransport::new();
        let printer = printer(&mock);
        assert!(matches!(printer.send_command("M105").await, Err(PrinterError::NotConnected)));
        assert!(matches!(printer.request_file_listing().await, Err(PrinterError::NotConnected)));
    }

    #[tokio::test]
    async fn test_missing_file_has_no_side_effects() {
        let mock = MockTransport::emulated();
        let printer = printer(&mock);
        printer.connect().await.unwrap();
        mock.clear_written();
        let err = printer.start_print("/nonexistent/part.gcode").await.unwrap_err();
        assert!(matches!(err, PrinterError::FileAccess { .. }));
        assert_eq!(printer.get_status(), PrinterStatus::Online);
        assert!(mock.written().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_bad_upload_names() {
        let mock = MockTransport::new();
        let printer = printer(&mock);
        assert!(printer.submit_upload("", vec![]).is_err());
        assert!(printer.submit_upload("two words.gco", vec![]).is_err());
        assert_eq!(printer.upload_queue_len(), 0);
    }

    #[tokio::test]
    async fn test_stale_writer_failure_leaves_new_link_open() {
        let mock = MockTransport::emulated();
        let printer = printer(&mock);
        printer.connect().await.unwrap();
        let old_link = printer.engine.link_id().unwrap();
        printer.disconnect().await.unwrap();
        printer.connect().await.unwrap();
        assert_ne!(printer.engine.link_id(), Some(old_link));

        let broken = PrinterError::Connectivity(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        printer.engine.report_writer_failure(old_link, &broken).await;
        assert!(printer.is_connected());
        assert_eq!(printer.get_status(), PrinterStatus::Online);
        assert_eq!(mock.close_count(), 1);
        assert!(matches!(
            printer.engine.write_line_on(old_link, "G28").await,
            Err(PrinterError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let mock = MockTransport::emulated();
        let printer = printer(&mock);
        printer.connect().await.unwrap();
        printer.disconnect().await.unwrap();
        printer.disconnect().await.unwrap();
        assert_eq!(printer.get_status(), PrinterStatus::Offline);
        assert_eq!(mock.close_count(), 1);
    }
}
