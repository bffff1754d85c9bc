// src/print_job.rs - streamed printing under acknowledgment credits
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use crate::gcode::strip_comments;
use crate::printer::{Engine, PrinterError};
use crate::state::PrinterStatus;
use crate::writer::{WriterMode, WriterStrategy};

/// Progress of a streamed print, derived from the byte offset reached in the
/// source file and the wall-clock time since the print started.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PrintProgress {
    pub elapsed_minutes: f64,
    /// 0 to 100, floored.
    pub percent_complete: f64,
    /// 0 while nothing has been sent yet and no estimate exists.
    pub total_minutes_estimate: f64,
    pub remaining_minutes: f64,
    pub bytes_sent: u64,
    pub total_bytes: u64,
}

impl PrintProgress {
    pub fn compute(elapsed: Duration, bytes_sent: u64, total_bytes: u64) -> Self {
        let elapsed_raw = elapsed.as_millis() as f64 / 60_000.0;
        let percent_raw = if total_bytes == 0 {
            100.0
        } else {
            (100.0 * bytes_sent as f64 / total_bytes as f64).min(100.0)
        };
        let total_raw = if percent_raw > 0.0 { 100.0 * elapsed_raw / percent_raw } else { 0.0 };

        let elapsed_minutes = elapsed_raw.round();
        let total_minutes_estimate = total_raw.round();
        let remaining_minutes = if percent_raw > 0.0 {
            (total_minutes_estimate - elapsed_minutes).max(0.0)
        } else {
            0.0
        };
        Self {
            elapsed_minutes,
            percent_complete: percent_raw.floor(),
            total_minutes_estimate,
            remaining_minutes,
            bytes_sent,
            total_bytes,
        }
    }
}

impl std::fmt::Display for PrintProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Elapsed Time: {} minutes, Percentage: {}%, Remaining: {} minutes.",
            self.elapsed_minutes, self.percent_complete, self.remaining_minutes
        )
    }
}

/// Point-in-time view for UIs and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub name: String,
    pub status: PrinterStatus,
    pub connected: bool,
    pub progress: Option<PrintProgress>,
}

impl std::fmt::Display for StatusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.status, &self.progress) {
            (PrinterStatus::Printing, Some(progress)) => write!(f, "{}", progress),
            (PrinterStatus::Printing, None) => f.write_str("Printing from SD card."),
            _ => f.write_str("Not printing!"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PrintEnd {
    Completed,
    Cancelled,
}

/// Handle kept by the engine while a streamed print runs.
#[derive(Debug)]
pub(crate) struct PrintSession {
    pub(crate) file: String,
    cancel: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

impl PrintSession {
    /// Raise the single-shot cancel flag. Returns `true` for the first caller.
    pub(crate) fn cancel(&self) -> bool {
        !self.cancel.send_replace(true)
    }

    pub(crate) fn done(&self) -> watch::Receiver<bool> {
        self.done.clone()
    }
}

/// Streams one file: comments stripped, blank lines skipped, every line sent
/// only after taking a credit.
pub(crate) struct StreamingPrint {
    link_id: u64,
    path: PathBuf,
    file: tokio::fs::File,
    total_bytes: u64,
    cancel: watch::Receiver<bool>,
    done: watch::Sender<bool>,
}

impl StreamingPrint {
    pub(crate) fn new(link_id: u64, path: PathBuf, file: tokio::fs::File, total_bytes: u64) -> (Self, PrintSession) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let session = PrintSession {
            file: path.display().to_string(),
            cancel: cancel_tx,
            done: done_rx,
        };
        let job = Self {
            link_id,
            path,
            file,
            total_bytes,
            cancel: cancel_rx,
            done: done_tx,
        };
        (job, session)
    }
}

async fn stream_file(
    engine: &Engine,
    link_id: u64,
    path: &Path,
    file: tokio::fs::File,
    total_bytes: u64,
    cancel: &mut watch::Receiver<bool>,
    started: Instant,
) -> Result<PrintEnd, PrinterError> {
    let access_error = |source| PrinterError::FileAccess { path: path.display().to_string(), source };
    let mut reader = BufReader::new(file);
    let mut raw = Vec::new();
    let mut offset = 0u64;
    let mut line_number = 0u64;

    loop {
        if *cancel.borrow() {
            return Ok(PrintEnd::Cancelled);
        }
        raw.clear();
        let n = reader.read_until(b'\n', &mut raw).await.map_err(access_error)?;
        if n == 0 {
            return Ok(PrintEnd::Completed);
        }
        offset += n as u64;
        let Some(line) = strip_comments(&String::from_utf8_lossy(&raw)) else {
            continue;
        };

        tokio::select! {
            biased;
            _ = cancel.wait_for(|cancelled| *cancelled) => return Ok(PrintEnd::Cancelled),
            acquired = engine.credits.acquire() => {
                acquired.map_err(|_| PrinterError::InvalidState("credit pool closed".to_string()))?;
            }
        }
        // Checked again right before touching the transport.
        if *cancel.borrow() {
            engine.credits.refund();
            return Ok(PrintEnd::Cancelled);
        }

        engine.write_line_on(link_id, &line).await?;
        line_number += 1;
        let progress = PrintProgress::compute(started.elapsed(), offset, total_bytes);
        tracing::debug!("Line {}: {} | {}", line_number, line, progress);
        engine.record_progress(progress);
    }
}

#[async_trait]
impl WriterStrategy for StreamingPrint {
    fn mode(&self) -> WriterMode {
        WriterMode::Streaming
    }

    async fn run(self: Box<Self>, engine: Arc<Engine>) -> Result<(), PrinterError> {
        let StreamingPrint { link_id, path, file, total_bytes, mut cancel, done } = *self;
        let started = Instant::now();
        let name = path.display().to_string();
        tracing::info!("Streaming {} ({} bytes)", name, total_bytes);

        let outcome = stream_file(&engine, link_id, &path, file, total_bytes, &mut cancel, started).await;
        let result = match outcome {
            Ok(end) => {
                if end == PrintEnd::Completed {
                    engine.record_progress(PrintProgress::compute(started.elapsed(), total_bytes, total_bytes));
                }
                engine.finish_print(link_id, &name, end).await;
                Ok(())
            }
            Err(e) => {
                engine.abandon_print(link_id, &name, &e).await;
                Err(e)
            }
        };
        done.send_replace(true);
        result
    }
}
