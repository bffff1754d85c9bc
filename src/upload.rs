//! SD-card uploads: a FIFO of whole files and the single worker that drains it.
//!
//! The worker is started lazily by `submit`, and by the engine whenever the
//! printer returns to `Online` with jobs waiting. It exits as soon as it finds
//! the printer not ready, putting the job it just took back at the head.
use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::communication::PrinterEvent;
use crate::gcode::{begin_sd_write, end_sd_write};
use crate::printer::{Engine, PrinterError};
use crate::state::PrinterStatus;
use crate::writer::{WriterMode, WriterStrategy, spawn_writer};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadJob {
    pub id: Uuid,
    pub file_name: String,
    /// Sent verbatim; comments are not stripped in upload mode.
    pub lines: Vec<String>,
}

impl UploadJob {
    pub fn new(file_name: impl Into<String>, lines: Vec<String>) -> Self {
        Self { id: Uuid::new_v4(), file_name: file_name.into(), lines }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: VecDeque<UploadJob>,
    worker: Option<JoinHandle<()>>,
}

pub(crate) enum NextJob {
    /// The job plus the link it must be written on.
    Ready(UploadJob, u64),
    NotReady,
    Empty,
}

/// The worker slot and the queue share one lock, so deciding to spawn and
/// recording the handle happen together.
#[derive(Debug, Default)]
pub(crate) struct UploadQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl UploadQueue {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn submit(&self, job: UploadJob, engine: &Arc<Engine>) {
        tracing::info!("Queued upload {} ({} lines)", job.file_name, job.lines.len());
        let mut state = self.state();
        state.jobs.push_back(job);
        Self::ensure_worker(&mut state, engine);
        drop(state);
        self.notify.notify_one();
    }

    /// Start a worker if jobs are waiting and none is running.
    pub(crate) fn kick(&self, engine: &Arc<Engine>) {
        let mut state = self.state();
        if state.jobs.is_empty() {
            return;
        }
        Self::ensure_worker(&mut state, engine);
        drop(state);
        self.notify.notify_one();
    }

    fn ensure_worker(state: &mut QueueState, engine: &Arc<Engine>) {
        if state.worker.is_none() {
            state.worker = Some(spawn_writer(engine.clone(), Box::new(UploadWorker)));
        }
    }

    /// Take the head job if the printer can accept it. A job that cannot run
    /// goes back to the head and the worker slot is cleared, both under the
    /// same lock the submitters take.
    pub(crate) fn next_job(&self, engine: &Engine) -> NextJob {
        let mut state = self.state();
        let Some(job) = state.jobs.pop_front() else {
            return NextJob::Empty;
        };
        let link_id = match engine.link_id() {
            Some(id) if engine.status.transition(PrinterStatus::Online, PrinterStatus::Uploading).is_ok() => Some(id),
            _ => None,
        };
        let Some(link_id) = link_id else {
            tracing::info!("Printer not ready, upload of {} deferred", job.file_name);
            state.jobs.push_front(job);
            state.worker = None;
            return NextJob::NotReady;
        };
        NextJob::Ready(job, link_id)
    }

    /// Put a failed job back at the head and release the worker slot.
    pub(crate) fn requeue(&self, job: UploadJob) {
        let mut state = self.state();
        state.jobs.push_front(job);
        state.worker = None;
    }

    pub(crate) async fn wait(&self) {
        self.notify.notified().await;
    }

    pub(crate) fn stop_worker(&self) {
        if let Some(worker) = self.state().worker.take() {
            worker.abort();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.state().jobs.len()
    }

    pub(crate) fn worker_running(&self) -> bool {
        self.state().worker.as_ref().is_some_and(|worker| !worker.is_finished())
    }
}

struct UploadWorker;

#[async_trait]
impl WriterStrategy for UploadWorker {
    fn mode(&self) -> WriterMode {
        WriterMode::SdUpload
    }

    async fn run(self: Box<Self>, engine: Arc<Engine>) -> Result<(), PrinterError> {
        loop {
            let (job, link_id) = match engine.uploads.next_job(&engine) {
                NextJob::Ready(job, link_id) => (job, link_id),
                NextJob::NotReady => return Ok(()),
                NextJob::Empty => {
                    engine.uploads.wait().await;
                    continue;
                }
            };

            if let Err(e) = upload(&engine, link_id, &job).await {
                tracing::error!("Upload of {} failed: {}", job.file_name, e);
                engine.uploads.requeue(job);
                engine.report_writer_failure(link_id, &e).await;
                // Still Uploading if the failure was not a lost link.
                let _ = engine.status.transition(PrinterStatus::Uploading, PrinterStatus::Online);
                return Err(e);
            }

            if let Err(e) = engine.status.transition(PrinterStatus::Uploading, PrinterStatus::Online) {
                tracing::warn!("Upload of {} finished but {}", job.file_name, e);
            }
            tracing::info!("Uploaded {}", job.file_name);
            engine.events.publish(PrinterEvent::UploadComplete { file_name: job.file_name });
        }
    }
}

async fn upload(engine: &Engine, link_id: u64, job: &UploadJob) -> Result<(), PrinterError> {
    engine.events.publish(PrinterEvent::UploadStarted { file_name: job.file_name.clone() });
    engine.write_line_on(link_id, &begin_sd_write(&job.file_name)).await?;
    for line in &job.lines {
        engine.write_line_on(link_id, line).await?;
    }
    engine.write_line_on(link_id, &end_sd_write(&job.file_name)).await
}
