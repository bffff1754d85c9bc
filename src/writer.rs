//! Outbound writer strategies.
//!
//! Two ways of feeding a printer exist: streaming a file line by line under
//! acknowledgment credits, and pushing whole files to the SD card between
//! `M28`/`M29`. Each is a [`WriterStrategy`]; the status machine guarantees at
//! most one runs at a time.
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::printer::{Engine, PrinterError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterMode {
    Streaming,
    SdUpload,
}

impl std::fmt::Display for WriterMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriterMode::Streaming => f.write_str("streaming"),
            WriterMode::SdUpload => f.write_str("sd-upload"),
        }
    }
}

#[async_trait]
pub(crate) trait WriterStrategy: Send + 'static {
    fn mode(&self) -> WriterMode;

    /// Runs to completion. State cleanup (status, events, re-queueing) is the
    /// strategy's own responsibility; the error is only logged here.
    async fn run(self: Box<Self>, engine: Arc<Engine>) -> Result<(), PrinterError>;
}

pub(crate) fn spawn_writer(engine: Arc<Engine>, strategy: Box<dyn WriterStrategy>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mode = strategy.mode();
        tracing::debug!("{} writer started", mode);
        match strategy.run(engine).await {
            Ok(()) => tracing::debug!("{} writer finished", mode),
            Err(e) => tracing::error!("{} writer stopped: {}", mode, e),
        }
    })
}
