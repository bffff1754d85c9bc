//! Engine-owned event channel. Listeners subscribe; the engine never calls
//! back into listener code.
use serde::Serialize;
use tokio::sync::broadcast;

use crate::communication::parser::Anomaly;
use crate::print_job::PrintProgress;
use crate::state::PrinterStatus;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PrinterEvent {
    StatusChanged { from: PrinterStatus, to: PrinterStatus },
    LineReceived { line: String },
    LineSent { line: String },
    FileListReceived { files: Vec<String> },
    Progress(PrintProgress),
    PrintComplete { file: Option<String> },
    PrintCancelled { file: Option<String> },
    UploadStarted { file_name: String },
    UploadComplete { file_name: String },
    ProtocolAnomaly { description: String },
    ConnectionLost { reason: String },
    WriterFailed { reason: String },
}

impl PrinterEvent {
    pub fn anomaly(anomaly: &Anomaly) -> Self {
        PrinterEvent::ProtocolAnomaly { description: anomaly.to_string() }
    }
}

/// Broadcast fan-out. Publishing never blocks; slow subscribers lag and lose
/// the oldest events instead of stalling the reader.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PrinterEvent>,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: PrinterEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PrinterEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
