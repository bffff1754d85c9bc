// src/state.rs - printer status state machine
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::communication::{EventBus, PrinterEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrinterStatus {
    Offline,
    Online,
    Printing,
    Uploading,
}

impl PrinterStatus {
    /// The transition table. `Printing` and `Uploading` are only entered from
    /// `Online`; every state may drop to `Offline` when the link is lost.
    pub fn can_transition_to(self, to: PrinterStatus) -> bool {
        use PrinterStatus::*;
        matches!(
            (self, to),
            (Offline, Online)
                | (Online, Printing)
                | (Online, Uploading)
                | (Printing, Online)
                | (Uploading, Online)
                | (_, Offline)
        )
    }
}

impl std::fmt::Display for PrinterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PrinterStatus::Offline => "Offline",
            PrinterStatus::Online => "Online",
            PrinterStatus::Printing => "Printing",
            PrinterStatus::Uploading => "Uploading",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("expected status {expected} but printer is {actual}")]
    Unexpected { expected: PrinterStatus, actual: PrinterStatus },
    #[error("transition from {from} to {to} is not allowed")]
    NotAllowed { from: PrinterStatus, to: PrinterStatus },
}

/// The single authoritative status. Every change is a compare-and-set under
/// the watch channel's lock, so two tasks racing for `Printing` and
/// `Uploading` cannot both win.
#[derive(Debug)]
pub struct StatusCell {
    tx: watch::Sender<PrinterStatus>,
    events: EventBus,
}

impl StatusCell {
    pub fn new(events: EventBus) -> Self {
        let (tx, _) = watch::channel(PrinterStatus::Offline);
        Self { tx, events }
    }

    pub fn get(&self) -> PrinterStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PrinterStatus> {
        self.tx.subscribe()
    }

    /// Move `from -> to` only if the current status is `from`.
    pub fn transition(&self, from: PrinterStatus, to: PrinterStatus) -> Result<(), TransitionError> {
        self.transition_from(&[from], to).map(|_| ())
    }

    /// Move to `to` if the current status is any of `from`; returns the status
    /// that was replaced.
    pub fn transition_from(
        &self,
        from: &[PrinterStatus],
        to: PrinterStatus,
    ) -> Result<PrinterStatus, TransitionError> {
        let mut outcome = Err(TransitionError::NotAllowed { from: to, to });
        self.tx.send_if_modified(|current| {
            let actual = *current;
            if !from.contains(&actual) {
                outcome = Err(TransitionError::Unexpected {
                    expected: from.first().copied().unwrap_or(to),
                    actual,
                });
                return false;
            }
            if actual == to {
                outcome = Ok(actual);
                return false;
            }
            if !actual.can_transition_to(to) {
                outcome = Err(TransitionError::NotAllowed { from: actual, to });
                return false;
            }
            *current = to;
            outcome = Ok(actual);
            true
        });
        if let Ok(previous) = outcome {
            if previous != to {
                tracing::info!("Printer status {} -> {}", previous, to);
                self.events.publish(PrinterEvent::StatusChanged { from: previous, to });
            }
        }
        outcome
    }

    /// Unconditional drop to `Offline`. Returns the previous status.
    pub fn force_offline(&self) -> PrinterStatus {
        let previous = self.tx.send_replace(PrinterStatus::Offline);
        if previous != PrinterStatus::Offline {
            tracing::warn!("Printer status {} -> Offline", previous);
            self.events.publish(PrinterEvent::StatusChanged {
                from: previous,
                to: PrinterStatus::Offline,
            });
        }
        previous
    }
}
