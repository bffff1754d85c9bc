//! Bounded record of recent traffic, for diagnostics only.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub direction: Direction,
    pub line: String,
}

impl std::fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let verb = match self.direction {
            Direction::Sent => "Write",
            Direction::Received => "Read",
        };
        write!(f, "{} {}: {}", self.at.format("%H:%M:%S%.3f"), verb, self.line)
    }
}

/// Ring of the last `capacity` lines. Oldest entries are evicted first.
#[derive(Debug)]
pub struct CommandHistory {
    capacity: usize,
    next_seq: AtomicU64,
    entries: Mutex<VecDeque<HistoryEntry>>,
}

impl CommandHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            next_seq: AtomicU64::new(0),
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, direction: Direction, line: &str) {
        let entry = HistoryEntry {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            at: Utc::now(),
            direction,
            line: line.to_string(),
        };
        let Ok(mut entries) = self.entries.lock() else {
            tracing::warn!("Command history lock poisoned, dropping entry");
            return;
        };
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries
            .lock()
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
