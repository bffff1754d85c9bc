//! Recognises protocol markers in the inbound line stream.
//!
//! The parser is a pure state machine over lines: it owns the file-list
//! accumulator and classifies each line. Applying the result (status changes,
//! credit release, events) is the reader task's job.
use crate::gcode::{BEGIN_FILE_LIST, DONE_PRINTING, END_FILE_LIST};

/// Unexpected inbound data. Never fatal; counted and published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    /// `End file list` with no listing in progress.
    UnmatchedEndFileList,
    /// A new `Begin file list` arrived before the previous one ended.
    AbandonedFileList { entries: usize },
    /// An acknowledgment arrived while no streamed line was outstanding.
    UnsolicitedAck,
    /// `Done printing file` arrived outside an SD print.
    UnexpectedCompletion,
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Anomaly::UnmatchedEndFileList => write!(f, "end of file list without a beginning"),
            Anomaly::AbandonedFileList { entries } => {
                write!(f, "file list restarted after {} entries", entries)
            }
            Anomaly::UnsolicitedAck => write!(f, "acknowledgment with no outstanding line"),
            Anomaly::UnexpectedCompletion => write!(f, "print completion while not printing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    FileListStarted,
    FileListEntry,
    /// A complete listing, ready to replace the published one.
    FileList(Vec<String>),
    PrintDone,
    Acknowledgment,
    Anomaly(Anomaly),
    /// Telemetry or anything else the host does not interpret.
    Other,
}

#[derive(Debug)]
pub struct ResponseParser {
    ack_prefix: String,
    listing: Option<Vec<String>>,
}

impl ResponseParser {
    pub fn new(ack_prefix: impl Into<String>) -> Self {
        Self { ack_prefix: ack_prefix.into(), listing: None }
    }

    /// Classify one framed line. Must be called in arrival order.
    pub fn handle(&mut self, line: &str) -> Response {
        if line == BEGIN_FILE_LIST {
            return match self.listing.replace(Vec::new()) {
                Some(previous) => {
                    tracing::warn!("File list restarted, dropping {} entries", previous.len());
                    Response::Anomaly(Anomaly::AbandonedFileList { entries: previous.len() })
                }
                None => Response::FileListStarted,
            };
        }
        if let Some(listing) = self.listing.as_mut() {
            if line == END_FILE_LIST {
                let files = std::mem::take(listing);
                self.listing = None;
                return Response::FileList(files);
            }
            listing.push(line.to_string());
            return Response::FileListEntry;
        }
        if line == END_FILE_LIST {
            return Response::Anomaly(Anomaly::UnmatchedEndFileList);
        }
        if line == DONE_PRINTING {
            return Response::PrintDone;
        }
        if line.starts_with(&self.ack_prefix) {
            return Response::Acknowledgment;
        }
        Response::Other
    }

    pub fn is_listing(&self) -> bool {
        self.listing.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> ResponseParser {
        ResponseParser::new("ok")
    }

    #[test]
    fn test_file_list_cycle() {
        let mut p = parser();
        assert_eq!(p.handle("Begin file list"), Response::FileListStarted);
        assert_eq!(p.handle("a.gcode"), Response::FileListEntry);
        assert_eq!(p.handle("b.gcode"), Response::FileListEntry);
        assert_eq!(
            p.handle("End file list"),
            Response::FileList(vec!["a.gcode".to_string(), "b.gcode".to_string()])
        );
        assert!(!p.is_listing());
        assert_eq!(p.handle("ok"), Response::Acknowledgment);
    }

    #[test]
    fn test_empty_file_list() {
        let mut p = parser();
        p.handle("Begin file list");
        assert_eq!(p.handle("End file list"), Response::FileList(vec![]));
    }

    #[test]
    fn test_markers_inside_listing_are_entries() {
        let mut p = parser();
        p.handle("Begin file list");
        assert_eq!(p.handle("Done printing file"), Response::FileListEntry);
        assert_eq!(p.handle("ok"), Response::FileListEntry);
        assert_eq!(
            p.handle("End file list"),
            Response::FileList(vec!["Done printing file".to_string(), "ok".to_string()])
        );
    }

    #[test]
    fn test_restarted_listing_discards_partial() {
        let mut p = parser();
        p.handle("Begin file list");
        p.handle("stale.gco");
        assert_eq!(
            p.handle("Begin file list"),
            Response::Anomaly(Anomaly::AbandonedFileList { entries: 1 })
        );
        p.handle("fresh.gco");
        assert_eq!(p.handle("End file list"), Response::FileList(vec!["fresh.gco".to_string()]));
    }

    #[test]
    fn test_unmatched_end_is_anomaly() {
        let mut p = parser();
        assert_eq!(p.handle("End file list"), Response::Anomaly(Anomaly::UnmatchedEndFileList));
    }

    #[test]
    fn test_completion_and_telemetry() {
        let mut p = parser();
        assert_eq!(p.handle("Done printing file"), Response::PrintDone);
        assert_eq!(p.handle("ok T:210.0 /210.0"), Response::Acknowledgment);
        assert_eq!(p.handle("echo:busy: processing"), Response::Other);
    }
}
