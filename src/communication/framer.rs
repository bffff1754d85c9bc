//! Splits the inbound byte stream into newline-terminated lines.
use async_stream::try_stream;
use futures_core::stream::Stream;
use std::io;
use std::sync::Arc;

use crate::transport::Transport;

const READ_CHUNK: usize = 1024;

/// Buffers partial lines across reads. Has no knowledge of line contents.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self { buffer: Vec::with_capacity(READ_CHUNK) }
    }

    /// Push raw bytes, returning every line they complete.
    ///
    /// The delimiter is not included. A trailing `\r` is dropped, and lines
    /// that end up empty are discarded.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b != b'\n' {
                self.buffer.push(b);
                continue;
            }
            if self.buffer.last() == Some(&b'\r') {
                self.buffer.pop();
            }
            if !self.buffer.is_empty() {
                lines.push(String::from_utf8_lossy(&self.buffer).into_owned());
            }
            self.buffer.clear();
        }
        lines
    }

    /// Bytes of the current, not yet terminated line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Lazy, non-restartable sequence of lines read from `transport`.
///
/// Ends with an error on the first failed read; end of stream is reported as
/// `UnexpectedEof` since a printer link never closes cleanly from the far side.
pub fn line_stream(
    transport: Arc<dyn Transport>,
    mut framer: LineFramer,
    seed: Vec<String>,
) -> impl Stream<Item = io::Result<String>> + Send {
    try_stream! {
        for line in seed {
            yield line;
        }
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = transport.read(&mut buf).await?;
            if n == 0 {
                Err::<(), _>(io::Error::new(io::ErrorKind::UnexpectedEof, "printer closed the stream"))?;
            }
            tracing::trace!("Read {} bytes from transport", n);
            for line in framer.push(&buf[..n]) {
                yield line;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use futures_util::StreamExt;

    #[test]
    fn test_splits_complete_lines() {
        let mut framer = LineFramer::new();
        assert_eq!(framer.push(b"ok\nT:20 B:21\n"), vec!["ok", "T:20 B:21"]);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_buffers_partial_line_across_pushes() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"Begin fi").is_empty());
        assert_eq!(framer.pending(), 8);
        assert_eq!(framer.push(b"le list\nab"), vec!["Begin file list"]);
        assert_eq!(framer.push(b"c.gco\n"), vec!["abc.gco"]);
    }

    #[test]
    fn test_discards_empty_lines_and_carriage_returns() {
        let mut framer = LineFramer::new();
        assert_eq!(framer.push(b"\n\nok\r\n\r\nwait\n"), vec!["ok", "wait"]);
    }

    #[test]
    fn test_chunking_does_not_change_the_result() {
        let input = b"ok\necho:busy processing\n\nDone printing file\nok T:210\n";
        let whole = LineFramer::new().push(input);
        for chunk_size in 1..input.len() {
            let mut framer = LineFramer::new();
            let mut lines = Vec::new();
            for chunk in input.chunks(chunk_size) {
                lines.extend(framer.push(chunk));
            }
            assert_eq!(lines, whole, "chunk size {}", chunk_size);
        }
        assert_eq!(whole.len(), 4);
    }

    #[tokio::test]
    async fn test_stream_yields_seed_then_transport_lines() {
        let mock = MockTransport::new();
        mock.feed("ok\nDone ");
        mock.feed("printing file\n");
        let mut lines = Box::pin(line_stream(mock.clone(), LineFramer::new(), vec!["start".to_string()]));
        assert_eq!(lines.next().await.unwrap().unwrap(), "start");
        assert_eq!(lines.next().await.unwrap().unwrap(), "ok");
        assert_eq!(lines.next().await.unwrap().unwrap(), "Done printing file");
        mock.hang_up();
        assert!(lines.next().await.unwrap().is_err());
        assert!(lines.next().await.is_none());
    }
}
