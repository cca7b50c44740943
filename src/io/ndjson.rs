//! Line-delimited JSON channel
//!
//! One JSON value per `\n`-terminated line. The reader yields classified
//! [`Message`]s in arrival order and skips lines it cannot use (oversized,
//! not UTF-8, not JSON) after reporting them; only I/O failures end the
//! sequence early. The writer serializes one message per line and flushes
//! after each one.

use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{trace, warn};

use crate::protocol::Message;

/// Default upper bound for a single line (10 MiB)
pub const DEFAULT_MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

/// How much of a rejected line to echo into diagnostics
const DIAGNOSTIC_PREVIEW_CHARS: usize = 200;

/// Outcome of reading one raw line
#[derive(Debug, PartialEq, Eq)]
enum RawLine {
    /// A line (possibly unterminated at EOF) is in the buffer
    Line,
    /// The line exceeded the limit and was discarded; carries the discarded length
    TooLong(usize),
    /// Zero-length read
    Eof,
}

// ============================================================================
// Reader
// ============================================================================

/// Reads line-delimited JSON messages from a byte stream
///
/// The sequence is finite: once [`NdjsonReader::next_message`] returns
/// `Ok(None)` the underlying stream has reached EOF and the reader is spent.
pub struct NdjsonReader<R> {
    reader: BufReader<R>,

    /// Peer name used in diagnostics ("upstream", "downstream")
    peer: &'static str,

    max_line_bytes: usize,

    /// Reusable line buffer
    line: Vec<u8>,

    /// Number of lines dropped so far
    skipped: u64,
}

impl<R: AsyncRead + Unpin> NdjsonReader<R> {
    pub fn new(reader: R, peer: &'static str, max_line_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            peer,
            max_line_bytes,
            line: Vec::new(),
            skipped: 0,
        }
    }

    /// Lines dropped because they were oversized, not UTF-8 or not JSON
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Read the next message, skipping unusable lines
    ///
    /// Returns `Ok(None)` at end of stream and `Err` only when the stream
    /// itself fails.
    pub async fn next_message(&mut self) -> io::Result<Option<Message>> {
        loop {
            match self.read_raw_line().await? {
                RawLine::Eof => {
                    trace!(peer = self.peer, "NdjsonReader: EOF reached");
                    return Ok(None);
                }
                RawLine::TooLong(len) => {
                    self.skipped += 1;
                    warn!(
                        peer = self.peer,
                        len,
                        max = self.max_line_bytes,
                        "Skipping line that exceeds the maximum message size"
                    );
                    continue;
                }
                RawLine::Line => {}
            }

            let text = match std::str::from_utf8(&self.line) {
                Ok(text) => text.trim(),
                Err(e) => {
                    self.skipped += 1;
                    warn!(peer = self.peer, error = %e, "Skipping line with invalid UTF-8");
                    continue;
                }
            };

            if text.is_empty() {
                continue;
            }

            match serde_json::from_str(text) {
                Ok(value) => return Ok(Some(Message::from_value(value))),
                Err(e) => {
                    self.skipped += 1;
                    warn!(
                        peer = self.peer,
                        error = %e,
                        line = %preview(text),
                        "Skipping malformed JSON line"
                    );
                }
            }
        }
    }

    /// Fill `self.line` with the next line, without its terminator
    ///
    /// Bytes past `max_line_bytes` are consumed and thrown away up to the
    /// next newline so the reader stays aligned on line boundaries.
    async fn read_raw_line(&mut self) -> io::Result<RawLine> {
        self.line.clear();
        let mut discarded = 0usize;

        loop {
            let available = self.reader.fill_buf().await?;

            if available.is_empty() {
                return Ok(if discarded > 0 {
                    RawLine::TooLong(discarded)
                } else if self.line.is_empty() {
                    RawLine::Eof
                } else {
                    RawLine::Line
                });
            }

            let (chunk_len, found_newline) = match available.iter().position(|&b| b == b'\n') {
                Some(pos) => (pos, true),
                None => (available.len(), false),
            };

            if discarded > 0 || self.line.len() + chunk_len > self.max_line_bytes {
                discarded += self.line.len() + chunk_len;
                self.line.clear();
            } else {
                self.line.extend_from_slice(&available[..chunk_len]);
            }

            let consumed = if found_newline { chunk_len + 1 } else { chunk_len };
            self.reader.consume(consumed);

            if found_newline {
                return Ok(if discarded > 0 {
                    RawLine::TooLong(discarded)
                } else {
                    RawLine::Line
                });
            }
        }
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() <= DIAGNOSTIC_PREVIEW_CHARS {
        text.to_string()
    } else {
        let head: String = text.chars().take(DIAGNOSTIC_PREVIEW_CHARS).collect();
        format!("{head}...")
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Writes one JSON message per line
///
/// Each message is serialized up front and written with a single
/// `write_all` followed by a flush, so the peer never sees half a line
/// from this writer.
pub struct NdjsonWriter<W> {
    /// `None` once the writer has been closed
    writer: Option<W>,

    peer: &'static str,
}

impl<W: AsyncWrite + Unpin> NdjsonWriter<W> {
    pub fn new(writer: W, peer: &'static str) -> Self {
        Self {
            writer: Some(writer),
            peer,
        }
    }

    pub async fn write_message(&mut self, message: &Message) -> io::Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("{} stream already closed", self.peer),
            )
        })?;

        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        trace!(
            peer = self.peer,
            len = line.len(),
            "NdjsonWriter: writing message"
        );
        writer.write_all(&line).await?;
        writer.flush().await
    }

    /// Shut down and drop the underlying stream; later writes fail with `BrokenPipe`
    pub async fn close(&mut self) -> io::Result<()> {
        match self.writer.take() {
            Some(mut writer) => {
                trace!(peer = self.peer, "NdjsonWriter: closing stream");
                writer.shutdown().await
            }
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    /// Take back the underlying stream, if it was not closed
    #[cfg(test)]
    pub fn into_inner(self) -> Option<W> {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn collect(input: &[u8], max_line_bytes: usize) -> (Vec<serde_json::Value>, u64) {
        let mut reader = NdjsonReader::new(input, "test", max_line_bytes);
        let mut values = Vec::new();
        while let Some(msg) = reader.next_message().await.unwrap() {
            values.push(msg.into_value());
        }
        (values, reader.skipped())
    }

    #[tokio::test]
    async fn test_reads_messages_in_order() {
        let input = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"a\"}\n{\"jsonrpc\":\"2.0\",\"method\":\"b\"}\n";
        let (values, skipped) = collect(input, DEFAULT_MAX_LINE_BYTES).await;
        assert_eq!(values.len(), 2);
        assert_eq!(values[0]["method"], "a");
        assert_eq!(values[1]["method"], "b");
        assert_eq!(skipped, 0);
    }

    #[tokio::test]
    async fn test_malformed_line_is_skipped() {
        let input = b"{not json\n{\"id\":1,\"result\":{}}\n{\"id\":2,\"result\":{}}\n{\"id\":3,\"result\":{}}\n";
        let (values, skipped) = collect(input, DEFAULT_MAX_LINE_BYTES).await;
        assert_eq!(values.len(), 3);
        assert_eq!(values[0]["id"], 1);
        assert_eq!(skipped, 1);
    }

    #[tokio::test]
    async fn test_blank_lines_and_crlf_are_ignored() {
        let input = b"\n   \r\n{\"method\":\"ping\",\"jsonrpc\":\"2.0\"}\r\n\n";
        let (values, skipped) = collect(input, DEFAULT_MAX_LINE_BYTES).await;
        assert_eq!(values, vec![json!({"method": "ping", "jsonrpc": "2.0"})]);
        assert_eq!(skipped, 0);
    }

    #[tokio::test]
    async fn test_unterminated_last_line_is_parsed() {
        let (values, _) = collect(b"{\"a\":1}\n{\"b\":2}", DEFAULT_MAX_LINE_BYTES).await;
        assert_eq!(values, vec![json!({"a": 1}), json!({"b": 2})]);
    }

    #[tokio::test]
    async fn test_oversized_line_is_discarded_and_reader_realigns() {
        let long = format!("{{\"pad\":\"{}\"}}\n", "x".repeat(200));
        let input = format!("{long}{{\"ok\":true}}\n{long}");
        let (values, skipped) = collect(input.as_bytes(), 64).await;
        assert_eq!(values, vec![json!({"ok": true})]);
        assert_eq!(skipped, 2);
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_skipped() {
        let input = b"\xff\xfe\n{\"ok\":1}\n";
        let (values, skipped) = collect(input, DEFAULT_MAX_LINE_BYTES).await;
        assert_eq!(values, vec![json!({"ok": 1})]);
        assert_eq!(skipped, 1);
    }

    #[tokio::test]
    async fn test_each_skipped_line_is_reported() {
        let (logs, _guard) = crate::test_utils::capture::capture_logs();
        let long = format!("{{\"pad\":\"{}\"}}\n", "x".repeat(200));
        let input = format!("{{broken\n{long}{{\"ok\":1}}\n");
        let mut bytes = input.into_bytes();
        bytes.extend_from_slice(b"\xff\xfe\n");

        let (values, skipped) = collect(&bytes, 64).await;
        assert_eq!(values, vec![json!({"ok": 1})]);
        assert_eq!(skipped, 3);

        let output = logs.contents();
        let warnings: Vec<&str> = output.lines().filter(|l| l.contains("WARN")).collect();
        assert_eq!(warnings.len(), 3, "{output}");
        assert!(warnings[0].contains("Skipping malformed JSON line"));
        assert!(warnings[0].contains("{broken"));
        assert!(warnings[1].contains("Skipping line that exceeds the maximum message size"));
        assert!(warnings[1].contains("max=64"));
        assert!(warnings[2].contains("Skipping line with invalid UTF-8"));
    }

    #[tokio::test]
    async fn test_empty_stream_ends_immediately() {
        let (values, skipped) = collect(b"", DEFAULT_MAX_LINE_BYTES).await;
        assert!(values.is_empty());
        assert_eq!(skipped, 0);
    }

    #[tokio::test]
    async fn test_writer_emits_one_line_per_message() {
        let mut writer = NdjsonWriter::new(Vec::new(), "test");
        let first = Message::from_value(json!({"jsonrpc": "2.0", "id": 1, "result": {}}));
        let second = Message::from_value(json!({"jsonrpc": "2.0", "method": "x"}));
        writer.write_message(&first).await.unwrap();
        writer.write_message(&second).await.unwrap();

        let bytes = writer.into_inner().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(
            text,
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n{\"jsonrpc\":\"2.0\",\"method\":\"x\"}\n"
        );
    }

    #[tokio::test]
    async fn test_writer_rejects_writes_after_close() {
        let mut writer = NdjsonWriter::new(Vec::new(), "test");
        writer.close().await.unwrap();
        assert!(writer.is_closed());

        let msg = Message::from_value(json!({"jsonrpc": "2.0", "method": "x"}));
        let err = writer.write_message(&msg).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        // Closing twice is harmless
        writer.close().await.unwrap();
    }
}
