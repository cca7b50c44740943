//! Transport layer - message sinks shared between pipelines
//!
//! Both interceptors write to the subprocess's stdin: the inbound side
//! forwards client traffic and the outbound side injects synthetic
//! approvals. [`SharedNdjsonWriter`] serializes those writers behind one
//! async mutex so lines never interleave.

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;

use crate::io::ndjson::NdjsonWriter;
use crate::protocol::Message;

/// Destination for outgoing messages
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Write one message; returns once it has been flushed
    async fn send(&self, message: &Message) -> io::Result<()>;

    /// Close the destination so the peer observes EOF
    async fn close(&self) -> io::Result<()>;

    /// Whether [`MessageSink::close`] has already run
    async fn is_closed(&self) -> bool;
}

// ============================================================================
// Shared NDJSON Writer
// ============================================================================

/// Cloneable, mutex-guarded [`NdjsonWriter`]
pub struct SharedNdjsonWriter<W> {
    inner: Arc<Mutex<NdjsonWriter<W>>>,
}

impl<W> Clone for SharedNdjsonWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: AsyncWrite + Unpin + Send> SharedNdjsonWriter<W> {
    pub fn new(writer: W, peer: &'static str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NdjsonWriter::new(writer, peer))),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> MessageSink for SharedNdjsonWriter<W> {
    async fn send(&self, message: &Message) -> io::Result<()> {
        self.inner.lock().await.write_message(message).await
    }

    async fn close(&self) -> io::Result<()> {
        self.inner.lock().await.close().await
    }

    async fn is_closed(&self) -> bool {
        self.inner.lock().await.is_closed()
    }
}

// ============================================================================
// Mock Sink (for testing)
// ============================================================================

/// Records every message it receives; can be told to fail like a dead peer
#[cfg(test)]
#[derive(Clone, Default)]
pub struct MockSink {
    sent: Arc<std::sync::Mutex<Vec<serde_json::Value>>>,
    broken: Arc<std::sync::atomic::AtomicBool>,
    closed: Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(test)]
impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose writes fail with `BrokenPipe`
    pub fn broken() -> Self {
        let sink = Self::default();
        sink.broken.store(true, std::sync::atomic::Ordering::SeqCst);
        sink
    }

    /// Every message written so far, as JSON
    pub fn sent(&self) -> Vec<serde_json::Value> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl MessageSink for MockSink {
    async fn send(&self, message: &Message) -> io::Result<()> {
        if self.broken.load(std::sync::atomic::Ordering::SeqCst) || self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock sink closed"));
        }
        self.sent
            .lock()
            .unwrap()
            .push(serde_json::to_value(message)?);
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    async fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncBufReadExt;

    #[tokio::test]
    async fn test_concurrent_writers_never_interleave_lines() {
        let (client, server) = tokio::io::duplex(64);
        let writer = SharedNdjsonWriter::new(client, "test");

        let mut tasks = Vec::new();
        for task_id in 0..4 {
            let writer = writer.clone();
            tasks.push(tokio::spawn(async move {
                for seq in 0..25 {
                    let msg = Message::from_value(json!({
                        "jsonrpc": "2.0",
                        "method": "tick",
                        "params": {"task": task_id, "seq": seq, "pad": "y".repeat(100)}
                    }));
                    writer.send(&msg).await.unwrap();
                }
            }));
        }

        let reader = tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(server).lines();
            let mut count = 0;
            while let Some(line) = lines.next_line().await.unwrap() {
                let value: serde_json::Value = serde_json::from_str(&line).unwrap();
                assert_eq!(value["method"], "tick");
                count += 1;
            }
            count
        });

        for task in tasks {
            task.await.unwrap();
        }
        writer.close().await.unwrap();
        assert_eq!(reader.await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let writer = SharedNdjsonWriter::new(Vec::new(), "test");
        assert!(!writer.is_closed().await);
        writer.close().await.unwrap();
        assert!(writer.is_closed().await);

        let msg = Message::from_value(json!({"jsonrpc": "2.0", "method": "x"}));
        let err = writer.send(&msg).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_mock_sink_records_and_breaks() {
        let sink = MockSink::new();
        let msg = Message::from_value(json!({"jsonrpc": "2.0", "method": "x"}));
        sink.send(&msg).await.unwrap();
        assert_eq!(sink.sent(), vec![json!({"jsonrpc": "2.0", "method": "x"})]);

        assert!(MockSink::broken().send(&msg).await.is_err());

        sink.close().await.unwrap();
        assert!(sink.is_closed());
        assert!(sink.send(&msg).await.is_err());
    }
}
