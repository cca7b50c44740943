//! Outbound pipeline: subprocess → client
//!
//! Relays everything the subprocess prints to the client. Requests matching
//! an auto-resolution rule are relayed as well, and then answered straight
//! back into the subprocess stdin before the next subprocess line is read.

use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, info, warn};

use crate::error::ProxyError;
use crate::io::{DOWNSTREAM, MessageSink, NdjsonReader, UPSTREAM};
use crate::log_proxy_message;
use crate::protocol::Message;
use crate::proxy::PipelineEnd;
use crate::proxy::pending::PendingElicitations;
use crate::rules::AutoResolutionRule;

pub struct OutboundInterceptor<R, U, D> {
    reader: NdjsonReader<R>,
    /// The client's stdout
    upstream: U,
    /// Subprocess stdin, shared with the inbound pipeline
    downstream: D,
    rules: Vec<AutoResolutionRule>,
    pending: Option<PendingElicitations>,
    shutdown: CancellationToken,
}

impl<R, U, D> OutboundInterceptor<R, U, D>
where
    R: AsyncRead + Unpin + Send,
    U: MessageSink,
    D: MessageSink,
{
    pub fn new(
        reader: NdjsonReader<R>,
        upstream: U,
        downstream: D,
        rules: Vec<AutoResolutionRule>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            reader,
            upstream,
            downstream,
            rules,
            pending: None,
            shutdown,
        }
    }

    /// Record auto-resolved ids so the inbound side can drop duplicate replies
    pub fn with_reply_suppression(mut self, pending: PendingElicitations) -> Self {
        self.pending = Some(pending);
        self
    }

    /// Relay until the subprocess closes stdout or the run is cancelled
    pub async fn run(mut self) -> Result<PipelineEnd, ProxyError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("outbound: shutdown requested");
                    return Ok(PipelineEnd::Cancelled);
                }
                next = self.reader.next_message() => next,
            };

            let message = match next {
                Ok(Some(message)) => message,
                Ok(None) => {
                    info!(
                        skipped = self.reader.skipped(),
                        "Subprocess closed its stdout"
                    );
                    return Ok(PipelineEnd::Eof);
                }
                Err(source) => {
                    return Err(ProxyError::Read {
                        peer: DOWNSTREAM,
                        source,
                    });
                }
            };

            log_proxy_message!(Level::DEBUG, "downstream->upstream", message);

            let matched = self.rules.iter().find(|rule| rule.matches(&message));
            let kind = matched.and_then(|rule| rule.discriminator_value(&message).cloned());
            let reply = matched.and_then(|rule| rule.resolve(&message));

            // Recorded before the client sees the elicitation, so a fast
            // client reply is already recognised as a duplicate
            if let (Some(pending), Some(id)) = (&self.pending, reply.as_ref().and_then(Message::id))
            {
                pending.record(id.clone(), kind.clone());
            }

            match deliver(&self.shutdown, &self.upstream, &message).await {
                Ok(true) => {}
                Ok(false) => return Ok(PipelineEnd::Cancelled),
                Err(source) => {
                    return Err(ProxyError::Write {
                        peer: UPSTREAM,
                        source,
                    });
                }
            }

            let Some(rule) = matched else {
                continue;
            };
            let Some(reply) = reply else {
                warn!(
                    method = %rule.method,
                    "Elicitation has no id, relayed without auto-approval"
                );
                continue;
            };

            let id = reply.id().map(|id| id.to_string()).unwrap_or_default();
            info!(id = %id, kind = ?kind, "Auto-approving elicitation");
            match deliver(&self.shutdown, &self.downstream, &reply).await {
                Ok(true) => {}
                Ok(false) => return Ok(PipelineEnd::Cancelled),
                // Client EOF closed subprocess stdin; keep relaying the drain
                Err(e) if self.downstream.is_closed().await => {
                    self.forget(&reply);
                    warn!(
                        id = %id,
                        "Subprocess stdin already closed, approval not delivered: {}",
                        e
                    );
                }
                Err(source) => {
                    self.forget(&reply);
                    return Err(ProxyError::Write {
                        peer: DOWNSTREAM,
                        source,
                    });
                }
            }
        }
    }

    /// Drop the pending record for an approval that never reached the subprocess
    fn forget(&self, reply: &Message) {
        if let (Some(pending), Some(id)) = (&self.pending, reply.id()) {
            pending.take(id);
        }
    }
}

/// Write one message, racing the shutdown token; `Ok(false)` when cancelled
async fn deliver<S: MessageSink>(
    shutdown: &CancellationToken,
    sink: &S,
    message: &Message,
) -> std::io::Result<bool> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => {
            debug!("outbound: shutdown requested while writing");
            Ok(false)
        }
        result = sink.send(message) => result.map(|()| true),
    }
}
