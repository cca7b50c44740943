//! Inbound pipeline: client → subprocess
//!
//! Reads the client's messages, fills in default tool arguments where an
//! injection rule matches, and forwards everything to the subprocess stdin.

use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, info};

use crate::error::ProxyError;
use crate::io::{DOWNSTREAM, MessageSink, NdjsonReader, UPSTREAM};
use crate::log_proxy_message;
use crate::protocol::Message;
use crate::proxy::PipelineEnd;
use crate::proxy::pending::PendingElicitations;
use crate::rules::InjectionRule;

pub struct InboundInterceptor<R, S> {
    reader: NdjsonReader<R>,
    downstream: S,
    rules: Vec<InjectionRule>,
    /// Set when client replies to auto-resolved elicitations must be dropped
    pending: Option<PendingElicitations>,
    shutdown: CancellationToken,
}

impl<R, S> InboundInterceptor<R, S>
where
    R: AsyncRead + Unpin + Send,
    S: MessageSink,
{
    pub fn new(
        reader: NdjsonReader<R>,
        downstream: S,
        rules: Vec<InjectionRule>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            reader,
            downstream,
            rules,
            pending: None,
            shutdown,
        }
    }

    pub fn with_reply_suppression(mut self, pending: PendingElicitations) -> Self {
        self.pending = Some(pending);
        self
    }

    /// Relay until the client closes its stream or the run is cancelled
    ///
    /// On client EOF the subprocess stdin is closed so the subprocess sees
    /// EOF too. A failed write to the subprocess ends the pipeline with an error.
    pub async fn run(mut self) -> Result<PipelineEnd, ProxyError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("inbound: shutdown requested");
                    return Ok(PipelineEnd::Cancelled);
                }
                next = self.reader.next_message() => next,
            };

            let mut message = match next {
                Ok(Some(message)) => message,
                Ok(None) => {
                    info!(
                        skipped = self.reader.skipped(),
                        "Client closed its stream, closing subprocess stdin"
                    );
                    if let Err(e) = self.downstream.close().await {
                        debug!("inbound: closing subprocess stdin failed: {}", e);
                    }
                    return Ok(PipelineEnd::Eof);
                }
                Err(source) => {
                    return Err(ProxyError::Read {
                        peer: UPSTREAM,
                        source,
                    });
                }
            };

            if !self.intercept(&mut message) {
                continue;
            }

            log_proxy_message!(Level::DEBUG, "upstream->downstream", message);

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("inbound: shutdown requested while writing");
                    return Ok(PipelineEnd::Cancelled);
                }
                result = self.downstream.send(&message) => {
                    result.map_err(|source| ProxyError::Write { peer: DOWNSTREAM, source })?;
                }
            }
        }
    }

    /// Apply injection rules in place; `false` means drop the message
    fn intercept(&self, message: &mut Message) -> bool {
        if let (Some(pending), Message::Response(response)) = (&self.pending, &*message) {
            if let Some(record) = pending.take(&response.id) {
                info!(
                    id = %response.id,
                    kind = ?record.kind,
                    resolved_at = %record.resolved_at,
                    "Dropping client reply to an elicitation that was already auto-approved"
                );
                return false;
            }
        }

        for rule in &self.rules {
            for key in rule.apply(message) {
                info!(
                    method = %rule.method,
                    key = %key,
                    "Injected default argument"
                );
            }
        }
        true
    }
}
