//! Proxy orchestrator
//!
//! Spawns the downstream process, runs the two relay pipelines as independent
//! tasks and decides when the run is over:
//!
//! - outbound ends first (subprocess closed stdout or failed): stop inbound
//! - inbound ends with client EOF: give outbound `drain_grace` to finish
//! - inbound fails: stop outbound
//! - shutdown token cancelled: both stop, outcome is `Interrupted`
//!
//! Whatever happened, the subprocess is terminated and reaped before
//! [`Proxy::run`] returns.

pub mod inbound;
pub mod outbound;
pub mod pending;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::ProxyConfig;
use crate::error::{Pipeline, ProxyError};
use crate::io::{
    ChildProcessManager, DOWNSTREAM, NdjsonReader, SharedNdjsonWriter, StderrMonitor, UPSTREAM,
};
use inbound::InboundInterceptor;
use outbound::OutboundInterceptor;
use pending::PendingElicitations;

/// How a single pipeline stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEnd {
    /// Its input stream reached end of file
    Eof,
    /// The shutdown token fired
    Cancelled,
}

/// How a whole proxy run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyOutcome {
    /// Streams closed normally; carries the subprocess exit code if it had one
    Completed { exit_code: Option<i32> },
    /// Stopped by SIGINT/SIGTERM
    Interrupted,
}

impl ProxyOutcome {
    /// Process exit code for this outcome
    ///
    /// The subprocess exit code is reported in the log only.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProxyOutcome::Completed { .. } | ProxyOutcome::Interrupted => 0,
        }
    }
}

pub struct Proxy {
    config: ProxyConfig,
}

impl Proxy {
    pub fn new(config: ProxyConfig) -> Self {
        Self { config }
    }

    /// Proxy this process's stdin/stdout to the configured subprocess
    pub async fn run(&self, shutdown: CancellationToken) -> Result<ProxyOutcome, ProxyError> {
        self.run_with_io(tokio::io::stdin(), tokio::io::stdout(), shutdown)
            .await
    }

    /// Same as [`Proxy::run`] over arbitrary client streams
    pub async fn run_with_io<R, W>(
        &self,
        client_in: R,
        client_out: W,
        shutdown: CancellationToken,
    ) -> Result<ProxyOutcome, ProxyError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let downstream = &self.config.downstream;
        let mut process =
            ChildProcessManager::new(downstream.command.clone(), downstream.args.clone())
                .with_terminate_grace(self.config.terminate_grace());
        process.on_stderr_line(|line| {
            info!(target: "downstream", "{}", line);
        });

        let pid = process.start().await?;
        let span = info_span!("proxy", run_id = %Uuid::new_v4(), pid);

        let driven = self
            .drive(&mut process, client_in, client_out, &shutdown)
            .instrument(span)
            .await;

        if process.is_running() {
            debug!(pid = ?process.state().pid(), "Stopping subprocess");
        }
        let exit_code = match process.terminate_and_wait().await {
            Ok(exit_code) => exit_code,
            Err(e) if driven.is_err() || shutdown.is_cancelled() => {
                warn!("Failed to reap subprocess: {}", e);
                None
            }
            Err(e) => return Err(e.into()),
        };

        if shutdown.is_cancelled() {
            if let Err(e) = driven {
                debug!("Error during interrupted run: {}", e);
            }
            info!("Proxy interrupted, subprocess stopped");
            return Ok(ProxyOutcome::Interrupted);
        }

        driven?;
        info!(exit_code = ?exit_code, "Proxy run completed");
        Ok(ProxyOutcome::Completed { exit_code })
    }

    /// Run both pipelines until the termination rules say stop
    async fn drive<R, W>(
        &self,
        process: &mut ChildProcessManager,
        client_in: R,
        client_out: W,
        shutdown: &CancellationToken,
    ) -> Result<(), ProxyError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (child_stdin, child_stdout) = process.take_stdio()?;
        let pipelines = shutdown.child_token();

        let to_subprocess = SharedNdjsonWriter::new(child_stdin, DOWNSTREAM);
        let to_client = SharedNdjsonWriter::new(client_out, UPSTREAM);

        let mut inbound = InboundInterceptor::new(
            NdjsonReader::new(client_in, UPSTREAM, self.config.max_line_bytes),
            to_subprocess.clone(),
            self.config.injection_rules.clone(),
            pipelines.clone(),
        );
        let mut outbound = OutboundInterceptor::new(
            NdjsonReader::new(child_stdout, DOWNSTREAM, self.config.max_line_bytes),
            to_client,
            to_subprocess,
            self.config.auto_resolution_rules.clone(),
            pipelines.clone(),
        );
        if self.config.suppress_duplicate_replies {
            let pending = PendingElicitations::new();
            inbound = inbound.with_reply_suppression(pending.clone());
            outbound = outbound.with_reply_suppression(pending);
        }

        let mut inbound_task = tokio::spawn(inbound.run().in_current_span());
        let mut outbound_task = tokio::spawn(outbound.run().in_current_span());
        info!("Relaying between client and {}", process.command());

        // (pipeline that ended first, the other one)
        let (first, second) = tokio::select! {
            result = &mut inbound_task => {
                let inbound_end = joined(Pipeline::Inbound, result);
                let outbound_end = if matches!(inbound_end, Ok(PipelineEnd::Eof)) {
                    let grace = self.config.drain_grace();
                    debug!(?grace, "Client gone, draining subprocess output");
                    match tokio::time::timeout(grace, &mut outbound_task).await {
                        Ok(result) => joined(Pipeline::Outbound, result),
                        Err(_) => {
                            info!("Subprocess still talking after {:?}, stopping", grace);
                            pipelines.cancel();
                            joined(Pipeline::Outbound, outbound_task.await)
                        }
                    }
                } else {
                    pipelines.cancel();
                    joined(Pipeline::Outbound, outbound_task.await)
                };
                (inbound_end, outbound_end)
            }
            result = &mut outbound_task => {
                pipelines.cancel();
                let outbound_end = joined(Pipeline::Outbound, result);
                (outbound_end, joined(Pipeline::Inbound, inbound_task.await))
            }
        };

        if let (Err(_), Err(e)) = (&first, &second) {
            warn!("Second pipeline also failed: {}", e);
        }
        first?;
        second?;
        Ok(())
    }
}

fn joined(
    pipeline: Pipeline,
    result: Result<Result<PipelineEnd, ProxyError>, JoinError>,
) -> Result<PipelineEnd, ProxyError> {
    let end = result.map_err(|source| ProxyError::Task { pipeline, source })??;
    debug!(%pipeline, ?end, "Pipeline finished");
    Ok(end)
}
