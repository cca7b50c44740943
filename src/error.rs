//! Error types for the proxy
//!
//! Parse errors never show up here: malformed lines are skipped inside the
//! channel. What remains is fatal to a pipeline or to the whole run.

use std::fmt;

use crate::config::ConfigError;
use crate::io::ProcessError;

/// The two relay directions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipeline {
    /// Client → subprocess
    Inbound,
    /// Subprocess → client
    Outbound,
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pipeline::Inbound => f.write_str("inbound"),
            Pipeline::Outbound => f.write_str("outbound"),
        }
    }
}

/// Errors that end a proxy run
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Spawning or tearing down the subprocess failed
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Failed to read from {peer}: {source}")]
    Read {
        peer: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write to {peer}: {source}")]
    Write {
        peer: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A pipeline task panicked or was aborted
    #[error("{pipeline} pipeline task failed: {source}")]
    Task {
        pipeline: Pipeline,
        #[source]
        source: tokio::task::JoinError,
    },
}
