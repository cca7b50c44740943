//! I/O layer - streams, framing and the child process
//!
//! - **Ndjson**: line-delimited JSON reader and writer
//! - **Transport**: message sinks, including the writer shared by both pipelines
//! - **Process**: downstream process lifecycle with stderr draining

pub mod ndjson;
pub mod process;
pub mod transport;

/// Peer names used in diagnostics and errors
pub const UPSTREAM: &str = "upstream";
pub const DOWNSTREAM: &str = "downstream";

pub use ndjson::NdjsonReader;
pub use process::{ChildProcessManager, ProcessError, StderrMonitor};
pub use transport::{MessageSink, SharedNdjsonWriter};
