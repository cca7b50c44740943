//! Protocol layer - JSON-RPC envelope and constants
//!
//! The proxy never needs typed MCP payloads; it only classifies each line and
//! reads a handful of fields, so messages stay generic JSON underneath.

pub mod jsonrpc_utils;
pub mod message;

pub use message::{Message, RequestId};
