//! JSON-RPC 2.0 protocol constants
//!
//! Method names and well-known fields the proxy looks at, as per
//! https://www.jsonrpc.org/specification and the MCP schema.

/// JSON-RPC 2.0 version identifier
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP method names the default rules key on
pub mod methods {
    /// Tool invocation request sent by the client
    pub const TOOLS_CALL: &str = "tools/call";

    /// Server-initiated request asking the client for a decision
    pub const ELICITATION_CREATE: &str = "elicitation/create";
}

/// Member of `params` naming the invoked tool on `tools/call`
pub const TOOL_NAME_FIELD: &str = "name";

/// Member of `params` holding the tool's arguments on `tools/call`
pub const TOOL_ARGUMENTS_FIELD: &str = "arguments";
