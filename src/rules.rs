//! Interception rules
//!
//! Two kinds of rules drive the proxy, both plain configuration data:
//!
//! - [`InjectionRule`]: fills in default tool arguments on client requests
//!   before they reach the subprocess.
//! - [`AutoResolutionRule`]: recognises approval-seeking requests from the
//!   subprocess and produces the reply the proxy answers them with.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::protocol::jsonrpc_utils::{
    TOOL_ARGUMENTS_FIELD, TOOL_NAME_FIELD, methods::ELICITATION_CREATE, methods::TOOLS_CALL,
};
use crate::protocol::{Message, RequestId};

// ============================================================================
// Injection Rules
// ============================================================================

/// Default arguments inserted into matching tool calls
///
/// A message matches when its `method` equals [`InjectionRule::method`] and
/// `params.name` is one of [`InjectionRule::tools`]. Each entry of
/// [`InjectionRule::defaults`] is inserted into `params.arguments` only if the
/// key is absent, so applying a rule twice changes nothing the second time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InjectionRule {
    #[serde(default = "default_injection_method")]
    pub method: String,

    /// Tool names the rule applies to
    pub tools: Vec<String>,

    /// Keys and values to insert, in insertion order
    pub defaults: Map<String, Value>,
}

fn default_injection_method() -> String {
    TOOLS_CALL.to_string()
}

impl Default for InjectionRule {
    /// `codex` and `codex-reply` calls run unattended with full access
    fn default() -> Self {
        let mut defaults = Map::new();
        defaults.insert("approval-policy".to_string(), json!("never"));
        defaults.insert("sandbox".to_string(), json!("danger-full-access"));
        Self {
            method: default_injection_method(),
            tools: vec!["codex".to_string(), "codex-reply".to_string()],
            defaults,
        }
    }
}

impl InjectionRule {
    pub fn matches(&self, message: &Message) -> bool {
        message.method() == Some(self.method.as_str())
            && message
                .params()
                .and_then(|params| params.get(TOOL_NAME_FIELD))
                .and_then(Value::as_str)
                .is_some_and(|name| self.tools.iter().any(|tool| tool == name))
    }

    /// Insert every absent default into `params.arguments`
    ///
    /// Returns the keys that were inserted. A missing or `null` `arguments`
    /// member is replaced by an empty object first; a non-object `arguments`
    /// (or `params`) is left alone and nothing is injected.
    pub fn apply(&self, message: &mut Message) -> Vec<String> {
        if !self.matches(message) {
            return Vec::new();
        }
        let Some(params) = message.params_object_mut() else {
            return Vec::new();
        };

        let arguments = params
            .entry(TOOL_ARGUMENTS_FIELD)
            .or_insert_with(|| Value::Object(Map::new()));
        if arguments.is_null() {
            *arguments = Value::Object(Map::new());
        }
        let Some(arguments) = arguments.as_object_mut() else {
            return Vec::new();
        };

        let mut injected = Vec::new();
        for (key, value) in &self.defaults {
            if !arguments.contains_key(key) {
                arguments.insert(key.clone(), value.clone());
                injected.push(key.clone());
            }
        }
        injected
    }
}

// ============================================================================
// Auto-Resolution Rules
// ============================================================================

/// Requests from the subprocess the proxy answers on the client's behalf
///
/// A message matches when its `method` equals [`AutoResolutionRule::method`]
/// and the value found at [`AutoResolutionRule::discriminator`] (a JSON
/// pointer into `params`) is one of [`AutoResolutionRule::accepted`]. Nothing
/// else is approved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutoResolutionRule {
    #[serde(default = "default_elicitation_method")]
    pub method: String,

    /// JSON pointer relative to `params`, e.g. `/codex_elicitation`
    pub discriminator: String,

    /// Discriminator values that are approved automatically
    pub accepted: Vec<Value>,

    /// `result` member of the synthesized response
    #[serde(default = "default_approval_result")]
    pub result: Value,
}

fn default_elicitation_method() -> String {
    ELICITATION_CREATE.to_string()
}

fn default_approval_result() -> Value {
    json!({ "decision": "approved" })
}

impl Default for AutoResolutionRule {
    /// Approve codex patch-approval elicitations, and only those
    fn default() -> Self {
        Self {
            method: default_elicitation_method(),
            discriminator: "/codex_elicitation".to_string(),
            accepted: vec![json!("patch-approval")],
            result: default_approval_result(),
        }
    }
}

impl AutoResolutionRule {
    /// The discriminator value carried by `message`, if any
    pub fn discriminator_value<'a>(&self, message: &'a Message) -> Option<&'a Value> {
        message.params()?.pointer(&self.discriminator)
    }

    pub fn matches(&self, message: &Message) -> bool {
        message.method() == Some(self.method.as_str())
            && self
                .discriminator_value(message)
                .is_some_and(|value| self.accepted.contains(value))
    }

    /// The approval to send back for `message`
    ///
    /// `None` when the message carries no id, since such a reply could not be
    /// correlated with anything.
    pub fn resolve(&self, message: &Message) -> Option<Message> {
        let id: &RequestId = message.id()?;
        Some(Message::success_response(id, self.result.clone()))
    }
}
