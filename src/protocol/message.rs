//! JSON-RPC message envelope
//!
//! Classifies raw JSON values into requests, responses and notifications
//! while keeping the complete original object, so a message that is relayed
//! without modification serializes back to the same structure and key order.

use serde::{Serialize, Serializer};
use serde_json::{Map, Number, Value};
use std::fmt;

use crate::protocol::jsonrpc_utils::JSONRPC_VERSION;

// ============================================================================
// Request Identifiers
// ============================================================================

/// JSON-RPC request identifier
///
/// Numbers are kept as [`serde_json::Number`] so the exact representation
/// (integer vs. float, signedness) survives being echoed back.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestId {
    Number(Number),
    String(String),
    Null,
}

impl RequestId {
    /// Interpret a JSON value as an identifier; objects, arrays and booleans are not ids
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(RequestId::Number(n.clone())),
            Value::String(s) => Some(RequestId::String(s.clone())),
            Value::Null => Some(RequestId::Null),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RequestId::Number(n) => Value::Number(n.clone()),
            RequestId::String(s) => Value::String(s.clone()),
            RequestId::Null => Value::Null,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s:?}"),
            RequestId::Null => f.write_str("null"),
        }
    }
}

// ============================================================================
// Envelope Types
// ============================================================================

/// A message that expects a response
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    object: Map<String, Value>,
}

/// A reply correlated with an earlier request
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    object: Map<String, Value>,
}

/// A fire-and-forget message
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    object: Map<String, Value>,
}

/// One line of traffic, classified
///
/// `Other` holds valid JSON that is not a recognisable JSON-RPC object
/// (batches, scalars, objects without `method` or `id`). The proxy relays it
/// untouched rather than dropping it.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
    Other(Value),
}

impl Message {
    /// Classify a parsed JSON value. Never fails; unrecognised shapes become `Other`.
    pub fn from_value(value: Value) -> Self {
        let object = match value {
            Value::Object(object) => object,
            other => return Message::Other(other),
        };

        let method = match object.get("method") {
            Some(Value::String(method)) => Ok(Some(method.clone())),
            Some(_) => Err(()),
            None => Ok(None),
        };
        let id = match object.get("id").map(RequestId::from_value) {
            Some(Some(id)) => Ok(Some(id)),
            Some(None) => Err(()),
            None => Ok(None),
        };
        let (Ok(method), Ok(id)) = (method, id) else {
            return Message::Other(Value::Object(object));
        };

        match (method, id) {
            (Some(method), Some(id)) => Message::Request(Request { id, method, object }),
            (Some(method), None) => Message::Notification(Notification { method, object }),
            (None, Some(id)) if object.contains_key("result") || object.contains_key("error") => {
                Message::Response(Response { id, object })
            }
            _ => Message::Other(Value::Object(object)),
        }
    }

    /// Build a successful response carrying `result` for the given id
    pub fn success_response(id: &RequestId, result: Value) -> Self {
        let mut object = Map::new();
        object.insert("jsonrpc".to_string(), Value::from(JSONRPC_VERSION));
        object.insert("id".to_string(), id.to_value());
        object.insert("result".to_string(), result);
        Message::Response(Response {
            id: id.clone(),
            object,
        })
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Message::Request(r) => Some(&r.id),
            Message::Response(r) => Some(&r.id),
            Message::Notification(_) | Message::Other(_) => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            Message::Response(_) | Message::Other(_) => None,
        }
    }

    /// The `params` member, if the message has one
    pub fn params(&self) -> Option<&Value> {
        self.object().and_then(|object| object.get("params"))
    }

    /// Mutable access to `params` as an object, inserting `{}` when absent
    ///
    /// Returns `None` for responses and unclassified values, and when
    /// `params` exists but is not an object (e.g. positional array params).
    pub fn params_object_mut(&mut self) -> Option<&mut Map<String, Value>> {
        let object = match self {
            Message::Request(r) => &mut r.object,
            Message::Notification(n) => &mut n.object,
            Message::Response(_) | Message::Other(_) => return None,
        };
        object
            .entry("params")
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
    }

    /// Short label for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "request",
            Message::Response(_) => "response",
            Message::Notification(_) => "notification",
            Message::Other(_) => "other",
        }
    }

    #[cfg(test)]
    pub fn into_value(self) -> Value {
        match self {
            Message::Request(Request { object, .. })
            | Message::Response(Response { object, .. })
            | Message::Notification(Notification { object, .. }) => Value::Object(object),
            Message::Other(value) => value,
        }
    }

    fn object(&self) -> Option<&Map<String, Value>> {
        match self {
            Message::Request(r) => Some(&r.object),
            Message::Response(r) => Some(&r.object),
            Message::Notification(n) => Some(&n.object),
            Message::Other(_) => None,
        }
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Message::Request(Request { object, .. })
            | Message::Response(Response { object, .. })
            | Message::Notification(Notification { object, .. }) => object.serialize(serializer),
            Message::Other(value) => value.serialize(serializer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_request() {
        let msg = Message::from_value(json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "codex"}
        }));
        assert!(matches!(msg, Message::Request(_)));
        assert_eq!(msg.method(), Some("tools/call"));
        assert_eq!(msg.id(), Some(&RequestId::Number(Number::from(1u64))));
        assert_eq!(msg.params().unwrap()["name"], "codex");
    }

    #[test]
    fn test_classify_response_and_notification() {
        let response = Message::from_value(json!({"jsonrpc": "2.0", "id": "abc", "result": {}}));
        assert!(matches!(response, Message::Response(_)));
        assert_eq!(response.id(), Some(&RequestId::String("abc".to_string())));
        assert_eq!(response.method(), None);

        let error = Message::from_value(json!({
            "jsonrpc": "2.0", "id": null, "error": {"code": -32700, "message": "Parse error"}
        }));
        assert_eq!(error.id(), Some(&RequestId::Null));

        let notification =
            Message::from_value(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}));
        assert!(matches!(notification, Message::Notification(_)));
        assert!(notification.id().is_none());
    }

    #[test]
    fn test_unclassifiable_values_are_kept() {
        for value in [
            json!([{"jsonrpc": "2.0", "id": 1, "method": "ping"}]),
            json!("hello"),
            json!({"jsonrpc": "2.0", "id": 1}),
            json!({"jsonrpc": "2.0", "id": {"nested": true}, "method": "ping"}),
            json!({"jsonrpc": "2.0", "method": 42}),
        ] {
            let msg = Message::from_value(value.clone());
            assert_eq!(msg.kind(), "other");
            assert_eq!(msg.into_value(), value);
        }
    }

    #[test]
    fn test_serialization_preserves_key_order() {
        let line = r#"{"method":"tools/list","jsonrpc":"2.0","id":3,"params":{"z":1,"a":2}}"#;
        let msg = Message::from_value(serde_json::from_str(line).unwrap());
        assert_eq!(serde_json::to_string(&msg).unwrap(), line);
    }

    #[test]
    fn test_success_response_echoes_id_type() {
        let float_id: Value = serde_json::from_str("7.5").unwrap();
        for raw in [json!(7), json!("7"), float_id] {
            let id = RequestId::from_value(&raw).unwrap();
            let response = Message::success_response(&id, json!({"decision": "approved"}));
            let value = response.into_value();
            assert_eq!(value["id"], raw);
            assert_eq!(value["jsonrpc"], "2.0");
            assert_eq!(value["result"]["decision"], "approved");
        }
    }

    #[test]
    fn test_params_object_mut_creates_missing_params() {
        let mut msg = Message::from_value(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}));
        msg.params_object_mut()
            .unwrap()
            .insert("x".to_string(), json!(1));
        assert_eq!(msg.params().unwrap()["x"], 1);

        let mut positional =
            Message::from_value(json!({"jsonrpc": "2.0", "id": 2, "method": "sum", "params": [1, 2]}));
        assert!(positional.params_object_mut().is_none());

        let mut response = Message::from_value(json!({"jsonrpc": "2.0", "id": 2, "result": 3}));
        assert!(response.params_object_mut().is_none());
    }
}
