//! Request and reply envelopes exchanged over the WebSocket
//!
//! Every text frame carries exactly one envelope encoded as JSON:
//!
//! - request: `{"id": "...", "name": "...", "arguments": {...}}`
//! - reply:   `{"id": "...", "name": "...", "content": [...], "isError": false}`

use crate::error::BridgeError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Ordered argument mapping carried by a request
pub type Arguments = Map<String, Value>;

/// Generate a fresh collision-resistant correlation ID
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A tool invocation sent to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub id: String,
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub arguments: Arguments,
}

impl ToolRequest {
    /// Create a request with a generated correlation ID
    pub fn new(name: impl Into<String>, arguments: Arguments) -> Self {
        Self {
            id: new_correlation_id(),
            name: name.into(),
            arguments,
        }
    }

    /// Create a request with a caller-supplied correlation ID
    pub fn with_id(id: impl Into<String>, name: impl Into<String>, arguments: Arguments) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// The host's answer to a [`ToolRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolReply {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "one_or_many")]
    pub content: Vec<Value>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl ToolReply {
    /// Successful reply carrying a single result value
    pub fn success(id: impl Into<String>, name: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            content: vec![value],
            is_error: false,
        }
    }

    /// Error reply carrying the error's message as its only content item
    pub fn error(id: impl Into<String>, name: impl Into<String>, error: &BridgeError) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            content: vec![Value::String(error.to_string())],
            is_error: true,
        }
    }

    /// Error reply answering `request`
    pub fn error_for(request: &ToolRequest, error: &BridgeError) -> Self {
        Self::error(request.id.clone(), request.name.clone(), error)
    }

    /// First content item rendered as text, if any
    pub fn text(&self) -> Option<String> {
        self.content.first().map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Best-effort extraction of the `id` of an envelope that failed to parse
pub fn salvage_id(raw: &str) -> Option<String> {
    let value: Value = serde_json::from_str(raw).ok()?;
    value.get("id")?.as_str().map(str::to_string)
}

/// Short preview of a frame for debug logs
pub fn preview(raw: &str) -> String {
    raw.chars().take(200).collect()
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Arguments, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Arguments>::deserialize(deserializer)?.unwrap_or_default())
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        single => Ok(vec![single]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_preserves_argument_order() {
        let json = r#"{"id":"r1","name":"set_game_object_world_position","arguments":{"z":3,"x":1,"y":2}}"#;
        let request: ToolRequest = serde_json::from_str(json).unwrap();

        let keys: Vec<&str> = request.arguments.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["z", "x", "y"]);
    }

    #[test]
    fn test_request_without_arguments() {
        let request: ToolRequest =
            serde_json::from_str(r#"{"id":"r1","name":"get_active_scene"}"#).unwrap();
        assert!(request.arguments.is_empty());

        let request: ToolRequest =
            serde_json::from_str(r#"{"id":"r1","name":"get_active_scene","arguments":null}"#)
                .unwrap();
        assert!(request.arguments.is_empty());
    }

    #[test]
    fn test_reply_accepts_single_content_value() {
        let reply: ToolReply = serde_json::from_str(
            r#"{"id":"r1","name":"get_components","content":"Tool 'x' not found","isError":true}"#,
        )
        .unwrap();

        assert!(reply.is_error);
        assert_eq!(reply.content, vec![json!("Tool 'x' not found")]);
    }

    #[test]
    fn test_reply_wire_format() {
        let reply = ToolReply::success("r2", "get_active_scene", json!({"name": "main"}));
        let json = serde_json::to_value(&reply).unwrap();

        assert_eq!(json["isError"], json!(false));
        assert_eq!(json["content"], json!([{"name": "main"}]));
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        let a = ToolRequest::new("ping", Arguments::new());
        let b = ToolRequest::new("ping", Arguments::new());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_salvage_id() {
        assert_eq!(salvage_id(r#"{"id":"abc","name":5}"#), Some("abc".into()));
        assert_eq!(salvage_id("not json"), None);
    }
}
