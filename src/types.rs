use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ErrorKind, ToolError};

/// One invocation: a tool name plus its arguments. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    #[serde(rename = "tool")]
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolRequest {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// Exactly one of these is produced per request.
pub type ToolResult = Result<String, ToolError>;

/// Wire shape of a [`ToolResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResponse {
    Result {
        result: String,
    },
    Error {
        error: String,
        kind: ErrorKind,
        code: u16,
    },
}

impl ToolResponse {
    pub fn is_error(&self) -> bool {
        matches!(self, ToolResponse::Error { .. })
    }

    pub fn into_result(self) -> ToolResult {
        match self {
            ToolResponse::Result { result } => Ok(result),
            ToolResponse::Error { error, kind, .. } => Err(ToolError::new(kind, error)),
        }
    }
}

impl From<ToolResult> for ToolResponse {
    fn from(result: ToolResult) -> Self {
        match result {
            Ok(result) => ToolResponse::Result { result },
            Err(e) => ToolResponse::Error {
                code: e.kind.code(),
                kind: e.kind,
                error: e.message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_uses_tool_field_on_the_wire() {
        let req: ToolRequest =
            serde_json::from_value(json!({"tool": "read_file", "arguments": {"file_path": "a"}}))
                .unwrap();
        assert_eq!(req.name, "read_file");
        assert_eq!(req.arguments["file_path"], "a");
    }

    #[test]
    fn request_arguments_default_to_empty() {
        let req: ToolRequest = serde_json::from_value(json!({"tool": "health"})).unwrap();
        assert!(req.arguments.is_empty());
    }

    #[test]
    fn response_envelope_shapes() {
        let ok = serde_json::to_value(ToolResponse::from(Ok("hi".to_string()))).unwrap();
        assert_eq!(ok, json!({"result": "hi"}));

        let err = serde_json::to_value(ToolResponse::from(Err(ToolError::unknown_tool("x"))))
            .unwrap();
        assert_eq!(err["error"], "unknown tool: x");
        assert_eq!(err["kind"], "unknown_tool");
        assert_eq!(err["code"], 404);
    }

    #[test]
    fn response_parses_back_into_result() {
        let parsed: ToolResponse =
            serde_json::from_value(json!({"error": "nope", "kind": "timeout", "code": 524}))
                .unwrap();
        let err = parsed.into_result().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(err.message, "nope");
    }
}
