use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde_json::{json, Value};
use tracing::{debug, warn};

use super::registry::ToolRegistry;
use crate::error::ToolError;
use crate::types::{ToolRequest, ToolResponse, ToolResult};

pub const LIST_TOOLS: &str = "list_tools";
pub const TOOL_SEARCH: &str = "tool_search";
pub const HEALTH: &str = "health";

/// Sole entry point for tool calls. Wraps a [`ToolRegistry`] and answers
/// the discovery and health meta-tools itself.
///
/// Apart from the invocation counter the dispatcher holds no mutable state,
/// so one instance can be shared by any number of connections.
pub struct Dispatcher {
    registry: ToolRegistry,
    served: AtomicU64,
    started: Instant,
}

impl Dispatcher {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            served: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Invocations answered so far, meta-tools included.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    /// Name, description and input schema of every callable tool.
    pub fn list_tools(&self) -> Vec<Value> {
        let mut tools = self.registry.schemas();
        tools.extend(meta_schemas());
        tools
    }

    pub async fn invoke(&self, request: &ToolRequest) -> ToolResult {
        self.served.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();

        let result = match request.name.as_str() {
            LIST_TOOLS => self.meta(request, |d, _| to_json(&d.list_tools())),
            TOOL_SEARCH => self.meta(request, |d, args| {
                let query = args.get("query").and_then(Value::as_str).unwrap_or("");
                to_json(&d.registry.search(query))
            }),
            HEALTH => self.meta(request, |d, _| {
                to_json(&json!({
                    "status": "ok",
                    "tools": d.registry.len(),
                    "served": d.served(),
                    "uptime_secs": d.started.elapsed().as_secs(),
                }))
            }),
            _ => self.registry.invoke(request).await,
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => debug!(tool = %request.name, elapsed_ms, "tool call succeeded"),
            Err(e) => warn!(
                tool = %request.name,
                kind = %e.kind,
                elapsed_ms,
                error = %e.message,
                "tool call failed"
            ),
        }
        result
    }

    /// Same as [`invoke`](Self::invoke), shaped for the wire.
    pub async fn handle(&self, request: &ToolRequest) -> ToolResponse {
        self.invoke(request).await.into()
    }

    fn meta(
        &self,
        request: &ToolRequest,
        answer: impl FnOnce(&Self, &serde_json::Map<String, Value>) -> ToolResult,
    ) -> ToolResult {
        let allowed: &[&str] = if request.name == TOOL_SEARCH { &["query"] } else { &[] };
        if let Some(unknown) = request
            .arguments
            .keys()
            .find(|k| !allowed.contains(&k.as_str()))
        {
            return Err(ToolError::invalid(format!("unknown parameter '{unknown}'")));
        }
        if request.name == TOOL_SEARCH {
            match request.arguments.get("query") {
                Some(Value::String(_)) => {}
                Some(_) => return Err(ToolError::invalid("'query' must be a string")),
                None => return Err(ToolError::invalid("missing required parameter 'query'")),
            }
        }
        answer(self, &request.arguments)
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> ToolResult {
    serde_json::to_string_pretty(value).map_err(|e| ToolError::internal(e.to_string()))
}

fn meta_schemas() -> Vec<Value> {
    let empty = json!({"type": "object", "properties": {}, "required": [], "additionalProperties": false});
    vec![
        json!({
            "name": LIST_TOOLS,
            "description": "List every available tool with its input schema.",
            "input_schema": empty,
        }),
        json!({
            "name": TOOL_SEARCH,
            "description": "Search available tools by keyword. Returns names and descriptions.",
            "input_schema": {
                "type": "object",
                "properties": {"query": {"type": "string", "description": "Keywords to match"}},
                "required": ["query"],
                "additionalProperties": false,
            },
        }),
        json!({
            "name": HEALTH,
            "description": "Report whether the dispatcher is up and how many calls it has served.",
            "input_schema": empty,
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::tools::handler::{ToolDef, ToolHandler};
    use crate::tools::schema::{Args, ParamSchema, ParamSpec};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, args: &Args) -> ToolResult {
            Ok(args.str("text")?.to_string())
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(ToolRegistry::new().add(ToolDef::new(
            "echo",
            "Echo text back",
            ParamSchema::new().param(ParamSpec::string("text", "Text").required()),
            Echo,
        )))
    }

    #[tokio::test]
    async fn routes_to_registry() {
        let d = dispatcher();
        let out = d
            .invoke(&ToolRequest::new("echo", json!({"text": "hi"})))
            .await
            .unwrap();
        assert_eq!(out, "hi");
    }

    #[tokio::test]
    async fn list_tools_includes_meta_tools() {
        let d = dispatcher();
        let out = d.invoke(&ToolRequest::new(LIST_TOOLS, json!({}))).await.unwrap();
        let tools: Vec<Value> = serde_json::from_str(&out).unwrap();
        let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
        assert_eq!(names, vec!["echo", LIST_TOOLS, TOOL_SEARCH, HEALTH]);
        assert_eq!(tools[0]["input_schema"]["required"], json!(["text"]));
    }

    #[tokio::test]
    async fn tool_search_requires_query() {
        let d = dispatcher();
        let err = d
            .invoke(&ToolRequest::new(TOOL_SEARCH, json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        let out = d
            .invoke(&ToolRequest::new(TOOL_SEARCH, json!({"query": "echo"})))
            .await
            .unwrap();
        let hits: Vec<Value> = serde_json::from_str(&out).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn health_counts_invocations() {
        let d = dispatcher();
        d.invoke(&ToolRequest::new("echo", json!({"text": "a"}))).await.unwrap();
        d.invoke(&ToolRequest::new("missing", json!({}))).await.unwrap_err();

        let out = d.invoke(&ToolRequest::new(HEALTH, json!({}))).await.unwrap();
        let health: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["tools"], 1);
        assert_eq!(health["served"], 3);
    }

    #[tokio::test]
    async fn handle_produces_error_envelope() {
        let d = dispatcher();
        let resp = d.handle(&ToolRequest::new("missing", json!({}))).await;
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"error": "unknown tool: missing", "kind": "unknown_tool", "code": 404})
        );
    }
}
