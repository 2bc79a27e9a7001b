use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde_json::{json, Value};
use tracing::warn;

use super::handler::ToolDef;
use crate::error::ToolError;
use crate::types::{ToolRequest, ToolResult};

/// Catalog of available tools. Stores definitions, provides schemas,
/// validates arguments and runs handlers by name.
///
/// Registration happens once at start-up; after that the registry is only read.
pub struct ToolRegistry {
    tools: Vec<ToolDef>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Builder form of [`register`](Self::register).
    pub fn add(mut self, def: ToolDef) -> Self {
        self.register(def);
        self
    }

    /// Register a tool. A later registration under the same name replaces the earlier one.
    pub fn register(&mut self, def: ToolDef) {
        if let Some(existing) = self.tools.iter_mut().find(|t| t.name == def.name) {
            warn!(tool = %def.name, "replacing previously registered tool");
            *existing = def;
        } else {
            self.tools.push(def);
        }
    }

    /// All tool schemas, in registration order.
    pub fn schemas(&self) -> Vec<Value> {
        self.tools.iter().map(ToolDef::schema).collect()
    }

    /// Schema for a specific tool by name.
    pub fn schema(&self, name: &str) -> Option<Value> {
        self.get(name).map(ToolDef::schema)
    }

    pub fn get(&self, name: &str) -> Option<&ToolDef> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Look up, validate, run. Unknown names and invalid arguments fail
    /// before the handler is touched. A panicking handler becomes an
    /// `InternalError` instead of taking the process down.
    pub async fn invoke(&self, request: &ToolRequest) -> ToolResult {
        let tool = self
            .get(&request.name)
            .ok_or_else(|| ToolError::unknown_tool(&request.name))?;
        let args = tool.params.validate(&request.arguments)?;

        match AssertUnwindSafe(tool.handler.call(&args)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(tool = %tool.name, %message, "tool handler panicked");
                Err(ToolError::internal(format!(
                    "tool '{}' failed unexpectedly: {message}",
                    tool.name
                )))
            }
        }
    }

    /// Search tools by query. Matches against name and description.
    /// Returns compact summaries (name + description only, no input_schema).
    pub fn search(&self, query: &str) -> Vec<Value> {
        let query_lower = query.to_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();

        self.tools
            .iter()
            .filter(|t| {
                let haystack = format!("{} {}", t.name, t.description).to_lowercase();
                terms.iter().any(|term| haystack.contains(term))
            })
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                })
            })
            .collect()
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::tools::handler::ToolHandler;
    use crate::tools::schema::{Args, ParamSchema, ParamSpec};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct NoopHandler;

    #[async_trait]
    impl ToolHandler for NoopHandler {
        async fn call(&self, _args: &Args) -> ToolResult {
            Ok("ok".into())
        }
    }

    /// Counts how often it was called.
    struct RecordingHandler(Arc<AtomicUsize>);

    #[async_trait]
    impl ToolHandler for RecordingHandler {
        async fn call(&self, args: &Args) -> ToolResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(format!("count={}", args.int("count")?))
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl ToolHandler for PanickingHandler {
        async fn call(&self, _args: &Args) -> ToolResult {
            panic!("handler exploded");
        }
    }

    fn test_registry() -> ToolRegistry {
        ToolRegistry::new()
            .add(ToolDef::new(
                "read_file",
                "Read the contents of a file at the given path",
                ParamSchema::new().param(ParamSpec::string("path", "File").required()),
                NoopHandler,
            ))
            .add(ToolDef::new(
                "list_directory",
                "List the entries of a directory on the local file system",
                ParamSchema::new().param(ParamSpec::string("path", "Directory").required()),
                NoopHandler,
            ))
            .add(ToolDef::new(
                "run_process",
                "Run an external program and capture stdout/stderr",
                ParamSchema::new(),
                NoopHandler,
            ))
    }

    fn counted(calls: Arc<AtomicUsize>) -> ToolRegistry {
        ToolRegistry::new().add(ToolDef::new(
            "counted",
            "Records calls",
            ParamSchema::new().param(ParamSpec::integer("count", "n").required().range(1, 5)),
            RecordingHandler(calls),
        ))
    }

    #[tokio::test]
    async fn unknown_tool_has_no_side_effect() {
        let calls = Arc::new(AtomicUsize::new(0));
        let reg = counted(calls.clone());
        let err = reg
            .invoke(&ToolRequest::new("nope", json!({"count": 1})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownTool);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_arguments_never_reach_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let reg = counted(calls.clone());

        for bad in [json!({}), json!({"count": 9}), json!({"count": "1"}), json!({"count": 1, "x": 1})] {
            let err = reg.invoke(&ToolRequest::new("counted", bad)).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidArgument);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let ok = reg
            .invoke(&ToolRequest::new("counted", json!({"count": 3})))
            .await
            .unwrap();
        assert_eq!(ok, "count=3");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_handler_becomes_internal_error() {
        let reg = ToolRegistry::new().add(ToolDef::new(
            "explode",
            "Always panics",
            ParamSchema::new(),
            PanickingHandler,
        ));
        let err = reg
            .invoke(&ToolRequest::new("explode", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InternalError);
        assert!(err.message.contains("handler exploded"));

        // Still usable afterwards.
        let err = reg
            .invoke(&ToolRequest::new("explode", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InternalError);
    }

    #[test]
    fn register_replaces_same_name() {
        let mut reg = test_registry();
        reg.register(ToolDef::new("read_file", "Replaced", ParamSchema::new(), NoopHandler));
        assert_eq!(reg.len(), 3);
        assert_eq!(reg.get("read_file").unwrap().description, "Replaced");
    }

    #[test]
    fn schemas_carry_input_schema() {
        let reg = test_registry();
        let schema = reg.schema("read_file").unwrap();
        assert_eq!(schema["name"], "read_file");
        assert_eq!(schema["input_schema"]["required"], json!(["path"]));
        assert_eq!(reg.schemas().len(), 3);
    }

    #[test]
    fn search_by_name() {
        let reg = test_registry();
        let results = reg.search("read");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["name"], "read_file");
    }

    #[test]
    fn search_by_description() {
        let reg = test_registry();
        let results = reg.search("stdout");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["name"], "run_process");
    }

    #[test]
    fn search_multiple_matches() {
        let reg = test_registry();
        assert_eq!(reg.search("file").len(), 2);
    }

    #[test]
    fn search_no_match() {
        assert!(test_registry().search("database").is_empty());
    }

    #[test]
    fn search_returns_compact_summaries() {
        let results = test_registry().search("read");
        assert!(results[0].get("name").is_some());
        assert!(results[0].get("description").is_some());
        assert!(results[0].get("input_schema").is_none());
    }
}
