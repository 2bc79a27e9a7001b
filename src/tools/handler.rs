use async_trait::async_trait;
use serde_json::{json, Value};

use super::schema::{Args, ParamSchema};
use crate::types::ToolResult;

/// A tool's execution handler. Receives arguments that already passed the
/// tool's [`ParamSchema`].
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: &Args) -> ToolResult;
}

/// A registered tool: name, description, parameter schema and handler.
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub params: ParamSchema,
    pub(crate) handler: Box<dyn ToolHandler>,
}

impl ToolDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        params: ParamSchema,
        handler: impl ToolHandler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params,
            handler: Box::new(handler),
        }
    }

    /// Complete tool definition (name, description, input_schema) for discovery.
    pub fn schema(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.params.to_json(),
        })
    }
}
