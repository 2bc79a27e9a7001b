use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::ToolContext;
use crate::error::ToolError;
use crate::tools::{Args, ParamSchema, ParamSpec, ToolDef, ToolHandler, ToolRegistry};
use crate::types::ToolResult;

pub(super) fn register(registry: &mut ToolRegistry, ctx: &ToolContext) {
    registry.register(ToolDef::new(
        "run_process",
        "Run an external program from an argument vector (no shell) and capture exit code, stdout and stderr.",
        ParamSchema::new()
            .param(
                ParamSpec::string_list("argv", "Program followed by its arguments")
                    .required()
                    .min(1),
            )
            .param(
                ParamSpec::integer("timeoutSeconds", "Kill the process after this many seconds")
                    .range(1, 3600)
                    .default(30),
            ),
        RunProcess { ctx: ctx.clone() },
    ));
}

struct RunProcess {
    ctx: ToolContext,
}

#[async_trait]
impl ToolHandler for RunProcess {
    async fn call(&self, args: &Args) -> ToolResult {
        let argv = args.str_list("argv")?;
        if argv.first().map_or(true, String::is_empty) {
            return Err(ToolError::invalid("'argv' must start with a program name"));
        }
        let timeout = Duration::from_secs(args.int("timeoutSeconds")? as u64);
        let done = self.ctx.run(argv, timeout).await?;

        serde_json::to_string_pretty(&json!({
            "exitCode": done.exit_code,
            "stdout": done.stdout,
            "stderr": done.stderr,
        }))
        .map_err(|e| ToolError::internal(e.to_string()))
    }
}
