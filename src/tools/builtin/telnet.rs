use std::time::Duration;

use async_trait::async_trait;

use super::{port_arg, secs, ToolContext};
use crate::connector::ConnectParams;
use crate::error::ConnectError;
use crate::tools::{Args, ParamSchema, ParamSpec, ToolDef, ToolHandler, ToolRegistry};
use crate::types::ToolResult;

const READ_CHUNK: usize = 4096;
const PREVIEW_CHUNK: usize = 1024;
const PREVIEW_CHARS: usize = 100;
const PREVIEW_WAIT: Duration = Duration::from_secs(5);

pub(super) fn register(registry: &mut ToolRegistry, ctx: &ToolContext) {
    let tool = |op| TelnetTool { op, ctx: ctx.clone() };
    let host = || ParamSpec::string("host", "Target hostname or IP address").required();

    registry.register(ToolDef::new(
        "telnet_connect",
        "Open a plain TCP (telnet) connection and return whatever the server sends first.",
        ParamSchema::new()
            .param(host())
            .param(ParamSpec::integer("port", "Telnet port").range(1, 65535).default(23))
            .param(ParamSpec::integer("timeout", "Connect timeout in seconds").range(1, 300).default(30))
            .param(
                ParamSpec::integer("read_timeout", "Seconds to wait for the initial response")
                    .range(1, 60)
                    .default(10),
            ),
        tool(TelnetOp::Connect),
    ));
    registry.register(ToolDef::new(
        "telnet_port_check",
        "Check whether a TCP port accepts connections and preview its banner.",
        ParamSchema::new()
            .param(host())
            .param(ParamSpec::integer("port", "Port to check").required().range(1, 65535))
            .param(ParamSpec::integer("timeout", "Connect timeout in seconds").range(1, 300).default(10)),
        tool(TelnetOp::PortCheck),
    ));
    registry.register(ToolDef::new(
        "telnet_banner_grab",
        "Connect to a service and capture its banner.",
        ParamSchema::new()
            .param(host())
            .param(ParamSpec::integer("port", "Target port").range(1, 65535).default(23))
            .param(ParamSpec::integer("timeout", "Connect timeout in seconds").range(1, 300).default(10))
            .param(
                ParamSpec::integer("wait_time", "Seconds to wait for banner data")
                    .range(1, 60)
                    .default(3),
            ),
        tool(TelnetOp::BannerGrab),
    ));
}

#[derive(Debug, Clone, Copy)]
enum TelnetOp {
    Connect,
    PortCheck,
    BannerGrab,
}

struct TelnetTool {
    op: TelnetOp,
    ctx: ToolContext,
}

#[async_trait]
impl ToolHandler for TelnetTool {
    async fn call(&self, args: &Args) -> ToolResult {
        let params = ConnectParams::new(args.str("host")?, port_arg(args, "port")?)
            .with_timeout(secs(args, "timeout")?);
        self.ctx.connector.validate(&params)?;

        match self.op {
            TelnetOp::Connect => self.connect(&params, secs(args, "read_timeout")?).await,
            TelnetOp::PortCheck => Ok(self.port_check(&params).await),
            TelnetOp::BannerGrab => self.banner_grab(&params, secs(args, "wait_time")?).await,
        }
    }
}

impl TelnetTool {
    async fn read_first(
        &self,
        params: &ConnectParams,
        max_bytes: usize,
        wait: Duration,
    ) -> Result<Option<String>, ConnectError> {
        self.ctx
            .connector
            .with_tcp(params, move |session| {
                Box::pin(async move { session.read_banner(max_bytes, wait).await })
            })
            .await
    }

    async fn connect(&self, params: &ConnectParams, read_timeout: Duration) -> ToolResult {
        let response = self.read_first(params, READ_CHUNK, read_timeout).await?;

        let rule = "=".repeat(35);
        let mut out = format!(
            "Telnet Connection Test\n{rule}\nServer: {}:{}\nStatus: Connection successful\n{rule}\n",
            params.host, params.port
        );
        match response.filter(|text| !text.trim().is_empty()) {
            Some(text) => out.push_str(&format!("Initial Response:\n{text}\n")),
            None => out.push_str("No initial response received\n"),
        }
        Ok(out)
    }

    /// A port that refuses or times out is the answer, not an error.
    async fn port_check(&self, params: &ConnectParams) -> String {
        let rule = "=".repeat(25);
        let mut out = format!(
            "Telnet Port Check\n{rule}\nTarget: {}:{}\nTimeout: {}s\n{rule}\n",
            params.host,
            params.port,
            params.timeout.as_secs()
        );

        match self.read_first(params, PREVIEW_CHUNK, PREVIEW_WAIT).await {
            Ok(Some(banner)) => {
                out.push_str("Port is open and responding\n");
                out.push_str(&format!("Service banner: {}\n", preview(&banner)));
            }
            Ok(None) => out.push_str("Port is open (no banner)\n"),
            Err(ConnectError::ProtocolError(_)) => {
                out.push_str("Port is open (unable to read banner)\n")
            }
            Err(e) => {
                out.push_str("Port is closed or filtered\n");
                out.push_str(&format!("Details: {e}\n"));
            }
        }
        out
    }

    async fn banner_grab(&self, params: &ConnectParams, wait: Duration) -> ToolResult {
        let banner = self.read_first(params, READ_CHUNK, wait).await?;

        let rule = "=".repeat(30);
        let mut out = format!(
            "Service Banner Grab\n{rule}\nTarget: {}:{}\nWait time: {}s\n{rule}\n",
            params.host,
            params.port,
            wait.as_secs()
        );
        match banner.filter(|text| !text.trim().is_empty()) {
            Some(text) => out.push_str(&format!("Banner:\n{text}\n")),
            None => out.push_str("No banner received (service may not send one)\n"),
        }
        Ok(out)
    }
}

/// First `PREVIEW_CHARS` characters, marked with `...` only when something was cut.
fn preview(banner: &str) -> String {
    let mut shown: String = banner.chars().take(PREVIEW_CHARS).collect();
    if banner.chars().count() > PREVIEW_CHARS {
        shown.push_str("...");
    }
    shown
}
