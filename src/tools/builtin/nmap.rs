use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;

use super::ToolContext;
use crate::error::{ErrorKind, ToolError};
use crate::exec::Completed;
use crate::tools::{Args, ParamSchema, ParamSpec, ToolDef, ToolHandler, ToolRegistry};
use crate::types::ToolResult;

const SCAN_TYPES: &[&str] = &["basic", "syn", "udp", "tcp", "ping", "os", "service"];
const PORT_SCAN_TYPES: &[&str] = &["tcp", "udp", "syn"];
const NMAP_OPTIONS: &[&str] = &[
    "-Pn", "-n", "-v", "-F", "--open", "-T0", "-T1", "-T2", "-T3", "-T4", "-T5", "-A", "--reason",
    "--traceroute",
];

pub(super) fn register(registry: &mut ToolRegistry, ctx: &ToolContext) {
    let tool = |op| NmapTool { op, ctx: ctx.clone() };

    registry.register(ToolDef::new(
        "nmap_scan",
        "Run an nmap scan against a host or network.",
        ParamSchema::new()
            .param(ParamSpec::string("target", "Host, IP address or CIDR network").required().min(1))
            .param(ParamSpec::string("scan_type", "Kind of scan").one_of(SCAN_TYPES).default("basic"))
            .param(ParamSpec::string("ports", "Ports, e.g. \"22,80,443\" or \"1-1000\"").default(""))
            .param(ParamSpec::string_list("options", "Extra nmap flags").one_of(NMAP_OPTIONS).default(Vec::<String>::new())),
        tool(NmapOp::Scan),
    ));
    registry.register(ToolDef::new(
        "ping_host",
        "Ping a host to check connectivity.",
        ParamSchema::new()
            .param(ParamSpec::string("host", "Hostname or IP address").required().min(1))
            .param(ParamSpec::integer("count", "Number of echo requests").range(1, 10).default(4))
            .param(ParamSpec::integer("timeout", "Seconds to wait for each reply").range(1, 30).default(5)),
        tool(NmapOp::Ping),
    ));
    registry.register(ToolDef::new(
        "port_scan",
        "Scan specific ports on a host without host discovery.",
        ParamSchema::new()
            .param(ParamSpec::string("host", "Target host").required().min(1))
            .param(ParamSpec::string("ports", "Port range, e.g. \"1-1000\" or \"22,80,443\"").default("1-1000"))
            .param(ParamSpec::string("scan_type", "Kind of scan").one_of(PORT_SCAN_TYPES).default("tcp")),
        tool(NmapOp::PortScan),
    ));
    registry.register(ToolDef::new(
        "network_discovery",
        "Discover live hosts on a network given in CIDR notation.",
        ParamSchema::new()
            .param(ParamSpec::string("network", "Network in CIDR notation").default("192.168.1.0/24")),
        tool(NmapOp::Discovery),
    ));
}

#[derive(Debug, Clone, Copy)]
enum NmapOp {
    Scan,
    Ping,
    PortScan,
    Discovery,
}

struct NmapTool {
    op: NmapOp,
    ctx: ToolContext,
}

#[async_trait]
impl ToolHandler for NmapTool {
    async fn call(&self, args: &Args) -> ToolResult {
        match self.op {
            NmapOp::Scan => self.scan(args).await,
            NmapOp::Ping => self.ping(args).await,
            NmapOp::PortScan => self.port_scan(args).await,
            NmapOp::Discovery => self.discovery(args).await,
        }
    }
}

impl NmapTool {
    async fn scan(&self, args: &Args) -> ToolResult {
        let target = args.str("target")?;
        self.check_target(target)?;

        let mut argv = vec!["nmap".to_string()];
        argv.extend(scan_flag(args.str("scan_type")?).iter().map(|f| f.to_string()));
        if let Some(ports) = args.opt_str("ports") {
            check_ports(ports)?;
            argv.push("-p".into());
            argv.push(ports.into());
        }
        argv.extend(args.str_list("options")?);
        argv.push(target.into());

        let command = argv.join(" ");
        let done = self.ctx.run(argv, self.ctx.limits.scan).await?;
        let done = require_success(done)?;
        Ok(format!(
            "NMAP Scan Results for {target}\n{rule}\nCommand: {command}\n{rule}\n{}",
            done.stdout,
            rule = "=".repeat(50)
        ))
    }

    async fn ping(&self, args: &Args) -> ToolResult {
        let host = args.str("host")?;
        self.ctx.check_host(host)?;
        let count = args.int("count")?;
        let timeout = args.int("timeout")?;

        let argv = vec![
            "ping".to_string(),
            "-c".into(),
            count.to_string(),
            "-W".into(),
            timeout.to_string(),
            host.into(),
        ];
        let deadline = Duration::from_secs((timeout * count + 10) as u64);
        let done = self.ctx.run(argv, deadline).await?;

        let mut out = format!("Ping Results for {host}\n{}\n{}", "=".repeat(30), done.stdout);
        if !done.stderr.is_empty() {
            out.push_str(&format!("\nErrors/Warnings:\n{}", done.stderr));
        }
        Ok(out)
    }

    async fn port_scan(&self, args: &Args) -> ToolResult {
        let host = args.str("host")?;
        self.ctx.check_host(host)?;
        let ports = args.str("ports")?;
        check_ports(ports)?;
        let scan_type = args.str("scan_type")?;

        let mut argv = vec!["nmap".to_string(), "-Pn".into()];
        argv.extend(scan_flag(scan_type).iter().map(|f| f.to_string()));
        argv.extend(["-p".to_string(), ports.to_string(), host.to_string()]);

        let done = self.ctx.run(argv, self.ctx.limits.port_scan).await?;
        let mut out = format!(
            "Port Scan Results for {host}\nPorts: {ports} | Type: {scan_type}\n{}\n{}",
            "=".repeat(50),
            done.stdout
        );
        if !done.stderr.is_empty() {
            out.push_str(&format!("\nWarnings:\n{}", done.stderr));
        }
        Ok(out)
    }

    async fn discovery(&self, args: &Args) -> ToolResult {
        let network = args.str("network")?;
        check_cidr(network)?;

        let argv = vec!["nmap".to_string(), "-sn".into(), network.into()];
        let done = self.ctx.run(argv, self.ctx.limits.discovery).await?;
        Ok(format!(
            "Network Discovery for {network}\n{}\n{}",
            "=".repeat(40),
            done.stdout
        ))
    }

    /// A scan target is a host or a CIDR network.
    fn check_target(&self, target: &str) -> Result<(), ToolError> {
        match target.split_once('/') {
            Some(_) => check_cidr(target),
            None => self.ctx.check_host(target),
        }
    }
}

fn scan_flag(scan_type: &str) -> &'static [&'static str] {
    match scan_type {
        "syn" => &["-sS"],
        "udp" => &["-sU"],
        "tcp" => &["-sT"],
        "ping" => &["-sn"],
        "os" => &["-O"],
        "service" => &["-sV"],
        _ => &[],
    }
}

fn check_ports(ports: &str) -> Result<(), ToolError> {
    let valid = !ports.is_empty()
        && !ports.starts_with('-')
        && ports.chars().all(|c| c.is_ascii_digit() || c == ',' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ToolError::invalid(format!(
            "invalid port specification {ports:?}; use e.g. \"22,80,443\" or \"1-1000\""
        )))
    }
}

fn check_cidr(network: &str) -> Result<(), ToolError> {
    let invalid = || {
        ToolError::invalid(format!(
            "invalid network {network:?}; use CIDR notation (e.g. 192.168.1.0/24)"
        ))
    };
    let (addr, prefix) = network.split_once('/').ok_or_else(invalid)?;
    let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(invalid());
    }
    Ok(())
}

fn require_success(done: Completed) -> Result<Completed, ToolError> {
    if done.exit_code == 0 {
        Ok(done)
    } else {
        Err(ToolError::new(
            ErrorKind::ProtocolError,
            format!("nmap exited with {}: {}", done.exit_code, done.stderr.trim_end()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{context, MockRunner};
    use super::*;
    use crate::types::ToolRequest;
    use serde_json::json;

    fn registry(runner: std::sync::Arc<MockRunner>) -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        register(&mut reg, &context(runner));
        reg
    }

    #[tokio::test]
    async fn scan_builds_argv_from_allow_listed_parts() {
        let runner = MockRunner::completing(0, "Host is up\n", "");
        let out = registry(runner.clone())
            .invoke(&ToolRequest::new(
                "nmap_scan",
                json!({"target": "10.0.0.5", "scan_type": "service", "ports": "22,80", "options": ["-Pn", "-T4"]}),
            ))
            .await
            .unwrap();
        assert_eq!(
            runner.last_argv(),
            vec!["nmap", "-sV", "-p", "22,80", "-Pn", "-T4", "10.0.0.5"]
        );
        assert_eq!(runner.last_timeout(), Some(Duration::from_secs(120)));
        assert!(out.contains("Command: nmap -sV -p 22,80 -Pn -T4 10.0.0.5"));
        assert!(out.ends_with("Host is up\n"));
    }

    #[tokio::test]
    async fn options_outside_allow_list_are_rejected() {
        let runner = MockRunner::completing(0, "", "");
        let reg = registry(runner.clone());
        for options in [json!(["--script=evil"]), json!(["-oN", "/etc/passwd"]), json!(["-v; rm"])] {
            let err = reg
                .invoke(&ToolRequest::new(
                    "nmap_scan",
                    json!({"target": "10.0.0.5", "options": options}),
                ))
                .await
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidArgument);
        }
        let err = reg
            .invoke(&ToolRequest::new(
                "nmap_scan",
                json!({"target": "10.0.0.5", "ports": "80;ls"}),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn scan_accepts_cidr_and_rejects_option_like_targets() {
        let runner = MockRunner::completing(0, "", "");
        let reg = registry(runner.clone());
        reg.invoke(&ToolRequest::new("nmap_scan", json!({"target": "192.168.1.0/24"})))
            .await
            .unwrap();
        assert_eq!(runner.last_argv(), vec!["nmap", "192.168.1.0/24"]);

        let err = reg
            .invoke(&ToolRequest::new("nmap_scan", json!({"target": "-iL/etc/hosts"})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn nonzero_nmap_exit_is_protocol_error() {
        let runner = MockRunner::completing(1, "", "Failed to resolve \"nowhere\".\n");
        let err = registry(runner)
            .invoke(&ToolRequest::new("nmap_scan", json!({"target": "nowhere"})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProtocolError);
        assert_eq!(err.message, "nmap exited with 1: Failed to resolve \"nowhere\".");
    }

    #[tokio::test]
    async fn ping_uses_count_and_scaled_deadline() {
        let runner = MockRunner::completing(0, "2 packets transmitted\n", "");
        let out = registry(runner.clone())
            .invoke(&ToolRequest::new(
                "ping_host",
                json!({"host": "example.com", "count": 2, "timeout": 3}),
            ))
            .await
            .unwrap();
        assert_eq!(runner.last_argv(), vec!["ping", "-c", "2", "-W", "3", "example.com"]);
        assert_eq!(runner.last_timeout(), Some(Duration::from_secs(16)));
        assert!(out.starts_with("Ping Results for example.com\n"));
    }

    #[tokio::test]
    async fn ping_bounds_are_enforced() {
        let runner = MockRunner::completing(0, "", "");
        let reg = registry(runner.clone());
        for bad in [json!({"host": "a", "count": 11}), json!({"host": "a", "timeout": 0}), json!({"host": ""})] {
            let err = reg.invoke(&ToolRequest::new("ping_host", bad)).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidArgument);
        }
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn port_scan_defaults() {
        let runner = MockRunner::completing(0, "22/tcp open ssh\n", "");
        let out = registry(runner.clone())
            .invoke(&ToolRequest::new("port_scan", json!({"host": "10.0.0.5"})))
            .await
            .unwrap();
        assert_eq!(
            runner.last_argv(),
            vec!["nmap", "-Pn", "-sT", "-p", "1-1000", "10.0.0.5"]
        );
        assert_eq!(runner.last_timeout(), Some(Duration::from_secs(300)));
        assert!(out.contains("Ports: 1-1000 | Type: tcp"));
    }

    #[tokio::test]
    async fn discovery_requires_cidr() {
        let runner = MockRunner::completing(0, "", "");
        let reg = registry(runner.clone());
        for bad in ["192.168.1.0", "192.168.1.0/33", "lan/24", "-sL/24"] {
            let err = reg
                .invoke(&ToolRequest::new("network_discovery", json!({"network": bad})))
                .await
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidArgument, "{bad}");
        }
        reg.invoke(&ToolRequest::new("network_discovery", json!({})))
            .await
            .unwrap();
        assert_eq!(runner.last_argv(), vec!["nmap", "-sn", "192.168.1.0/24"]);
        assert_eq!(runner.last_timeout(), Some(Duration::from_secs(60)));
    }
}
