//! Concrete tools, grouped by the capability they expose.

mod files;
mod ftp;
mod interfaces;
mod nmap;
mod process;
mod ssh;
mod telnet;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::registry::ToolRegistry;
use crate::config::SystoolsConfig;
use crate::connector::{self, RemoteConnector};
use crate::error::ToolError;
use crate::exec::{CommandRunner, Completed, ProcessRunner};

/// A family of tools that is served together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolGroup {
    Files,
    Process,
    Nmap,
    Ssh,
    Ftp,
    Telnet,
    Interfaces,
}

impl ToolGroup {
    pub const ALL: [ToolGroup; 7] = [
        ToolGroup::Files,
        ToolGroup::Process,
        ToolGroup::Nmap,
        ToolGroup::Ssh,
        ToolGroup::Ftp,
        ToolGroup::Telnet,
        ToolGroup::Interfaces,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolGroup::Files => "files",
            ToolGroup::Process => "process",
            ToolGroup::Nmap => "nmap",
            ToolGroup::Ssh => "ssh",
            ToolGroup::Ftp => "ftp",
            ToolGroup::Telnet => "telnet",
            ToolGroup::Interfaces => "interfaces",
        }
    }
}

impl fmt::Display for ToolGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolGroup::ALL
            .into_iter()
            .find(|g| g.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                let known: Vec<&str> = ToolGroup::ALL.iter().map(|g| g.as_str()).collect();
                format!("unknown tool group '{s}' (expected one of: {})", known.join(", "))
            })
    }
}

/// Deadlines the tools apply to external programs and transfers.
#[derive(Debug, Clone)]
pub struct Limits {
    pub command: Duration,
    pub scan: Duration,
    pub port_scan: Duration,
    pub discovery: Duration,
    pub transfer: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self::from_config(&SystoolsConfig::default())
    }
}

impl Limits {
    pub fn from_config(config: &SystoolsConfig) -> Self {
        Self {
            command: Duration::from_secs(config.default_command_timeout_secs),
            scan: Duration::from_secs(config.scan_timeout_secs),
            port_scan: Duration::from_secs(config.port_scan_timeout_secs),
            discovery: Duration::from_secs(config.discovery_timeout_secs),
            transfer: Duration::from_secs(config.transfer_timeout_secs),
        }
    }
}

/// What every tool handler gets to work with.
#[derive(Clone)]
pub struct ToolContext {
    pub runner: Arc<dyn CommandRunner>,
    pub connector: RemoteConnector,
    pub limits: Limits,
}

impl ToolContext {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            connector: RemoteConnector::new(),
            limits: Limits::default(),
        }
    }

    pub fn from_config(config: &SystoolsConfig) -> Self {
        Self {
            runner: Arc::new(ProcessRunner::new().with_max_output(config.max_output_bytes)),
            connector: RemoteConnector::new().with_max_host_len(config.max_host_len),
            limits: Limits::from_config(config),
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Run `argv` and turn timeouts and launch failures into tool errors.
    async fn run(&self, argv: Vec<String>, timeout: Duration) -> Result<Completed, ToolError> {
        let program = argv.first().cloned().unwrap_or_default();
        self.runner.run(&argv, timeout).await.completed(&program)
    }

    fn check_host(&self, host: &str) -> Result<(), ToolError> {
        connector::validate_host(host, self.connector.max_host_len())?;
        Ok(())
    }
}

/// Registry holding only the tools of `groups`.
pub fn registry_for(groups: &[ToolGroup], ctx: &ToolContext) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for group in groups {
        match group {
            ToolGroup::Files => files::register(&mut registry),
            ToolGroup::Process => process::register(&mut registry, ctx),
            ToolGroup::Nmap => nmap::register(&mut registry, ctx),
            ToolGroup::Ssh => ssh::register(&mut registry, ctx),
            ToolGroup::Ftp => ftp::register(&mut registry, ctx),
            ToolGroup::Telnet => telnet::register(&mut registry, ctx),
            ToolGroup::Interfaces => interfaces::register(&mut registry),
        }
    }
    registry
}

/// Registry holding every built-in tool.
pub fn full_registry(ctx: &ToolContext) -> ToolRegistry {
    registry_for(&ToolGroup::ALL, ctx)
}

fn port_arg(args: &super::Args, name: &str) -> Result<u16, ToolError> {
    Ok(connector::validate_port(args.int(name)?)?)
}

fn secs(args: &super::Args, name: &str) -> Result<Duration, ToolError> {
    Ok(Duration::from_secs(args.int(name)?.max(0) as u64))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolRequest;
    use serde_json::json;

    #[test]
    fn groups_parse_case_insensitively() {
        assert_eq!("FTP".parse::<ToolGroup>().unwrap(), ToolGroup::Ftp);
        assert!("database".parse::<ToolGroup>().is_err());
    }

    #[test]
    fn registry_for_selects_groups() {
        let ctx = testing::real_context();
        let reg = registry_for(&[ToolGroup::Files], &ctx);
        assert_eq!(
            reg.tool_names(),
            vec!["read_file", "list_directory", "get_file_info"]
        );

        let all = full_registry(&ctx);
        for name in [
            "run_process",
            "nmap_scan",
            "ping_host",
            "port_scan",
            "network_discovery",
            "ssh_execute",
            "ssh_copy_file",
            "ssh_key_info",
            "ftp_list_files",
            "ftp_download_file",
            "ftp_upload_file",
            "ftp_server_info",
            "ftp_test_connection",
            "telnet_connect",
            "telnet_port_check",
            "telnet_banner_grab",
            "get_network_interfaces",
            "get_network_stats",
            "get_interface_status",
        ] {
            assert!(all.get(name).is_some(), "missing {name}");
        }
    }

    #[tokio::test]
    async fn run_process_echo_end_to_end() {
        let reg = full_registry(&testing::real_context());
        let out = reg
            .invoke(&ToolRequest::new(
                "run_process",
                json!({"argv": ["echo", "hi"], "timeoutSeconds": 5}),
            ))
            .await
            .unwrap();
        let outcome: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(outcome["stdout"], "hi\n");
        assert_eq!(outcome["exitCode"], 0);
    }

    #[tokio::test]
    async fn empty_ftp_host_fails_fast() {
        let reg = full_registry(&testing::real_context());
        let started = std::time::Instant::now();
        let err = reg
            .invoke(&ToolRequest::new(
                "ftp_list_files",
                json!({"host": "", "port": 21}),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidArgument);
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn closed_port_is_connection_refused() {
        let reg = full_registry(&testing::real_context());
        let started = std::time::Instant::now();
        let err = reg
            .invoke(&ToolRequest::new(
                "telnet_connect",
                json!({"host": "127.0.0.1", "port": 1, "timeout": 2}),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ConnectionRefused);
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
