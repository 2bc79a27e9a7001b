use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::tools::builtin::ToolGroup;

/// Runtime configuration. Every field is optional in the JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystoolsConfig {
    /// Upper bound on hostname length for remote tools.
    pub max_host_len: usize,
    /// Captured stdout/stderr is cut off past this many bytes per stream.
    pub max_output_bytes: usize,
    pub default_command_timeout_secs: u64,
    pub scan_timeout_secs: u64,
    pub port_scan_timeout_secs: u64,
    pub discovery_timeout_secs: u64,
    pub transfer_timeout_secs: u64,
    /// How long a supervised server must stay alive to count as started.
    pub startup_grace_ms: u64,
    /// How long a supervised server gets after SIGTERM before it is killed.
    pub stop_grace_ms: u64,
    pub services: Vec<ServiceConfig>,
}

impl Default for SystoolsConfig {
    fn default() -> Self {
        Self {
            max_host_len: 100,
            max_output_bytes: 1024 * 1024,
            default_command_timeout_secs: 30,
            scan_timeout_secs: 120,
            port_scan_timeout_secs: 300,
            discovery_timeout_secs: 60,
            transfer_timeout_secs: 60,
            startup_grace_ms: 2000,
            stop_grace_ms: 5000,
            services: default_services(),
        }
    }
}

impl SystoolsConfig {
    /// Load from a JSON file and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let shown = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: shown.clone(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: shown.clone(),
            source,
        })?;
        config.validate()?;
        debug!(path = %shown, services = config.services.len(), "config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_host_len == 0 {
            return Err(ConfigError::Invalid("max_host_len must be positive".into()));
        }
        if self.max_output_bytes == 0 {
            return Err(ConfigError::Invalid("max_output_bytes must be positive".into()));
        }
        for (field, value) in [
            ("default_command_timeout_secs", self.default_command_timeout_secs),
            ("scan_timeout_secs", self.scan_timeout_secs),
            ("port_scan_timeout_secs", self.port_scan_timeout_secs),
            ("discovery_timeout_secs", self.discovery_timeout_secs),
            ("transfer_timeout_secs", self.transfer_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{field} must be positive")));
            }
        }

        let mut names = HashSet::new();
        for service in &self.services {
            if !names.insert(service.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate service name: {}",
                    service.name
                )));
            }
            service.addr()?;
        }
        Ok(())
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }
}

/// One supervised tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub group: ToolGroup,
    /// TCP address the server listens on, e.g. `127.0.0.1:8001`.
    pub listen: String,
    /// Executable to launch. Defaults to the running `systools` binary.
    #[serde(default)]
    pub program: Option<String>,
    /// Extra arguments. When `program` is unset these follow the generated
    /// `serve --group <group> --listen <addr>` arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

impl ServiceConfig {
    pub fn new(name: &str, group: ToolGroup, port: u16, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            group,
            listen: format!("127.0.0.1:{port}"),
            program: None,
            args: Vec::new(),
        }
    }

    pub fn addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen.parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "service {}: '{}' is not a socket address",
                self.name, self.listen
            ))
        })
    }

    pub fn port(&self) -> Option<u16> {
        self.addr().ok().map(|a| a.port())
    }

    /// The argv used to launch this service, given the default program.
    pub fn argv(&self, default_program: &str) -> Vec<String> {
        match &self.program {
            Some(program) => std::iter::once(program.clone())
                .chain(self.args.iter().cloned())
                .collect(),
            None => [
                default_program.to_string(),
                "serve".into(),
                "--group".into(),
                self.group.to_string(),
                "--listen".into(),
                self.listen.clone(),
            ]
            .into_iter()
            .chain(self.args.iter().cloned())
            .collect(),
        }
    }
}

fn default_services() -> Vec<ServiceConfig> {
    vec![
        ServiceConfig::new(
            "files",
            ToolGroup::Files,
            8001,
            "File reading and directory listing",
        ),
        ServiceConfig::new(
            "nmap",
            ToolGroup::Nmap,
            8002,
            "Network scanning with nmap and ping",
        ),
        ServiceConfig::new(
            "ssh",
            ToolGroup::Ssh,
            8003,
            "SSH remote command execution and file transfer",
        ),
        ServiceConfig::new("ftp", ToolGroup::Ftp, 8004, "FTP file transfer and server info"),
        ServiceConfig::new(
            "telnet",
            ToolGroup::Telnet,
            8005,
            "Telnet connectivity testing and banner grabbing",
        ),
        ServiceConfig::new(
            "interfaces",
            ToolGroup::Interfaces,
            8006,
            "Network interface addresses, counters and link status",
        ),
    ]
}
