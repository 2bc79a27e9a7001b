//! Owns the child tool servers, keyed by service name.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

use crate::config::{ServiceConfig, SystoolsConfig};
use crate::error::{SupervisorError, ToolError};
use crate::server::probe_health;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
/// How long to collect stderr from a service that exited during startup.
/// A grandchild may still hold the pipe open.
const EXIT_STDERR_WAIT: Duration = Duration::from_secs(1);
const EXIT_STDERR_LIMIT: usize = 64 * 1024;

/// A running child and the service it was started for.
struct ManagedChild {
    child: Child,
    pid: u32,
}

/// Point-in-time view of one configured service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub description: String,
    pub pid: Option<u32>,
    pub running: bool,
    pub port: Option<u16>,
}

pub struct Supervisor {
    services: Vec<ServiceConfig>,
    program: String,
    startup_grace: Duration,
    stop_grace: Duration,
    children: HashMap<String, ManagedChild>,
}

impl Supervisor {
    /// `program` is what services without an explicit `program` are
    /// launched with, normally the running `systools` binary.
    pub fn new(config: &SystoolsConfig, program: impl Into<String>) -> Self {
        Self {
            services: config.services.clone(),
            program: program.into(),
            startup_grace: config.startup_grace(),
            stop_grace: config.stop_grace(),
            children: HashMap::new(),
        }
    }

    /// Same as [`new`](Self::new), launching services with this executable.
    pub fn for_current_exe(config: &SystoolsConfig) -> Result<Self, SupervisorError> {
        let exe = std::env::current_exe().map_err(|e| SupervisorError::Spawn {
            name: "systools".into(),
            reason: format!("cannot locate own executable: {e}"),
        })?;
        Ok(Self::new(config, exe.display().to_string()))
    }

    fn service(&self, name: &str) -> Result<&ServiceConfig, SupervisorError> {
        self.services
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| SupervisorError::UnknownService(name.to_string()))
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name.clone()).collect()
    }

    /// Whether `name` has a live child. Reaps it if it has exited.
    pub fn is_running(&mut self, name: &str) -> bool {
        let Some(managed) = self.children.get_mut(name) else {
            return false;
        };
        match managed.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!(service = name, pid = managed.pid, %status, "service exited");
                self.children.remove(name);
                false
            }
            Err(e) => {
                warn!(service = name, error = %e, "cannot poll service");
                false
            }
        }
    }

    /// Spawn the service and wait out the startup grace period.
    /// A child that is already gone by then failed to start.
    pub async fn start(&mut self, name: &str) -> Result<u32, SupervisorError> {
        let service = self.service(name)?.clone();
        if self.is_running(name) {
            return Err(SupervisorError::AlreadyRunning(name.to_string()));
        }

        let argv = service.argv(&self.program);
        let Some((program, args)) = argv.split_first() else {
            return Err(SupervisorError::Spawn {
                name: name.to_string(),
                reason: "empty command".into(),
            });
        };

        info!(service = name, listen = %service.listen, "starting service");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Spawn {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        let pid = child.id().ok_or_else(|| SupervisorError::Spawn {
            name: name.to_string(),
            reason: "child exited before reporting a pid".into(),
        })?;

        tokio::time::sleep(self.startup_grace).await;

        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                let stderr = match child.stderr.take() {
                    Some(pipe) => exit_stderr(name, pipe, EXIT_STDERR_WAIT).await,
                    None => String::new(),
                };
                let stderr = stderr.trim();
                return Err(SupervisorError::StartFailed {
                    name: name.to_string(),
                    stderr: if stderr.is_empty() {
                        format!("exited with {status}")
                    } else {
                        stderr.to_string()
                    },
                });
            }
            Err(e) => {
                return Err(SupervisorError::Spawn {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(name.to_string(), stderr));
        }
        info!(service = name, pid, "service started");
        self.children
            .insert(name.to_string(), ManagedChild { child, pid });
        Ok(pid)
    }

    /// SIGTERM, then SIGKILL once the stop grace period runs out.
    /// Stopping a service that is not running is a no-op.
    pub async fn stop(&mut self, name: &str) -> Result<(), SupervisorError> {
        self.service(name)?;
        let Some(mut managed) = self.children.remove(name) else {
            debug!(service = name, "not running");
            return Ok(());
        };
        let pid = managed.pid;
        info!(service = name, pid, "stopping service");

        let raw = i32::try_from(pid).map_err(|_| SupervisorError::Stop {
            name: name.to_string(),
            reason: format!("pid {pid} out of range"),
        })?;
        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                return Err(SupervisorError::Stop {
                    name: name.to_string(),
                    reason: format!("SIGTERM failed: {e}"),
                })
            }
        }

        match tokio::time::timeout(self.stop_grace, managed.child.wait()).await {
            Ok(Ok(status)) => {
                info!(service = name, pid, %status, "service stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(SupervisorError::Stop {
                name: name.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => {
                warn!(service = name, pid, "did not stop gracefully, killing");
                managed
                    .child
                    .kill()
                    .await
                    .map_err(|e| SupervisorError::Stop {
                        name: name.to_string(),
                        reason: format!("kill failed: {e}"),
                    })
            }
        }
    }

    /// Start every configured service. One failure does not stop the rest.
    pub async fn start_all(&mut self) -> Vec<(String, Result<u32, SupervisorError>)> {
        let mut outcomes = Vec::new();
        for name in self.service_names() {
            let outcome = self.start(&name).await;
            if let Err(e) = &outcome {
                warn!(service = %name, error = %e, "service failed to start");
            }
            outcomes.push((name, outcome));
        }
        outcomes
    }

    pub async fn stop_all(&mut self) -> Vec<(String, Result<(), SupervisorError>)> {
        let mut outcomes = Vec::new();
        for name in self.service_names() {
            let outcome = self.stop(&name).await;
            if let Err(e) = &outcome {
                warn!(service = %name, error = %e, "service failed to stop");
            }
            outcomes.push((name, outcome));
        }
        outcomes
    }

    pub async fn restart_all(&mut self) -> Vec<(String, Result<u32, SupervisorError>)> {
        self.stop_all().await;
        self.start_all().await
    }

    pub fn status(&mut self) -> Vec<ServiceStatus> {
        self.service_names()
            .into_iter()
            .map(|name| {
                let running = self.is_running(&name);
                let pid = self.children.get(&name).map(|m| m.pid);
                let service = self.services.iter().find(|s| s.name == name);
                ServiceStatus {
                    description: service.map(|s| s.description.clone()).unwrap_or_default(),
                    port: service.and_then(ServiceConfig::port),
                    pid,
                    running,
                    name,
                }
            })
            .collect()
    }

    /// Probe the service's listen address with a `health` request.
    pub async fn check_health(&self, name: &str) -> Result<Value, SupervisorError> {
        let service = self.service(name)?;
        let addr = service.addr().map_err(|e| SupervisorError::Health {
            name: name.to_string(),
            source: ToolError::invalid(e.to_string()),
        })?;
        probe_health(addr, HEALTH_TIMEOUT)
            .await
            .map_err(|source| SupervisorError::Health {
                name: name.to_string(),
                source,
            })
    }
}

async fn forward_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(service = %name, "{line}");
    }
}

/// Whatever the exited child wrote to stderr, read until EOF or `wait`.
async fn exit_stderr(name: &str, mut pipe: ChildStderr, wait: Duration) -> String {
    let deadline = tokio::time::Instant::now() + wait;
    let mut collected = Vec::new();
    let mut chunk = [0u8; 4096];
    while collected.len() < EXIT_STDERR_LIMIT {
        match tokio::time::timeout_at(deadline, pipe.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => collected.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => {
                warn!(service = %name, error = %e, "failed to read stderr of exited service");
                break;
            }
            Err(_) => {
                debug!(service = %name, "stderr still open after exit");
                break;
            }
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}
