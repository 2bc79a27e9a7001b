//! Line-oriented operator console for `systools supervise`.

use std::fmt::Write as _;

use crate::exec::DependencyCheck;
use crate::supervisor::ServiceStatus;

pub const HELP: &str = "Commands:
  status  - show server status
  restart - restart all servers
  stop    - stop all servers
  quit    - exit (also: exit, q)
  help    - show this help";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Status,
    Restart,
    Stop,
    Quit,
    Help,
    Empty,
    Unknown(String),
}

impl ConsoleCommand {
    /// Case-insensitive; surrounding whitespace is ignored.
    pub fn parse(line: &str) -> Self {
        let command = line.trim().to_lowercase();
        match command.as_str() {
            "" => ConsoleCommand::Empty,
            "status" => ConsoleCommand::Status,
            "restart" => ConsoleCommand::Restart,
            "stop" => ConsoleCommand::Stop,
            "quit" | "exit" | "q" => ConsoleCommand::Quit,
            "help" => ConsoleCommand::Help,
            _ => ConsoleCommand::Unknown(command),
        }
    }
}

pub fn render_status(services: &[ServiceStatus]) -> String {
    let mut out = format!("Server Status\n{}\n", "=".repeat(50));
    if services.is_empty() {
        out.push_str("No servers configured\n");
        return out;
    }
    for service in services {
        let state = if service.running { "running" } else { "stopped" };
        let _ = writeln!(out, "[{state}] {}", service.name);
        if let Some(pid) = service.pid {
            let _ = writeln!(out, "   PID: {pid}");
        }
        if let Some(port) = service.port {
            let _ = writeln!(out, "   Port: {port}");
        }
        if !service.description.is_empty() {
            let _ = writeln!(out, "   Description: {}", service.description);
        }
        out.push('\n');
    }
    out
}

pub fn render_checks(checks: &[DependencyCheck]) -> String {
    let mut out = String::new();
    for check in checks {
        let mark = if check.available { "ok" } else { "MISSING" };
        let _ = writeln!(out, "{:<6} {mark:<8} {}", check.name, check.detail);
    }
    let missing: Vec<&str> = checks
        .iter()
        .filter(|c| !c.available)
        .map(|c| c.name)
        .collect();
    if missing.is_empty() {
        out.push_str("All dependencies are installed\n");
    } else {
        let _ = writeln!(out, "Missing: {}", missing.join(", "));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_commands() {
        assert_eq!(ConsoleCommand::parse("status"), ConsoleCommand::Status);
        assert_eq!(ConsoleCommand::parse("  RESTART \n"), ConsoleCommand::Restart);
        assert_eq!(ConsoleCommand::parse("stop"), ConsoleCommand::Stop);
        for quit in ["quit", "exit", "q", "Q"] {
            assert_eq!(ConsoleCommand::parse(quit), ConsoleCommand::Quit);
        }
        assert_eq!(ConsoleCommand::parse("help"), ConsoleCommand::Help);
        assert_eq!(ConsoleCommand::parse("   "), ConsoleCommand::Empty);
        assert_eq!(
            ConsoleCommand::parse("Reboot now"),
            ConsoleCommand::Unknown("reboot now".into())
        );
    }

    #[test]
    fn status_lists_every_service() {
        let out = render_status(&[
            ServiceStatus {
                name: "files".into(),
                description: "File reading".into(),
                pid: Some(42),
                running: true,
                port: Some(8001),
            },
            ServiceStatus {
                name: "nmap".into(),
                description: String::new(),
                pid: None,
                running: false,
                port: Some(8002),
            },
        ]);
        assert!(out.contains("[running] files\n   PID: 42\n   Port: 8001\n   Description: File reading\n"));
        assert!(out.contains("[stopped] nmap\n   Port: 8002\n\n"));
        assert!(render_status(&[]).ends_with("No servers configured\n"));
    }

    #[test]
    fn checks_name_what_is_missing() {
        let out = render_checks(&[
            DependencyCheck {
                name: "nmap",
                available: false,
                detail: "No such file or directory".into(),
            },
            DependencyCheck {
                name: "ssh",
                available: true,
                detail: "OpenSSH_9.6p1".into(),
            },
        ]);
        assert!(out.contains("nmap   MISSING  No such file or directory\n"));
        assert!(out.ends_with("Missing: nmap\n"));
    }
}
