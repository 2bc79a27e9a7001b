use std::fmt;

use serde::{Deserialize, Serialize};

/// Fixed vocabulary for every way a tool call can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    UnknownTool,
    LaunchFailed,
    TimedOut,
    Timeout,
    DnsFailure,
    ConnectionRefused,
    Unreachable,
    AuthenticationFailure,
    ProtocolError,
    NotFound,
    PermissionDenied,
    Io,
    InternalError,
}

impl ErrorKind {
    /// Stable numeric code carried next to the message in the response envelope.
    pub fn code(self) -> u16 {
        match self {
            ErrorKind::InvalidArgument => 400,
            ErrorKind::UnknownTool => 404,
            ErrorKind::LaunchFailed => 500,
            ErrorKind::TimedOut => 504,
            ErrorKind::Timeout => 524,
            ErrorKind::DnsFailure => 530,
            ErrorKind::ConnectionRefused => 531,
            ErrorKind::Unreachable => 532,
            ErrorKind::AuthenticationFailure => 401,
            ErrorKind::ProtocolError => 502,
            ErrorKind::NotFound => 410,
            ErrorKind::PermissionDenied => 403,
            ErrorKind::Io => 507,
            ErrorKind::InternalError => 599,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::UnknownTool => "unknown_tool",
            ErrorKind::LaunchFailed => "launch_failed",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::Timeout => "timeout",
            ErrorKind::DnsFailure => "dns_failure",
            ErrorKind::ConnectionRefused => "connection_refused",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::AuthenticationFailure => "authentication_failure",
            ErrorKind::ProtocolError => "protocol_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Io => "io",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `Err` side of a tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn unknown_tool(name: &str) -> Self {
        Self::new(ErrorKind::UnknownTool, format!("unknown tool: {name}"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    /// Map a file-system error on `path` into the tool vocabulary.
    pub fn from_io(path: &str, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => {
                Self::new(ErrorKind::NotFound, format!("'{path}' does not exist"))
            }
            std::io::ErrorKind::PermissionDenied => Self::new(
                ErrorKind::PermissionDenied,
                format!("permission denied accessing '{path}'"),
            ),
            _ => Self::new(ErrorKind::Io, format!("error accessing '{path}': {err}")),
        }
    }
}

/// Remote-session failures, normalized from the transport's native errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("connection to {host}:{port} timed out after {secs}s")]
    Timeout { host: String, port: u16, secs: u64 },
    #[error("DNS resolution failed for {host}: {reason}")]
    DnsFailure { host: String, reason: String },
    #[error("connection refused by {host}:{port}")]
    ConnectionRefused { host: String, port: u16 },
    #[error("{host}:{port} is unreachable: {reason}")]
    Unreachable {
        host: String,
        port: u16,
        reason: String,
    },
    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),
    #[error("protocol error: {0}")]
    ProtocolError(String),
}

impl ConnectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ConnectError::Timeout { .. } => ErrorKind::Timeout,
            ConnectError::DnsFailure { .. } => ErrorKind::DnsFailure,
            ConnectError::ConnectionRefused { .. } => ErrorKind::ConnectionRefused,
            ConnectError::Unreachable { .. } => ErrorKind::Unreachable,
            ConnectError::AuthenticationFailure(_) => ErrorKind::AuthenticationFailure,
            ConnectError::ProtocolError(_) => ErrorKind::ProtocolError,
        }
    }
}

impl From<ConnectError> for ToolError {
    fn from(err: ConnectError) -> Self {
        ToolError::new(err.kind(), err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("unknown service: {0}")]
    UnknownService(String),
    #[error("service {0} is already running")]
    AlreadyRunning(String),
    #[error("failed to spawn {name}: {reason}")]
    Spawn { name: String, reason: String },
    #[error("{name} exited during startup: {stderr}")]
    StartFailed { name: String, stderr: String },
    #[error("failed to stop {name}: {reason}")]
    Stop { name: String, reason: String },
    #[error("health check for {name} failed: {source}")]
    Health {
        name: String,
        #[source]
        source: ToolError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_errors_keep_their_kind() {
        let err: ToolError = ConnectError::ConnectionRefused {
            host: "127.0.0.1".into(),
            port: 1,
        }
        .into();
        assert_eq!(err.kind, ErrorKind::ConnectionRefused);
        assert_eq!(err.message, "connection refused by 127.0.0.1:1");
    }

    #[test]
    fn io_errors_map_to_file_kinds() {
        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(ToolError::from_io("/x", &missing).kind, ErrorKind::NotFound);

        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(
            ToolError::from_io("/x", &denied).kind,
            ErrorKind::PermissionDenied
        );
    }

    #[test]
    fn codes_are_distinct() {
        let kinds = [
            ErrorKind::InvalidArgument,
            ErrorKind::UnknownTool,
            ErrorKind::LaunchFailed,
            ErrorKind::TimedOut,
            ErrorKind::Timeout,
            ErrorKind::DnsFailure,
            ErrorKind::ConnectionRefused,
            ErrorKind::Unreachable,
            ErrorKind::AuthenticationFailure,
            ErrorKind::ProtocolError,
            ErrorKind::NotFound,
            ErrorKind::PermissionDenied,
            ErrorKind::Io,
            ErrorKind::InternalError,
        ];
        let codes: std::collections::HashSet<u16> = kinds.iter().map(|k| k.code()).collect();
        assert_eq!(codes.len(), kinds.len());
    }
}
