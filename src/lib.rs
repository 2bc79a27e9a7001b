//! Local system and network tools behind one request/response envelope.
//!
//! A [`Dispatcher`] wraps a [`ToolRegistry`] of concrete tools and is the
//! only way to invoke them. [`server`] carries the envelope over stdio or
//! TCP, and [`Supervisor`] runs one server per tool group.

pub mod config;
pub mod connector;
pub mod console;
pub mod error;
pub mod exec;
pub mod server;
pub mod supervisor;
pub mod tools;
pub mod types;

pub use config::{ServiceConfig, SystoolsConfig};
pub use connector::{ConnectParams, Credentials, FtpSession, RemoteConnector, TcpSession};
pub use console::ConsoleCommand;
pub use error::{ConfigError, ConnectError, ErrorKind, SupervisorError, ToolError};
pub use exec::{CommandRunner, ExecutionOutcome, ProcessRunner};
pub use server::{probe_health, serve_stdio, serve_stream, serve_tcp};
pub use supervisor::{ServiceStatus, Supervisor};
pub use tools::builtin::{full_registry, registry_for, ToolContext, ToolGroup};
pub use tools::{Dispatcher, ToolDef, ToolHandler, ToolRegistry};
pub use types::{ToolRequest, ToolResponse, ToolResult};
