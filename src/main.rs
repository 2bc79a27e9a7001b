//! `systools`: serve, call and supervise the local system tools.
//!
//! Usage:
//!   systools serve                                  # envelope over stdio, all groups
//!   systools serve --group files --listen 127.0.0.1:8001
//!   systools call read_file '{"file_path": "Cargo.toml"}'
//!   systools list --group nmap
//!   systools check
//!   systools supervise
//!
//! Logs go to stderr; set RUST_LOG to change the level.

use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use nexus_systools::console::{render_checks, render_status, HELP};
use nexus_systools::exec::check_dependencies;
use nexus_systools::{
    registry_for, serve_stdio, serve_tcp, ConsoleCommand, Dispatcher, ProcessRunner,
    Supervisor, SystoolsConfig, ToolContext, ToolGroup, ToolRequest, ToolResponse,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "systools", about = "Local system and network tools")]
struct Cli {
    /// JSON config file; built-in defaults when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the request envelope over stdio, or TCP with --listen
    Serve {
        /// Tool group to serve; repeat for several. All groups when omitted
        #[arg(long = "group", value_name = "GROUP")]
        groups: Vec<ToolGroup>,

        /// Listen on this TCP address instead of stdio
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Invoke one tool in-process and print the response envelope
    Call {
        tool: String,

        /// Arguments as a JSON object
        #[arg(default_value = "{}")]
        arguments: String,
    },
    /// Print the tool catalog
    List {
        #[arg(long = "group", value_name = "GROUP")]
        groups: Vec<ToolGroup>,
    },
    /// Check that nmap, ssh and ping are available
    Check,
    /// Start one server per configured service and manage them
    Supervise {
        /// Run until interrupted instead of reading console commands
        #[arg(long)]
        no_console: bool,
    },
}

fn dispatcher(config: &SystoolsConfig, groups: &[ToolGroup]) -> Dispatcher {
    let groups = if groups.is_empty() {
        &ToolGroup::ALL[..]
    } else {
        groups
    };
    let ctx = ToolContext::from_config(config);
    Dispatcher::new(registry_for(groups, &ctx))
}

/// Cancel `token` on Ctrl-C or SIGTERM.
fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("interrupted"),
                        _ = term.recv() => info!("SIGTERM received"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "cannot listen for SIGTERM");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupted");
        }
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => SystoolsConfig::load(path)?,
        None => SystoolsConfig::default(),
    };

    match cli.command {
        Command::Serve { groups, listen } => serve(&config, &groups, listen).await,
        Command::Call { tool, arguments } => call(&config, tool, &arguments).await,
        Command::List { groups } => {
            let catalog = dispatcher(&config, &groups).list_tools();
            println!("{}", serde_json::to_string_pretty(&catalog)?);
            Ok(())
        }
        Command::Check => {
            let runner = ProcessRunner::new().with_max_output(config.max_output_bytes);
            let checks = check_dependencies(&runner, CHECK_TIMEOUT).await;
            print!("{}", render_checks(&checks));
            if checks.iter().any(|c| !c.available) {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Supervise { no_console } => supervise(&config, no_console).await,
    }
}

async fn serve(
    config: &SystoolsConfig,
    groups: &[ToolGroup],
    listen: Option<SocketAddr>,
) -> Result<(), Box<dyn Error>> {
    let dispatcher = dispatcher(config, groups);
    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone());

    match listen {
        Some(addr) => {
            let listener = TcpListener::bind(addr).await?;
            serve_tcp(Arc::new(dispatcher), listener, shutdown).await?;
        }
        None => {
            info!(tools = dispatcher.registry().len(), "serving on stdio");
            serve_stdio(&dispatcher, shutdown).await?;
        }
    }
    Ok(())
}

async fn call(config: &SystoolsConfig, tool: String, arguments: &str) -> Result<(), Box<dyn Error>> {
    let arguments: serde_json::Value = serde_json::from_str(arguments)?;
    if !arguments.is_object() {
        return Err("arguments must be a JSON object".into());
    }
    let response: ToolResponse = dispatcher(config, &[])
        .handle(&ToolRequest::new(tool, arguments))
        .await;
    println!("{}", serde_json::to_string(&response)?);
    if response.is_error() {
        std::process::exit(1);
    }
    Ok(())
}

async fn supervise(config: &SystoolsConfig, no_console: bool) -> Result<(), Box<dyn Error>> {
    let mut supervisor = Supervisor::for_current_exe(config)?;
    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone());

    report_starts(supervisor.start_all().await);

    if no_console {
        shutdown.cancelled().await;
    } else {
        println!("{HELP}");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = lines.next_line() => line?,
            };
            // EOF behaves like quit.
            let Some(line) = line else { break };
            match ConsoleCommand::parse(&line) {
                ConsoleCommand::Status => print!("{}", render_status(&supervisor.status())),
                ConsoleCommand::Restart => report_starts(supervisor.restart_all().await),
                ConsoleCommand::Stop => {
                    supervisor.stop_all().await;
                    println!("All servers stopped");
                }
                ConsoleCommand::Quit => break,
                ConsoleCommand::Help => println!("{HELP}"),
                ConsoleCommand::Empty => {}
                ConsoleCommand::Unknown(command) => {
                    println!("Unknown command: {command}. Type 'help' for available commands.")
                }
            }
        }
    }

    supervisor.stop_all().await;
    println!("All servers stopped");
    Ok(())
}

fn report_starts(outcomes: Vec<(String, Result<u32, nexus_systools::SupervisorError>)>) {
    let total = outcomes.len();
    let mut started = 0;
    for (name, outcome) in outcomes {
        match outcome {
            Ok(pid) => {
                started += 1;
                println!("{name} started (PID {pid})");
            }
            Err(e) => println!("{name} failed: {e}"),
        }
    }
    println!("Started {started}/{total} servers");
}
