use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{port_arg, secs, ToolContext};
use crate::connector::{ConnectParams, Credentials, FtpSession};
use crate::error::{ConnectError, ToolError};
use crate::tools::{Args, ParamSchema, ParamSpec, ToolDef, ToolHandler, ToolRegistry};
use crate::types::ToolResult;

const STAT_PREVIEW: usize = 100;

/// Connection parameters every FTP tool accepts.
fn connection_params(schema: ParamSchema, default_timeout: i64) -> ParamSchema {
    schema
        .param(ParamSpec::string("username", "FTP username").default("anonymous"))
        .param(ParamSpec::string("password", "FTP password").default(""))
        .param(ParamSpec::integer("port", "FTP control port").range(1, 65535).default(21))
        .param(
            ParamSpec::integer("timeout", "Connect and per-operation timeout in seconds")
                .range(1, 300)
                .default(default_timeout),
        )
}

fn host_param() -> ParamSchema {
    ParamSchema::new().param(ParamSpec::string("host", "FTP server hostname or IP address").required())
}

pub(super) fn register(registry: &mut ToolRegistry, ctx: &ToolContext) {
    let tool = |op| FtpTool { op, ctx: ctx.clone() };

    registry.register(ToolDef::new(
        "ftp_list_files",
        "List files and directories on an FTP server.",
        connection_params(
            host_param().param(ParamSpec::string("directory", "Directory to list").default("/")),
            30,
        ),
        tool(FtpOp::List),
    ));
    registry.register(ToolDef::new(
        "ftp_download_file",
        "Download a file from an FTP server.",
        connection_params(
            host_param()
                .param(ParamSpec::string("remote_file", "Path of the file on the server").required().min(1))
                .param(ParamSpec::string("local_file", "Where to save it; defaults to the remote file name")),
            30,
        ),
        tool(FtpOp::Download),
    ));
    registry.register(ToolDef::new(
        "ftp_upload_file",
        "Upload a local file to an FTP server.",
        connection_params(
            host_param()
                .param(ParamSpec::string("local_file", "Local file to upload").required().min(1))
                .param(ParamSpec::string("remote_file", "Remote path; defaults to the local file name")),
            30,
        ),
        tool(FtpOp::Upload),
    ));
    registry.register(ToolDef::new(
        "ftp_server_info",
        "Report an FTP server's welcome message, system type, features and status.",
        connection_params(host_param(), 30),
        tool(FtpOp::Info),
    ));
    registry.register(ToolDef::new(
        "ftp_test_connection",
        "Check whether an FTP server accepts a login.",
        connection_params(host_param(), 10),
        tool(FtpOp::Test),
    ));
}

#[derive(Debug, Clone, Copy)]
enum FtpOp {
    List,
    Download,
    Upload,
    Info,
    Test,
}

struct FtpTool {
    op: FtpOp,
    ctx: ToolContext,
}

#[async_trait]
impl ToolHandler for FtpTool {
    async fn call(&self, args: &Args) -> ToolResult {
        let params = self.params(args)?;
        match self.op {
            FtpOp::List => self.list(args, params).await,
            FtpOp::Download => self.download(args, params).await,
            FtpOp::Upload => self.upload(args, params).await,
            FtpOp::Info => self.info(params).await,
            FtpOp::Test => Ok(self.test(params).await),
        }
    }
}

impl FtpTool {
    fn params(&self, args: &Args) -> Result<ConnectParams, ToolError> {
        let params = ConnectParams::new(args.str("host")?, port_arg(args, "port")?)
            .with_credentials(Credentials::new(args.str("username")?, args.str("password")?))
            .with_timeout(secs(args, "timeout")?);
        self.ctx.connector.validate(&params)?;
        Ok(params)
    }

    async fn list(&self, args: &Args, params: ConnectParams) -> ToolResult {
        let directory = args.str("directory")?.to_string();
        let (welcome, cwd, entries) = self
            .ctx
            .connector
            .with_ftp(&params, move |session| {
                Box::pin(async move {
                    if directory != "/" {
                        session.cwd(&directory).await?;
                    }
                    let entries = session.list().await?;
                    let cwd = session.pwd().await?;
                    Ok::<_, ConnectError>((session.welcome().to_string(), cwd, entries))
                })
            })
            .await?;

        let mut out = header("FTP Directory Listing", 40, &params);
        out.push_str(&format!("Directory: {cwd}\n"));
        out.push_str(&format!("User: {}\n", username(&params)));
        out.push_str(&format!("Welcome: {welcome}\n{}\n", "=".repeat(40)));
        if entries.is_empty() {
            out.push_str("Directory is empty\n");
        }
        for entry in entries {
            out.push_str(&entry);
            out.push('\n');
        }
        Ok(out)
    }

    async fn download(&self, args: &Args, params: ConnectParams) -> ToolResult {
        let remote_file = args.str("remote_file")?.to_string();
        let local_file = match args.opt_str("local_file") {
            Some(path) => path.to_string(),
            None => default_local_name(&remote_file),
        };
        let partial = partial_path(&local_file);

        // `local_file` is only replaced once the whole transfer succeeded.
        let remote = remote_file.clone();
        let target = partial.clone();
        let (size, copied) = self
            .ctx
            .connector
            .with_ftp(&params, move |session| {
                Box::pin(async move {
                    let mut file = match create_partial(&target).await {
                        Ok(file) => file,
                        Err(e) => return Ok(Err(e)),
                    };
                    let fetched = fetch(session, &remote, &mut file, &target).await;
                    drop(file);
                    if fetched.is_err() {
                        remove_partial(&target).await;
                    }
                    Ok::<_, ConnectError>(fetched)
                })
            })
            .await??;

        if let Err(e) = tokio::fs::rename(&partial, &local_file).await {
            remove_partial(&partial).await;
            return Err(ToolError::from_io(&local_file, &e));
        }

        let size_info = size.map(|n| format!(" ({n} bytes)")).unwrap_or_default();
        let mut out = header("FTP File Download", 30, &params);
        out.push_str(&format!("Remote file: {remote_file}{size_info}\n"));
        out.push_str(&format!("Local file: {local_file}\n"));
        out.push_str(&format!("Downloaded: {copied} bytes\n"));
        out.push_str("Status: Download completed successfully\n");
        Ok(out)
    }

    async fn upload(&self, args: &Args, params: ConnectParams) -> ToolResult {
        let local_file = args.str("local_file")?.to_string();
        let meta = tokio::fs::metadata(&local_file)
            .await
            .map_err(|e| ToolError::from_io(&local_file, &e))?;
        if !meta.is_file() {
            return Err(ToolError::invalid(format!("'{local_file}' is not a file")));
        }
        let remote_file = match args.opt_str("remote_file") {
            Some(path) => path.to_string(),
            None => default_local_name(&local_file),
        };
        let file = tokio::fs::File::open(&local_file)
            .await
            .map_err(|e| ToolError::from_io(&local_file, &e))?;

        let remote = remote_file.clone();
        let (sent, remote_size) = self
            .ctx
            .connector
            .with_ftp(&params, move |session| {
                Box::pin(async move {
                    let mut file = file;
                    let sent = session.store(&remote, &mut file).await?;
                    let remote_size = session.size(&remote).await?;
                    Ok::<_, ConnectError>((sent, remote_size))
                })
            })
            .await?;

        let verify = match remote_size {
            Some(n) => format!("Remote size: {n} bytes"),
            None => "Size verification not supported".to_string(),
        };
        let mut out = header("FTP File Upload", 30, &params);
        out.push_str(&format!("Local file: {local_file}\n"));
        out.push_str(&format!("Remote file: {remote_file}\n"));
        out.push_str(&format!("Uploaded: {sent} bytes\n"));
        out.push_str(&format!("{verify}\n"));
        out.push_str("Status: Upload completed successfully\n");
        Ok(out)
    }

    async fn info(&self, params: ConnectParams) -> ToolResult {
        let report = self
            .ctx
            .connector
            .with_ftp(&params, |session| Box::pin(async move { Ok::<_, ConnectError>(server_report(session).await) }))
            .await?;

        let mut out = header("FTP Server Information", 35, &params);
        out.push_str(&format!("User: {}\n", username(&params)));
        out.push_str(&report);
        Ok(out)
    }

    /// A refused or failed login is a finding, not a tool failure.
    async fn test(&self, params: ConnectParams) -> String {
        let result = self
            .ctx
            .connector
            .with_ftp(&params, |session| {
                Box::pin(async move { Ok::<_, ConnectError>(session.welcome().to_string()) })
            })
            .await;

        let rule = "=".repeat(30);
        let mut out = format!(
            "FTP Connection Test\n{rule}\nServer: {}:{}\nUsername: {}\nTimeout: {}s\n{rule}\n",
            params.host,
            params.port,
            username(&params),
            params.timeout.as_secs()
        );
        match result {
            Ok(welcome) => {
                out.push_str("Connection successful\n");
                out.push_str(&format!("Welcome: {welcome}\n"));
            }
            Err(e) => {
                out.push_str("Connection failed\n");
                out.push_str(&format!("Error: {e}\n"));
            }
        }
        out
    }
}

async fn fetch(
    session: &mut FtpSession,
    remote: &str,
    file: &mut tokio::fs::File,
    path: &Path,
) -> Result<(Option<u64>, u64), ToolError> {
    let size = session.size(remote).await?;
    let copied = session.retrieve(remote, file).await?;
    file.flush()
        .await
        .map_err(|e| ToolError::from_io(&path.to_string_lossy(), &e))?;
    Ok((size, copied))
}

/// Sibling of `local` that no other download in this process will pick.
fn partial_path(local: &str) -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    PathBuf::from(format!("{local}.part-{}-{n}", std::process::id()))
}

async fn create_partial(path: &Path) -> Result<tokio::fs::File, ToolError> {
    tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map_err(|e| ToolError::from_io(&path.to_string_lossy(), &e))
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!(path = %path.display(), error = %e, "could not remove partial download");
    }
}

/// Best-effort server details. Commands the server refuses are reported, not raised.
async fn server_report(session: &mut FtpSession) -> String {
    let mut out = format!("Welcome Message: {}\n", session.welcome());

    match session.pwd().await {
        Ok(dir) => out.push_str(&format!("Current Directory: {dir}\n")),
        Err(_) => out.push_str("Current Directory: Unable to determine\n"),
    }
    match completion_text(session, "SYST").await {
        Some(text) => out.push_str(&format!("System Type: {text}\n")),
        None => out.push_str("System Type: Unable to determine\n"),
    }
    match completion_text(session, "FEAT").await {
        Some(text) => out.push_str(&format!("Features:\n{text}\n")),
        None => out.push_str("Features: Not supported or unable to retrieve\n"),
    }
    match completion_text(session, "STAT").await {
        Some(text) if text.chars().count() > STAT_PREVIEW => {
            let preview: String = text.chars().take(STAT_PREVIEW).collect();
            out.push_str(&format!("Status: {preview}...\n"));
        }
        Some(text) => out.push_str(&format!("Status: {text}\n")),
        None => out.push_str("Status: Unable to retrieve\n"),
    }
    out
}

async fn completion_text(session: &mut FtpSession, command: &str) -> Option<String> {
    match session.command(command).await {
        Ok(reply) if reply.is_completion() => Some(reply.text),
        Ok(reply) => {
            debug!(peer = %session.peer(), %command, code = reply.code, "command not supported");
            None
        }
        Err(e) => {
            debug!(peer = %session.peer(), %command, error = %e, "command failed");
            None
        }
    }
}

fn header(title: &str, width: usize, params: &ConnectParams) -> String {
    format!(
        "{title}\n{}\nServer: {}:{}\n",
        "=".repeat(width),
        params.host,
        params.port
    )
}

fn username(params: &ConnectParams) -> &str {
    params
        .credentials
        .as_ref()
        .map(|c| c.username.as_str())
        .unwrap_or("anonymous")
}

/// Last path component, or `downloaded_file` when there is none.
fn default_local_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "downloaded_file".to_string())
}
