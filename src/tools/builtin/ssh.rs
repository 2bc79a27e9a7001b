use std::time::Duration;

use async_trait::async_trait;

use super::{port_arg, secs, ToolContext};
use crate::error::{ErrorKind, ToolError};
use crate::tools::{Args, ParamSchema, ParamSpec, ToolDef, ToolHandler, ToolRegistry};
use crate::types::ToolResult;

const BLOCKED_PATTERNS: &[&str] = &["rm -rf", "mkfs", "dd if=", "> /dev/", "format ", "fdisk"];
const KEYGEN_TIMEOUT: Duration = Duration::from_secs(10);

pub(super) fn register(registry: &mut ToolRegistry, ctx: &ToolContext) {
    let tool = |op| SshTool { op, ctx: ctx.clone() };

    registry.register(ToolDef::new(
        "ssh_execute",
        "Execute a command on a remote host over SSH using key-based authentication.",
        ParamSchema::new()
            .param(ParamSpec::string("host", "Target hostname or IP address").required().min(1))
            .param(ParamSpec::string("command", "Command to run on the remote host").required().range(1, 500))
            .param(ParamSpec::string("username", "Remote user; defaults to the current user"))
            .param(ParamSpec::string("key_file", "Path to the private key"))
            .param(ParamSpec::integer("port", "SSH port").range(1, 65535).default(22))
            .param(ParamSpec::integer("timeout", "Command timeout in seconds").range(1, 600).default(30)),
        tool(SshOp::Execute),
    ));
    registry.register(ToolDef::new(
        "ssh_copy_file",
        "Copy a file to or from a remote host with scp.",
        ParamSchema::new()
            .param(ParamSpec::string("host", "Target hostname or IP address").required().min(1))
            .param(ParamSpec::string("local_path", "Local file path").required().min(1))
            .param(ParamSpec::string("remote_path", "Remote file path").required().min(1))
            .param(
                ParamSpec::string("direction", "upload (local to remote) or download (remote to local)")
                    .one_of(&["upload", "download"])
                    .default("upload"),
            )
            .param(ParamSpec::string("username", "Remote user; defaults to the current user"))
            .param(ParamSpec::string("key_file", "Path to the private key"))
            .param(ParamSpec::integer("port", "SSH port").range(1, 65535).default(22)),
        tool(SshOp::Copy),
    ));
    registry.register(ToolDef::new(
        "ssh_key_info",
        "Describe an SSH key file: type and comment for public keys, fingerprint and permissions for private keys.",
        ParamSchema::new().param(ParamSpec::string("key_file", "Path to the key file").required().min(1)),
        tool(SshOp::KeyInfo),
    ));
}

#[derive(Debug, Clone, Copy)]
enum SshOp {
    Execute,
    Copy,
    KeyInfo,
}

struct SshTool {
    op: SshOp,
    ctx: ToolContext,
}

#[async_trait]
impl ToolHandler for SshTool {
    async fn call(&self, args: &Args) -> ToolResult {
        match self.op {
            SshOp::Execute => self.execute(args).await,
            SshOp::Copy => self.copy(args).await,
            SshOp::KeyInfo => self.key_info(args).await,
        }
    }
}

/// Connection options shared by `ssh` and `scp`. `BatchMode` keeps both
/// from ever waiting on a password prompt.
fn base_argv(program: &str, port_flag: &str, port: u16, key_file: Option<&str>) -> Vec<String> {
    let mut argv: Vec<String> = [
        program,
        "-o",
        "BatchMode=yes",
        "-o",
        "ConnectTimeout=10",
        "-o",
        "StrictHostKeyChecking=accept-new",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    if port != 22 {
        argv.push(port_flag.into());
        argv.push(port.to_string());
    }
    if let Some(key) = key_file {
        argv.push("-i".into());
        argv.push(key.into());
    }
    argv
}

fn check_username(username: &str) -> Result<(), ToolError> {
    let valid = !username.starts_with('-')
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ToolError::invalid(format!("invalid username {username:?}")))
    }
}

fn check_path(name: &str, path: &str) -> Result<(), ToolError> {
    if path.starts_with('-') {
        return Err(ToolError::invalid(format!("'{name}' may not start with '-'")));
    }
    Ok(())
}

async fn check_key_file(key_file: Option<&str>) -> Result<(), ToolError> {
    if let Some(key) = key_file {
        check_path("key_file", key)?;
        tokio::fs::metadata(key)
            .await
            .map_err(|e| ToolError::from_io(key, &e))?;
    }
    Ok(())
}

fn destination(username: Option<&str>, host: &str) -> String {
    match username {
        Some(user) => format!("{user}@{host}"),
        None => host.to_string(),
    }
}

impl SshTool {
    /// Host, username and key checks common to `ssh_execute` and `ssh_copy_file`.
    async fn target<'a>(&self, args: &'a Args) -> Result<(&'a str, Option<&'a str>, Option<&'a str>, u16), ToolError> {
        let host = args.str("host")?;
        self.ctx.check_host(host)?;
        let username = args.opt_str("username");
        if let Some(user) = username {
            check_username(user)?;
        }
        let key_file = args.opt_str("key_file");
        check_key_file(key_file).await?;
        Ok((host, username, key_file, port_arg(args, "port")?))
    }

    async fn execute(&self, args: &Args) -> ToolResult {
        let (host, username, key_file, port) = self.target(args).await?;
        let command = args.str("command")?;
        let lowered = command.to_lowercase();
        if let Some(pattern) = BLOCKED_PATTERNS.iter().find(|p| lowered.contains(*p)) {
            return Err(ToolError::invalid(format!(
                "command blocked: contains potentially destructive pattern {pattern:?}"
            )));
        }

        let mut argv = base_argv("ssh", "-p", port, key_file);
        argv.push(destination(username, host));
        argv.push(command.into());

        let done = self.ctx.run(argv, secs(args, "timeout")?).await?;

        let rule = "=".repeat(50);
        let mut out = format!(
            "SSH Command Execution on {host}\n{rule}\nUser: {}\nPort: {port}\nCommand: {command}\nExit Code: {}\n{rule}\n",
            username.unwrap_or("current user"),
            done.exit_code,
        );
        if !done.stdout.is_empty() {
            out.push_str(&format!("STDOUT:\n{}\n", done.stdout));
        }
        if !done.stderr.is_empty() {
            out.push_str(&format!("STDERR:\n{}\n", done.stderr));
        }
        Ok(out)
    }

    async fn copy(&self, args: &Args) -> ToolResult {
        let (host, username, key_file, port) = self.target(args).await?;
        let local_path = args.str("local_path")?;
        let remote_path = args.str("remote_path")?;
        let direction = args.str("direction")?;
        check_path("local_path", local_path)?;
        check_path("remote_path", remote_path)?;

        let remote = format!("{}:{remote_path}", destination(username, host));
        let (source, target) = if direction == "upload" {
            tokio::fs::metadata(local_path)
                .await
                .map_err(|e| ToolError::from_io(local_path, &e))?;
            (local_path.to_string(), remote)
        } else {
            (remote, local_path.to_string())
        };

        let mut argv = base_argv("scp", "-P", port, key_file);
        argv.push(source);
        argv.push(target);

        let done = self.ctx.run(argv, self.ctx.limits.transfer).await?;
        if done.exit_code != 0 {
            return Err(ToolError::new(
                ErrorKind::ProtocolError,
                format!("scp exited with {}: {}", done.exit_code, done.stderr.trim_end()),
            ));
        }

        let rule = "=".repeat(40);
        let mut out = format!(
            "SCP File Copy ({})\n{rule}\nHost: {host}:{port}\nUser: {}\nLocal: {local_path}\nRemote: {remote_path}\n{rule}\nFile copy completed successfully\n",
            direction.to_uppercase(),
            username.unwrap_or("current user"),
        );
        if !done.stdout.is_empty() {
            out.push_str(&format!("Output: {}\n", done.stdout));
        }
        Ok(out)
    }

    async fn key_info(&self, args: &Args) -> ToolResult {
        let key_file = args.str("key_file")?;
        check_path("key_file", key_file)?;
        let meta = tokio::fs::metadata(key_file)
            .await
            .map_err(|e| ToolError::from_io(key_file, &e))?;
        if !meta.is_file() {
            return Err(ToolError::invalid(format!("'{key_file}' is not a file")));
        }

        if key_file.ends_with(".pub") {
            let content = tokio::fs::read_to_string(key_file)
                .await
                .map_err(|e| ToolError::from_io(key_file, &e))?;
            return describe_public_key(key_file, &content);
        }

        let argv = vec!["ssh-keygen".into(), "-l".into(), "-f".into(), key_file.into()];
        let done = self.ctx.run(argv, KEYGEN_TIMEOUT).await?;
        if done.exit_code != 0 {
            return Err(ToolError::new(
                ErrorKind::Io,
                format!("error reading key file: {}", done.stderr.trim_end()),
            ));
        }

        let perms = permission_digits(&meta);
        let rule = "=".repeat(35);
        let mut out = format!(
            "SSH Private Key Information\n{rule}\nFile: {key_file}\nFingerprint: {}\nPermissions: {perms}\n",
            done.stdout.trim()
        );
        if perms != "600" {
            out.push_str("Warning: private key should have 600 permissions\n");
        }
        Ok(out)
    }
}

fn describe_public_key(key_file: &str, content: &str) -> ToolResult {
    let mut parts = content.split_whitespace();
    let (Some(key_type), Some(key_data)) = (parts.next(), parts.next()) else {
        return Err(ToolError::invalid(format!(
            "'{key_file}' is not a valid public key"
        )));
    };
    let comment: Vec<&str> = parts.collect();
    let comment = if comment.is_empty() {
        "No comment".to_string()
    } else {
        comment.join(" ")
    };
    Ok(format!(
        "SSH Public Key Information\n{}\nFile: {key_file}\nType: {key_type}\nComment: {comment}\nKey Length: {} characters\n",
        "=".repeat(35),
        key_data.len()
    ))
}

#[cfg(unix)]
fn permission_digits(meta: &std::fs::Metadata) -> String {
    use std::os::unix::fs::MetadataExt;
    format!("{:03o}", meta.mode() & 0o777)
}

#[cfg(not(unix))]
fn permission_digits(_meta: &std::fs::Metadata) -> String {
    "unknown".into()
}
