use std::fmt::Write as _;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Local};

use crate::error::{ErrorKind, ToolError};
use crate::tools::{Args, ParamSchema, ParamSpec, ToolDef, ToolHandler, ToolRegistry};
use crate::types::ToolResult;

const RULE: &str = "==================================================";

pub(super) fn register(registry: &mut ToolRegistry) {
    registry.register(ToolDef::new(
        "read_file",
        "Read the contents of a text file from the local filesystem.",
        ParamSchema::new()
            .param(ParamSpec::string("file_path", "Absolute or relative path to the file").required().min(1))
            .param(
                ParamSpec::string("encoding", "Text encoding; utf-8-lossy replaces invalid sequences")
                    .one_of(&["utf-8", "utf-8-lossy"])
                    .default("utf-8"),
            ),
        FileTool(FileOp::Read),
    ));
    registry.register(ToolDef::new(
        "list_directory",
        "List the contents of a directory with file sizes.",
        ParamSchema::new()
            .param(ParamSpec::string("dir_path", "Path to the directory to list").required().min(1))
            .param(ParamSpec::boolean("show_hidden", "Include entries starting with '.'").default(false)),
        FileTool(FileOp::List),
    ));
    registry.register(ToolDef::new(
        "get_file_info",
        "Get type, size, permissions, ownership and timestamps of a file or directory.",
        ParamSchema::new()
            .param(ParamSpec::string("file_path", "Path to the file or directory").required().min(1)),
        FileTool(FileOp::Info),
    ));
}

#[derive(Debug, Clone, Copy)]
enum FileOp {
    Read,
    List,
    Info,
}

struct FileTool(FileOp);

#[async_trait]
impl ToolHandler for FileTool {
    async fn call(&self, args: &Args) -> ToolResult {
        match self.0 {
            FileOp::Read => read_file(args.str("file_path")?, args.str("encoding")?).await,
            FileOp::List => list_directory(args.str("dir_path")?, args.bool("show_hidden")?).await,
            FileOp::Info => file_info(args.str("file_path")?).await,
        }
    }
}

fn absolute(path: &str) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| PathBuf::from(path))
}

async fn read_file(path: &str, encoding: &str) -> ToolResult {
    let abs = absolute(path);
    let meta = tokio::fs::metadata(&abs)
        .await
        .map_err(|e| ToolError::from_io(path, &e))?;
    if !meta.is_file() {
        return Err(ToolError::invalid(format!("'{path}' is not a file")));
    }

    let bytes = tokio::fs::read(&abs)
        .await
        .map_err(|e| ToolError::from_io(path, &e))?;
    match encoding {
        "utf-8-lossy" => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        _ => String::from_utf8(bytes).map_err(|e| {
            ToolError::new(
                ErrorKind::Io,
                format!("unicode decode error reading file '{path}': {}", e.utf8_error()),
            )
        }),
    }
}

async fn list_directory(path: &str, show_hidden: bool) -> ToolResult {
    let abs = absolute(path);
    let meta = tokio::fs::metadata(&abs)
        .await
        .map_err(|e| ToolError::from_io(path, &e))?;
    if !meta.is_dir() {
        return Err(ToolError::invalid(format!("'{path}' is not a directory")));
    }

    let mut reader = tokio::fs::read_dir(&abs)
        .await
        .map_err(|e| ToolError::from_io(path, &e))?;
    let mut names = Vec::new();
    while let Some(entry) = reader
        .next_entry()
        .await
        .map_err(|e| ToolError::from_io(path, &e))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if show_hidden || !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();

    let mut out = format!("Contents of '{}':\n{RULE}\n", abs.display());
    if names.is_empty() {
        out.push_str("Directory is empty\n");
        return Ok(out);
    }
    for name in names {
        // Follows symlinks, so a link to a directory lists as one.
        match tokio::fs::metadata(abs.join(&name)).await {
            Ok(m) if m.is_dir() => {
                let _ = writeln!(out, "{name}/");
            }
            Ok(m) => {
                let _ = writeln!(out, "{name} ({})", human_size(m.len()));
            }
            Err(_) => {
                let _ = writeln!(out, "{name}");
            }
        }
    }
    Ok(out)
}

fn human_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    if bytes < KB {
        format!("{bytes}B")
    } else if bytes < MB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    }
}

fn timestamp(time: std::io::Result<SystemTime>) -> String {
    match time {
        Ok(t) => DateTime::<Local>::from(t).to_rfc3339(),
        Err(_) => "unavailable".into(),
    }
}

#[cfg(unix)]
fn ownership(meta: &Metadata) -> (String, String, String) {
    use std::os::unix::fs::MetadataExt;
    (
        format!("{:03o}", meta.mode() & 0o777),
        meta.uid().to_string(),
        meta.gid().to_string(),
    )
}

#[cfg(not(unix))]
fn ownership(meta: &Metadata) -> (String, String, String) {
    let perms = if meta.permissions().readonly() { "444" } else { "644" };
    (perms.into(), "unknown".into(), "unknown".into())
}

async fn file_info(path: &str) -> ToolResult {
    let abs = absolute(path);
    let meta = tokio::fs::metadata(&abs)
        .await
        .map_err(|e| ToolError::from_io(path, &e))?;
    let (perms, uid, gid) = ownership(&meta);

    let mut out = format!("Information for '{}':\n{RULE}\n", abs.display());
    let _ = writeln!(out, "Type: {}", if meta.is_dir() { "Directory" } else { "File" });
    let _ = writeln!(out, "Size: {} bytes", meta.len());
    let _ = writeln!(out, "Permissions: {perms}");
    let _ = writeln!(out, "Owner: {uid}");
    let _ = writeln!(out, "Group: {gid}");
    let _ = writeln!(out, "Modified: {}", timestamp(meta.modified()));
    let _ = writeln!(out, "Accessed: {}", timestamp(meta.accessed()));
    let _ = writeln!(out, "Created: {}", timestamp(meta.created()));
    if meta.is_file() {
        let _ = writeln!(out, "Extension: {}", extension(&abs));
    }
    Ok(out)
}

fn extension(path: &Path) -> String {
    path.extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolRequest;
    use serde_json::json;

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        register(&mut reg);
        reg
    }

    fn path_str(p: &Path) -> String {
        p.to_string_lossy().into_owned()
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(human_size(0), "0B");
        assert_eq!(human_size(1023), "1023B");
        assert_eq!(human_size(1536), "1.5KB");
        assert_eq!(human_size(3 * 1024 * 1024), "3.0MB");
    }

    #[tokio::test]
    async fn read_file_returns_contents() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.txt");
        std::fs::write(&file, "line one\nline two\n").unwrap();

        let out = registry()
            .invoke(&ToolRequest::new("read_file", json!({"file_path": path_str(&file)})))
            .await
            .unwrap();
        assert_eq!(out, "line one\nline two\n");
    }

    #[tokio::test]
    async fn read_file_error_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry();

        let missing = dir.path().join("missing.txt");
        let err = reg
            .invoke(&ToolRequest::new("read_file", json!({"file_path": path_str(&missing)})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);

        let err = reg
            .invoke(&ToolRequest::new("read_file", json!({"file_path": path_str(dir.path())})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        let err = reg
            .invoke(&ToolRequest::new(
                "read_file",
                json!({"file_path": path_str(dir.path()), "encoding": "latin-1"}),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn invalid_utf8_needs_lossy_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("blob.bin");
        std::fs::write(&file, [b'o', b'k', 0xff, 0xfe]).unwrap();
        let reg = registry();

        let err = reg
            .invoke(&ToolRequest::new("read_file", json!({"file_path": path_str(&file)})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Io);
        assert!(err.message.contains("unicode decode error"));

        let out = reg
            .invoke(&ToolRequest::new(
                "read_file",
                json!({"file_path": path_str(&file), "encoding": "utf-8-lossy"}),
            ))
            .await
            .unwrap();
        assert!(out.starts_with("ok"));
        assert!(out.contains('\u{FFFD}'));
    }

    #[tokio::test]
    async fn list_directory_formats_sorted_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), vec![0u8; 2048]).unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        std::fs::write(dir.path().join(".hidden"), "x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let reg = registry();
        let out = reg
            .invoke(&ToolRequest::new("list_directory", json!({"dir_path": path_str(dir.path())})))
            .await
            .unwrap();
        let lines: Vec<&str> = out.lines().skip(2).collect();
        assert_eq!(lines, vec!["a.txt (5B)", "b.txt (2.0KB)", "sub/"]);

        let out = reg
            .invoke(&ToolRequest::new(
                "list_directory",
                json!({"dir_path": path_str(dir.path()), "show_hidden": true}),
            ))
            .await
            .unwrap();
        assert!(out.contains(".hidden (1B)"));
    }

    #[tokio::test]
    async fn list_directory_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one"), "1").unwrap();
        std::fs::create_dir(dir.path().join("two")).unwrap();

        let reg = registry();
        let req = ToolRequest::new("list_directory", json!({"dir_path": path_str(dir.path())}));
        let first = reg.invoke(&req).await.unwrap();
        let second = reg.invoke(&req).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn list_empty_directory_and_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry();
        let out = reg
            .invoke(&ToolRequest::new("list_directory", json!({"dir_path": path_str(dir.path())})))
            .await
            .unwrap();
        assert!(out.ends_with("Directory is empty\n"));

        let file = dir.path().join("f");
        std::fs::write(&file, "").unwrap();
        let err = reg
            .invoke(&ToolRequest::new("list_directory", json!({"dir_path": path_str(&file)})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_info_reports_permissions_and_extension() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("key.pem");
        std::fs::write(&file, "secret").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o600)).unwrap();

        let out = registry()
            .invoke(&ToolRequest::new("get_file_info", json!({"file_path": path_str(&file)})))
            .await
            .unwrap();
        assert!(out.contains("Type: File\n"));
        assert!(out.contains("Size: 6 bytes\n"));
        assert!(out.contains("Permissions: 600\n"));
        assert!(out.contains("Extension: .pem\n"));

        let out = registry()
            .invoke(&ToolRequest::new("get_file_info", json!({"file_path": path_str(dir.path())})))
            .await
            .unwrap();
        assert!(out.contains("Type: Directory\n"));
        assert!(!out.contains("Extension:"));
    }
}
