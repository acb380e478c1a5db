// SPF Tool Gateway - Native Executor
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// In-process tools. The router has already applied access policy and
// approval before anything here runs; this module only executes.
// Relative paths resolve against the session working directory.

use crate::error::GatewayError;
use crate::paths::resolve_path;
use crate::registry::{ToolSource, ToolSpec};
use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

/// Per-call context handed to the executor
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub session_id: String,
    pub working_dir: PathBuf,
}

#[async_trait]
pub trait NativeExecutor: Send + Sync {
    /// Tool names, in a stable order
    fn list_tools(&self) -> Vec<String>;
    fn tool_spec(&self, name: &str) -> Option<ToolSpec>;
    async fn execute(&self, name: &str, args: &Value, ctx: &ExecContext) -> Result<Value, GatewayError>;
}

const TOOL_NAMES: [&str; 5] = [
    "read_file",
    "create_file",
    "str_replace_editor",
    "list_dir",
    "execute_shell_command",
];

/// Filesystem and shell tools on the local machine
pub struct LocalExecutor {
    max_write_size: usize,
    shell_timeout: Duration,
}

impl LocalExecutor {
    pub fn new(max_write_size: usize, shell_timeout: Duration) -> Self {
        Self { max_write_size, shell_timeout }
    }

    async fn read_file(&self, args: &Value, ctx: &ExecContext) -> Result<Value, GatewayError> {
        let path = required_path("read_file", args, ctx)?;
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| failed("read_file", &path, e))?;

        let offset = args.get("offset").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(0) as usize;

        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len();
        let start = offset.min(total);
        let end = if limit > 0 { (start + limit).min(total) } else { total };

        let numbered = lines[start..end]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:>6}\t{}", start + i + 1, line))
            .collect::<Vec<_>>()
            .join("\n");

        Ok(json!({
            "path": path.to_string_lossy(),
            "total_lines": total,
            "content": numbered,
        }))
    }

    async fn create_file(&self, args: &Value, ctx: &ExecContext) -> Result<Value, GatewayError> {
        let path = required_path("create_file", args, ctx)?;
        let content = str_arg(args, &["content", "file_text"]).ok_or_else(|| missing("create_file", "content"))?;
        if content.len() > self.max_write_size {
            return Err(GatewayError::ToolFailed {
                tool: "create_file".to_string(),
                message: format!("content is {} bytes, limit is {}", content.len(), self.max_write_size),
            });
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| failed("create_file", parent, e))?;
        }
        tokio::fs::write(&path, content).await.map_err(|e| failed("create_file", &path, e))?;

        Ok(json!({
            "path": path.to_string_lossy(),
            "bytes": content.len(),
            "sha256": sha256_hex(content.as_bytes()),
        }))
    }

    async fn str_replace(&self, args: &Value, ctx: &ExecContext) -> Result<Value, GatewayError> {
        const TOOL: &str = "str_replace_editor";
        let path = required_path(TOOL, args, ctx)?;
        let old_str = str_arg(args, &["old_str", "old_string"]).ok_or_else(|| missing(TOOL, "old_str"))?;
        let new_str = str_arg(args, &["new_str", "new_string"]).unwrap_or("");
        if old_str.is_empty() {
            return Err(GatewayError::ToolFailed { tool: TOOL.to_string(), message: "old_str is empty".to_string() });
        }

        let content = tokio::fs::read_to_string(&path).await.map_err(|e| failed(TOOL, &path, e))?;
        match content.matches(old_str).count() {
            1 => {}
            0 => {
                return Err(GatewayError::ToolFailed {
                    tool: TOOL.to_string(),
                    message: format!("old_str not found in {}", path.display()),
                })
            }
            n => {
                return Err(GatewayError::ToolFailed {
                    tool: TOOL.to_string(),
                    message: format!("old_str matches {} times in {}; it must be unique", n, path.display()),
                })
            }
        }

        let updated = content.replacen(old_str, new_str, 1);
        if updated.len() > self.max_write_size {
            return Err(GatewayError::ToolFailed {
                tool: TOOL.to_string(),
                message: format!("result is {} bytes, limit is {}", updated.len(), self.max_write_size),
            });
        }
        tokio::fs::write(&path, &updated).await.map_err(|e| failed(TOOL, &path, e))?;

        Ok(json!({
            "path": path.to_string_lossy(),
            "replaced": 1,
            "sha256": sha256_hex(updated.as_bytes()),
        }))
    }

    async fn list_dir(&self, args: &Value, ctx: &ExecContext) -> Result<Value, GatewayError> {
        let raw = str_arg(args, PATH_KEYS).unwrap_or(".");
        let path = resolve_path(&ctx.working_dir, raw);
        let mut reader = tokio::fs::read_dir(&path).await.map_err(|e| failed("list_dir", &path, e))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(|e| failed("list_dir", &path, e))? {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push((entry.file_name().to_string_lossy().to_string(), is_dir));
        }
        entries.sort();

        let entries: Vec<Value> = entries
            .into_iter()
            .map(|(name, is_dir)| json!({"name": name, "kind": if is_dir { "dir" } else { "file" }}))
            .collect();
        Ok(json!({"path": path.to_string_lossy(), "entries": entries}))
    }

    async fn execute_shell(&self, args: &Value, ctx: &ExecContext) -> Result<Value, GatewayError> {
        const TOOL: &str = "execute_shell_command";
        let command = str_arg(args, &["command"]).ok_or_else(|| missing(TOOL, "command"))?;
        let timeout = args
            .get("timeout")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs)
            .map_or(self.shell_timeout, |t| t.min(self.shell_timeout));

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(&ctx.working_dir).kill_on_drop(true);
        let child = cmd.output();

        // Elapsed drops the child future, which kills the process
        let output = match tokio::time::timeout(timeout, child).await {
            Ok(result) => result.map_err(|e| GatewayError::ToolFailed { tool: TOOL.to_string(), message: e.to_string() })?,
            Err(_) => return Err(GatewayError::Timeout { after_ms: timeout.as_millis() as u64 }),
        };

        Ok(json!({
            "exit_code": output.status.code().unwrap_or(-1),
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
        }))
    }
}

#[async_trait]
impl NativeExecutor for LocalExecutor {
    fn list_tools(&self) -> Vec<String> {
        TOOL_NAMES.iter().map(|s| s.to_string()).collect()
    }

    fn tool_spec(&self, name: &str) -> Option<ToolSpec> {
        let spec = match name {
            "read_file" => ToolSpec::new(
                name,
                "Read a file with line numbers.",
                ToolSource::Native,
                json!({
                    "file_path": {"type": "string", "description": "Path to file (relative to the session working directory or absolute)"},
                    "offset": {"type": "integer", "description": "Line offset to start from (optional)"},
                    "limit": {"type": "integer", "description": "Max lines to read (optional)"}
                }),
                vec!["file_path"],
            ),
            "create_file" => ToolSpec::new(
                name,
                "Create or overwrite a file. Size-limited.",
                ToolSource::Native,
                json!({
                    "file_path": {"type": "string", "description": "Path to file"},
                    "content": {"type": "string", "description": "File content"}
                }),
                vec!["file_path", "content"],
            ),
            "str_replace_editor" => ToolSpec::new(
                name,
                "Replace one unique occurrence of old_str with new_str.",
                ToolSource::Native,
                json!({
                    "file_path": {"type": "string", "description": "Path to file"},
                    "old_str": {"type": "string", "description": "Text to replace; must occur exactly once"},
                    "new_str": {"type": "string", "description": "Replacement text"}
                }),
                vec!["file_path", "old_str"],
            ),
            "list_dir" => ToolSpec::new(
                name,
                "List directory entries.",
                ToolSource::Native,
                json!({
                    "path": {"type": "string", "description": "Directory (default: working directory)"}
                }),
                vec![],
            ),
            "execute_shell_command" => ToolSpec::new(
                name,
                "Run a shell command in the session working directory.",
                ToolSource::Native,
                json!({
                    "command": {"type": "string", "description": "Command line"},
                    "timeout": {"type": "integer", "description": "Timeout in seconds (capped by configuration)"}
                }),
                vec!["command"],
            ),
            _ => return None,
        };
        Some(spec)
    }

    async fn execute(&self, name: &str, args: &Value, ctx: &ExecContext) -> Result<Value, GatewayError> {
        log::debug!("native {} for session {}", name, ctx.session_id);
        match name {
            "read_file" => self.read_file(args, ctx).await,
            "create_file" => self.create_file(args, ctx).await,
            "str_replace_editor" => self.str_replace(args, ctx).await,
            "list_dir" => self.list_dir(args, ctx).await,
            "execute_shell_command" => self.execute_shell(args, ctx).await,
            other => Err(GatewayError::UnknownTool(other.to_string())),
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Argument keys that name a filesystem target
pub const PATH_KEYS: &[&str] = &["file_path", "path", "relative_path", "target_path"];

fn str_arg<'a>(args: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| args.get(*k).and_then(|v| v.as_str()))
}

fn required_path(tool: &str, args: &Value, ctx: &ExecContext) -> Result<PathBuf, GatewayError> {
    str_arg(args, PATH_KEYS)
        .map(|raw| resolve_path(&ctx.working_dir, raw))
        .ok_or_else(|| missing(tool, "file_path"))
}

fn missing(tool: &str, arg: &str) -> GatewayError {
    GatewayError::ToolFailed { tool: tool.to_string(), message: format!("missing argument '{}'", arg) }
}

fn failed(tool: &str, path: &Path, e: std::io::Error) -> GatewayError {
    GatewayError::ToolFailed { tool: tool.to_string(), message: format!("{}: {}", path.display(), e) }
}

/// SHA256 hash as hex string
fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ctx(dir: &Path) -> ExecContext {
        ExecContext { session_id: "s1".to_string(), working_dir: dir.to_path_buf() }
    }

    fn executor() -> LocalExecutor {
        LocalExecutor::new(64, Duration::from_secs(5))
    }

    #[test]
    fn every_listed_tool_has_a_spec() {
        let exec = executor();
        for name in exec.list_tools() {
            let spec = exec.tool_spec(&name).unwrap();
            assert_eq!(spec.name, name);
            assert_eq!(spec.source, ToolSource::Native);
        }
        assert!(exec.tool_spec("nope").is_none());
    }

    #[tokio::test]
    async fn read_file_numbers_lines_with_offset_and_limit() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\nthree\nfour\n").unwrap();
        let out = executor()
            .execute("read_file", &json!({"file_path": "a.txt", "offset": 1, "limit": 2}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(out["total_lines"], 4);
        assert_eq!(out["content"], "     2\ttwo\n     3\tthree");
    }

    #[tokio::test]
    async fn create_file_enforces_size_limit_and_hashes() {
        let dir = tempdir().unwrap();
        let exec = executor();
        let out = exec
            .execute("create_file", &json!({"file_path": "sub/new.txt", "content": "abc"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(out["bytes"], 3);
        assert_eq!(out["sha256"], "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
        assert_eq!(std::fs::read_to_string(dir.path().join("sub/new.txt")).unwrap(), "abc");

        let big = "x".repeat(65);
        let err = exec
            .execute("create_file", &json!({"file_path": "big.txt", "content": big}), &ctx(dir.path()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "tool_failed");
        assert!(!dir.path().join("big.txt").exists());
    }

    #[tokio::test]
    async fn str_replace_requires_unique_match() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("lib.rs");
        std::fs::write(&file, "fn a() {}\nfn b() {}\n").unwrap();
        let exec = executor();

        let err = exec
            .execute("str_replace_editor", &json!({"file_path": "lib.rs", "old_str": "fn ", "new_str": "pub fn "}), &ctx(dir.path()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("2 times"), "{err}");

        let err = exec
            .execute("str_replace_editor", &json!({"file_path": "lib.rs", "old_str": "fn c", "new_str": "x"}), &ctx(dir.path()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"), "{err}");

        exec.execute("str_replace_editor", &json!({"file_path": "lib.rs", "old_str": "fn b", "new_str": "fn c"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "fn a() {}\nfn c() {}\n");
    }

    #[tokio::test]
    async fn list_dir_sorts_and_marks_dirs() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "").unwrap();
        let out = executor().execute("list_dir", &json!({}), &ctx(dir.path())).await.unwrap();
        assert_eq!(
            out["entries"],
            json!([{"name": "Cargo.toml", "kind": "file"}, {"name": "src", "kind": "dir"}])
        );
    }

    #[tokio::test]
    async fn shell_runs_in_working_dir() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "").unwrap();
        let out = executor()
            .execute("execute_shell_command", &json!({"command": "ls; exit 3"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(out["exit_code"], 3);
        assert!(out["stdout"].as_str().unwrap().contains("marker"));
    }

    #[tokio::test]
    async fn shell_timeout_is_reported() {
        let dir = tempdir().unwrap();
        let exec = LocalExecutor::new(64, Duration::from_secs(1));
        let err = exec
            .execute("execute_shell_command", &json!({"command": "sleep 5"}), &ctx(dir.path()))
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Timeout { after_ms: 1000 });
    }
}
