use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

const MAX_LOGGED_STRING: usize = 1024;

/// Appends one JSON line per command-surface call. The current file is moved aside
/// with a timestamp suffix once it reaches `max_size_bytes`.
#[derive(Debug)]
pub struct AuditLogger {
    log_file_path: PathBuf,
    max_size_bytes: u64,
}

impl AuditLogger {
    pub fn new(log_file_path: PathBuf, max_size_bytes: u64) -> Self {
        if let Some(dir) = log_file_path.parent() {
            if let Err(e) = std::fs::create_dir_all(dir) {
                error!(path = %dir.display(), error = %e, "Failed to create audit log directory");
            }
        }
        Self {
            log_file_path,
            max_size_bytes,
        }
    }

    fn rotated_path(&self) -> PathBuf {
        let stem = self
            .log_file_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audit".to_string());
        let suffix = Utc::now().format("%Y%m%d-%H%M%S%.3f");
        let name = match self.log_file_path.extension() {
            Some(ext) => format!("{}-{}.{}", stem, suffix, ext.to_string_lossy()),
            None => format!("{}-{}", stem, suffix),
        };
        self.log_file_path.with_file_name(name)
    }

    async fn rotate(&self) -> Result<()> {
        let len = match fs::metadata(&self.log_file_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if len < self.max_size_bytes {
            return Ok(());
        }
        let target = self.rotated_path();
        debug!(from = %self.log_file_path.display(), to = %target.display(), "Rotating audit log");
        fs::rename(&self.log_file_path, target).await?;
        Ok(())
    }

    /// Records one call. Failures are logged and never surface to the caller.
    pub async fn log_tool_call(&self, tool_name: &str, arguments: &Value) {
        if let Err(e) = self.append(tool_name, arguments).await {
            error!(tool = %tool_name, error = %e, "Failed to write audit log");
        }
    }

    async fn append(&self, tool_name: &str, arguments: &Value) -> Result<()> {
        self.rotate().await?;

        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "tool": tool_name,
            "arguments": sanitize_arguments(arguments),
        });
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

/// Session input and natural-language commands can be large; keep the log readable.
fn sanitize_arguments(arguments: &Value) -> Value {
    let mut sanitized = arguments.clone();
    if let Some(obj) = sanitized.as_object_mut() {
        for key in ["text", "input"] {
            if let Some(val) = obj.get_mut(key) {
                if val.as_str().map_or(false, |s| s.len() > MAX_LOGGED_STRING) {
                    *val = Value::String(format!("<{} truncated for log>", key));
                }
            }
        }
    }
    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_input_is_truncated() {
        let big = "x".repeat(MAX_LOGGED_STRING + 1);
        let sanitized = sanitize_arguments(&json!({ "session_id": "abc", "text": big }));
        assert_eq!(sanitized["session_id"], "abc");
        assert_eq!(sanitized["text"], "<text truncated for log>");
    }

    #[tokio::test]
    async fn writes_and_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("tool_calls.log");
        let logger = AuditLogger::new(path.clone(), 1);

        logger.log_tool_call("list_sessions", &json!({})).await;
        assert!(path.exists());

        logger.log_tool_call("get_session", &json!({ "session_id": "abc" })).await;
        let entries = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 2);

        let current: Value = serde_json::from_str(std::fs::read_to_string(&path).unwrap().trim()).unwrap();
        assert_eq!(current["tool"], "get_session");
        assert_eq!(current["arguments"]["session_id"], "abc");
    }
}
