//! The external operation behind a free-text query.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryBackendError {
    #[error("failed to spawn query backend '{executable}': {detail}")]
    Spawn { executable: String, detail: String },
    #[error("query backend timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("query backend failed with status {status}: {summary}")]
    ProcessFailed { status: String, summary: String },
    #[error("query backend returned an error payload: {0}")]
    ErrorPayload(String),
    #[error("query backend returned empty output")]
    EmptyOutput,
}

/// Runs one query to completion. Implementations may take arbitrarily long;
/// the admission watchdog does not cancel them.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    async fn run_query(&self, query: &str) -> Result<String, QueryBackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaudeCliConfig {
    pub executable: String,
    pub model: String,
    pub account_ref: String,
    pub extra_args: Vec<String>,
    /// Hard limit on the child process; it is killed when this expires.
    pub timeout_ms: u64,
}

/// Query backend that shells out to the `claude` CLI in print mode.
#[derive(Debug, Clone)]
pub struct ClaudeCliBackend {
    config: ClaudeCliConfig,
}

impl ClaudeCliBackend {
    pub fn new(config: ClaudeCliConfig) -> Result<Self, QueryBackendError> {
        if config.executable.trim().is_empty() {
            return Err(QueryBackendError::Spawn {
                executable: config.executable,
                detail: "executable is empty".to_string(),
            });
        }
        if config.timeout_ms == 0 {
            return Err(QueryBackendError::Timeout { timeout_ms: 0 });
        }
        Ok(Self { config })
    }
}

async fn spawn_with_text_file_busy_retry(
    command: &mut Command,
    executable: &str,
) -> Result<tokio::process::Child, QueryBackendError> {
    const MAX_TEXT_FILE_BUSY_RETRIES: u32 = 5;
    const TEXT_FILE_BUSY_ERRNO: i32 = 26;
    let mut attempt = 0;
    loop {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(error)
                if error.raw_os_error() == Some(TEXT_FILE_BUSY_ERRNO)
                    && attempt < MAX_TEXT_FILE_BUSY_RETRIES =>
            {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            Err(error) => {
                return Err(QueryBackendError::Spawn {
                    executable: executable.to_string(),
                    detail: error.to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl QueryBackend for ClaudeCliBackend {
    async fn run_query(&self, query: &str) -> Result<String, QueryBackendError> {
        let prompt = render_query_prompt(&self.config.account_ref, query);
        let mut command = Command::new(&self.config.executable);
        command.kill_on_drop(true);
        command.arg("-p");
        command.arg(prompt);
        command.arg("--output-format");
        command.arg("json");
        command.arg("--model");
        command.arg(&self.config.model);
        command.args(&self.config.extra_args);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        let child = spawn_with_text_file_busy_retry(&mut command, &self.config.executable).await?;

        let output = tokio::time::timeout(
            Duration::from_millis(self.config.timeout_ms),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| QueryBackendError::Timeout {
            timeout_ms: self.config.timeout_ms,
        })?
        .map_err(|error| QueryBackendError::ProcessFailed {
            status: "io".to_string(),
            summary: error.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            let status = output
                .status
                .code()
                .map(|value| value.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(QueryBackendError::ProcessFailed {
                status,
                summary: summarize_process_failure(&stderr, &stdout),
            });
        }

        let reply = extract_assistant_text(&stdout)?;
        if reply.trim().is_empty() {
            return Err(QueryBackendError::EmptyOutput);
        }
        Ok(reply)
    }
}

fn render_query_prompt(account_ref: &str, query: &str) -> String {
    [
        format!("Calendar account: {account_ref}"),
        "Answer the scheduling request below for this account.".to_string(),
        "Keep the reply short; it is shown in a chat window.".to_string(),
        "Request:".to_string(),
        query.trim().to_string(),
    ]
    .join("\n")
}

/// Accepts the CLI's JSON result object (or an array of events ending in
/// one); anything that is not JSON is taken as the reply verbatim.
fn extract_assistant_text(stdout: &str) -> Result<String, QueryBackendError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(message) = extract_error_message(&value) {
            return Err(QueryBackendError::ErrorPayload(message));
        }
        if let Some(result) = extract_result_message(&value) {
            return Ok(result);
        }
    }
    Ok(trimmed.to_string())
}

fn first_text_field(map: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        map.get(*key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    })
}

fn extract_error_message(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            if !map
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                return None;
            }
            Some(
                first_text_field(map, &["result", "error", "message"])
                    .unwrap_or_else(|| "backend reported an error".to_string()),
            )
        }
        Value::Array(entries) => entries.iter().find_map(extract_error_message),
        _ => None,
    }
}

fn extract_result_message(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => first_text_field(map, &["result"]),
        Value::Array(entries) => entries.iter().rev().find_map(extract_result_message),
        _ => None,
    }
}

fn summarize_process_failure(stderr: &str, stdout: &str) -> String {
    const MAX_CHARS: usize = 240;
    let text = [stderr.trim(), stdout.trim()]
        .into_iter()
        .find(|text| !text.is_empty())
        .unwrap_or("no error output");
    if text.chars().count() <= MAX_CHARS {
        return text.to_string();
    }
    text.chars().take(MAX_CHARS).collect::<String>() + "..."
}
