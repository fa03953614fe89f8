//! Tool call execution over a subprocess's stdin/stdout
//!
//! Each call spawns the owning server as a child process, performs the
//! initialize/initialized handshake, issues one tools/call request, and
//! tears the child down. The child is terminated on every exit path:
//! success, protocol error, timeout, and mid-handshake I/O failure alike.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::{timeout, timeout_at, Instant};

use crate::config::ToolServerConfig;

use super::extract::ToolCallExtractor;
use super::schema::ToolSchemaRegistry;
use super::validate::ToolCallValidator;
use super::{ExecutionResult, Stage, ToolCall};

/// Protocol version advertised during the handshake
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Timeouts and budgets for one protocol exchange
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Wall-clock budget for the initialization response
    pub init_timeout: Duration,
    /// Wall-clock budget for the tool call response (tools are slower)
    pub call_timeout: Duration,
    /// Maximum stdout lines inspected per response before giving up
    pub max_response_lines: usize,
    /// Grace period between SIGTERM and SIGKILL at teardown
    pub kill_grace: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            max_response_lines: 10,
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// Executes tool calls against subprocess tool servers
pub struct ToolCallExecutor {
    registry: ToolSchemaRegistry,
    servers: BTreeMap<String, ToolServerConfig>,
    extractor: ToolCallExtractor,
    config: ExecutorConfig,
}

impl ToolCallExecutor {
    pub fn new(
        registry: ToolSchemaRegistry,
        servers: BTreeMap<String, ToolServerConfig>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            servers,
            extractor: ToolCallExtractor::new(),
            config,
        }
    }

    pub fn registry(&self) -> &ToolSchemaRegistry {
        &self.registry
    }

    /// Execute a single tool call.
    ///
    /// Validates the call, resolves the owning server's executable, runs
    /// the stdio protocol, and unconditionally terminates the child before
    /// returning.
    pub async fn execute(&self, call: &ToolCall) -> ExecutionResult {
        let validator = ToolCallValidator::new(&self.registry);
        if let Err(err) = validator.validate(call) {
            tracing::warn!(tool = %call.name, %err, "Validation failed");
            return ExecutionResult::failure(&call.name, err.stage(), err.to_string());
        }

        let Some(server) = self.registry.server_for(&call.name) else {
            return ExecutionResult::failure(
                &call.name,
                Stage::Routing,
                format!("unknown tool: {}", call.name),
            );
        };

        let Some(server_config) = self.servers.get(server) else {
            return ExecutionResult::failure(
                &call.name,
                Stage::Routing,
                format!("no configured executable for server '{}'", server),
            );
        };

        let path = match expand_path(&server_config.path) {
            Ok(path) => path,
            Err(err) => {
                return ExecutionResult::failure(&call.name, Stage::Execution, err);
            }
        };
        if !path.exists() {
            return ExecutionResult::failure(
                &call.name,
                Stage::Execution,
                format!("server executable not found: {}", path.display()),
            );
        }

        tracing::info!(tool = %call.name, server, path = %path.display(), "Executing tool call");

        let mut command = Command::new(&path);
        command
            .args(&server_config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &server_config.env {
            let expanded = shellexpand::env(value).unwrap_or_else(|_| value.clone().into());
            command.env(key, expanded.as_ref());
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return ExecutionResult::failure(
                    &call.name,
                    Stage::Execution,
                    format!("failed to spawn server '{}': {}", server, err),
                );
            }
        };

        let outcome = self.drive_protocol(&mut child, call).await;

        // Teardown happens regardless of how the exchange ended.
        self.terminate(&mut child).await;

        match outcome {
            Ok(result) => {
                tracing::info!(tool = %call.name, "Tool executed successfully");
                ExecutionResult::success(&call.name, result)
            }
            Err((stage, message)) => {
                tracing::warn!(tool = %call.name, %stage, message = %message, "Tool execution failed");
                ExecutionResult::failure(&call.name, stage, message)
            }
        }
    }

    /// Extract, validate, and execute every tool call found in raw text.
    ///
    /// Invalid calls are recorded as validation failures and skipped without
    /// aborting the batch. Valid calls run sequentially so subprocess use is
    /// bounded and result order matches extraction order; the returned vector
    /// has one entry per extracted call.
    pub async fn execute_batch(&self, text: &str) -> Vec<ExecutionResult> {
        let mut calls = self.extractor.extract(text);
        if calls.is_empty() {
            let inferred = self.extractor.infer_from_reasoning(text);
            if !inferred.is_empty() {
                tracing::warn!(
                    count = inferred.len(),
                    "No structured tool calls found, using reasoning-text inference"
                );
                calls = inferred;
            }
        }

        if calls.is_empty() {
            tracing::info!("No tool calls found in text");
            return Vec::new();
        }

        tracing::info!(count = calls.len(), "Executing tool call batch");

        let validator = ToolCallValidator::new(&self.registry);
        let mut results = Vec::with_capacity(calls.len());
        for call in &calls {
            match validator.validate(call) {
                Err(err) => {
                    tracing::warn!(tool = %call.name, %err, "Skipping invalid tool call");
                    results.push(ExecutionResult::failure(
                        &call.name,
                        err.stage(),
                        err.to_string(),
                    ));
                }
                Ok(()) => results.push(self.execute(call).await),
            }
        }

        results
    }

    /// Run the initialize/initialized/tools-call exchange.
    async fn drive_protocol(
        &self,
        child: &mut Child,
        call: &ToolCall,
    ) -> Result<Value, (Stage, String)> {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| (Stage::Exception, "child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| (Stage::Exception, "child stdout unavailable".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let init_request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "clientInfo": {
                    "name": "deskhub",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            },
        });
        write_frame(&mut stdin, &init_request)
            .await
            .map_err(|e| (Stage::Exception, format!("failed to send initialize: {}", e)))?;

        let init_response = self
            .read_response(&mut lines, self.config.init_timeout)
            .await?
            .ok_or_else(|| {
                (
                    Stage::Execution,
                    "no valid initialization response from server".to_string(),
                )
            })?;
        if let Some(error) = init_response.get("error") {
            return Err((
                Stage::Execution,
                format!("initialization failed: {}", error),
            ));
        }

        let initialized = json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
        });
        write_frame(&mut stdin, &initialized)
            .await
            .map_err(|e| (Stage::Exception, format!("failed to send initialized: {}", e)))?;

        let tool_request = json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": {
                "name": call.name,
                "arguments": call.arguments,
            },
        });
        write_frame(&mut stdin, &tool_request)
            .await
            .map_err(|e| (Stage::Exception, format!("failed to send tool call: {}", e)))?;

        let tool_response = self
            .read_response(&mut lines, self.config.call_timeout)
            .await?
            .ok_or_else(|| {
                (
                    Stage::Execution,
                    "no valid response from server for tool call".to_string(),
                )
            })?;

        if let Some(result) = tool_response.get("result") {
            Ok(result.clone())
        } else {
            let message = tool_response
                .get("error")
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            Err((Stage::Execution, message))
        }
    }

    /// Read stdout lines until a JSON object appears, a budget runs out,
    /// or the stream ends. Non-JSON lines (server logs) are skipped.
    async fn read_response(
        &self,
        lines: &mut Lines<BufReader<ChildStdout>>,
        budget: Duration,
    ) -> Result<Option<Value>, (Stage, String)> {
        let deadline = Instant::now() + budget;

        for _ in 0..self.config.max_response_lines {
            let line = match timeout_at(deadline, lines.next_line()).await {
                Err(_) => return Ok(None), // wall-clock budget exhausted
                Ok(Err(err)) => {
                    return Err((Stage::Exception, format!("error reading from server: {}", err)));
                }
                Ok(Ok(None)) => return Ok(None), // stdout closed
                Ok(Ok(Some(line))) => line,
            };

            let trimmed = line.trim();
            if !trimmed.starts_with('{') {
                tracing::debug!(line = trimmed, "Skipping non-JSON server output");
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) if value.is_object() => return Ok(Some(value)),
                _ => {
                    tracing::debug!(line = trimmed, "Skipping unparseable server output");
                    continue;
                }
            }
        }

        Ok(None) // line budget exhausted
    }

    /// Terminate the child: graceful signal first, then a hard kill.
    async fn terminate(&self, child: &mut Child) {
        if let Ok(Some(_)) = child.try_wait() {
            return; // already exited
        }

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            if timeout(self.config.kill_grace, child.wait()).await.is_ok() {
                return;
            }
            tracing::warn!(pid, "Server did not exit after SIGTERM, killing");
        }

        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

/// Expand `~` and environment variables in a configured executable path.
fn expand_path(path: &str) -> Result<PathBuf, String> {
    shellexpand::full(path)
        .map(|expanded| PathBuf::from(expanded.as_ref()))
        .map_err(|e| format!("invalid server path '{}': {}", path, e))
}

async fn write_frame(stdin: &mut ChildStdin, value: &Value) -> std::io::Result<()> {
    let mut data = serde_json::to_string(value).map_err(std::io::Error::other)?;
    data.push('\n');
    stdin.write_all(data.as_bytes()).await?;
    stdin.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::pid_alive;
    use serde_json::{json, Map};
    use std::path::Path;

    fn write_server_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn server_config(name: &str, path: &Path) -> ToolServerConfig {
        ToolServerConfig {
            name: name.to_string(),
            path: path.to_string_lossy().into_owned(),
            args: vec![],
            env: Default::default(),
            port: None,
            description: String::new(),
            enabled: true,
            auto_start: false,
            capabilities: vec![],
            tools: vec![],
            restart_on_failure: false,
            max_restart_attempts: 3,
            process_id: None,
        }
    }

    fn executor_for(server: &str, path: &Path) -> ToolCallExecutor {
        let mut servers = BTreeMap::new();
        servers.insert(server.to_string(), server_config(server, path));
        ToolCallExecutor::new(
            ToolSchemaRegistry::builtin(),
            servers,
            ExecutorConfig {
                init_timeout: Duration::from_secs(2),
                call_timeout: Duration::from_secs(2),
                max_response_lines: 10,
                kill_grace: Duration::from_millis(500),
            },
        )
    }

    fn call(name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall::new(name, args.as_object().cloned().unwrap_or_else(Map::new))
    }

    const WELL_BEHAVED: &str = r#"echo "word_editor server starting"
read line
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05"}}'
read line
read line
echo '{"jsonrpc":"2.0","id":2,"result":{"ok":true}}'"#;

    #[tokio::test]
    async fn test_execute_success_skips_log_lines() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_server_script(dir.path(), "server.sh", WELL_BEHAVED);
        let executor = executor_for("word_editor", &script);

        let result = executor.execute(&call("set_text", json!({"text": "hi"}))).await;
        assert!(result.success, "unexpected failure: {:?}", result.error);
        assert_eq!(result.result.unwrap()["ok"], json!(true));
    }

    #[tokio::test]
    async fn test_execute_tool_reported_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_server_script(
            dir.path(),
            "server.sh",
            r#"read line
echo '{"jsonrpc":"2.0","id":1,"result":{}}'
read line
read line
echo '{"jsonrpc":"2.0","id":2,"error":{"code":-32000,"message":"boom"}}'"#,
        );
        let executor = executor_for("word_editor", &script);

        let result = executor.execute(&call("get_text", json!({}))).await;
        assert!(!result.success);
        assert_eq!(result.stage, Some(Stage::Execution));
        assert!(result.error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_handshake_timeout_kills_server() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("server.pid");
        let script = write_server_script(
            dir.path(),
            "server.sh",
            &format!("echo $$ > {}\nexec sleep 30", pid_file.display()),
        );
        let mut executor = executor_for("word_editor", &script);
        executor.config.init_timeout = Duration::from_millis(300);

        let result = executor.execute(&call("get_text", json!({}))).await;
        assert!(!result.success);
        assert_eq!(result.stage, Some(Stage::Execution));
        assert!(result
            .error
            .unwrap()
            .contains("no valid initialization response"));

        let pid: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(!pid_alive(pid), "server process should have been terminated");
    }

    #[tokio::test]
    async fn test_execute_missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor_for("word_editor", &dir.path().join("nonexistent"));

        let result = executor.execute(&call("get_text", json!({}))).await;
        assert!(!result.success);
        assert_eq!(result.stage, Some(Stage::Execution));
        assert!(result.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_execute_unknown_tool_is_routing_failure() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_server_script(dir.path(), "server.sh", WELL_BEHAVED);
        let executor = executor_for("word_editor", &script);

        let result = executor.execute(&call("no_such_tool", json!({}))).await;
        assert!(!result.success);
        assert_eq!(result.stage, Some(Stage::Routing));
    }

    #[tokio::test]
    async fn test_batch_skips_invalid_call_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_server_script(dir.path(), "server.sh", WELL_BEHAVED);
        let executor = executor_for("word_editor", &script);

        let text = concat!(
            "```json\n{\"name\":\"set_text\",\"arguments\":{\"text\":\"a\"}}\n```\n",
            "```json\n{\"name\":\"save_file\",\"arguments\":{}}\n```\n",
            "```json\n{\"name\":\"get_text\",\"arguments\":{}}\n```",
        );

        let results = executor.execute_batch(text).await;
        assert_eq!(results.len(), 3);

        assert!(results[0].success);
        assert_eq!(results[0].tool.as_deref(), Some("set_text"));

        assert!(!results[1].success);
        assert_eq!(results[1].stage, Some(Stage::Validation));
        assert!(results[1].error.as_ref().unwrap().contains("file_path"));

        assert!(results[2].success);
        assert_eq!(results[2].tool.as_deref(), Some("get_text"));
    }

    #[tokio::test]
    async fn test_batch_empty_text() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_server_script(dir.path(), "server.sh", WELL_BEHAVED);
        let executor = executor_for("word_editor", &script);

        assert!(executor.execute_batch("nothing to see here").await.is_empty());
    }
}
