use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::models::ToolCall;
use crate::config::{ExecutorKind, ExecutorSection};
use crate::errors::ExecutorError;

/// Marker that makes the mock executor fail a step.
pub const MOCK_FAIL_MARKER: &str = "[fail]";

/// One task step handed to an executor.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub run_id: String,
    pub session_id: String,
    pub step_order: u32,
    pub action: String,
    pub expected_outcome: Option<String>,
    pub tool: Option<String>,
}

/// What an executor returns for a successful step.
///
/// `output` is only used when the executor streamed no chunks at all.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub output: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Abstraction over the thing that performs a task step.
/// Real implementation: `CommandExecutor`. Demo/test double: `MockExecutor`.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Identifies this executor in step records.
    fn source(&self) -> &str;

    fn model(&self) -> Option<String> {
        None
    }

    /// Run one step, sending partial output on `chunks` as it is produced.
    async fn execute(
        &self,
        request: &StepRequest,
        chunks: mpsc::UnboundedSender<String>,
    ) -> Result<StepOutput, ExecutorError>;
}

/// Build the executor selected by configuration.
pub fn build_executor(config: &ExecutorSection) -> Result<Arc<dyn StepExecutor>> {
    match config.kind {
        ExecutorKind::Mock => Ok(Arc::new(
            MockExecutor::new(Duration::from_millis(config.mock_chunk_delay_ms))
                .with_model(config.model.clone()),
        )),
        ExecutorKind::Command => {
            let command = config
                .command
                .clone()
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| anyhow::anyhow!("executor.command is not configured"))?;
            Ok(Arc::new(
                CommandExecutor::new(command, config.args.clone()).with_model(config.model.clone()),
            ))
        }
    }
}

// ── Mock executor ────────────────────────────────────────────────────

/// Streams the step action back word by word.
pub struct MockExecutor {
    delay: Duration,
    model: Option<String>,
}

impl MockExecutor {
    pub fn new(delay: Duration) -> Self {
        Self { delay, model: None }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }
}

#[async_trait]
impl StepExecutor for MockExecutor {
    fn source(&self) -> &str {
        "mock"
    }

    fn model(&self) -> Option<String> {
        self.model.clone()
    }

    async fn execute(
        &self,
        request: &StepRequest,
        chunks: mpsc::UnboundedSender<String>,
    ) -> Result<StepOutput, ExecutorError> {
        for word in request.action.split_inclusive(' ') {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            // Receiver gone means the engine stopped listening; nothing to do
            let _ = chunks.send(word.to_string());
        }

        if request.action.contains(MOCK_FAIL_MARKER) {
            return Err(ExecutorError::Failed(format!(
                "Mock failure requested by step {}",
                request.step_order
            )));
        }

        let tool_calls = request
            .tool
            .iter()
            .map(|tool| ToolCall {
                name: tool.clone(),
                arguments: serde_json::json!({ "action": request.action }),
                result: Some(serde_json::json!("ok")),
                error: None,
            })
            .collect();

        Ok(StepOutput {
            output: String::new(),
            tool_calls,
        })
    }
}

// ── Command executor ─────────────────────────────────────────────────

/// A parsed line of executor stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Chunk(String),
    ToolCall(ToolCall),
}

pub struct OutputParser;

impl OutputParser {
    /// Parse a single stdout line.
    ///
    /// JSON objects with `"type": "tool_call"` and a `name` become tool call
    /// records. Everything else, including malformed JSON, is output text and
    /// keeps its trailing newline.
    pub fn parse_line(line: &str) -> ParsedLine {
        let trimmed = line.trim();
        if trimmed.starts_with('{')
            && let Ok(parsed) = serde_json::from_str::<serde_json::Value>(trimmed)
            && parsed.get("type").and_then(|t| t.as_str()) == Some("tool_call")
            && let Some(name) = parsed.get("name").and_then(|n| n.as_str())
        {
            return ParsedLine::ToolCall(ToolCall {
                name: name.to_string(),
                arguments: parsed
                    .get("arguments")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
                result: parsed.get("result").cloned(),
                error: parsed
                    .get("error")
                    .and_then(|e| e.as_str())
                    .map(str::to_string),
            });
        }
        ParsedLine::Chunk(format!("{}\n", line))
    }
}

/// Spawns an external program per task step.
///
/// The action is passed as the last argument and the tool reference in
/// `PLAN_RUNNER_TOOL`. Stdout lines stream as output chunks.
pub struct CommandExecutor {
    command: String,
    args: Vec<String>,
    model: Option<String>,
}

impl CommandExecutor {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            model: None,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }
}

#[async_trait]
impl StepExecutor for CommandExecutor {
    fn source(&self) -> &str {
        "command"
    }

    fn model(&self) -> Option<String> {
        self.model.clone()
    }

    async fn execute(
        &self,
        request: &StepRequest,
        chunks: mpsc::UnboundedSender<String>,
    ) -> Result<StepOutput, ExecutorError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .arg(&request.action)
            .env("PLAN_RUNNER_TOOL", request.tool.as_deref().unwrap_or(""))
            .env("PLAN_RUNNER_RUN_ID", &request.run_id)
            .env("PLAN_RUNNER_SESSION_ID", &request.session_id)
            .env("PLAN_RUNNER_STEP_ORDER", request.step_order.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        // Drain stderr concurrently so a chatty child can't block on a full pipe
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut content = Vec::new();
                if let Err(e) = stderr.read_to_end(&mut content).await {
                    tracing::warn!(error = %e, "failed to read executor stderr");
                }
                String::from_utf8_lossy(&content).into_owned()
            })
        });

        let mut tool_calls = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                if reader.read_until(b'\n', &mut buf).await? == 0 {
                    break;
                }
                // Invalid UTF-8 is replaced rather than failing the step
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                match OutputParser::parse_line(line) {
                    ParsedLine::Chunk(chunk) => {
                        let _ = chunks.send(chunk);
                    }
                    ParsedLine::ToolCall(call) => tool_calls.push(call),
                }
            }
        }

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            tracing::warn!(
                command = %self.command,
                step_order = request.step_order,
                exit_code = ?status.code(),
                "executor command failed"
            );
            return Err(ExecutorError::NonZeroExit {
                exit_code: status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(StepOutput {
            output: String::new(),
            tool_calls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(action: &str) -> StepRequest {
        StepRequest {
            run_id: "r-1".into(),
            session_id: "s-1".into(),
            step_order: 1,
            action: action.into(),
            expected_outcome: None,
            tool: None,
        }
    }

    fn collect(mut rx: mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            out.push(chunk);
        }
        out
    }

    #[test]
    fn test_parse_line_plain_text() {
        assert_eq!(
            OutputParser::parse_line("hello world"),
            ParsedLine::Chunk("hello world\n".into())
        );
    }

    #[test]
    fn test_parse_line_tool_call() {
        let line = r#"{"type":"tool_call","name":"search","arguments":{"q":"rust"},"result":["a"]}"#;
        match OutputParser::parse_line(line) {
            ParsedLine::ToolCall(call) => {
                assert_eq!(call.name, "search");
                assert_eq!(call.arguments["q"], "rust");
                assert_eq!(call.result, Some(serde_json::json!(["a"])));
                assert!(call.error.is_none());
            }
            other => panic!("Expected ToolCall, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_line_other_json_is_output() {
        let line = r#"{"type":"thinking","content":"hm"}"#;
        assert!(matches!(OutputParser::parse_line(line), ParsedLine::Chunk(_)));
    }

    #[test]
    fn test_parse_line_tool_call_without_name_is_output() {
        let line = r#"{"type":"tool_call"}"#;
        assert!(matches!(OutputParser::parse_line(line), ParsedLine::Chunk(_)));
    }

    #[test]
    fn test_parse_line_malformed_json() {
        assert_eq!(
            OutputParser::parse_line("{not json"),
            ParsedLine::Chunk("{not json\n".into())
        );
    }

    #[tokio::test]
    async fn test_mock_executor_chunks_concatenate_to_action() {
        let executor = MockExecutor::new(Duration::ZERO);
        let (tx, rx) = mpsc::unbounded_channel();
        executor.execute(&request("collect the data"), tx).await.unwrap();
        let chunks = collect(rx);
        assert_eq!(chunks, vec!["collect ", "the ", "data"]);
        assert_eq!(chunks.concat(), "collect the data");
    }

    #[tokio::test]
    async fn test_mock_executor_fail_marker() {
        let executor = MockExecutor::new(Duration::ZERO);
        let (tx, rx) = mpsc::unbounded_channel();
        let err = executor.execute(&request("publish [fail]"), tx).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Failed(_)));
        // Partial output was still streamed
        assert_eq!(collect(rx).concat(), "publish [fail]");
    }

    #[tokio::test]
    async fn test_mock_executor_records_tool_call() {
        let executor = MockExecutor::new(Duration::ZERO).with_model(Some("m-1".into()));
        let mut req = request("search");
        req.tool = Some("web_search".into());
        let (tx, _rx) = mpsc::unbounded_channel();
        let output = executor.execute(&req, tx).await.unwrap();
        assert_eq!(output.tool_calls.len(), 1);
        assert_eq!(output.tool_calls[0].name, "web_search");
        assert_eq!(executor.model().as_deref(), Some("m-1"));
        assert_eq!(executor.source(), "mock");
    }

    #[test]
    fn test_build_executor_requires_command() {
        let mut config = ExecutorSection::default();
        assert_eq!(build_executor(&config).unwrap().source(), "mock");
        config.kind = ExecutorKind::Command;
        assert!(build_executor(&config).is_err());
        config.command = Some("sh".into());
        assert_eq!(build_executor(&config).unwrap().source(), "command");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_executor_streams_lines_and_tool_calls() {
        let script = r#"echo "start $1"; echo '{"type":"tool_call","name":"lookup","arguments":{}}'; echo "tool=$PLAN_RUNNER_TOOL""#;
        let executor =
            CommandExecutor::new("sh", vec!["-c".into(), script.into(), "sh".into()]);
        let mut req = request("collect");
        req.tool = Some("db".into());
        let (tx, rx) = mpsc::unbounded_channel();
        let output = executor.execute(&req, tx).await.unwrap();
        assert_eq!(collect(rx).concat(), "start collect\ntool=db\n");
        assert_eq!(output.tool_calls.len(), 1);
        assert_eq!(output.tool_calls[0].name, "lookup");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_executor_non_zero_exit_keeps_stderr() {
        let executor = CommandExecutor::new(
            "sh",
            vec!["-c".into(), "echo partial; echo broken >&2; exit 3".into(), "sh".into()],
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let err = executor.execute(&request("x"), tx).await.unwrap_err();
        match err {
            ExecutorError::NonZeroExit { exit_code, stderr } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr, "broken");
            }
            other => panic!("Expected NonZeroExit, got {:?}", other),
        }
        assert_eq!(collect(rx).concat(), "partial\n");
    }

    #[tokio::test]
    async fn test_command_executor_spawn_failure() {
        let executor = CommandExecutor::new("/definitely/not/a/real/binary", vec![]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = executor.execute(&request("x"), tx).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_executor_tolerates_invalid_utf8() {
        let executor = CommandExecutor::new(
            "sh",
            vec![
                "-c".into(),
                r"printf 'ok \377 line\n'; printf 'bad \377\n' >&2; exit 1".into(),
                "sh".into(),
            ],
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let err = executor.execute(&request("x"), tx).await.unwrap_err();
        match err {
            ExecutorError::NonZeroExit { exit_code, stderr } => {
                assert_eq!(exit_code, 1);
                assert_eq!(stderr, "bad \u{FFFD}");
            }
            other => panic!("Expected NonZeroExit, got {:?}", other),
        }
        assert_eq!(collect(rx).concat(), "ok \u{FFFD} line\n");
    }
}
