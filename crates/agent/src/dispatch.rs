//! Tool dispatch: argument validation, concurrent batching, and result
//! compression.
//!
//! Calls arrive in model order and results leave in the same order.
//! Consecutive calls whose catalog entries are marked independent run as
//! one concurrent group; a dependent call breaks the run and executes
//! alone in place. Every execution is fully wrapped: executor errors,
//! unknown tools, missing arguments, and timeouts all come back as
//! failure outcomes the model can read, never as dispatcher errors.

use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use taskloom_config::DispatchConfig;
use taskloom_core::tool::{ToolCall, ToolCatalog, ToolExecutor, ToolOutcome};
use tracing::{debug, warn};

/// The result of dispatching one tool call.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Call id, echoed into the tool-result message
    pub call_id: String,

    pub tool_name: String,

    /// The raw outcome, fed to escalation tracking
    pub outcome: ToolOutcome,

    /// Compressed JSON body for the conversation
    pub body: String,
}

/// Executes the tool calls of one assistant turn.
pub struct ToolDispatcher {
    executor: Arc<dyn ToolExecutor>,
    catalog: Arc<dyn ToolCatalog>,
    config: DispatchConfig,
}

impl ToolDispatcher {
    pub fn new(
        executor: Arc<dyn ToolExecutor>,
        catalog: Arc<dyn ToolCatalog>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            executor,
            catalog,
            config,
        }
    }

    /// Execute a batch of tool calls, preserving input order.
    pub async fn dispatch(&self, calls: &[ToolCall]) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::with_capacity(calls.len());
        let mut i = 0;

        while i < calls.len() {
            if self.catalog.is_independent(&calls[i].name) {
                let mut j = i + 1;
                while j < calls.len() && self.catalog.is_independent(&calls[j].name) {
                    j += 1;
                }
                let group = &calls[i..j];
                if group.len() > 1 {
                    debug!(count = group.len(), "Running independent tool calls concurrently");
                }
                let futures: Vec<_> = group.iter().map(|c| self.execute_one(c)).collect();
                outcomes.extend(join_all(futures).await);
                i = j;
            } else {
                outcomes.push(self.execute_one(&calls[i]).await);
                i += 1;
            }
        }

        outcomes
    }

    /// Run one call end to end: validate, execute under timeout, compress.
    async fn execute_one(&self, call: &ToolCall) -> DispatchOutcome {
        let outcome = self.guarded_execute(call).await;
        if !outcome.success {
            warn!(
                tool = %call.name,
                error = outcome.error.as_deref().unwrap_or(""),
                "Tool call failed"
            );
        }
        let body = self.compress(&call.name, &outcome);
        DispatchOutcome {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            outcome,
            body,
        }
    }

    async fn guarded_execute(&self, call: &ToolCall) -> ToolOutcome {
        let Some(spec) = self.catalog.get(&call.name) else {
            return ToolOutcome::failed(format!("Unknown tool: {}", call.name));
        };

        // Required arguments are checked before the executor sees the call.
        for param in &spec.required_params {
            let present = call
                .arguments
                .get(param)
                .map(|v| !v.is_null())
                .unwrap_or(false);
            if !present {
                return ToolOutcome::failed(format!(
                    "Missing required parameter '{param}' for tool '{}'",
                    call.name
                ));
            }
        }

        let timeout = Duration::from_secs(self.config.tool_timeout_secs);
        match tokio::time::timeout(timeout, self.executor.execute(call)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => ToolOutcome::failed(e.to_string()),
            Err(_) => ToolOutcome::failed(format!(
                "Tool '{}' timed out after {}s",
                call.name, self.config.tool_timeout_secs
            )),
        }
    }

    /// Compress an outcome into the JSON body stored in the conversation.
    /// The success flag and the error text always survive compression.
    fn compress(&self, tool_name: &str, outcome: &ToolOutcome) -> String {
        let limit = self
            .config
            .result_char_limits
            .get(tool_name)
            .copied()
            .unwrap_or(self.config.default_result_char_limit);

        let output = match tool_name {
            "shell" => compress_command_output(&outcome.output, limit),
            "file_read" => compress_file_content(&outcome.output, limit),
            "file_list" => compress_listing(&outcome.output, limit),
            "file_write" => head_chars(&outcome.output, limit),
            _ => {
                if outcome.output.chars().count() > limit {
                    format!("{}... (truncated)", head_chars(&outcome.output, limit))
                } else {
                    outcome.output.clone()
                }
            }
        };

        // errors keep their tail, where the actual failure usually is
        let error = outcome.error.as_ref().map(|e| {
            if e.chars().count() > limit {
                format!("...{}", tail_chars(e, limit))
            } else {
                e.clone()
            }
        });

        let mut body = json!({ "success": outcome.success, "output": output });
        if let Some(error) = error {
            body["error"] = json!(error);
        }
        body.to_string()
    }
}

/// Shell output: stderr-like failure text is handled by the error field,
/// so this samples stdout head + tail when the line count is high.
fn compress_command_output(output: &str, limit: usize) -> String {
    if output.chars().count() <= limit {
        return output.to_string();
    }
    let lines: Vec<&str> = output.lines().collect();
    if lines.len() > 10 {
        let head = lines[..3].join("\n");
        let tail = lines[lines.len() - 7..].join("\n");
        format!("{head}\n... ({} lines omitted) ...\n{tail}", lines.len() - 10)
    } else {
        format!("{}... (truncated)", head_chars(output, limit / 2))
    }
}

/// File content: head and tail of the file with an omission marker.
fn compress_file_content(content: &str, limit: usize) -> String {
    if content.chars().count() <= limit {
        return content.to_string();
    }
    let lines: Vec<&str> = content.lines().collect();
    if lines.len() > 30 {
        let head = lines[..15].join("\n");
        let tail = lines[lines.len() - 10..].join("\n");
        format!(
            "{head}\n\n... ({} lines omitted) ...\n\n{tail}",
            lines.len() - 25
        )
    } else {
        format!("{}\n... (truncated)", head_chars(content, limit))
    }
}

/// Directory listings: entry cap with an explicit omitted count.
fn compress_listing(listing: &str, limit: usize) -> String {
    if listing.chars().count() <= limit {
        return listing.to_string();
    }
    let entries: Vec<&str> = listing.lines().collect();
    if entries.len() > 30 {
        let shown = entries[..30].join("\n");
        format!("{shown}\n... ({} entries omitted)", entries.len() - 30)
    } else {
        format!("{}... (truncated)", head_chars(listing, limit))
    }
}

fn head_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn tail_chars(s: &str, max: usize) -> String {
    let count = s.chars().count();
    s.chars().skip(count.saturating_sub(max)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use taskloom_core::error::ToolError;
    use taskloom_core::tool::{StaticCatalog, ToolSpec};

    /// Executor that sleeps, fails on demand, and counts invocations.
    struct ScriptedExecutor {
        delay_ms: u64,
        invocations: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn new(delay_ms: u64) -> Self {
            Self {
                delay_ms,
                invocations: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ToolExecutor for ScriptedExecutor {
        async fn execute(&self, call: &ToolCall) -> Result<ToolOutcome, ToolError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if call.arguments.get("fail").is_some() {
                return Ok(ToolOutcome::failed("scripted failure"));
            }
            if call.arguments.get("explode").is_some() {
                return Err(ToolError::ExecutionFailed {
                    tool_name: call.name.clone(),
                    reason: "executor blew up".into(),
                });
            }
            Ok(ToolOutcome::ok(format!("done:{}", call.id)))
        }
    }

    fn catalog() -> Arc<StaticCatalog> {
        let spec = |name: &str, independent: bool, required: &[&str]| ToolSpec {
            name: name.into(),
            description: format!("{name} tool"),
            parameters: json!({ "type": "object" }),
            independent,
            required_params: required.iter().map(|s| s.to_string()).collect(),
        };
        Arc::new(StaticCatalog::new(vec![
            spec("file_read", true, &["path"]),
            spec("file_list", true, &[]),
            spec("shell", false, &["command"]),
            spec("file_write", false, &["path", "content"]),
        ]))
    }

    fn dispatcher(executor: Arc<ScriptedExecutor>) -> ToolDispatcher {
        ToolDispatcher::new(executor, catalog(), DispatchConfig::default())
    }

    fn read_call(id: &str, path: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: "file_read".into(),
            arguments: json!({ "path": path }),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn independent_calls_run_concurrently() {
        let executor = Arc::new(ScriptedExecutor::new(100));
        let dispatcher = dispatcher(executor.clone());

        let calls = vec![read_call("a", "x"), read_call("b", "y"), read_call("c", "z")];

        let start = tokio::time::Instant::now();
        let outcomes = dispatcher.dispatch(&calls).await;
        let elapsed = start.elapsed();

        assert_eq!(outcomes.len(), 3);
        assert_eq!(executor.invocations.load(Ordering::SeqCst), 3);
        // three 100ms calls joined, not chained
        assert!(elapsed < Duration::from_millis(250), "took {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn dependent_call_breaks_the_group() {
        let executor = Arc::new(ScriptedExecutor::new(100));
        let dispatcher = dispatcher(executor.clone());

        let calls = vec![
            read_call("a", "x"),
            ToolCall {
                id: "b".into(),
                name: "shell".into(),
                arguments: json!({ "command": "make" }),
            },
            read_call("c", "z"),
        ];

        let start = tokio::time::Instant::now();
        let outcomes = dispatcher.dispatch(&calls).await;
        let elapsed = start.elapsed();

        // serial shell in the middle forces three sequential slots
        assert!(elapsed >= Duration::from_millis(300), "took {elapsed:?}");
        let ids: Vec<&str> = outcomes.iter().map(|o| o.call_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn failing_sibling_does_not_affect_others() {
        let executor = Arc::new(ScriptedExecutor::new(0));
        let dispatcher = dispatcher(executor);

        let calls = vec![
            read_call("a", "x"),
            ToolCall {
                id: "b".into(),
                name: "file_read".into(),
                arguments: json!({ "path": "y", "fail": true }),
            },
            read_call("c", "z"),
        ];

        let outcomes = dispatcher.dispatch(&calls).await;
        assert!(outcomes[0].outcome.success);
        assert!(!outcomes[1].outcome.success);
        assert!(outcomes[2].outcome.success);
        assert_eq!(outcomes[2].outcome.output, "done:c");
    }

    #[tokio::test]
    async fn executor_error_becomes_failure_outcome() {
        let executor = Arc::new(ScriptedExecutor::new(0));
        let dispatcher = dispatcher(executor);

        let calls = vec![ToolCall {
            id: "a".into(),
            name: "file_read".into(),
            arguments: json!({ "path": "x", "explode": true }),
        }];

        let outcomes = dispatcher.dispatch(&calls).await;
        assert!(!outcomes[0].outcome.success);
        assert!(outcomes[0]
            .outcome
            .error
            .as_deref()
            .unwrap()
            .contains("executor blew up"));
    }

    #[tokio::test]
    async fn missing_required_param_skips_execution() {
        let executor = Arc::new(ScriptedExecutor::new(0));
        let dispatcher = dispatcher(executor.clone());

        let calls = vec![ToolCall {
            id: "a".into(),
            name: "file_write".into(),
            arguments: json!({ "path": "out.txt" }), // no content
        }];

        let outcomes = dispatcher.dispatch(&calls).await;
        assert!(!outcomes[0].outcome.success);
        assert!(outcomes[0]
            .outcome
            .error
            .as_deref()
            .unwrap()
            .contains("content"));
        assert_eq!(executor.invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_tool_fails_cleanly() {
        let executor = Arc::new(ScriptedExecutor::new(0));
        let dispatcher = dispatcher(executor.clone());

        let calls = vec![ToolCall {
            id: "a".into(),
            name: "teleport".into(),
            arguments: json!({}),
        }];

        let outcomes = dispatcher.dispatch(&calls).await;
        assert!(!outcomes[0].outcome.success);
        assert_eq!(executor.invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tool_times_out_into_failure() {
        let executor = Arc::new(ScriptedExecutor::new(10_000));
        let config = DispatchConfig {
            tool_timeout_secs: 1,
            ..DispatchConfig::default()
        };
        let dispatcher = ToolDispatcher::new(executor, catalog(), config);

        let calls = vec![read_call("a", "x")];
        let outcomes = dispatcher.dispatch(&calls).await;
        assert!(!outcomes[0].outcome.success);
        assert!(outcomes[0]
            .outcome
            .error
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn compression_preserves_success_and_error() {
        let executor = Arc::new(ScriptedExecutor::new(0));
        let dispatcher = dispatcher(executor);

        let calls = vec![ToolCall {
            id: "a".into(),
            name: "file_read".into(),
            arguments: json!({ "path": "y", "fail": true }),
        }];
        let outcomes = dispatcher.dispatch(&calls).await;

        let body: serde_json::Value = serde_json::from_str(&outcomes[0].body).unwrap();
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["error"], json!("scripted failure"));
    }

    #[test]
    fn long_file_content_samples_head_and_tail() {
        let content: String = (0..100)
            .map(|i| format!("line {i}\n"))
            .collect();
        let compressed = compress_file_content(&content, 200);
        assert!(compressed.contains("line 0"));
        assert!(compressed.contains("line 99"));
        assert!(compressed.contains("lines omitted"));
    }

    #[test]
    fn long_listing_caps_entries() {
        let listing: String = (0..80).map(|i| format!("entry-{i}\n")).collect();
        let compressed = compress_listing(&listing, 100);
        assert!(compressed.contains("entry-0"));
        assert!(compressed.contains("entries omitted"));
        assert!(!compressed.contains("entry-79"));
    }

    #[test]
    fn short_output_is_untouched() {
        assert_eq!(compress_command_output("ok", 2000), "ok");
        assert_eq!(compress_listing("a\nb", 2000), "a\nb");
    }
}
