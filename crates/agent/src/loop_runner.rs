//! The run loop: consult the model, dispatch tool calls, feed results
//! back, repeat until a final answer or a terminal condition.
//!
//! Every terminal path produces user-facing text. Model errors, stops,
//! stagnation, and budget exhaustion all come back as a `RunOutcome`,
//! never as an error the caller has to interpret.

use crate::context::ContextWindowManager;
use crate::decompose::{ParallelDecomposer, Subtask, compute_waves};
use crate::dispatch::ToolDispatcher;
use crate::escalation::{EscalationState, call_signature};
use futures::future::BoxFuture;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use taskloom_config::AppConfig;
use taskloom_core::error::ProviderError;
use taskloom_core::message::{Conversation, Message};
use taskloom_core::policy::{PolicyProvider, TaskPolicy};
use taskloom_core::provider::{ChatRequest, ChatResponse, ChatService, ToolDefinition};
use taskloom_core::step::{AgentEvent, AgentStep, StepBus, StepKind};
use taskloom_core::tool::{ToolCall, ToolCatalog, ToolExecutor};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-run options supplied by the caller.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Policy lookup key
    pub task_class: String,

    /// Whether to try splitting the task into parallel subtasks first
    pub decompose: bool,

    /// Image attachments forwarded with every model request
    pub images: Vec<taskloom_core::provider::ImageAttachment>,

    /// Iteration budget override (None = configured default)
    pub max_iterations: Option<u32>,

    /// Whether the one-shot budget extension may be granted
    pub allow_auto_extend: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            task_class: "default".into(),
            decompose: false,
            images: vec![],
            max_iterations: None,
            allow_auto_extend: true,
        }
    }
}

/// How a run ended. Every variant carries the user-facing text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The model produced a final answer
    Done(String),
    /// Stopped cooperatively by the caller
    Stopped(String),
    /// Stagnation persisted after every escalation
    Stuck(String),
    /// Iteration budget spent (including the extension)
    Exhausted(String),
    /// The model could not be reached
    Failed(String),
}

impl RunOutcome {
    pub fn text(&self) -> &str {
        match self {
            Self::Done(t)
            | Self::Stopped(t)
            | Self::Stuck(t)
            | Self::Exhausted(t)
            | Self::Failed(t) => t,
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Self::Done(t)
            | Self::Stopped(t)
            | Self::Stuck(t)
            | Self::Exhausted(t)
            | Self::Failed(t) => t,
        }
    }
}

/// The result of one run: outcome plus the full step log.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub steps: Vec<AgentStep>,
}

/// Append-only step log that mirrors every record onto the bus.
struct StepLog {
    run_id: String,
    bus: StepBus,
    steps: Vec<AgentStep>,
    seq: u64,
}

impl StepLog {
    fn new(run_id: String, bus: StepBus) -> Self {
        Self {
            run_id,
            bus,
            steps: Vec::new(),
            seq: 0,
        }
    }

    fn step(&mut self, kind: StepKind, content: impl Into<String>) -> AgentStep {
        let step = AgentStep::new(self.seq, kind, content);
        self.seq += 1;
        step
    }

    fn record(&mut self, step: AgentStep) {
        self.bus.publish(AgentEvent::Step {
            run_id: self.run_id.clone(),
            step: step.clone(),
        });
        self.steps.push(step);
    }

    fn emit(&mut self, kind: StepKind, content: impl Into<String>) {
        let step = self.step(kind, content);
        self.record(step);
    }
}

/// The orchestration engine for one task at a time.
#[derive(Clone)]
pub struct AgentLoop {
    chat: Arc<dyn ChatService>,
    executor: Arc<dyn ToolExecutor>,
    catalog: Arc<dyn ToolCatalog>,
    policy: Arc<dyn PolicyProvider>,
    config: AppConfig,
    bus: StepBus,
    stop: Arc<AtomicBool>,
}

impl AgentLoop {
    pub fn new(
        chat: Arc<dyn ChatService>,
        executor: Arc<dyn ToolExecutor>,
        catalog: Arc<dyn ToolCatalog>,
        policy: Arc<dyn PolicyProvider>,
        config: AppConfig,
    ) -> Self {
        Self {
            chat,
            executor,
            catalog,
            policy,
            config,
            bus: StepBus::default(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attach a shared step bus for observers.
    pub fn with_bus(mut self, bus: StepBus) -> Self {
        self.bus = bus;
        self
    }

    /// Attach a shared cooperative stop flag (see `RunRegistry`).
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = flag;
        self
    }

    pub fn bus(&self) -> &StepBus {
        &self.bus
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Run a task to completion.
    ///
    /// The future is boxed so the recursion through decomposition waves
    /// carries a declared `Send` bound instead of an inferred one.
    pub fn run(&self, task: &str, options: RunOptions) -> BoxFuture<'_, RunReport> {
        let task = task.to_string();
        Box::pin(async move { self.run_inner(&task, options).await })
    }

    async fn run_inner(&self, task: &str, options: RunOptions) -> RunReport {
        let run_id = Uuid::new_v4().to_string();
        let policy = self.policy.policy_for(&options.task_class);
        let mut log = StepLog::new(run_id.clone(), self.bus.clone());

        info!(run_id = %run_id, task_class = %options.task_class, "Run started");

        let outcome = if options.decompose {
            match self.run_decomposed(task, &options, &policy, &mut log).await {
                Some(outcome) => outcome,
                None => self.run_loop(task, &options, &policy, &mut log).await,
            }
        } else {
            self.run_loop(task, &options, &policy, &mut log).await
        };

        info!(run_id = %run_id, outcome = ?outcome_kind(&outcome), "Run finished");
        RunReport {
            run_id,
            outcome,
            steps: log.steps,
        }
    }

    // ── Decomposition pass ──

    /// Try running the task as parallel subtask waves. Returns `None`
    /// when the plan degenerates to a single subtask; the caller then
    /// falls through to the ordinary loop.
    async fn run_decomposed(
        &self,
        task: &str,
        options: &RunOptions,
        policy: &TaskPolicy,
        log: &mut StepLog,
    ) -> Option<RunOutcome> {
        let decomposer =
            ParallelDecomposer::new(self.chat.clone(), self.config.decompose.clone());
        let model = policy.tiers.binding(0).model.clone();

        let plan = decomposer.plan(&model, task).await;
        if plan.len() <= 1 {
            debug!("Plan has a single subtask, running the task directly");
            return None;
        }

        let outline: Vec<String> = plan
            .iter()
            .map(|s| format!("[{}] {}", s.id, s.description))
            .collect();
        log.emit(
            StepKind::Plan,
            format!("Split into {} subtasks:\n{}", plan.len(), outline.join("\n")),
        );

        let waves = compute_waves(&plan);
        let mut result_by_id: HashMap<String, String> = HashMap::new();

        for (wave_idx, wave) in waves.iter().enumerate() {
            if self.stop_requested() {
                let text = "Stopped by user request.".to_string();
                log.emit(StepKind::Terminal, &text);
                return Some(RunOutcome::Stopped(text));
            }

            if wave.len() > 1 {
                info!(
                    wave = wave_idx + 1,
                    subtasks = wave.len(),
                    "Running subtask wave concurrently"
                );
            }

            let reports = self.run_wave(wave, options).await;
            for (subtask, report) in wave.iter().zip(reports) {
                let text = match report.outcome {
                    RunOutcome::Failed(t) => {
                        warn!(subtask = %subtask.id, "Subtask failed");
                        format!("Subtask '{}' failed: {t}", subtask.id)
                    }
                    other => other.into_text(),
                };
                result_by_id.insert(subtask.id.clone(), text);
            }
        }

        let ordered: Vec<String> = plan
            .iter()
            .map(|s| result_by_id.get(&s.id).cloned().unwrap_or_default())
            .collect();
        let merged = decomposer.merge(&model, task, &ordered).await;
        log.emit(StepKind::Terminal, &merged);
        Some(RunOutcome::Done(merged))
    }

    /// Run one wave of subtasks; two or more run concurrently as child
    /// loops with fresh conversations and a reduced budget.
    async fn run_wave(&self, wave: &[Subtask], options: &RunOptions) -> Vec<RunReport> {
        let child_options = RunOptions {
            task_class: options.task_class.clone(),
            decompose: false,
            images: vec![],
            max_iterations: Some(self.config.decompose.subtask_max_iterations),
            allow_auto_extend: false,
        };

        let futures: Vec<BoxFuture<'static, RunReport>> = wave
            .iter()
            .map(|subtask| {
                let child = self.clone();
                let description = subtask.description.clone();
                let opts = child_options.clone();
                let fut: BoxFuture<'static, RunReport> =
                    Box::pin(async move { child.run(&description, opts).await });
                fut
            })
            .collect();

        futures::future::join_all(futures).await
    }

    // ── Main loop ──

    async fn run_loop(
        &self,
        task: &str,
        options: &RunOptions,
        policy: &TaskPolicy,
        log: &mut StepLog,
    ) -> RunOutcome {
        let mut conversation = Conversation::new(&policy.system_prompt);
        conversation.push(Message::user(task));

        let context = ContextWindowManager::new(self.config.context.clone());
        let dispatcher = ToolDispatcher::new(
            self.executor.clone(),
            self.catalog.clone(),
            self.config.dispatch.clone(),
        );
        let tiers = &policy.tiers;
        let mut esc = EscalationState::new(self.config.escalation.clone(), tiers.max_hops());

        let tool_defs: Vec<ToolDefinition> = self
            .catalog
            .specs()
            .iter()
            .filter(|s| policy.allows_tool(&s.name))
            .map(|s| s.to_definition())
            .collect();

        let mut budget = options
            .max_iterations
            .unwrap_or(self.config.engine.max_iterations);
        let mut extended = false;
        let mut iteration: u32 = 0;

        loop {
            if iteration >= budget {
                let extension = self.config.engine.iteration_extension;
                if options.allow_auto_extend
                    && !extended
                    && extension > 0
                    && !self.stop_requested()
                    && !esc.is_stuck()
                {
                    extended = true;
                    budget += extension;
                    info!(extension, "Iteration budget reached, granting extension");
                    log.emit(
                        StepKind::Thought,
                        format!(
                            "Reached the {} iteration limit, adding {extension} more to finish up...",
                            budget - extension
                        ),
                    );
                    continue;
                }
                let text = "Iteration limit reached. The task is too complex; try splitting it into subtasks.".to_string();
                log.emit(StepKind::Terminal, &text);
                return RunOutcome::Exhausted(text);
            }

            if self.stop_requested() {
                let text = "Stopped by user request.".to_string();
                log.emit(StepKind::Terminal, &text);
                return RunOutcome::Stopped(text);
            }

            if esc.is_stuck() {
                let text = "The run kept failing after exhausting every escalation. \
                            Try rephrasing the task or splitting it into subtasks."
                    .to_string();
                warn!(iteration, "Stuck detected, exiting early");
                conversation.push(Message::assistant(&text));
                log.emit(StepKind::Terminal, &text);
                return RunOutcome::Stuck(text);
            }

            let remaining = budget - iteration;
            if remaining <= self.config.engine.low_iteration_warning && remaining > 1 {
                log.emit(
                    StepKind::Thought,
                    format!("{remaining} iterations left, wrapping up the task..."),
                );
            }

            if esc.should_escalate() {
                let (next, tier_idx) = esc.escalate();
                esc = next;
                let binding = tiers.binding(tier_idx);
                info!(tier = %binding.name, model = %binding.model, "Escalated to stronger tier");
                log.emit(
                    StepKind::Escalation,
                    format!(
                        "Switching to tier '{}' ({}) for a better result...",
                        binding.name, binding.model
                    ),
                );
                conversation.push(Message::user(EscalationState::escalation_hint()));
            }

            iteration += 1;

            let goal_preview = conversation
                .last_user_content()
                .map(|c| preview(c.trim(), 80))
                .unwrap_or_default();
            log.emit(
                StepKind::Thought,
                format!(
                    "Thinking... (iteration {iteration}/{budget})\nLast request: \"{goal_preview}\""
                ),
            );

            let view = context.view(&conversation);
            if view.len() < conversation.messages.len() {
                log.emit(
                    StepKind::Compression,
                    format!(
                        "Context compressed: {} -> {} messages",
                        conversation.messages.len(),
                        view.len()
                    ),
                );
            }

            let model = tiers.binding(esc.tier_index).model.clone();
            let request = ChatRequest {
                model,
                messages: view,
                tools: tool_defs.clone(),
                temperature: policy.temperature,
                max_tokens: policy.max_tokens.or(Some(self.config.default_max_tokens)),
                images: options.images.clone(),
            };

            let response = match self.chat_with_retry(request, log).await {
                Ok(response) => response,
                Err(outcome) => {
                    log.emit(StepKind::Terminal, outcome.text());
                    return outcome;
                }
            };

            if response.is_empty() {
                warn!(iteration, "Model returned an empty response");
                log.emit(StepKind::Error, "Model returned an empty response, retrying...");
                continue;
            }

            if !response.text.trim().is_empty() {
                log.emit(StepKind::Thought, response.text.trim());
            }

            if response.tool_calls.is_empty() {
                let text = response.text.trim().to_string();
                conversation.push(Message::assistant(&text));
                log.emit(StepKind::Terminal, &text);
                return RunOutcome::Done(text);
            }

            conversation.push(Message::assistant_with_calls(
                &response.text,
                response.tool_calls.clone(),
            ));

            let mut calls: Vec<ToolCall> = Vec::with_capacity(response.tool_calls.len());
            for tc in &response.tool_calls {
                let arguments = parse_or_repair_arguments(&tc.name, &tc.arguments);
                let step = log
                    .step(StepKind::ToolCall, format!("Calling: {}", tc.name))
                    .with_tool(&tc.name)
                    .with_args(&tc.arguments);
                log.record(step);
                calls.push(ToolCall {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    arguments,
                });
            }

            let outcomes = dispatcher.dispatch(&calls).await;
            for (call, dispatched) in calls.iter().zip(&outcomes) {
                esc = esc.record(
                    call_signature(&call.name, &call.arguments),
                    dispatched.outcome.success,
                );

                let summary = if dispatched.outcome.success {
                    preview(&dispatched.outcome.output, 200)
                } else {
                    format!(
                        "Error: {}",
                        dispatched.outcome.error.as_deref().unwrap_or("unknown")
                    )
                };
                let step = log
                    .step(StepKind::ToolResult, summary)
                    .with_tool(&dispatched.tool_name)
                    .with_ok(dispatched.outcome.success);
                log.record(step);

                conversation.push(Message::tool_result(&dispatched.call_id, &dispatched.body));
            }
        }
    }

    /// One model consultation over the streaming interface. Text deltas
    /// are published as chunk events in arrival order while the complete
    /// response is assembled for the loop.
    async fn consult(
        &self,
        request: ChatRequest,
        run_id: &str,
    ) -> Result<ChatResponse, ProviderError> {
        let model = request.model.clone();
        let mut rx = self.chat.stream(request).await?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut usage = None;
        while let Some(chunk) = rx.recv().await {
            let chunk = chunk?;
            if let Some(content) = chunk.content {
                if !content.is_empty() {
                    self.bus.publish(AgentEvent::Chunk {
                        run_id: run_id.to_string(),
                        content: content.clone(),
                    });
                    text.push_str(&content);
                }
            }
            tool_calls.extend(chunk.tool_calls);
            if chunk.usage.is_some() {
                usage = chunk.usage;
            }
            if chunk.done {
                break;
            }
        }

        Ok(ChatResponse {
            text,
            tool_calls,
            usage,
            model,
        })
    }

    /// One model consultation, timeout-guarded, with bounded retries and
    /// increasing backoff. A final failure becomes a terminal outcome.
    async fn chat_with_retry(
        &self,
        request: ChatRequest,
        log: &mut StepLog,
    ) -> Result<ChatResponse, RunOutcome> {
        let timeout = Duration::from_secs(self.config.engine.llm_timeout_secs);
        let attempts = self.config.engine.llm_attempts.max(1);
        let run_id = log.run_id.clone();

        for attempt in 1..=attempts {
            debug!(
                attempt,
                model = %request.model,
                messages = request.messages.len(),
                "Sending model request"
            );
            match tokio::time::timeout(timeout, self.consult(request.clone(), &run_id)).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) => {
                    warn!(attempt, error = %e, "Model request failed");
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_secs(2 * attempt as u64)).await;
                        continue;
                    }
                    log.emit(StepKind::Error, format!("Model error: {e}"));
                    return Err(RunOutcome::Failed(format!(
                        "The model request failed: {e}. Please retry."
                    )));
                }
                Err(_) => {
                    warn!(attempt, timeout_secs = timeout.as_secs(), "Model request timed out");
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_secs(2 * attempt as u64)).await;
                        continue;
                    }
                    log.emit(
                        StepKind::Error,
                        format!(
                            "No model response within {}s after {attempts} attempts",
                            timeout.as_secs()
                        ),
                    );
                    return Err(RunOutcome::Failed(format!(
                        "The model did not respond within {}s. Please retry.",
                        timeout.as_secs()
                    )));
                }
            }
        }
        unreachable!("attempts >= 1")
    }
}

fn outcome_kind(outcome: &RunOutcome) -> &'static str {
    match outcome {
        RunOutcome::Done(_) => "done",
        RunOutcome::Stopped(_) => "stopped",
        RunOutcome::Stuck(_) => "stuck",
        RunOutcome::Exhausted(_) => "exhausted",
        RunOutcome::Failed(_) => "failed",
    }
}

/// Parse raw tool-call arguments, repairing truncated output when the
/// structure allows it. Irreparable arguments become an empty object so
/// the dispatcher's required-parameter validation produces a structured
/// failure the model can react to.
fn parse_or_repair_arguments(tool_name: &str, raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value @ serde_json::Value::Object(_)) => value,
        Ok(_) => json!({}),
        Err(_) => {
            warn!(tool = %tool_name, "Malformed tool-call JSON, attempting repair");
            repair_arguments(tool_name, raw).unwrap_or_else(|| json!({}))
        }
    }
}

/// Best-effort salvage for file-writing calls whose JSON was cut off
/// mid-content: recover the path and as much content as survived.
fn repair_arguments(tool_name: &str, raw: &str) -> Option<serde_json::Value> {
    if tool_name != "file_write" {
        return None;
    }
    let path = extract_string_field(raw, "path")?;
    let content = extract_tail_field(raw, "content").unwrap_or_default();
    info!(path = %path, content_len = content.len(), "Repaired truncated file_write arguments");
    Some(json!({ "path": path, "content": content }))
}

/// Extract a complete double-quoted string field from raw JSON text.
fn extract_string_field(raw: &str, field: &str) -> Option<String> {
    let rest = field_value_start(raw, field)?;
    let mut out = String::new();
    let mut chars = rest.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                out.push(c);
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            }
            '"' => return Some(unescape_fragment(&out)),
            _ => out.push(c),
        }
    }
    None
}

/// Extract a string field that may run to the (truncated) end of the
/// text. Stops at the first unescaped quote followed by `,` or `}`.
fn extract_tail_field(raw: &str, field: &str) -> Option<String> {
    let rest = field_value_start(raw, field)?;
    let bytes = rest.as_bytes();
    let mut cut = rest.len();
    let mut i = 0;
    let mut escaped = false;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == '"' && !escaped {
            let after = rest[i + 1..].trim_start();
            if after.starts_with(',') || after.starts_with('}') || after.is_empty() {
                cut = i;
                break;
            }
        }
        escaped = c == '\\' && !escaped;
        i += 1;
    }
    Some(unescape_fragment(&rest[..cut]))
}

/// Position just past the opening quote of `"field": "`.
fn field_value_start<'a>(raw: &'a str, field: &str) -> Option<&'a str> {
    let key = format!("\"{field}\"");
    let start = raw.find(&key)? + key.len();
    let rest = &raw[start..];
    let colon = rest.find(':')?;
    rest[colon + 1..].trim_start().strip_prefix('"')
}

fn unescape_fragment(s: &str) -> String {
    s.replace("\\n", "\n")
        .replace("\\t", "\t")
        .replace("\\\"", "\"")
        .replace("\\\\", "\\")
}

fn preview(s: &str, max: usize) -> String {
    let mut out: String = s.chars().take(max).collect();
    if s.chars().count() > max {
        out.push('…');
    }
    out
}
