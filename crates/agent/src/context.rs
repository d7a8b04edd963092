//! Context window management: compression, safe splitting, and chain
//! validity enforcement.
//!
//! The engine never sends the raw conversation to the model. `view`
//! produces a bounded copy: short histories pass through unchanged, long
//! ones are split at a safe boundary into an old part (replaced by one
//! synthetic summary message) and a recent suffix kept verbatim. Two
//! ceilings apply on top: tool results in an oversized suffix are
//! truncated per message, and a hard total cap evicts the oldest
//! retained messages chain-atomically. Every path ends in a validity
//! pass so no orphan tool message or incomplete tool-call chain ever
//! reaches the wire.

use taskloom_config::ContextConfig;
use taskloom_core::message::{Conversation, Message, Role};
use tracing::{debug, warn};

/// Bounds the conversation view sent to the chat service.
pub struct ContextWindowManager {
    config: ContextConfig,
}

impl ContextWindowManager {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    /// Build the bounded message list for the next chat request.
    pub fn view(&self, conversation: &Conversation) -> Vec<Message> {
        let messages = &conversation.messages;
        if messages.is_empty() {
            return Vec::new();
        }

        let has_system = messages[0].role == Role::System;
        let system = has_system.then(|| messages[0].clone());
        let rest: &[Message] = if has_system { &messages[1..] } else { messages };

        if rest.len() <= self.config.summary_threshold {
            return sanitize(messages.to_vec());
        }

        let split = find_safe_split(rest, self.config.recent_full);
        let (old_part, recent) = rest.split_at(split);

        // No safe boundary at all: send everything and let the
        // validity pass clean it up.
        if recent.is_empty() {
            return sanitize(messages.to_vec());
        }

        let summary_text = build_summary(old_part);

        // The most recent goal, restated so it survives the cut
        let goal_prefix = recent
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| truncate_chars(m.content.trim(), 300))
            .filter(|g| !g.is_empty())
            .map(|g| format!("Current goal (answer this): {g}\n\n"))
            .unwrap_or_default();

        let summary_content = format!("{goal_prefix}[Condensed context]:\n{summary_text}");

        let mut recent: Vec<Message> = recent.to_vec();
        if estimate_tokens(&recent) > self.config.recent_token_ceiling {
            debug!(
                messages = recent.len(),
                "Recent suffix over token ceiling, compressing tool results"
            );
            recent = self.compress_recent(recent);
        }

        let mut out = Vec::with_capacity(recent.len() + 2);
        if let Some(system) = system {
            out.push(system);
        }
        let header_len = out.len() + 1;
        out.push(Message::user(summary_content));
        out.extend(recent);
        let mut out = sanitize(out);

        // Hard cap: evict the oldest retained messages, whole chains at
        // a time, until the view fits.
        let total = estimate_tokens(&out);
        if total > self.config.hard_token_ceiling {
            warn!(
                tokens = total,
                ceiling = self.config.hard_token_ceiling,
                "Context over hard ceiling, evicting oldest messages"
            );
            let tail = out.split_off(header_len.min(out.len()));
            let mut tail: std::collections::VecDeque<Message> = tail.into();
            while !tail.is_empty() {
                let mut probe: Vec<Message> = out.clone();
                probe.extend(tail.iter().cloned());
                if estimate_tokens(&probe) <= self.config.hard_token_ceiling {
                    break;
                }
                if let Some(dropped) = tail.pop_front() {
                    if dropped.opens_chain() {
                        while tail.front().map(|m| m.role == Role::Tool).unwrap_or(false) {
                            tail.pop_front();
                        }
                    }
                }
            }
            out.extend(tail);
        }

        out
    }

    /// Truncate oversized tool-result messages in the recent suffix.
    fn compress_recent(&self, messages: Vec<Message>) -> Vec<Message> {
        let cap = self.config.per_message_char_cap;
        messages
            .into_iter()
            .map(|mut m| {
                if m.role == Role::Tool && m.content.chars().count() > cap {
                    m.content =
                        format!("{}... (truncated in context)", truncate_chars(&m.content, cap));
                }
                m
            })
            .collect()
    }
}

/// Deterministic token estimate over content and tool-call arguments.
/// Uses a conservative ~2.5 chars per token so mixed-language text and
/// code never underestimate against the model's real limit.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    let total_chars: usize = messages
        .iter()
        .map(|m| {
            m.content.chars().count()
                + m.tool_calls
                    .iter()
                    .map(|tc| tc.arguments.chars().count())
                    .sum::<usize>()
        })
        .sum();
    (total_chars as f64 / 2.5) as usize
}

/// Find the index in `rest` where splitting into [old, recent] cannot
/// land inside an assistant-plus-tool-results chain. Walks backward from
/// the target position to the nearest user message; if none exists
/// before the target, walks forward instead. The recent slice therefore
/// never starts with an orphaned tool message.
fn find_safe_split(rest: &[Message], target_recent: usize) -> usize {
    let mut split = rest.len().saturating_sub(target_recent);

    while split > 0 {
        if rest[split].role == Role::User {
            break;
        }
        split -= 1;
    }

    if split == 0 && rest.first().map(|m| m.role != Role::User).unwrap_or(false) {
        split = rest
            .iter()
            .position(|m| m.role == Role::User)
            .unwrap_or(rest.len());
    }

    split
}

/// Enforce the tool-call-chain invariant on an outgoing message list:
/// - orphan tool messages are dropped;
/// - an assistant message whose tool calls lack a complete, consecutive
///   set of matching tool results has its call list stripped, and is
///   dropped entirely when no text remains.
///
/// Idempotent: a sanitized list passes through unchanged.
pub fn sanitize(messages: Vec<Message>) -> Vec<Message> {
    let mut result: Vec<Message> = Vec::with_capacity(messages.len());
    let mut i = 0;

    while i < messages.len() {
        let m = &messages[i];

        if m.role == Role::Tool {
            warn!(
                tool_call_id = m.tool_call_id.as_deref().unwrap_or(""),
                "Dropping orphaned tool message"
            );
            i += 1;
            continue;
        }

        if m.opens_chain() {
            let expected: Vec<&str> = m.tool_calls.iter().map(|tc| tc.id.as_str()).collect();

            let mut seen: Vec<&str> = Vec::new();
            let mut j = i + 1;
            while j < messages.len() && messages[j].role == Role::Tool {
                if let Some(id) = messages[j].tool_call_id.as_deref() {
                    if expected.contains(&id) {
                        seen.push(id);
                    }
                }
                j += 1;
            }

            let complete =
                !expected.is_empty() && expected.iter().all(|id| seen.contains(id));
            if complete {
                result.push(m.clone());
                result.extend(messages[i + 1..j].iter().cloned());
                i = j;
                continue;
            }

            warn!(
                expected = expected.len(),
                seen = seen.len(),
                "Dropping incomplete tool-call chain"
            );
            if !m.content.trim().is_empty() {
                let mut stripped = m.clone();
                stripped.tool_calls.clear();
                result.push(stripped);
            }
            i += 1;
            continue;
        }

        result.push(m.clone());
        i += 1;
    }

    result
}

/// Build the structured summary that replaces the evicted old part:
/// original goal, files written, commands run, URLs requested, recent
/// errors, and the last assistant text.
fn build_summary(messages: &[Message]) -> String {
    let mut goal = String::new();
    let mut files_written: Vec<String> = Vec::new();
    let mut commands_run: Vec<String> = Vec::new();
    let mut urls: Vec<String> = Vec::new();
    let mut errors: Vec<String> = Vec::new();
    let mut last_assistant = String::new();

    for m in messages {
        match m.role {
            Role::User => {
                let text = m.content.trim();
                if goal.is_empty() && !text.is_empty() {
                    goal = truncate_chars(text, 300);
                }
            }
            Role::Assistant => {
                for tc in &m.tool_calls {
                    extract_call_facts(tc.name.as_str(), &tc.arguments, &mut files_written,
                        &mut commands_run, &mut urls);
                }
                let text = m.content.trim();
                if !text.is_empty() {
                    last_assistant = truncate_chars(text, 200);
                }
            }
            Role::Tool => extract_tool_error(&m.content, &mut errors),
            Role::System => {}
        }
    }

    let mut parts: Vec<String> = Vec::new();

    if !goal.is_empty() {
        parts.push(format!("TASK: {goal}"));
    }

    if !files_written.is_empty() {
        let shown: Vec<&str> = files_written
            .iter()
            .rev()
            .take(12)
            .map(String::as_str)
            .collect();
        let shown: Vec<&str> = shown.into_iter().rev().collect();
        let extra = if files_written.len() > 12 {
            format!(" (+{} more)", files_written.len() - 12)
        } else {
            String::new()
        };
        parts.push(format!("FILES WRITTEN: {}{extra}", shown.join(", ")));
    }

    if !commands_run.is_empty() {
        let shown: Vec<&str> = commands_run
            .iter()
            .rev()
            .take(6)
            .map(String::as_str)
            .collect();
        let shown: Vec<&str> = shown.into_iter().rev().collect();
        parts.push(format!("COMMANDS RUN: {}", shown.join("; ")));
    }

    if !urls.is_empty() {
        let shown: Vec<&str> = urls.iter().rev().take(3).map(String::as_str).collect();
        let shown: Vec<&str> = shown.into_iter().rev().collect();
        parts.push(format!("URLS REQUESTED: {}", shown.join(", ")));
    }

    if !errors.is_empty() {
        let shown: Vec<&str> = errors.iter().rev().take(3).map(String::as_str).collect();
        let shown: Vec<&str> = shown.into_iter().rev().collect();
        parts.push(format!("RECENT ERRORS: {}", shown.join(" | ")));
    }

    if !last_assistant.is_empty() {
        parts.push(format!("LAST ASSISTANT REPLY: {last_assistant}"));
    }

    if parts.is_empty() {
        "Earlier conversation (condensed).".into()
    } else {
        parts.join("\n")
    }
}

/// Pull summary-worthy facts out of tool-call arguments.
fn extract_call_facts(
    tool_name: &str,
    raw_args: &str,
    files_written: &mut Vec<String>,
    commands_run: &mut Vec<String>,
    urls: &mut Vec<String>,
) {
    let args: serde_json::Value = match serde_json::from_str(raw_args) {
        Ok(v) => v,
        Err(_) => return,
    };

    match tool_name {
        "file_write" => {
            if let Some(path) = args.get("path").and_then(|v| v.as_str()) {
                if !path.is_empty() && !files_written.iter().any(|f| f == path) {
                    files_written.push(path.to_string());
                }
            }
        }
        "shell" => {
            if let Some(cmd) = args.get("command").and_then(|v| v.as_str()) {
                if !cmd.is_empty() {
                    commands_run.push(truncate_chars(cmd, 80));
                }
            }
        }
        "http_request" => {
            if let Some(url) = args.get("url").and_then(|v| v.as_str()) {
                if !url.is_empty() {
                    urls.push(truncate_chars(url, 100));
                }
            }
        }
        _ => {}
    }
}

/// Pull a short error snippet out of a tool-result body.
fn extract_tool_error(content: &str, errors: &mut Vec<String>) {
    let data: serde_json::Value = match serde_json::from_str(content) {
        Ok(v) => v,
        Err(_) => return,
    };
    if data.get("success").and_then(|v| v.as_bool()).unwrap_or(true) {
        return;
    }
    let snippet = data
        .get("error")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .or_else(|| data.get("output").and_then(|v| v.as_str()))
        .unwrap_or("");
    if !snippet.is_empty() {
        errors.push(truncate_chars(snippet, 120));
    }
}

/// Char-boundary-safe prefix.
fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}
