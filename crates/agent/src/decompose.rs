//! Task decomposition into dependency-ordered waves of subtasks.
//!
//! One chat call turns the task into a JSON array of subtasks with
//! `depends_on` edges. Subtasks are then partitioned into waves: wave 0
//! has no dependencies, wave 1 depends only on wave 0, and so on. Every
//! step degrades instead of failing — an unparseable plan becomes a
//! single subtask wrapping the whole task, cyclic or dangling
//! dependencies are dumped into one final wave, and a failed merge call
//! falls back to concatenation.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use taskloom_config::DecomposeConfig;
use taskloom_core::provider::{ChatRequest, ChatService};
use tracing::{debug, warn};

const PLANNER_PROMPT: &str = "\
Split the user's task into subtasks for parallel execution.

Rules:
- If the task is a single unit, return an array with one subtask holding the full text.
- If it has 2+ independent parts (e.g. \"landing page + API\", \"frontend and backend\"), split it.
- Each subtask must be self-contained (its own files/commands).
- Answer with ONLY a valid JSON array, no markdown and no commentary.

Format:
[
  {\"id\": \"1\", \"description\": \"subtask 1\", \"depends_on\": []},
  {\"id\": \"2\", \"description\": \"subtask 2\", \"depends_on\": []}
]

depends_on lists ids of subtasks that must finish first (usually [] for parallel parts).
Write descriptions in the user's language.";

const MERGE_PROMPT: &str = "\
You are an assistant. The user asked for a task; below are the subtask \
results. Give a brief summary in the user's language: what was done and \
how to run or verify it. Nothing extra.";

/// One planned unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A group of subtasks whose dependencies all live in earlier waves.
pub type Wave = Vec<Subtask>;

/// Plans, orders, and merges subtasks. Child execution is driven by the
/// loop so subtask runs get fresh conversations and budgets.
pub struct ParallelDecomposer {
    chat: Arc<dyn ChatService>,
    config: DecomposeConfig,
}

impl ParallelDecomposer {
    pub fn new(chat: Arc<dyn ChatService>, config: DecomposeConfig) -> Self {
        Self { chat, config }
    }

    /// Ask the model for a subtask plan. Never fails: any parse or
    /// transport problem yields a single subtask wrapping the task.
    pub async fn plan(&self, model: &str, task: &str) -> Vec<Subtask> {
        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![
                taskloom_core::message::Message::system(PLANNER_PROMPT),
                taskloom_core::message::Message::user(task),
            ],
            tools: vec![],
            temperature: 0.2,
            max_tokens: Some(1024),
            images: vec![],
        };

        let text = match self.chat.chat(request).await {
            Ok(response) => response.text,
            Err(e) => {
                warn!(error = %e, "Plan request failed, running as a single task");
                return vec![Self::whole_task(task)];
            }
        };

        let subtasks = parse_plan(&text, task);
        let subtasks: Vec<Subtask> = subtasks.into_iter().take(self.config.max_subtasks).collect();
        debug!(count = subtasks.len(), "Planned subtasks");
        subtasks
    }

    /// Merge subtask outputs, in original plan order, into one reply.
    pub async fn merge(&self, model: &str, task: &str, results: &[String]) -> String {
        let fallback = || results.join("\n\n");

        if !self.config.merge_with_model {
            return fallback();
        }

        let parts: Vec<String> = results
            .iter()
            .enumerate()
            .map(|(i, r)| format!("Subtask {}:\n{r}", i + 1))
            .collect();
        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![
                taskloom_core::message::Message::system(MERGE_PROMPT),
                taskloom_core::message::Message::user(format!(
                    "User request: {task}\n\nResults:\n{}",
                    parts.join("\n\n")
                )),
            ],
            tools: vec![],
            temperature: 0.3,
            max_tokens: Some(1024),
            images: vec![],
        };

        match self.chat.chat(request).await {
            Ok(response) if !response.text.trim().is_empty() => response.text.trim().to_string(),
            Ok(_) => fallback(),
            Err(e) => {
                warn!(error = %e, "Merge request failed, concatenating results");
                format!("{}\n\n(Summary unavailable: {e})", fallback())
            }
        }
    }

    fn whole_task(task: &str) -> Subtask {
        Subtask {
            id: "1".into(),
            description: task.to_string(),
            depends_on: vec![],
        }
    }
}

/// Parse a plan response into subtasks, tolerating markdown fences and
/// malformed entries.
fn parse_plan(text: &str, task: &str) -> Vec<Subtask> {
    let stripped = strip_code_fence(text.trim());

    let items: Vec<serde_json::Value> = match serde_json::from_str(stripped) {
        Ok(serde_json::Value::Array(items)) => items,
        _ => {
            warn!("Plan was not a JSON array, running as a single task");
            return vec![ParallelDecomposer::whole_task(task)];
        }
    };

    let mut out = Vec::new();
    for (i, item) in items.iter().enumerate() {
        let Some(obj) = item.as_object() else { continue };
        let id = match obj.get("id") {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => (i + 1).to_string(),
        };
        let description = obj
            .get("description")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(task)
            .to_string();
        let depends_on = obj
            .get("depends_on")
            .and_then(|v| v.as_array())
            .map(|deps| {
                deps.iter()
                    .filter_map(|d| match d {
                        serde_json::Value::String(s) => Some(s.clone()),
                        serde_json::Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        out.push(Subtask {
            id,
            description,
            depends_on,
        });
    }

    if out.is_empty() {
        vec![ParallelDecomposer::whole_task(task)]
    } else {
        out
    }
}

/// Strip a surrounding markdown code fence, tolerating a language tag.
fn strip_code_fence(text: &str) -> &str {
    if !text.contains("```") {
        return text;
    }
    let Some(start) = text.find("```") else {
        return text;
    };
    let after_fence = &text[start + 3..];
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_fence[body_start..];
    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

/// Partition subtasks into dependency waves. A subtask joins a wave once
/// all its dependencies are in earlier waves. When no subtask qualifies
/// (a cycle, or dependencies on ids that don't exist) everything left
/// becomes one final wave, so the walk always terminates with full
/// coverage.
pub fn compute_waves(subtasks: &[Subtask]) -> Vec<Wave> {
    let mut waves: Vec<Wave> = Vec::new();
    let mut done: HashSet<String> = HashSet::new();

    while done.len() < subtasks.len() {
        let mut wave: Wave = Vec::new();
        for s in subtasks {
            if done.contains(&s.id) {
                continue;
            }
            if s.depends_on.iter().all(|d| done.contains(d)) {
                wave.push(s.clone());
            }
        }

        if wave.is_empty() {
            warn!("Cyclic or dangling dependencies, forcing remaining subtasks into one wave");
            wave = subtasks
                .iter()
                .filter(|s| !done.contains(&s.id))
                .cloned()
                .collect();
        }

        for s in &wave {
            done.insert(s.id.clone());
        }
        waves.push(wave);
    }

    waves
}
