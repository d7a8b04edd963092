//! Step log events and the broadcast bus observers subscribe to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// What a single step in the run log records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Assistant text produced this iteration
    Thought,
    /// A tool call was dispatched
    ToolCall,
    /// A tool call completed
    ToolResult,
    /// The capability tier changed
    Escalation,
    /// The context window was compressed
    Compression,
    /// A subtask plan was produced
    Plan,
    /// A recoverable error inside an iteration
    Error,
    /// The run reached a terminal state
    Terminal,
}

/// One entry in a run's step log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    /// Position in the run, starting at 0
    pub seq: u64,

    pub kind: StepKind,

    /// Human-readable content (assistant text, result preview, reason)
    pub content: String,

    /// Tool name for ToolCall/ToolResult steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    /// Serialized tool arguments for ToolCall steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<String>,

    /// Whether the tool call succeeded, for ToolResult steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_ok: Option<bool>,

    pub timestamp: DateTime<Utc>,
}

impl AgentStep {
    pub fn new(seq: u64, kind: StepKind, content: impl Into<String>) -> Self {
        Self {
            seq,
            kind,
            content: content.into(),
            tool_name: None,
            tool_args: None,
            tool_ok: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_tool(mut self, name: impl Into<String>) -> Self {
        self.tool_name = Some(name.into());
        self
    }

    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.tool_args = Some(args.into());
        self
    }

    pub fn with_ok(mut self, ok: bool) -> Self {
        self.tool_ok = Some(ok);
        self
    }
}

/// Events published while a run is in flight.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A step was appended to the run log
    Step { run_id: String, step: AgentStep },
    /// A partial assistant text chunk arrived
    Chunk { run_id: String, content: String },
}

/// Broadcast bus for run observers. Publishing never fails: when no
/// subscriber is listening the event is dropped.
#[derive(Debug, Clone)]
pub struct StepBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl StepBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for StepBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let bus = StepBus::default();
        bus.publish(AgentEvent::Chunk {
            run_id: "r1".into(),
            content: "hi".into(),
        });
    }

    #[tokio::test]
    async fn subscriber_receives_steps_in_order() {
        let bus = StepBus::new(16);
        let mut rx = bus.subscribe();

        for seq in 0..3u64 {
            bus.publish(AgentEvent::Step {
                run_id: "r1".into(),
                step: AgentStep::new(seq, StepKind::Thought, format!("t{seq}")),
            });
        }

        for expect in 0..3u64 {
            match rx.recv().await.unwrap() {
                AgentEvent::Step { step, .. } => assert_eq!(step.seq, expect),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn step_builder_fields() {
        let step = AgentStep::new(4, StepKind::ToolResult, "ok")
            .with_tool("shell")
            .with_args("{\"command\":\"ls\"}")
            .with_ok(true);
        assert_eq!(step.tool_name.as_deref(), Some("shell"));
        assert_eq!(step.tool_ok, Some(true));
    }
}
