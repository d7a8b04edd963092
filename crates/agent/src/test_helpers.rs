//! Shared mocks for engine tests: a scripted chat service and a
//! scripted tool executor.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use taskloom_core::error::{ProviderError, ToolError};
use taskloom_core::message::MessageToolCall;
use taskloom_core::provider::{ChatRequest, ChatResponse, ChatService, Usage};
use taskloom_core::tool::{ToolCall, ToolExecutor, ToolOutcome};

/// A chat service that replays a script of responses in order and
/// records every request it receives. Panics when the script runs dry,
/// which catches loops that consult the model more often than expected.
pub struct SequentialMockChat {
    script: Mutex<VecDeque<Result<ChatResponse, ProviderError>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl SequentialMockChat {
    pub fn new(script: Vec<Result<ChatResponse, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn texts(texts: Vec<String>) -> Self {
        Self::new(texts.into_iter().map(|t| Ok(Self::text(&t))).collect())
    }

    pub fn errors(errors: Vec<ProviderError>) -> Self {
        Self::new(errors.into_iter().map(Err).collect())
    }

    /// A plain text response.
    pub fn text(content: &str) -> ChatResponse {
        ChatResponse {
            text: content.to_string(),
            tool_calls: vec![],
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            model: "mock-model".into(),
        }
    }

    /// A response carrying tool calls: (id, tool name, raw JSON args).
    pub fn calls(calls: &[(&str, &str, &str)]) -> ChatResponse {
        ChatResponse {
            text: String::new(),
            tool_calls: calls
                .iter()
                .map(|(id, name, args)| MessageToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments: args.to_string(),
                })
                .collect(),
            usage: None,
            model: "mock-model".into(),
        }
    }

    pub fn recorded_requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatService for SequentialMockChat {
    fn name(&self) -> &str {
        "sequential-mock"
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.requests.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .expect("mock chat script exhausted")
    }
}

/// A tool executor that replays scripted outcomes and records calls.
/// When the script is empty every call succeeds with a stock output.
pub struct ScriptedToolExecutor {
    script: Mutex<VecDeque<ToolOutcome>>,
    calls: Mutex<Vec<ToolCall>>,
}

impl ScriptedToolExecutor {
    pub fn new(script: Vec<ToolOutcome>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn always_ok() -> Self {
        Self::new(vec![])
    }

    pub fn recorded_calls(&self) -> Vec<ToolCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolExecutor for ScriptedToolExecutor {
    async fn execute(&self, call: &ToolCall) -> Result<ToolOutcome, ToolError> {
        self.calls.lock().unwrap().push(call.clone());
        Ok(self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ToolOutcome::ok("ok")))
    }
}
