//! Core types and traits for the taskloom agent engine.
//!
//! This crate defines the conversation model, the external seams the
//! engine depends on (chat service, tool executor, tool catalog, policy
//! provider), the step-log event bus, and the shared error types. The
//! engine itself lives in `taskloom-agent`.

pub mod error;
pub mod message;
pub mod policy;
pub mod provider;
pub mod step;
pub mod tool;

pub use error::{Error, ProviderError, Result, ToolError};
pub use message::{Conversation, ConversationId, Message, MessageToolCall, Role};
pub use policy::{PolicyProvider, StaticPolicyProvider, TaskPolicy, TierBinding, TierChain};
pub use provider::{
    ChatRequest, ChatResponse, ChatService, ImageAttachment, ImageSource, StreamChunk,
    ToolDefinition, Usage,
};
pub use step::{AgentEvent, AgentStep, StepBus, StepKind};
pub use tool::{StaticCatalog, ToolCall, ToolCatalog, ToolExecutor, ToolOutcome, ToolSpec};
