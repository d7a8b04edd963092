//! The orchestration engine: the iteration loop and the machinery it
//! leans on: context windowing, escalation tracking, tool dispatch,
//! parallel decomposition, and the run registry.
//!
//! [`AgentLoop`] is the entry point. It is generic over the seams in
//! `taskloom-core` (chat service, tool executor, tool catalog, policy
//! provider), so the same loop runs against any model backend or tool
//! sandbox.

pub mod context;
pub mod decompose;
pub mod dispatch;
pub mod escalation;
pub mod loop_runner;
pub mod registry;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use context::ContextWindowManager;
pub use decompose::{ParallelDecomposer, Subtask, Wave, compute_waves};
pub use dispatch::{DispatchOutcome, ToolDispatcher};
pub use escalation::{EscalationState, call_signature};
pub use loop_runner::{AgentLoop, RunOptions, RunOutcome, RunReport};
pub use registry::{RunHandle, RunRegistry};
