//! Run policy: system prompt, generation settings, and the capability
//! tier chain.
//!
//! A tier names a capability level and binds it to a concrete model
//! string. Escalation walks the chain from cheapest to strongest; the
//! engine only ever holds an index into the chain.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A capability tier bound to a concrete model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBinding {
    /// Tier label, e.g. "standard" or "reasoning"
    pub name: String,

    /// The model this tier resolves to
    pub model: String,
}

/// Ordered list of tiers, cheapest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierChain {
    tiers: Vec<TierBinding>,
}

impl TierChain {
    /// Build a chain from at least one tier. Returns `None` when empty.
    pub fn new(tiers: Vec<TierBinding>) -> Option<Self> {
        if tiers.is_empty() {
            None
        } else {
            Some(Self { tiers })
        }
    }

    /// A single-tier chain.
    pub fn single(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            tiers: vec![TierBinding {
                name: name.into(),
                model: model.into(),
            }],
        }
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    /// The tier at `index`, clamped to the strongest tier.
    pub fn binding(&self, index: usize) -> &TierBinding {
        let clamped = index.min(self.tiers.len() - 1);
        &self.tiers[clamped]
    }

    /// Whether a tier above `index` exists.
    pub fn has_next(&self, index: usize) -> bool {
        index + 1 < self.tiers.len()
    }

    /// Maximum number of upward hops from the bottom tier.
    pub fn max_hops(&self) -> usize {
        self.tiers.len() - 1
    }
}

/// The policy governing one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPolicy {
    /// System prompt for the conversation
    pub system_prompt: String,

    /// Sampling temperature
    pub temperature: f32,

    /// Maximum tokens per model response
    pub max_tokens: Option<u32>,

    /// Tool names this task class may use; empty = all catalog tools
    #[serde(default)]
    pub allowed_tools: Vec<String>,

    /// Capability chain, cheapest first
    pub tiers: TierChain,
}

impl TaskPolicy {
    pub fn new(system_prompt: impl Into<String>, tiers: TierChain) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            temperature: 0.7,
            max_tokens: None,
            allowed_tools: vec![],
            tiers,
        }
    }

    /// Whether a tool is permitted under this policy.
    pub fn allows_tool(&self, name: &str) -> bool {
        self.allowed_tools.is_empty() || self.allowed_tools.iter().any(|t| t == name)
    }
}

/// Supplies the policy for a run, keyed by task class. A deployment might
/// look this up per tenant or task type; tests use [`StaticPolicyProvider`].
pub trait PolicyProvider: Send + Sync {
    fn policy_for(&self, task_class: &str) -> TaskPolicy;
}

/// A table of policies with a fallback default.
#[derive(Debug, Clone)]
pub struct StaticPolicyProvider {
    policies: HashMap<String, TaskPolicy>,
    default: TaskPolicy,
}

impl StaticPolicyProvider {
    pub fn new(default: TaskPolicy) -> Self {
        Self {
            policies: HashMap::new(),
            default,
        }
    }

    pub fn with_class(mut self, task_class: impl Into<String>, policy: TaskPolicy) -> Self {
        self.policies.insert(task_class.into(), policy);
        self
    }
}

impl PolicyProvider for StaticPolicyProvider {
    fn policy_for(&self, task_class: &str) -> TaskPolicy {
        self.policies
            .get(task_class)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}
