//! Stagnation detection and capability escalation.
//!
//! Tracks tool outcomes for one run and decides when the current model
//! tier is struggling: repeated failures, the same call issued over and
//! over, or a long run that keeps hitting errors. State transitions are
//! pure: `record` and `escalate` consume the state and return the next
//! one, so the loop owns exactly one live value and tests can replay
//! sequences without shared mutability.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};
use taskloom_config::EscalationConfig;

/// Per-run escalation tracking.
#[derive(Debug, Clone)]
pub struct EscalationState {
    /// Index into the run's tier chain
    pub tier_index: usize,

    /// Whether at least one escalation happened
    pub escalated: bool,

    consecutive_failures: u32,
    total_iterations: u32,
    recent_signatures: VecDeque<String>,
    escalation_count: u32,
    iterations_since_escalation: u32,
    seen_failure: bool,

    config: EscalationConfig,

    /// Upper bound on escalations, min of config and chain headroom
    max_escalations: u32,
}

impl EscalationState {
    /// Fresh state for a run with `chain_hops` upward tier moves available.
    pub fn new(config: EscalationConfig, chain_hops: usize) -> Self {
        let max_escalations = config.max_escalations.min(chain_hops as u32);
        Self {
            tier_index: 0,
            escalated: false,
            consecutive_failures: 0,
            total_iterations: 0,
            recent_signatures: VecDeque::new(),
            escalation_count: 0,
            iterations_since_escalation: 0,
            seen_failure: false,
            config,
            max_escalations,
        }
    }

    /// Record one tool outcome, returning the next state.
    pub fn record(mut self, signature: String, success: bool) -> Self {
        self.total_iterations += 1;
        self.iterations_since_escalation += 1;

        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
            self.seen_failure = true;
        }

        self.recent_signatures.push_back(signature);
        while self.recent_signatures.len() > self.config.signature_history {
            self.recent_signatures.pop_front();
        }

        self
    }

    /// Whether a tier switch is warranted right now.
    ///
    /// The cooldown after a previous escalation suppresses every trigger,
    /// including the stall rule.
    pub fn should_escalate(&self) -> bool {
        if self.escalation_count >= self.max_escalations {
            return false;
        }

        if self.escalated
            && self.iterations_since_escalation < self.config.cooldown_iterations
        {
            return false;
        }

        if self.consecutive_failures >= self.config.max_consecutive_failures {
            return true;
        }

        if self.is_looping() {
            return true;
        }

        self.total_iterations >= self.config.stall_iteration_threshold && self.seen_failure
    }

    /// Move one tier up. Resets the failure streak and the signature
    /// buffer and starts the cooldown. Returns the next state and the
    /// new tier index.
    pub fn escalate(mut self) -> (Self, usize) {
        self.escalated = true;
        self.escalation_count += 1;
        self.iterations_since_escalation = 0;
        self.tier_index += 1;
        self.consecutive_failures = 0;
        self.recent_signatures.clear();
        let tier = self.tier_index;
        (self, tier)
    }

    /// True when every escalation is spent and the run is still failing
    /// or looping. The loop exits early rather than burn the remaining
    /// budget on a model that cannot make progress.
    pub fn is_stuck(&self) -> bool {
        if self.escalation_count < self.max_escalations {
            return false;
        }
        self.consecutive_failures >= self.config.max_consecutive_failures || self.is_looping()
    }

    fn is_looping(&self) -> bool {
        let n = self.config.repeated_call_window;
        if n == 0 || self.recent_signatures.len() < n {
            return false;
        }
        let mut tail = self.recent_signatures.iter().rev().take(n);
        let first = match tail.next() {
            Some(sig) => sig,
            None => return false,
        };
        tail.all(|sig| sig == first)
    }

    pub fn total_iterations(&self) -> u32 {
        self.total_iterations
    }

    pub fn escalation_count(&self) -> u32 {
        self.escalation_count
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Corrective note appended to the conversation after a tier switch.
    pub fn escalation_hint() -> &'static str {
        "[SYSTEM NOTE: Previous attempts had repeated errors. \
         Re-analyze the problem from scratch. \
         Do NOT repeat the same failing approach; try an alternative.]"
    }
}

/// Loop-detection signature for a tool call: the tool name plus the
/// first 8 hex chars of a sha256 over key-canonicalized arguments, so
/// the same call with reordered JSON keys hashes identically.
pub fn call_signature(tool_name: &str, arguments: &serde_json::Value) -> String {
    let canonical = canonicalize(arguments);
    let raw = serde_json::to_string(&canonical).unwrap_or_else(|_| canonical.to_string());
    let digest = Sha256::digest(raw.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("{tool_name}:{}", &hex[..8])
}

/// Recursively sort object keys so the serialization is order-stable.
fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<&String, serde_json::Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            serde_json::Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), v))
                    .collect(),
            )
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}
