//! Capability policy resolution
//!
//! Answers "is this capability exercise allowed against this descriptor?"
//! using declarative rule sets attached to the host environment:
//!
//! ```text
//! policy.sources["src:mcp"]        = untrusted
//! policy.labels["src:mcp"].deny    = [destructive, "op:cmd:git:push"]
//! policy.labels["src:mcp"].review  = ["op:exe:*"]
//! ```
//!
//! A `needs-review` decision signals the directive layer to route the call
//! through the guard evaluation engine rather than fail outright, enabling
//! the dual-audit airlock pattern.

use mlld_core::{Capability, Label, SecurityDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// POLICY RULE SETS
// ============================================================================

/// Operation-pattern lists attached to one label.
///
/// Entries are capability kinds (`destructive`) or operation keys
/// (`op:cmd:git:push`); a trailing `*` segment matches any suffix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LabelPolicy {
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub review: Vec<String>,
}

impl LabelPolicy {
    pub fn deny(patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            deny: patterns.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_review(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.review = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_allow(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.allow = patterns.into_iter().map(Into::into).collect();
        self
    }
}

/// Declarative policy: per-source label defaults and per-label operation
/// matrices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PolicySet {
    /// Source pattern -> label implied on values from that source
    #[serde(default)]
    pub sources: BTreeMap<String, Label>,
    /// Label -> operation-pattern matrix
    #[serde(default)]
    pub labels: BTreeMap<Label, LabelPolicy>,
}

impl PolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Imply a label on descriptors whose provenance matches the pattern.
    pub fn with_source_rule(mut self, pattern: impl Into<String>, label: Label) -> Self {
        self.sources.insert(pattern.into(), label);
        self
    }

    /// Attach an operation matrix to a label.
    pub fn with_label_policy(mut self, label: Label, policy: LabelPolicy) -> Self {
        self.labels.insert(label, policy);
        self
    }
}

// ============================================================================
// RESOLUTION
// ============================================================================

/// Decision for one capability exercise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyDecision {
    Allow,
    Deny,
    NeedsReview,
}

/// Resolution result with the rules that fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyOutcome {
    pub decision: PolicyDecision,
    pub reasons: Vec<String>,
}

/// Resolve a capability exercise against a descriptor under a policy.
/// Precedence: deny > needs-review > allow.
pub fn resolve(
    capability: &Capability,
    descriptor: &SecurityDescriptor,
    policy: &PolicySet,
) -> PolicyOutcome {
    let labels = effective_labels(descriptor, policy);

    let mut reasons = Vec::new();
    let mut denied = false;
    let mut review = false;

    for label in &labels {
        let Some(label_policy) = policy.labels.get(label) else {
            continue;
        };
        for pattern in &label_policy.deny {
            if pattern_matches(pattern, capability) {
                reasons.push(format!("label '{}' denies '{}'", label, pattern));
                denied = true;
            }
        }
        for pattern in &label_policy.review {
            if pattern_matches(pattern, capability) {
                reasons.push(format!("label '{}' requires review for '{}'", label, pattern));
                review = true;
            }
        }
        for pattern in &label_policy.allow {
            if pattern_matches(pattern, capability) {
                reasons.push(format!("label '{}' allows '{}'", label, pattern));
            }
        }
    }

    let decision = if denied {
        PolicyDecision::Deny
    } else if review {
        PolicyDecision::NeedsReview
    } else {
        PolicyDecision::Allow
    };
    PolicyOutcome { decision, reasons }
}

/// The descriptor's labels plus anything its provenance implies through the
/// policy's source rules.
fn effective_labels(descriptor: &SecurityDescriptor, policy: &PolicySet) -> BTreeSet<Label> {
    let mut labels = descriptor.labels().clone();
    for (pattern, implied) in &policy.sources {
        let from_source = descriptor
            .sources()
            .iter()
            .any(|source| wildcard_matches(pattern, source));
        let from_label = descriptor
            .labels()
            .iter()
            .any(|label| wildcard_matches(pattern, label.as_str()));
        if from_source || from_label {
            labels.insert(implied.clone());
        }
    }
    labels
}

/// A policy entry matches a capability by kind or by operation key.
fn pattern_matches(pattern: &str, capability: &Capability) -> bool {
    if pattern == capability.kind {
        return true;
    }
    let op_pattern = pattern.strip_prefix("op:").unwrap_or(pattern);
    wildcard_matches(op_pattern, &capability.operation)
}

/// Exact match, or prefix match when the pattern ends in `*`.
fn wildcard_matches(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}
