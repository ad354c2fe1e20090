//! Guard data model
//!
//! Declarative guard definitions (filter, timing, rule block), the snapshot
//! exposed to a running guard, and the result/trace records the engine
//! accumulates. The serde representation of [`GuardDefinition`] is the wire
//! format used to import and export guards between modules; the string tags
//! exist only on the wire.

use crate::descriptor::Label;
use crate::identity::{EntityIdType, GuardId};
use crate::structured::StructuredValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ============================================================================
// TIMING, SCOPE, FILTERS, DECISIONS
// ============================================================================

/// When a guard runs relative to the operation body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardTiming {
    Before,
    After,
    Always,
}

impl GuardTiming {
    /// Whether a guard declared with this timing applies at the given
    /// evaluation point.
    pub fn applies_at(&self, point: GuardTiming) -> bool {
        matches!(self, GuardTiming::Always) || *self == point
    }
}

impl fmt::Display for GuardTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            GuardTiming::Before => "before",
            GuardTiming::After => "after",
            GuardTiming::Always => "always",
        };
        write!(f, "{}", tag)
    }
}

/// Whether a guard evaluates once per input or once per operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GuardScope {
    PerInput,
    PerOperation,
}

/// What a guard's filter value selects on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GuardFilterKind {
    /// Matches a data label carried by an input
    Label,
    /// Matches a normalized operation key
    Op,
    /// Matches a label attached at the operation call site
    OperationTag,
}

/// Decision produced by a guard rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardDecision {
    Allow,
    Deny,
    Retry,
    /// Extend the operation environment; valid for before-guards only
    Env,
}

impl fmt::Display for GuardDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            GuardDecision::Allow => "allow",
            GuardDecision::Deny => "deny",
            GuardDecision::Retry => "retry",
            GuardDecision::Env => "env",
        };
        write!(f, "{}", tag)
    }
}

// ============================================================================
// CONDITIONS AND REPLACEMENT EXPRESSIONS
// ============================================================================

/// Condition tree for guard rules.
///
/// The host-language parser lowers `when` expressions into these trees; the
/// trees themselves are the engine contract and travel with the serialized
/// guard descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum GuardCondition {
    /// The normalized operation keys include this key
    OpIs(String),
    /// `@ctx.op.type` equals the string
    OpTypeIs(String),
    /// `@ctx.op.subtype` equals the string
    OpSubtypeIs(String),
    /// `@ctx.op.name` equals the string
    OpNameIs(String),
    /// The operation call site carries the label
    OpHas(Label),
    /// The call site carries at least one of the labels
    OpHasAny(Vec<Label>),
    /// The call site carries all of the labels
    OpHasAll(Vec<Label>),
    /// The guarded input carries the label
    InputHas(Label),
    /// The current output parses as JSON
    OutputIsValidJson,
    /// The recorded tool-call trace includes the entry
    TraceIncludes(String),
    /// The current attempt number is at least the bound
    AttemptAtLeast(u32),
    /// A host executable returns a truthy verdict
    Exec(String),
    All(Vec<GuardCondition>),
    Any(Vec<GuardCondition>),
    Not(Box<GuardCondition>),
}

/// Expression producing a replacement value or a let-binding value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum ReplacementExpr {
    /// A literal data view
    Literal(serde_json::Value),
    /// Reference to a variable visible in the guard environment
    Var(String),
    /// A host executable produces the value
    Exec(String),
    /// Prefix the subject's text with `[label] ` and attach the label
    PrefixWith(Label),
    /// Annotate the subject with the evaluation timing
    Tag(GuardTiming),
}

// ============================================================================
// ACTIONS AND RULES
// ============================================================================

/// The action taken when a rule matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardAction {
    pub decision: GuardDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Replacement expression for `allow value`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ReplacementExpr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_labels: Vec<Label>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_labels: Vec<Label>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl GuardAction {
    /// Plain allow.
    pub fn allow() -> Self {
        Self {
            decision: GuardDecision::Allow,
            message: None,
            value: None,
            add_labels: Vec::new(),
            remove_labels: Vec::new(),
            warning: None,
        }
    }

    /// Deny with a reason.
    pub fn deny(message: impl Into<String>) -> Self {
        Self {
            decision: GuardDecision::Deny,
            message: Some(message.into()),
            ..Self::allow()
        }
    }

    /// Retry with a hint for the next attempt.
    pub fn retry(hint: impl Into<String>) -> Self {
        Self {
            decision: GuardDecision::Retry,
            message: Some(hint.into()),
            ..Self::allow()
        }
    }

    /// Extend the operation environment (before-guards only).
    pub fn env() -> Self {
        Self {
            decision: GuardDecision::Env,
            ..Self::allow()
        }
    }

    /// Attach a replacement expression.
    pub fn with_value(mut self, value: ReplacementExpr) -> Self {
        self.value = Some(value);
        self
    }

    /// Labels to add after privilege checks.
    pub fn with_add_labels(mut self, labels: impl IntoIterator<Item = Label>) -> Self {
        self.add_labels = labels.into_iter().collect();
        self
    }

    /// Labels to remove; requires a privileged guard.
    pub fn with_remove_labels(mut self, labels: impl IntoIterator<Item = Label>) -> Self {
        self.remove_labels = labels.into_iter().collect();
        self
    }

    /// Attach a warning emitted on the stderr effect channel.
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warning = Some(warning.into());
        self
    }
}

/// A let-binding extending the guard environment for subsequent rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LetBinding {
    #[serde(rename = "let")]
    pub name: String,
    pub value: ReplacementExpr,
}

/// A condition/action pair. A wildcard rule matches unconditionally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRule {
    #[serde(default)]
    pub is_wildcard: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<GuardCondition>,
    pub action: GuardAction,
}

/// One entry in a guard block: either a let-binding or a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GuardRule {
    Let(LetBinding),
    Match(MatchRule),
}

impl GuardRule {
    /// Rule matching on a condition.
    pub fn when(condition: GuardCondition, action: GuardAction) -> Self {
        GuardRule::Match(MatchRule {
            is_wildcard: false,
            condition: Some(condition),
            action,
        })
    }

    /// Wildcard rule matching unconditionally.
    pub fn otherwise(action: GuardAction) -> Self {
        GuardRule::Match(MatchRule {
            is_wildcard: true,
            condition: None,
            action,
        })
    }

    /// Let-binding entry.
    pub fn bind(name: impl Into<String>, value: ReplacementExpr) -> Self {
        GuardRule::Let(LetBinding {
            name: name.into(),
            value,
        })
    }
}

/// Ordered rule block of a guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GuardBlock {
    pub rules: Vec<GuardRule>,
}

// ============================================================================
// GUARD DEFINITION
// ============================================================================

/// A declarative guard: what it watches, when it runs, and its rule block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardDefinition {
    pub id: GuardId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub scope: GuardScope,
    pub filter_kind: GuardFilterKind,
    pub filter_value: String,
    pub timing: GuardTiming,
    /// Privileged guards may remove labels (protected labels excepted)
    #[serde(default)]
    pub privileged: bool,
    /// Per-guard retry bound; the configured ceiling still applies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
    pub block: GuardBlock,
}

impl GuardDefinition {
    /// Create a guard watching a data label.
    pub fn on_label(
        name: impl Into<String>,
        label: Label,
        timing: GuardTiming,
        rules: Vec<GuardRule>,
    ) -> Self {
        Self {
            id: GuardId::now_v7(),
            name: Some(name.into()),
            scope: GuardScope::PerInput,
            filter_kind: GuardFilterKind::Label,
            filter_value: label.as_str().to_string(),
            timing,
            privileged: false,
            max: None,
            block: GuardBlock { rules },
        }
    }

    /// Create a guard watching a normalized operation key.
    pub fn on_operation(
        name: impl Into<String>,
        op_key: impl Into<String>,
        timing: GuardTiming,
        rules: Vec<GuardRule>,
    ) -> Self {
        Self {
            id: GuardId::now_v7(),
            name: Some(name.into()),
            scope: GuardScope::PerOperation,
            filter_kind: GuardFilterKind::Op,
            filter_value: op_key.into(),
            timing,
            privileged: false,
            max: None,
            block: GuardBlock { rules },
        }
    }

    /// Mark the guard privileged.
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// Set the per-guard retry bound.
    pub fn with_max(mut self, max: u32) -> Self {
        self.max = Some(max);
        self
    }

    /// Display name: the guard's name, falling back to its ID.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }
}

// ============================================================================
// SNAPSHOTS, RESULTS, HISTORY
// ============================================================================

/// One recorded attempt of a retried operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub decision: GuardDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Ambient record exposed to a running guard as `@ctx.guard`. Immutable per
/// evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardContextSnapshot {
    pub name: String,
    pub attempt: u32,
    pub tries: Vec<AttemptRecord>,
    pub max: u32,
    /// The materialized guard subject
    pub input: StructuredValue,
    /// Current output, present for after-guards
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StructuredValue>,
    pub labels: BTreeSet<Label>,
    pub sources: Vec<String>,
    pub input_preview: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_preview: Option<String>,
    pub hint_history: Vec<String>,
    pub timing: GuardTiming,
}

/// Label changes applied by a guard action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LabelModifications {
    pub added: Vec<Label>,
    pub removed: Vec<Label>,
}

/// Outcome of evaluating one guard against one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard_name: Option<String>,
    pub decision: GuardDecision,
    pub timing: GuardTiming,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Whether the guard materialized a replacement value
    #[serde(default)]
    pub replaced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_modifications: Option<LabelModifications>,
    /// Wall-clock duration, when the host provides a clock
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl GuardResult {
    /// Result for a guard that reached a decision.
    pub fn new(guard_name: Option<String>, decision: GuardDecision, timing: GuardTiming) -> Self {
        Self {
            guard_name,
            decision,
            timing,
            reason: None,
            hint: None,
            replaced: false,
            label_modifications: None,
            duration_ms: None,
            metadata: BTreeMap::new(),
        }
    }
}

/// Entry appended to the shared pipeline guard history after each guarded
/// operation completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardHistoryEntry {
    /// Pipeline stage, when the operation ran inside a pipeline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<u32>,
    /// Key of the guarded operation
    pub operation: String,
    pub decision: GuardDecision,
    pub trace: Vec<GuardResult>,
    pub hints: Vec<String>,
    pub reasons: Vec<String>,
}

/// Per-call guard override from the `with` clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GuardOverride {
    /// `guards: false`: disable all applicable guards
    Disabled,
    /// `guards: { only: [@a, @b] }`: keep only the named guards
    Only(Vec<String>),
    /// `guards: { except: [@a] }`: drop the named guards
    Except(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(s: &str) -> Label {
        Label::normalize(s).expect("valid label")
    }

    #[test]
    fn test_timing_applies() {
        assert!(GuardTiming::Always.applies_at(GuardTiming::Before));
        assert!(GuardTiming::Before.applies_at(GuardTiming::Before));
        assert!(!GuardTiming::Before.applies_at(GuardTiming::After));
    }

    #[test]
    fn test_definition_wire_round_trip() {
        let guard = GuardDefinition::on_label(
            "secretShow",
            label("secret"),
            GuardTiming::Before,
            vec![
                GuardRule::when(
                    GuardCondition::OpTypeIs("show".to_string()),
                    GuardAction::deny("Secrets cannot be shown"),
                ),
                GuardRule::otherwise(GuardAction::allow()),
            ],
        );
        let json = serde_json::to_string(&guard).expect("serialize");
        assert!(json.contains("\"filterKind\":\"label\""));
        assert!(json.contains("\"scope\":\"perInput\""));
        let back: GuardDefinition = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(guard, back);
    }

    #[test]
    fn test_rule_untagged_forms() {
        let rules = vec![
            GuardRule::bind("cleaned", ReplacementExpr::Exec("sanitize".to_string())),
            GuardRule::otherwise(GuardAction::allow()),
        ];
        let json = serde_json::to_string(&rules).expect("serialize");
        let back: Vec<GuardRule> = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(rules, back);
        assert!(matches!(back[0], GuardRule::Let(_)));
        assert!(matches!(back[1], GuardRule::Match(_)));
    }

    #[test]
    fn test_display_name_falls_back_to_id() {
        let mut guard = GuardDefinition::on_operation(
            "validateJson",
            "exe",
            GuardTiming::After,
            vec![GuardRule::otherwise(GuardAction::allow())],
        );
        assert_eq!(guard.display_name(), "validateJson");
        guard.name = None;
        assert_eq!(guard.display_name(), guard.id.to_string());
    }
}
