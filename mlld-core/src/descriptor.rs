//! Security descriptors - ground truth for information-flow metadata
//!
//! Every runtime value carries a `SecurityDescriptor`: the labels attached to
//! it, the subset of labels that demand downstream enforcement (taint), the
//! provenance trail, the capability being exercised, and an opaque policy
//! context. The descriptor is an immutable value object; all operations
//! return new descriptors and all operations are total.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// LABELS
// ============================================================================

/// Wire format for labels: lower-case ASCII identifiers, colon-namespaced
/// for provenance families (`src:mcp`, `src:file`, `src:url`).
static LABEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z][a-z0-9_-]*(:[a-z0-9_-]+)*$").expect("label pattern is valid")
});

/// A tag attached to a value denoting a fact about it (origin, kind,
/// sensitivity). Validated on construction; ordering is lexicographic so
/// label sets are canonical for free.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Label(String);

impl Label {
    /// Normalize arbitrary input into a label: trim, lowercase, validate.
    /// Returns `None` when the input cannot be a label even after
    /// normalization.
    pub fn normalize(input: &str) -> Option<Self> {
        let candidate = input.trim().to_ascii_lowercase();
        if LABEL_RE.is_match(&candidate) {
            Some(Self(candidate))
        } else {
            None
        }
    }

    /// The label as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this label belongs to the `src:` provenance namespace.
    pub fn is_src(&self) -> bool {
        self.0.starts_with("src:")
    }
}

/// Error type for parsing labels from strings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid label '{input}': expected lower-case ASCII identifier, optionally colon-namespaced")]
pub struct LabelParseError {
    pub input: String,
}

impl FromStr for Label {
    type Err = LabelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::normalize(s).ok_or_else(|| LabelParseError {
            input: s.to_string(),
        })
    }
}

impl TryFrom<String> for Label {
    type Error = LabelParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Label> for String {
    fn from(label: Label) -> Self {
        label.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// CAPABILITY
// ============================================================================

/// Structured record identifying the capability an operation exercises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    /// Kind of capability (e.g., "destructive", "network", "filesystem")
    pub kind: String,
    /// Operation key being exercised (e.g., "cmd:git:push")
    pub operation: String,
    /// Free-form capability metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Capability {
    /// Create a new capability record.
    pub fn new(kind: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            operation: operation.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

// ============================================================================
// SECURITY DESCRIPTOR
// ============================================================================

/// Immutable information-flow metadata: `{labels, taint, sources,
/// capability, policy_context}`.
///
/// Invariant: `taint ⊆ labels`. The invariant is re-established on
/// deserialization and preserved by every operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(from = "DescriptorWire")]
pub struct SecurityDescriptor {
    labels: BTreeSet<Label>,
    taint: BTreeSet<Label>,
    sources: Vec<String>,
    capability: Option<Capability>,
    policy_context: BTreeMap<String, serde_json::Value>,
}

/// Serde shadow for [`SecurityDescriptor`]; deserialization funnels through
/// this shape so the taint invariant holds for any wire input.
#[derive(Deserialize)]
struct DescriptorWire {
    #[serde(default)]
    labels: BTreeSet<Label>,
    #[serde(default)]
    taint: BTreeSet<Label>,
    #[serde(default)]
    sources: Vec<String>,
    #[serde(default)]
    capability: Option<Capability>,
    #[serde(default)]
    policy_context: BTreeMap<String, serde_json::Value>,
}

impl From<DescriptorWire> for SecurityDescriptor {
    fn from(wire: DescriptorWire) -> Self {
        let mut labels = wire.labels;
        labels.extend(wire.taint.iter().cloned());
        Self {
            taint: wire.taint,
            labels,
            sources: dedup_first_occurrence(wire.sources),
            capability: wire.capability,
            policy_context: wire.policy_context,
        }
    }
}

/// Construction inputs for [`SecurityDescriptor::make`]. Invalid labels are
/// silently dropped during normalization.
#[derive(Debug, Clone, Default)]
pub struct DescriptorParts {
    pub labels: Vec<Label>,
    /// Explicit taint set; `None` defaults to `labels ∩ known-taint set`.
    pub taint: Option<Vec<Label>>,
    pub sources: Vec<String>,
    pub capability: Option<Capability>,
    pub policy_context: BTreeMap<String, serde_json::Value>,
}

impl DescriptorParts {
    /// Collect labels from raw strings, dropping anything that does not
    /// normalize to a valid label.
    pub fn with_labels<'a>(mut self, labels: impl IntoIterator<Item = &'a str>) -> Self {
        self.labels = labels.into_iter().filter_map(Label::normalize).collect();
        self
    }

    /// Set an explicit taint set from raw strings.
    pub fn with_taint<'a>(mut self, taint: impl IntoIterator<Item = &'a str>) -> Self {
        self.taint = Some(taint.into_iter().filter_map(Label::normalize).collect());
        self
    }

    /// Set the provenance trail.
    pub fn with_sources(mut self, sources: impl IntoIterator<Item = String>) -> Self {
        self.sources = sources.into_iter().collect();
        self
    }

    /// Set the capability record.
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = Some(capability);
        self
    }

    /// Add a policy-context entry.
    pub fn with_policy_entry(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.policy_context.insert(key.into(), value);
        self
    }
}

impl SecurityDescriptor {
    /// The empty descriptor: no labels, no taint, no sources.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a descriptor from parts, normalizing labels and sources.
    ///
    /// When `parts.taint` is absent, taint defaults to the intersection of
    /// the labels with the configured known-taint set. Taint labels not in
    /// `labels` are added to `labels` to keep the invariant.
    pub fn make(parts: DescriptorParts, config: &crate::MlldConfig) -> Self {
        let mut labels: BTreeSet<Label> = parts.labels.into_iter().collect();
        let taint: BTreeSet<Label> = match parts.taint {
            Some(explicit) => explicit.into_iter().collect(),
            None => labels
                .iter()
                .filter(|l| config.known_taints.contains(*l))
                .cloned()
                .collect(),
        };
        labels.extend(taint.iter().cloned());
        Self {
            labels,
            taint,
            sources: dedup_first_occurrence(parts.sources),
            capability: parts.capability,
            policy_context: parts.policy_context,
        }
    }

    /// Merge descriptors: labels and taint by union, sources by ordered
    /// union (first occurrence wins), policy context right-biased, and the
    /// last capability present wins.
    pub fn merge<'a>(descriptors: impl IntoIterator<Item = &'a SecurityDescriptor>) -> Self {
        let mut merged = Self::empty();
        for d in descriptors {
            merged.labels.extend(d.labels.iter().cloned());
            merged.taint.extend(d.taint.iter().cloned());
            for source in &d.sources {
                if !merged.sources.contains(source) {
                    merged.sources.push(source.clone());
                }
            }
            if d.capability.is_some() {
                merged.capability = d.capability.clone();
            }
            for (k, v) in &d.policy_context {
                merged.policy_context.insert(k.clone(), v.clone());
            }
        }
        merged
    }

    /// Canonical form: label order is already canonical (sorted sets);
    /// sources are deduplicated preserving first occurrence.
    pub fn normalize(&self) -> Self {
        let mut normalized = self.clone();
        normalized.sources = dedup_first_occurrence(normalized.sources);
        normalized
    }

    /// `self` subsumes `other` iff `self.labels ⊇ other.labels` and
    /// `self.taint ⊇ other.taint`.
    pub fn subsumes(&self, other: &Self) -> bool {
        other.labels.is_subset(&self.labels) && other.taint.is_subset(&self.taint)
    }

    /// Labels attached to the value.
    pub fn labels(&self) -> &BTreeSet<Label> {
        &self.labels
    }

    /// The enforced subset of labels.
    pub fn taint(&self) -> &BTreeSet<Label> {
        &self.taint
    }

    /// Provenance trail, first occurrence first.
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Capability record, if any.
    pub fn capability(&self) -> Option<&Capability> {
        self.capability.as_ref()
    }

    /// Opaque key/value map used by policy resolution.
    pub fn policy_context(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.policy_context
    }

    /// Whether the descriptor carries the given label.
    pub fn has_label(&self, label: &Label) -> bool {
        self.labels.contains(label)
    }

    /// Whether any taint is present.
    pub fn is_tainted(&self) -> bool {
        !self.taint.is_empty()
    }

    /// Return a descriptor with the source appended (if not already
    /// present).
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        let source = source.into();
        if !self.sources.contains(&source) {
            self.sources.push(source);
        }
        self
    }

    /// Return a descriptor with the capability set.
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = Some(capability);
        self
    }

    /// Return a descriptor with a policy-context entry set (right-biased).
    pub fn with_policy_entry(
        mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.policy_context.insert(key.into(), value);
        self
    }

    /// Return a descriptor with the labels added. Added labels join the
    /// taint set when the configuration knows them as taints.
    pub fn add_labels<'a>(
        mut self,
        labels: impl IntoIterator<Item = &'a Label>,
        config: &crate::MlldConfig,
    ) -> Self {
        for label in labels {
            if config.known_taints.contains(label) {
                self.taint.insert(label.clone());
            }
            self.labels.insert(label.clone());
        }
        self
    }

    /// Return a descriptor with the labels removed from both `labels` and
    /// `taint`. Privilege and protected-label rules are enforced by the
    /// guard engine before this is called.
    pub fn remove_labels<'a>(mut self, labels: impl IntoIterator<Item = &'a Label>) -> Self {
        for label in labels {
            self.labels.remove(label);
            self.taint.remove(label);
        }
        self
    }
}

fn dedup_first_occurrence(sources: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    sources
        .into_iter()
        .filter(|s| seen.insert(s.clone()))
        .collect()
}
