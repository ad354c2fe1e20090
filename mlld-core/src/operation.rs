//! Operation contexts for observable operations

use crate::descriptor::Label;
use crate::identity::{EntityIdType, OperationId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// OPERATION CONTEXT
// ============================================================================

/// Free-form metadata carried by an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OperationMetadata {
    /// Finer-grained run subtype (e.g., "runCommand", "runExecReference")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_subtype: Option<String>,
    /// Language for code execution operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Whether the operation streams its output
    #[serde(default)]
    pub streaming: bool,
    /// Whether the operation's source can be re-executed on retry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_retryable: Option<bool>,
    /// Recorded tool-call trace for enforcement guards
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<String>,
    /// Anything else the host attaches
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Context describing one observable operation: `{type, subtype, name,
/// labels, metadata}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationContext {
    pub operation_id: OperationId,
    /// Directive kind ("show", "run", "exe", "llm", ...)
    #[serde(rename = "type")]
    pub op_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Labels attached at the call site
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub metadata: OperationMetadata,
}

impl OperationContext {
    /// Create an operation context for a directive kind.
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            operation_id: OperationId::now_v7(),
            op_type: op_type.into(),
            subtype: None,
            name: None,
            labels: Vec::new(),
            metadata: OperationMetadata::default(),
        }
    }

    /// Set the subtype.
    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    /// Set the operation name (target executable or directive name).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attach call-site labels.
    pub fn with_labels(mut self, labels: impl IntoIterator<Item = Label>) -> Self {
        self.labels = labels.into_iter().collect();
        self
    }

    /// Replace the metadata.
    pub fn with_metadata(mut self, metadata: OperationMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Mark the operation as streaming.
    pub fn streaming(mut self) -> Self {
        self.metadata.streaming = true;
        self
    }

    /// Normalized operation keys used for guard and policy lookups.
    ///
    /// All keys are lowercased. Synonyms: `run` with subtype `runCommand`
    /// adds `cmd`; a `runExec*` subtype adds `exec`; `runCode` adds `code`
    /// and the language key when present. Order is deterministic and
    /// duplicates are removed.
    pub fn operation_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        let mut push = |keys: &mut Vec<String>, key: String| {
            if !key.is_empty() && !keys.contains(&key) {
                keys.push(key);
            }
        };

        push(&mut keys, self.op_type.to_ascii_lowercase());
        if let Some(subtype) = &self.subtype {
            push(&mut keys, subtype.to_ascii_lowercase());
            if self.op_type.eq_ignore_ascii_case("run") && subtype == "runCommand" {
                push(&mut keys, "cmd".to_string());
            }
            if subtype.starts_with("runExec") {
                push(&mut keys, "exec".to_string());
            }
            if subtype == "runCode" {
                push(&mut keys, "code".to_string());
                if let Some(language) = &self.metadata.language {
                    push(&mut keys, language.to_ascii_lowercase());
                }
            }
        }
        if let Some(name) = &self.name {
            push(&mut keys, name.to_ascii_lowercase());
        }
        keys
    }
}

/// Normalize a guard or policy operation filter to the key space produced
/// by [`OperationContext::operation_keys`]. A leading `op:` prefix is
/// stripped.
pub fn normalize_op_filter(value: &str) -> String {
    let trimmed = value.trim();
    let stripped = trimmed.strip_prefix("op:").unwrap_or(trimmed);
    stripped.to_ascii_lowercase()
}

// ============================================================================
// PIPELINE AND DENIED CONTEXTS
// ============================================================================

/// Context for the current pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineContext {
    /// Zero-based stage index
    pub stage: u32,
    pub total_stages: u32,
    /// Whether the stage's source can be re-executed on retry
    pub source_retryable: bool,
}

/// Context pushed while evaluating a fallback after a guard denial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeniedContext {
    /// Key of the denied operation
    pub operation: String,
    /// First reason recorded for the denial
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_command_synonym() {
        let op = OperationContext::new("run").with_subtype("runCommand");
        let keys = op.operation_keys();
        assert!(keys.contains(&"run".to_string()));
        assert!(keys.contains(&"runcommand".to_string()));
        assert!(keys.contains(&"cmd".to_string()));
    }

    #[test]
    fn test_run_exec_synonym() {
        let op = OperationContext::new("run").with_subtype("runExecReference");
        assert!(op.operation_keys().contains(&"exec".to_string()));
    }

    #[test]
    fn test_run_code_adds_language() {
        let mut op = OperationContext::new("run").with_subtype("runCode");
        op.metadata.language = Some("JS".to_string());
        let keys = op.operation_keys();
        assert!(keys.contains(&"code".to_string()));
        assert!(keys.contains(&"js".to_string()));
    }

    #[test]
    fn test_keys_deterministic_and_deduped() {
        let op = OperationContext::new("show").with_name("Show");
        assert_eq!(op.operation_keys(), vec!["show".to_string()]);
    }

    #[test]
    fn test_filter_normalization_strips_op_prefix() {
        assert_eq!(normalize_op_filter("op:exe"), "exe");
        assert_eq!(normalize_op_filter("LLM"), "llm");
    }
}
