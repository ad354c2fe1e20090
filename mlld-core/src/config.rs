//! Configuration types

use crate::descriptor::Label;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Master configuration struct for the guard engine.
///
/// The protected set and the known-taint set are configuration inputs fixed
/// at startup; no code path consults a process-wide default instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlldConfig {
    /// Labels whose removal is forbidden regardless of guard privilege.
    /// Every `src:`-namespaced label is protected in addition to this set.
    pub protected_labels: BTreeSet<Label>,
    /// Labels that demand downstream enforcement. When a descriptor is made
    /// without an explicit taint set, its taint defaults to the intersection
    /// of its labels with this set.
    pub known_taints: BTreeSet<Label>,
    /// Overall ceiling on guard retry attempts per operation.
    pub max_retries: u32,
    /// Width, in characters, of input/output previews recorded in guard
    /// snapshots and errors.
    pub preview_width: usize,
}

impl MlldConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_retries".to_string(),
                value: "0".to_string(),
                reason: "at least one attempt is required".to_string(),
            });
        }
        if self.preview_width == 0 {
            return Err(ConfigError::InvalidValue {
                field: "preview_width".to_string(),
                value: "0".to_string(),
                reason: "previews cannot be zero-width".to_string(),
            });
        }
        Ok(())
    }

    /// Whether the label is currently protected.
    ///
    /// The `src:` provenance namespace is protected as a whole.
    pub fn is_protected_label(&self, label: &Label) -> bool {
        label.is_src() || self.protected_labels.contains(label)
    }

    /// Replace the protected set.
    pub fn with_protected_labels(mut self, labels: impl IntoIterator<Item = Label>) -> Self {
        self.protected_labels = labels.into_iter().collect();
        self
    }

    /// Replace the known-taint set.
    pub fn with_known_taints(mut self, labels: impl IntoIterator<Item = Label>) -> Self {
        self.known_taints = labels.into_iter().collect();
        self
    }

    /// Set the retry ceiling.
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }
}

impl Default for MlldConfig {
    fn default() -> Self {
        let protected: BTreeSet<Label> = ["untrusted", "influenced", "secret"]
            .iter()
            .filter_map(|l| Label::normalize(l))
            .collect();
        let mut known = protected.clone();
        known.extend(Label::normalize("destructive"));
        Self {
            protected_labels: protected,
            known_taints: known,
            max_retries: 3,
            preview_width: 120,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(MlldConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_retries_rejected() {
        let config = MlldConfig::default().with_max_retries(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_src_namespace_is_protected() {
        let config = MlldConfig::default().with_protected_labels([]);
        let src = Label::normalize("src:mcp").expect("valid label");
        let plain = Label::normalize("untrusted").expect("valid label");
        assert!(config.is_protected_label(&src));
        assert!(!config.is_protected_label(&plain));
    }
}
