//! Guard registry - indexed store of guard definitions
//!
//! Guards are indexed by data label and by normalized operation key, per
//! timing. Lookups are deterministic and stable across runs: every index
//! bucket preserves registration order, and registration order equals
//! insertion order. Definitions are read-only after registration.

use mlld_core::{
    normalize_op_filter, GuardDefinition, GuardFilterKind, GuardId, GuardScope, GuardTiming, Label,
};
use std::collections::{HashMap, HashSet};

/// Indexed store of guard definitions.
#[derive(Debug, Default)]
pub struct GuardRegistry {
    /// All guards in insertion order
    guards: Vec<GuardDefinition>,
    ids: HashSet<GuardId>,
    /// filter label -> positions, in insertion order
    by_label: HashMap<String, Vec<usize>>,
    /// normalized op key -> positions, in insertion order
    by_operation: HashMap<String, Vec<usize>>,
}

impl GuardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a guard. Registration is additive; a guard whose `id` is
    /// already present is ignored.
    pub fn register(&mut self, definition: GuardDefinition) {
        if !self.ids.insert(definition.id) {
            return;
        }
        let position = self.guards.len();
        match definition.filter_kind {
            GuardFilterKind::Label | GuardFilterKind::OperationTag => {
                self.by_label
                    .entry(definition.filter_value.to_ascii_lowercase())
                    .or_default()
                    .push(position);
            }
            GuardFilterKind::Op => {
                self.by_operation
                    .entry(normalize_op_filter(&definition.filter_value))
                    .or_default()
                    .push(position);
            }
        }
        self.guards.push(definition);
    }

    /// Number of registered guards.
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// All guards, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &GuardDefinition> {
        self.guards.iter()
    }

    /// Guards filtering on a data label that apply at the evaluation point.
    pub fn data_guards_for_timing(
        &self,
        label: &Label,
        point: GuardTiming,
    ) -> Vec<&GuardDefinition> {
        self.label_bucket(label.as_str())
            .filter(|g| g.filter_kind == GuardFilterKind::Label && g.timing.applies_at(point))
            .collect()
    }

    /// Guards filtering on a normalized operation key that apply at the
    /// evaluation point.
    pub fn operation_guards_for_timing(
        &self,
        op_key: &str,
        point: GuardTiming,
    ) -> Vec<&GuardDefinition> {
        let key = normalize_op_filter(op_key);
        match self.by_operation.get(&key) {
            Some(positions) => positions
                .iter()
                .map(|&i| &self.guards[i])
                .filter(|g| g.timing.applies_at(point))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Guards filtering on a call-site operation tag that apply at the
    /// evaluation point.
    pub fn operation_tag_guards_for_timing(
        &self,
        tag: &Label,
        point: GuardTiming,
    ) -> Vec<&GuardDefinition> {
        self.label_bucket(tag.as_str())
            .filter(|g| {
                g.filter_kind == GuardFilterKind::OperationTag && g.timing.applies_at(point)
            })
            .collect()
    }

    /// Per-operation guards keyed by a data label, for broad-label sweeps.
    pub fn operation_scope_label_guards_for_timing(
        &self,
        label: &Label,
        point: GuardTiming,
    ) -> Vec<&GuardDefinition> {
        self.label_bucket(label.as_str())
            .filter(|g| {
                g.filter_kind == GuardFilterKind::Label
                    && g.scope == GuardScope::PerOperation
                    && g.timing.applies_at(point)
            })
            .collect()
    }

    fn label_bucket(&self, key: &str) -> impl Iterator<Item = &GuardDefinition> {
        self.by_label
            .get(&key.to_ascii_lowercase())
            .into_iter()
            .flatten()
            .map(|&i| &self.guards[i])
    }

    // ------------------------------------------------------------------
    // Serialization for import/export between modules
    // ------------------------------------------------------------------

    /// All guards in the serialized wire form.
    pub fn serialize_own(&self) -> Vec<GuardDefinition> {
        self.guards.clone()
    }

    /// The named guards in the serialized wire form. Unknown names are
    /// skipped.
    pub fn serialize_by_names(&self, names: &[String]) -> Vec<GuardDefinition> {
        self.guards
            .iter()
            .filter(|g| names.iter().any(|n| g.display_name() == *n))
            .cloned()
            .collect()
    }

    /// Import serialized guards. Additive; duplicates by `id` are ignored.
    pub fn import_serialized(&mut self, definitions: Vec<GuardDefinition>) {
        for definition in definitions {
            self.register(definition);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlld_core::{GuardAction, GuardRule};

    fn label(s: &str) -> Label {
        Label::normalize(s).expect("valid label")
    }

    fn label_guard(name: &str, on: &str, timing: GuardTiming) -> GuardDefinition {
        GuardDefinition::on_label(
            name,
            label(on),
            timing,
            vec![GuardRule::otherwise(GuardAction::allow())],
        )
    }

    fn op_guard(name: &str, key: &str, timing: GuardTiming) -> GuardDefinition {
        GuardDefinition::on_operation(
            name,
            key,
            timing,
            vec![GuardRule::otherwise(GuardAction::allow())],
        )
    }

    #[test]
    fn test_label_lookup_preserves_insertion_order() {
        let mut registry = GuardRegistry::new();
        registry.register(label_guard("first", "secret", GuardTiming::Before));
        registry.register(label_guard("second", "secret", GuardTiming::Always));
        registry.register(label_guard("other", "untrusted", GuardTiming::Before));

        let found = registry.data_guards_for_timing(&label("secret"), GuardTiming::Before);
        let names: Vec<_> = found.iter().map(|g| g.display_name()).collect();
        assert_eq!(names, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn test_timing_filter() {
        let mut registry = GuardRegistry::new();
        registry.register(op_guard("afterOnly", "exe", GuardTiming::After));
        assert!(registry
            .operation_guards_for_timing("exe", GuardTiming::Before)
            .is_empty());
        assert_eq!(
            registry
                .operation_guards_for_timing("exe", GuardTiming::After)
                .len(),
            1
        );
    }

    #[test]
    fn test_op_prefix_normalized_on_both_sides() {
        let mut registry = GuardRegistry::new();
        registry.register(op_guard("validate", "op:exe", GuardTiming::After));
        assert_eq!(
            registry
                .operation_guards_for_timing("exe", GuardTiming::After)
                .len(),
            1
        );
    }

    #[test]
    fn test_duplicate_ids_ignored() {
        let mut registry = GuardRegistry::new();
        let guard = op_guard("validate", "exe", GuardTiming::After);
        registry.register(guard.clone());
        registry.register(guard);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_serialize_round_trip_through_wire() {
        let mut registry = GuardRegistry::new();
        registry.register(label_guard("a", "secret", GuardTiming::Before));
        registry.register(op_guard("b", "cmd", GuardTiming::Always));

        let wire = serde_json::to_string(&registry.serialize_own()).expect("serialize");
        let defs: Vec<GuardDefinition> = serde_json::from_str(&wire).expect("deserialize");

        let mut imported = GuardRegistry::new();
        imported.import_serialized(defs);
        assert_eq!(imported.len(), 2);
        // Re-importing the same wire is a no-op
        imported.import_serialized(serde_json::from_str(&wire).expect("deserialize"));
        assert_eq!(imported.len(), 2);
    }

    #[test]
    fn test_serialize_by_names() {
        let mut registry = GuardRegistry::new();
        registry.register(label_guard("a", "secret", GuardTiming::Before));
        registry.register(op_guard("b", "cmd", GuardTiming::Always));
        let only_b = registry.serialize_by_names(&["b".to_string()]);
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].display_name(), "b");
    }
}
