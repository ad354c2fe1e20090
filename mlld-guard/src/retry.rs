//! Retry coordination - attempt counters and hint history
//!
//! The attempt store is owned by the hook manager of a root environment.
//! Entries are keyed by operation identity, scope, and (for per-input
//! guards) variable identity. Retries serialize on the owning operation;
//! there is never more than one in-flight attempt per key.

use mlld_core::{AttemptRecord, GuardDecision, OperationId, VariableId};
use mlld_env::ScopeIndex;
use std::collections::HashMap;

/// Identity of a retryable guard evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptKey {
    pub operation: OperationId,
    pub scope: ScopeIndex,
    /// Present for per-input guards, absent for per-operation guards
    pub variable: Option<VariableId>,
}

impl AttemptKey {
    /// Key for a per-operation guard.
    pub fn operation(operation: OperationId, scope: ScopeIndex) -> Self {
        Self {
            operation,
            scope,
            variable: None,
        }
    }

    /// Key for a per-input guard on a specific variable.
    pub fn input(operation: OperationId, scope: ScopeIndex, variable: VariableId) -> Self {
        Self {
            operation,
            scope,
            variable: Some(variable),
        }
    }
}

/// Read-only view of the attempt state for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptView {
    /// 1-based attempt number the next evaluation runs as
    pub attempt: u32,
    pub tries: Vec<AttemptRecord>,
    pub hint_history: Vec<String>,
    pub max: u32,
}

#[derive(Debug, Default)]
struct AttemptState {
    next_attempt: u32,
    history: Vec<AttemptRecord>,
}

/// Owns the attempt counter and hint history per operation/scope/variable.
#[derive(Debug)]
pub struct RetryCoordinator {
    entries: HashMap<AttemptKey, AttemptState>,
    ceiling: u32,
}

impl RetryCoordinator {
    /// Create a coordinator with the configured overall retry ceiling.
    pub fn new(ceiling: u32) -> Self {
        Self {
            entries: HashMap::new(),
            ceiling: ceiling.max(1),
        }
    }

    /// Current attempt view for a key. A per-guard `max` narrows the
    /// configured ceiling but can never raise it.
    pub fn peek(&self, key: &AttemptKey, guard_max: Option<u32>) -> AttemptView {
        let max = guard_max
            .map(|m| m.clamp(1, self.ceiling))
            .unwrap_or(self.ceiling);
        match self.entries.get(key) {
            Some(state) => AttemptView {
                attempt: state.next_attempt.max(1),
                tries: state.history.clone(),
                hint_history: state
                    .history
                    .iter()
                    .filter_map(|record| record.hint.clone())
                    .collect(),
                max,
            },
            None => AttemptView {
                attempt: 1,
                tries: Vec::new(),
                hint_history: Vec::new(),
                max,
            },
        }
    }

    /// Record a retry decision for the current attempt and advance the
    /// counter.
    pub fn record_retry(&mut self, key: AttemptKey, hint: Option<String>) {
        let state = self.entries.entry(key).or_insert(AttemptState {
            next_attempt: 1,
            history: Vec::new(),
        });
        state.history.push(AttemptRecord {
            attempt: state.next_attempt.max(1),
            decision: GuardDecision::Retry,
            hint,
        });
        state.next_attempt = state.next_attempt.max(1) + 1;
    }

    /// Drop the entry on a terminal decision (allow, deny, or cancel).
    pub fn clear(&mut self, key: &AttemptKey) {
        self.entries.remove(key);
    }

    /// Drop every entry belonging to an operation, for cancellation
    /// between pre- and post-hooks.
    pub fn clear_operation(&mut self, operation: OperationId) {
        self.entries.retain(|key, _| key.operation != operation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlld_core::EntityIdType;

    fn key() -> AttemptKey {
        AttemptKey::operation(OperationId::now_v7(), ScopeIndex::ROOT)
    }

    #[test]
    fn test_fresh_key_starts_at_attempt_one() {
        let coordinator = RetryCoordinator::new(3);
        let view = coordinator.peek(&key(), None);
        assert_eq!(view.attempt, 1);
        assert_eq!(view.max, 3);
        assert!(view.tries.is_empty());
    }

    #[test]
    fn test_record_retry_advances_and_keeps_hints() {
        let mut coordinator = RetryCoordinator::new(3);
        let k = key();
        coordinator.record_retry(k, Some("try harder".to_string()));
        coordinator.record_retry(k, None);
        let view = coordinator.peek(&k, None);
        assert_eq!(view.attempt, 3);
        assert_eq!(view.tries.len(), 2);
        assert_eq!(view.hint_history, vec!["try harder".to_string()]);
    }

    #[test]
    fn test_guard_max_narrows_but_never_raises() {
        let coordinator = RetryCoordinator::new(3);
        assert_eq!(coordinator.peek(&key(), Some(2)).max, 2);
        assert_eq!(coordinator.peek(&key(), Some(10)).max, 3);
    }

    #[test]
    fn test_clear_resets() {
        let mut coordinator = RetryCoordinator::new(3);
        let k = key();
        coordinator.record_retry(k, None);
        coordinator.clear(&k);
        assert_eq!(coordinator.peek(&k, None).attempt, 1);
    }

    #[test]
    fn test_clear_operation_drops_all_variable_keys() {
        let mut coordinator = RetryCoordinator::new(3);
        let op = OperationId::now_v7();
        let a = AttemptKey::input(op, ScopeIndex::ROOT, VariableId::now_v7());
        let b = AttemptKey::input(op, ScopeIndex::ROOT, VariableId::now_v7());
        coordinator.record_retry(a, None);
        coordinator.record_retry(b, None);
        coordinator.clear_operation(op);
        assert_eq!(coordinator.peek(&a, None).attempt, 1);
        assert_eq!(coordinator.peek(&b, None).attempt, 1);
    }
}
