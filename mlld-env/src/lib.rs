//! mlld Environment - Scopes and Context Stacks
//!
//! Hierarchical variable scope with a parent chain, the operation/pipeline/
//! guard/denied context stacks, guard suppression, security-descriptor
//! aggregation, and effect emission.
//!
//! Scopes live in an arena indexed by [`ScopeIndex`]; parent references are
//! indices, never shared pointers, so the variable graph has no cycles and
//! scope lifetime is explicit. Child scopes read through their parent chain
//! but never mutate a parent.

use mlld_core::{
    DeniedContext, GuardContextSnapshot, GuardHistoryEntry, MlldConfig, OperationContext,
    OperationId, PipelineContext, SecurityDescriptor, Variable,
};
use mlld_events::{EffectKind, EventPayload, EventSink, EventSinkExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

// ============================================================================
// SCOPE ARENA
// ============================================================================

/// Index of a scope in the environment's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeIndex(u32);

impl ScopeIndex {
    /// The root scope of every environment.
    pub const ROOT: ScopeIndex = ScopeIndex(0);
}

#[derive(Debug, Default)]
struct Scope {
    parent: Option<ScopeIndex>,
    variables: BTreeMap<String, Variable>,
}

// ============================================================================
// ENVIRONMENT
// ============================================================================

/// The interpreter environment: variable scopes, context stacks, descriptor
/// aggregation, and the event sink.
pub struct Environment {
    scopes: Vec<Scope>,
    operation_stack: Vec<OperationContext>,
    pipeline_stack: Vec<PipelineContext>,
    guard_stack: Vec<GuardContextSnapshot>,
    denied_stack: Vec<DeniedContext>,
    suppress_depth: u32,
    guard_history: Vec<GuardHistoryEntry>,
    recorded: HashMap<OperationId, SecurityDescriptor>,
    sink: Rc<dyn EventSink>,
    config: MlldConfig,
}

impl Environment {
    /// Create a root environment with the given configuration and sink.
    pub fn new(config: MlldConfig, sink: Rc<dyn EventSink>) -> Self {
        Self {
            scopes: vec![Scope::default()],
            operation_stack: Vec::new(),
            pipeline_stack: Vec::new(),
            guard_stack: Vec::new(),
            denied_stack: Vec::new(),
            suppress_depth: 0,
            guard_history: Vec::new(),
            recorded: HashMap::new(),
            sink,
            config,
        }
    }

    /// The startup configuration.
    pub fn config(&self) -> &MlldConfig {
        &self.config
    }

    /// The event sink handle.
    pub fn sink(&self) -> Rc<dyn EventSink> {
        Rc::clone(&self.sink)
    }

    // ------------------------------------------------------------------
    // Scopes and variables
    // ------------------------------------------------------------------

    /// The root scope.
    pub fn root(&self) -> ScopeIndex {
        ScopeIndex::ROOT
    }

    /// Create a child scope; reads fall through to the parent chain.
    pub fn create_child(&mut self, parent: ScopeIndex) -> ScopeIndex {
        let index = ScopeIndex(self.scopes.len() as u32);
        self.scopes.push(Scope {
            parent: Some(parent),
            variables: BTreeMap::new(),
        });
        index
    }

    /// Parent of a scope, if it has one.
    pub fn parent_of(&self, scope: ScopeIndex) -> Option<ScopeIndex> {
        self.scopes.get(scope.0 as usize)?.parent
    }

    /// Bind a variable in the given scope, shadowing any parent binding.
    pub fn set_variable(&mut self, scope: ScopeIndex, variable: Variable) {
        self.sink.emit(EventPayload::VariableCreate {
            name: variable.name.clone(),
            kind: variable.kind,
        });
        self.scopes[scope.0 as usize]
            .variables
            .insert(variable.name.clone(), variable);
    }

    /// Bind a parameter variable (marks the binding as a parameter).
    pub fn set_parameter_variable(&mut self, scope: ScopeIndex, variable: Variable) {
        self.set_variable(
            scope,
            variable.with_flags(mlld_core::VariableFlags::PARAMETER),
        );
    }

    /// Look up a variable, falling through the parent chain. Returns `None`
    /// rather than an error; the directive layer decides strictness.
    pub fn get_variable(&self, scope: ScopeIndex, name: &str) -> Option<&Variable> {
        let mut cursor = Some(scope);
        while let Some(index) = cursor {
            let scope = &self.scopes[index.0 as usize];
            if let Some(variable) = scope.variables.get(name) {
                self.sink.emit(EventPayload::VariableAccess {
                    name: name.to_string(),
                });
                return Some(variable);
            }
            cursor = scope.parent;
        }
        None
    }

    /// Whether a variable is visible from the scope.
    pub fn has_variable(&self, scope: ScopeIndex, name: &str) -> bool {
        self.get_variable(scope, name).is_some()
    }

    /// Flatten the scope chain, child bindings shadowing parents.
    pub fn get_all_variables(&self, scope: ScopeIndex) -> BTreeMap<String, &Variable> {
        let mut chain = Vec::new();
        let mut cursor = Some(scope);
        while let Some(index) = cursor {
            chain.push(index);
            cursor = self.scopes[index.0 as usize].parent;
        }
        let mut flattened = BTreeMap::new();
        for index in chain.into_iter().rev() {
            for (name, variable) in &self.scopes[index.0 as usize].variables {
                flattened.insert(name.clone(), variable);
            }
        }
        flattened
    }

    /// Update a variable in place in the scope where it is bound. Used by
    /// the guard engine to synchronize a binding's context with a new
    /// descriptor.
    pub fn update_variable(&mut self, scope: ScopeIndex, variable: Variable) {
        let mut cursor = Some(scope);
        while let Some(index) = cursor {
            let s = &mut self.scopes[index.0 as usize];
            if s.variables.contains_key(&variable.name) {
                s.variables.insert(variable.name.clone(), variable);
                return;
            }
            cursor = s.parent;
        }
        self.scopes[scope.0 as usize]
            .variables
            .insert(variable.name.clone(), variable);
    }

    // ------------------------------------------------------------------
    // Context stacks
    // ------------------------------------------------------------------

    /// Run `f` with the operation pushed; the pop happens on every exit
    /// path out of `f`. Publishes the directive lifecycle events, the
    /// completion event carrying the descriptors recorded during the
    /// operation.
    pub fn with_operation<R>(
        &mut self,
        operation: OperationContext,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        let operation_id = operation.operation_id;
        let key = operation
            .operation_keys()
            .first()
            .cloned()
            .unwrap_or_default();
        self.sink.emit(EventPayload::DirectiveStart {
            operation: key.clone(),
            descriptor: SecurityDescriptor::empty(),
        });
        self.operation_stack.push(operation);
        let result = f(self);
        self.operation_stack.pop();
        let descriptor = self
            .recorded
            .get(&operation_id)
            .cloned()
            .unwrap_or_else(SecurityDescriptor::empty);
        self.sink.emit(EventPayload::DirectiveComplete {
            operation: key,
            descriptor,
        });
        result
    }

    /// The operation currently under evaluation.
    pub fn current_operation(&self) -> Option<&OperationContext> {
        self.operation_stack.last()
    }

    /// Run `f` with the pipeline context pushed.
    pub fn with_pipeline_context<R>(
        &mut self,
        context: PipelineContext,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        self.pipeline_stack.push(context);
        let result = f(self);
        self.pipeline_stack.pop();
        result
    }

    /// The innermost pipeline context.
    pub fn current_pipeline(&self) -> Option<&PipelineContext> {
        self.pipeline_stack.last()
    }

    /// Run `f` with the guard snapshot pushed.
    pub fn with_guard_context<R>(
        &mut self,
        snapshot: GuardContextSnapshot,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        self.guard_stack.push(snapshot);
        let result = f(self);
        self.guard_stack.pop();
        result
    }

    /// The snapshot of the guard currently evaluating.
    pub fn current_guard_context(&self) -> Option<&GuardContextSnapshot> {
        self.guard_stack.last()
    }

    /// Run `f` with the denied context pushed (fallback evaluation after a
    /// guard denial).
    pub fn with_denied_context<R>(
        &mut self,
        context: DeniedContext,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        self.denied_stack.push(context);
        let result = f(self);
        self.denied_stack.pop();
        result
    }

    /// The innermost denied context.
    pub fn current_denied(&self) -> Option<&DeniedContext> {
        self.denied_stack.last()
    }

    /// Whether the source of the operation can be re-executed: the
    /// operation's own metadata wins, then the pipeline context, then no.
    pub fn source_retryable(&self, operation: &OperationContext) -> bool {
        operation
            .metadata
            .source_retryable
            .or_else(|| self.current_pipeline().map(|p| p.source_retryable))
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Guard suppression
    // ------------------------------------------------------------------

    /// Whether guard evaluation is suppressed (already inside a guard).
    pub fn should_suppress_guards(&self) -> bool {
        self.suppress_depth > 0
    }

    /// Run `f` with guards suppressed, preventing guard-inside-guard
    /// recursion.
    pub fn with_guard_suppression<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.suppress_depth += 1;
        let result = f(self);
        self.suppress_depth -= 1;
        result
    }

    // ------------------------------------------------------------------
    // Security descriptors
    // ------------------------------------------------------------------

    /// Merge descriptors with the standard algebra.
    pub fn merge_security_descriptors<'a>(
        &self,
        descriptors: impl IntoIterator<Item = &'a SecurityDescriptor>,
    ) -> SecurityDescriptor {
        SecurityDescriptor::merge(descriptors)
    }

    /// Accumulate a descriptor into the current operation's record for
    /// observability. A no-op outside any operation.
    pub fn record_security_descriptor(&mut self, descriptor: &SecurityDescriptor) {
        if let Some(operation) = self.operation_stack.last() {
            let entry = self
                .recorded
                .entry(operation.operation_id)
                .or_insert_with(SecurityDescriptor::empty);
            *entry = SecurityDescriptor::merge([&*entry, descriptor]);
        }
    }

    /// The descriptor recorded for an operation, if any.
    pub fn recorded_descriptor(&self, operation_id: OperationId) -> Option<&SecurityDescriptor> {
        self.recorded.get(&operation_id)
    }

    // ------------------------------------------------------------------
    // Effects, events, history
    // ------------------------------------------------------------------

    /// Publish a user-visible effect to the host.
    pub fn emit_effect(&self, kind: EffectKind, text: impl Into<String>, source: Option<String>) {
        self.sink.emit_effect(kind, text, source);
    }

    /// Publish an arbitrary event payload.
    pub fn emit(&self, payload: EventPayload) {
        self.sink.emit(payload);
    }

    /// Append to the shared pipeline guard history.
    pub fn push_guard_history(&mut self, entry: GuardHistoryEntry) {
        self.guard_history.push(entry);
    }

    /// The shared pipeline guard history, oldest first.
    pub fn guard_history(&self) -> &[GuardHistoryEntry] {
        &self.guard_history
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use mlld_core::{StructuredValue, Variable, VariableKind};
    use mlld_events::NullSink;
    use proptest::prelude::*;

    fn fresh_env() -> Environment {
        Environment::new(MlldConfig::default(), Rc::new(NullSink))
    }

    fn var(name: &str, text: &str) -> Variable {
        Variable::declare(name, VariableKind::SimpleText, StructuredValue::text(text))
    }

    proptest! {
        /// A binding set anywhere on a scope chain is visible from every
        /// descendant, and a name bound nowhere resolves to None at every
        /// depth.
        #[test]
        fn prop_parent_fallthrough(
            depth in 1usize..8,
            bind_at in 0usize..8,
        ) {
            let bind_at = bind_at.min(depth);
            let mut env = fresh_env();
            let mut chain = vec![env.root()];
            for _ in 0..depth {
                let child = env.create_child(*chain.last().expect("chain is non-empty"));
                chain.push(child);
            }
            env.set_variable(chain[bind_at], var("needle", "found"));

            for scope in &chain[bind_at..] {
                prop_assert_eq!(
                    env.get_variable(*scope, "needle").map(|v| v.value().as_text()),
                    Some("found")
                );
                prop_assert!(env.get_variable(*scope, "missing").is_none());
            }
        }

        /// The innermost binding of a name wins, and `get_all_variables`
        /// agrees with `get_variable` on every visible name.
        #[test]
        fn prop_shadowing_and_flattening_agree(
            depth in 1usize..6,
            values in proptest::collection::vec("[a-z]{1,8}", 1..6),
        ) {
            let mut env = fresh_env();
            let mut scope = env.root();
            let mut chain = vec![scope];
            for _ in 0..depth {
                scope = env.create_child(scope);
                chain.push(scope);
            }
            // Rebind the same name at successive depths; the deepest wins.
            for (level, value) in values.iter().enumerate() {
                env.set_variable(chain[level.min(depth)], var("shadowed", value));
            }
            let leaf = *chain.last().expect("chain is non-empty");
            let flattened = env.get_all_variables(leaf);
            for (name, variable) in &flattened {
                prop_assert_eq!(
                    env.get_variable(leaf, name).map(|v| v.value().as_text()),
                    Some(variable.value().as_text())
                );
            }
            let expected = values
                .iter()
                .enumerate()
                .max_by_key(|(level, _)| (*level).min(depth))
                .map(|(_, value)| value.as_str());
            prop_assert_eq!(
                env.get_variable(leaf, "shadowed").map(|v| v.value().as_text()),
                expected
            );
        }

        /// Guard suppression is balanced across arbitrary nesting depth.
        #[test]
        fn prop_suppression_balances(depth in 1usize..10) {
            let mut env = fresh_env();
            fn nest(env: &mut Environment, remaining: usize) {
                assert!(env.should_suppress_guards());
                if remaining > 0 {
                    env.with_guard_suppression(|env| nest(env, remaining - 1));
                    assert!(env.should_suppress_guards());
                }
            }
            prop_assert!(!env.should_suppress_guards());
            env.with_guard_suppression(|env| nest(env, depth));
            prop_assert!(!env.should_suppress_guards());
        }
    }
}
