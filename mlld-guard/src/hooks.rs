//! Hook dispatch - the boundary between directive evaluators and guards
//!
//! The hook manager owns the guard registry, the retry coordinator, and the
//! host executables. Directive evaluators call [`HookManager::pre`] before
//! running an operation body and [`HookManager::post`] on the result; retry
//! and deny travel back as values, never as panics.
//!
//! The [`GuardExecutable`] trait is the engine's suspension seam: a host
//! implementation may block on I/O, an external command, or an LLM call.
//! While one executable runs, no other guard or hook runs for the same
//! operation.

use crate::eval::{evaluate_selected, select_guards, AggregateOutcome, DeciderInfo};
use crate::registry::GuardRegistry;
use crate::retry::RetryCoordinator;
use mlld_core::preview;
use mlld_core::{
    GuardContextSnapshot, GuardDecision, GuardError, GuardHistoryEntry, GuardOverride,
    GuardRetrySignal, GuardScope, GuardTiming, InterpreterError, MlldConfig, MlldError,
    OperationContext, OperationId, StructuredValue, Variable,
};
use mlld_env::{Environment, ScopeIndex};
use mlld_events::{EventPayload, GuardEvalEvent};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use thiserror::Error;

// ============================================================================
// HOST EXECUTABLES
// ============================================================================

/// Arguments handed to a host executable invoked from a guard script.
#[derive(Debug, Clone, Copy)]
pub struct GuardCall<'a> {
    /// The materialized guard subject
    pub input: &'a StructuredValue,
    /// Current output, present in after-hooks
    pub output: Option<&'a StructuredValue>,
    pub operation: &'a OperationContext,
    pub snapshot: Option<&'a GuardContextSnapshot>,
}

/// A host-provided executable callable from guard conditions and
/// replacement expressions. This is the engine's suspension point.
pub trait GuardExecutable {
    fn invoke(&self, call: &GuardCall<'_>) -> Result<serde_json::Value, InterpreterError>;
}

pub(crate) type ExecMap = BTreeMap<String, Rc<dyn GuardExecutable>>;

// ============================================================================
// HOOK RESULTS
// ============================================================================

/// The directive result flowing through the post-hook.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalResult {
    /// The structured value, context attached
    pub value: StructuredValue,
    /// Text view for stream consumers
    pub stdout: String,
}

impl EvalResult {
    /// Wrap a structured value; `stdout` mirrors its text view.
    pub fn new(value: StructuredValue) -> Self {
        let stdout = value.as_text().to_string();
        Self { value, stdout }
    }

    /// Wrap plain text output.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(StructuredValue::text(text))
    }
}

/// The aggregate decision a hook chain reports to the directive runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    Continue,
    Retry,
    Abort,
}

/// Outcome of the pre-hook chain. First abort wins; any retry wins over
/// the remaining continues.
#[derive(Debug)]
pub enum PreOutcome {
    /// Proceed with the (possibly transformed) inputs
    Continue { inputs: Vec<Variable> },
    /// Rerun the operation with the signal's hint
    Retry(GuardRetrySignal),
    /// The operation is denied before its body runs
    Abort(GuardError),
}

impl PreOutcome {
    pub fn action(&self) -> HookAction {
        match self {
            PreOutcome::Continue { .. } => HookAction::Continue,
            PreOutcome::Retry(_) => HookAction::Retry,
            PreOutcome::Abort(_) => HookAction::Abort,
        }
    }
}

/// Failure of the post-hook chain. The directive runtime matches on this;
/// an uncaught `Retry` degrades to a deny.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("{0}")]
    Deny(GuardError),

    #[error("{0}")]
    Retry(GuardRetrySignal),

    /// Engine failure (privilege violation, unknown executable, ...)
    #[error("{0}")]
    Fault(MlldError),
}

impl HookError {
    /// Degrade to the canonical guard error, converting an uncaught retry
    /// into its deny form.
    pub fn into_guard_error(self) -> Result<GuardError, MlldError> {
        match self {
            HookError::Deny(error) => Ok(error),
            HookError::Retry(signal) => Ok(signal.into_deny()),
            HookError::Fault(error) => Err(error),
        }
    }
}

// ============================================================================
// HOOK MANAGER
// ============================================================================

/// Dispatches the pre- and post-hook chains around every observable
/// operation. One hook manager serves one root environment; the attempt
/// store lives here.
pub struct HookManager {
    registry: GuardRegistry,
    retry: RetryCoordinator,
    executables: ExecMap,
}

impl HookManager {
    /// Create a hook manager honoring the configured retry ceiling.
    pub fn new(config: &MlldConfig) -> Self {
        Self {
            registry: GuardRegistry::new(),
            retry: RetryCoordinator::new(config.max_retries),
            executables: BTreeMap::new(),
        }
    }

    /// The guard registry.
    pub fn registry(&self) -> &GuardRegistry {
        &self.registry
    }

    /// Mutable access for registration and import.
    pub fn registry_mut(&mut self) -> &mut GuardRegistry {
        &mut self.registry
    }

    /// Register a guard definition.
    pub fn register_guard(&mut self, definition: mlld_core::GuardDefinition) {
        self.registry.register(definition);
    }

    /// Register a host executable resolvable from guard scripts.
    pub fn register_executable(
        &mut self,
        name: impl Into<String>,
        executable: Rc<dyn GuardExecutable>,
    ) {
        self.executables.insert(name.into(), executable);
    }

    /// Cancel an operation between its pre- and post-hooks: the attempt
    /// store entries are cleared and no post-hooks will run for it.
    pub fn cancel(&mut self, operation: OperationId) {
        self.retry.clear_operation(operation);
    }

    /// Run the pre-hook chain for an operation.
    pub fn pre(
        &mut self,
        env: &mut Environment,
        scope: ScopeIndex,
        inputs: &[Variable],
        operation: &OperationContext,
        guard_override: Option<&GuardOverride>,
    ) -> Result<PreOutcome, MlldError> {
        if env.should_suppress_guards() {
            return Ok(PreOutcome::Continue {
                inputs: inputs.to_vec(),
            });
        }

        // Streaming output cannot satisfy after-guards, which need the
        // complete result; refuse deterministically before the body runs.
        if operation.metadata.streaming {
            let after = select_guards(
                &self.registry,
                operation,
                inputs,
                GuardTiming::After,
                guard_override,
            )?;
            if !after.is_empty() {
                let guards: Vec<String> = after
                    .iter()
                    .map(|s| s.definition.display_name())
                    .collect();
                let reason = InterpreterError::StreamingAfterGuards { guards }.to_string();
                let error = GuardError::deny(operation_key(operation), GuardTiming::Before, reason);
                self.retry.clear_operation(operation.operation_id);
                return Ok(PreOutcome::Abort(error));
            }
        }

        let selected = select_guards(
            &self.registry,
            operation,
            inputs,
            GuardTiming::Before,
            guard_override,
        )?;
        if selected.is_empty() {
            return Ok(PreOutcome::Continue {
                inputs: inputs.to_vec(),
            });
        }

        let outcome = evaluate_selected(
            env,
            scope,
            &self.executables,
            &mut self.retry,
            &selected,
            operation,
            inputs,
            None,
            GuardTiming::Before,
        )?;

        self.publish(env, inputs, &outcome, GuardTiming::Before);

        match outcome.decision {
            GuardDecision::Allow | GuardDecision::Env => {
                for binding in &outcome.env_bindings {
                    env.set_variable(scope, binding.clone());
                }
                for variable in &outcome.transformed_inputs {
                    env.update_variable(scope, variable.clone());
                }
                Ok(PreOutcome::Continue {
                    inputs: outcome.transformed_inputs,
                })
            }
            GuardDecision::Retry => {
                self.record_history(env, operation, &outcome);
                let error =
                    build_guard_error(GuardDecision::Retry, &outcome, operation, inputs, None);
                if env.source_retryable(operation) {
                    Ok(PreOutcome::Retry(GuardRetrySignal(error)))
                } else {
                    self.retry.clear_operation(operation.operation_id);
                    Ok(PreOutcome::Abort(unretryable(error)))
                }
            }
            GuardDecision::Deny => {
                self.record_history(env, operation, &outcome);
                self.retry.clear_operation(operation.operation_id);
                Ok(PreOutcome::Abort(build_guard_error(
                    GuardDecision::Deny,
                    &outcome,
                    operation,
                    inputs,
                    None,
                )))
            }
        }
    }

    /// Run the post-hook chain, transforming the operation's result.
    pub fn post(
        &mut self,
        env: &mut Environment,
        scope: ScopeIndex,
        result: EvalResult,
        inputs: &[Variable],
        operation: &OperationContext,
        guard_override: Option<&GuardOverride>,
    ) -> Result<EvalResult, HookError> {
        if env.should_suppress_guards() {
            return Ok(result);
        }

        let selected = select_guards(
            &self.registry,
            operation,
            inputs,
            GuardTiming::After,
            guard_override,
        )
        .map_err(HookError::Fault)?;
        if selected.is_empty() {
            return Ok(result);
        }

        let outcome = evaluate_selected(
            env,
            scope,
            &self.executables,
            &mut self.retry,
            &selected,
            operation,
            inputs,
            Some(&result.value),
            GuardTiming::After,
        )
        .map_err(HookError::Fault)?;

        self.publish(env, inputs, &outcome, GuardTiming::After);
        self.record_history(env, operation, &outcome);

        match outcome.decision {
            GuardDecision::Allow | GuardDecision::Env => {
                self.retry.clear_operation(operation.operation_id);
                let value = outcome.final_output.unwrap_or(result.value);
                Ok(EvalResult::new(value))
            }
            GuardDecision::Deny => {
                self.retry.clear_operation(operation.operation_id);
                Err(HookError::Deny(build_guard_error(
                    GuardDecision::Deny,
                    &outcome,
                    operation,
                    inputs,
                    Some(&result.value),
                )))
            }
            GuardDecision::Retry => {
                let error = build_guard_error(
                    GuardDecision::Retry,
                    &outcome,
                    operation,
                    inputs,
                    Some(&result.value),
                );
                if env.source_retryable(operation) {
                    Err(HookError::Retry(GuardRetrySignal(error)))
                } else {
                    self.retry.clear_operation(operation.operation_id);
                    Err(HookError::Deny(unretryable(error)))
                }
            }
        }
    }

    fn publish(
        &self,
        env: &Environment,
        inputs: &[Variable],
        outcome: &AggregateOutcome,
        point: GuardTiming,
    ) {
        let decider = outcome.denier.as_ref().or(outcome.retrier.as_ref());
        let labels: BTreeSet<_> = inputs
            .iter()
            .flat_map(|v| v.ctx().labels.iter().cloned())
            .collect();
        let provenance: Vec<String> = {
            let mut seen = Vec::new();
            for variable in inputs {
                for source in variable.ctx().sources.iter() {
                    if !seen.contains(source) {
                        seen.push(source.clone());
                    }
                }
            }
            seen
        };
        let event = GuardEvalEvent {
            guard: decider
                .map(|d| d.name.clone())
                .or_else(|| outcome.results.first().and_then(|r| r.guard_name.clone()))
                .unwrap_or_default(),
            labels,
            decision: outcome.decision,
            trace: outcome.results.clone(),
            hints: outcome.hints.clone(),
            reasons: outcome.reasons.clone(),
            provenance,
        };
        let payload = match point {
            GuardTiming::After => EventPayload::GuardAfter(event),
            _ => EventPayload::GuardBefore(event),
        };
        env.emit(payload);
    }

    fn record_history(
        &self,
        env: &mut Environment,
        operation: &OperationContext,
        outcome: &AggregateOutcome,
    ) {
        env.push_guard_history(GuardHistoryEntry {
            stage: env.current_pipeline().map(|p| p.stage),
            operation: operation_key(operation),
            decision: outcome.decision,
            trace: outcome.results.clone(),
            hints: outcome.hints.clone(),
            reasons: outcome.reasons.clone(),
        });
    }
}

// ============================================================================
// ERROR ASSEMBLY
// ============================================================================

fn operation_key(operation: &OperationContext) -> String {
    operation
        .operation_keys()
        .first()
        .cloned()
        .unwrap_or_else(|| operation.op_type.clone())
}

fn unretryable(mut error: GuardError) -> GuardError {
    let detail = error
        .retry_hint
        .clone()
        .or_else(|| error.reasons.first().cloned())
        .unwrap_or_else(|| "guard requested retry".to_string());
    error.decision = GuardDecision::Deny;
    error
        .reasons
        .insert(0, format!("Cannot retry: {} (source not retryable)", detail));
    error
}

fn build_guard_error(
    decision: GuardDecision,
    outcome: &AggregateOutcome,
    operation: &OperationContext,
    inputs: &[Variable],
    output: Option<&StructuredValue>,
) -> GuardError {
    let decider: Option<&DeciderInfo> = match decision {
        GuardDecision::Retry => outcome.retrier.as_ref(),
        _ => outcome.denier.as_ref(),
    };
    let scope = decider
        .map(|d| d.scope)
        .unwrap_or(GuardScope::PerOperation);
    let timing = decider
        .map(|d| d.snapshot.timing)
        .unwrap_or(GuardTiming::Before);
    let mut reasons = outcome.reasons.clone();
    if reasons.is_empty() {
        if let Some(hint) = outcome.hints.first() {
            reasons.push(hint.clone());
        }
    }
    GuardError {
        decision,
        guard_name: decider.map(|d| d.name.clone()),
        guard_filter: decider.map(|d| d.filter.clone()),
        scope,
        operation: operation_key(operation),
        input_preview: inputs.first().map(|v| preview(v.value().as_text(), 120)),
        output_preview: output.map(|o| preview(o.as_text(), 120)),
        reasons,
        guard_results: outcome.results.clone(),
        hints: outcome.hints.clone(),
        timing,
        retry_hint: decider.and_then(|d| d.hint.clone()),
        guard_context: decider.map(|d| d.snapshot.clone()),
    }
}
