//! Guard evaluation - selection, rule walk, action semantics, aggregation
//!
//! Selection is identical for the before and after hooks except in the
//! timing filter. Every guard evaluates in a child scope that inherits the
//! call site's variables, with the reserved `input` (and, after the body,
//! `output`) bindings installed and the guard snapshot pushed as ambient
//! context. Helper predicates (`opIs`, `inputHas`, ...) are engine-owned
//! condition forms, not user variables.
//!
//! Aggregation precedence is deny > retry > allow. Allow replacements
//! compose: each successful transform replaces the active subject for the
//! guards that follow, and the merged descriptor carries every
//! contributor's `guard:<name>` source.

use crate::hooks::{ExecMap, GuardCall};
use crate::registry::GuardRegistry;
use crate::retry::{AttemptKey, AttemptView, RetryCoordinator};
use mlld_core::preview;
use mlld_core::{
    GuardAction, GuardContextSnapshot, GuardCondition, GuardDecision, GuardDefinition, GuardId,
    GuardOverride, GuardResult, GuardRule, GuardScope, GuardTiming, InterpreterError, MlldConfig,
    MlldError, OperationContext, ReplacementExpr, SecurityDescriptor, SecurityError,
    StructuredValue, Variable, VariableFlags, VariableKind, WhenExpressionError,
};
use mlld_env::{Environment, ScopeIndex};
use std::collections::HashSet;

// ============================================================================
// SELECTION
// ============================================================================

/// What a selected guard evaluates against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GuardSubject {
    /// One input variable, by position
    Input(usize),
    /// The operation as a whole (aggregate input)
    Operation,
}

/// One guard picked for an operation, with its subject.
#[derive(Debug, Clone)]
pub(crate) struct SelectedGuard {
    pub definition: GuardDefinition,
    pub subject: GuardSubject,
}

/// Select the guards applicable to an operation's inputs and outputs at an
/// evaluation point.
///
/// Selection always runs against the operation's original inputs so that
/// re-selection on a later attempt yields the same guard list.
pub(crate) fn select_guards(
    registry: &GuardRegistry,
    operation: &OperationContext,
    inputs: &[Variable],
    point: GuardTiming,
    guard_override: Option<&GuardOverride>,
) -> Result<Vec<SelectedGuard>, MlldError> {
    let mut selected: Vec<SelectedGuard> = Vec::new();
    let mut seen: HashSet<(GuardId, Option<usize>)> = HashSet::new();

    // Per-input guards, inputs in positional order.
    for (index, input) in inputs.iter().enumerate() {
        for label in &input.ctx().labels {
            for definition in registry.data_guards_for_timing(label, point) {
                if definition.scope == GuardScope::PerInput
                    && seen.insert((definition.id, Some(index)))
                {
                    selected.push(SelectedGuard {
                        definition: definition.clone(),
                        subject: GuardSubject::Input(index),
                    });
                }
            }
        }
    }

    // Per-operation guards keyed by the normalized operation keys.
    for key in operation.operation_keys() {
        for definition in registry.operation_guards_for_timing(&key, point) {
            if seen.insert((definition.id, None)) {
                selected.push(SelectedGuard {
                    definition: definition.clone(),
                    subject: GuardSubject::Operation,
                });
            }
        }
    }

    // Guards keyed by call-site operation tags.
    for tag in &operation.labels {
        for definition in registry.operation_tag_guards_for_timing(tag, point) {
            if seen.insert((definition.id, None)) {
                selected.push(SelectedGuard {
                    definition: definition.clone(),
                    subject: GuardSubject::Operation,
                });
            }
        }
    }

    // Per-operation guards keyed by input labels (broad-label sweeps).
    for input in inputs {
        for label in &input.ctx().labels {
            for definition in registry.operation_scope_label_guards_for_timing(label, point) {
                if seen.insert((definition.id, None)) {
                    selected.push(SelectedGuard {
                        definition: definition.clone(),
                        subject: GuardSubject::Operation,
                    });
                }
            }
        }
    }

    // Fallback: when nothing matched at the operation level, promote
    // input-side guards whose label filter matches a call-site label.
    let has_operation_guards = selected
        .iter()
        .any(|s| s.subject == GuardSubject::Operation);
    if !has_operation_guards {
        for tag in &operation.labels {
            for definition in registry.data_guards_for_timing(tag, point) {
                if definition.scope == GuardScope::PerInput
                    && seen.insert((definition.id, None))
                {
                    selected.push(SelectedGuard {
                        definition: definition.clone(),
                        subject: GuardSubject::Operation,
                    });
                }
            }
        }
    }

    apply_override(selected, guard_override)
}

/// Parse a `with { guards: ... }` clause into an override. `only` and
/// `except` are mutually exclusive; `guards: false` cannot carry either.
pub fn parse_override_clause(
    enabled: Option<bool>,
    only: Option<Vec<String>>,
    except: Option<Vec<String>>,
) -> Result<Option<GuardOverride>, MlldError> {
    if only.is_some() && except.is_some() {
        return Err(InterpreterError::InvalidGuardOverride {
            reason: "'only' and 'except' are mutually exclusive".to_string(),
        }
        .into());
    }
    if enabled == Some(false) {
        if only.is_some() || except.is_some() {
            return Err(InterpreterError::InvalidGuardOverride {
                reason: "'guards: false' cannot be combined with 'only' or 'except'".to_string(),
            }
            .into());
        }
        return Ok(Some(GuardOverride::Disabled));
    }
    match (only, except) {
        (Some(names), None) => Ok(Some(GuardOverride::Only(names))),
        (None, Some(names)) => Ok(Some(GuardOverride::Except(names))),
        (None, None) => Ok(None),
        (Some(_), Some(_)) => unreachable!("checked above"),
    }
}

/// Apply an override to a selection. Names must carry the `@` prefix.
pub(crate) fn apply_override(
    selected: Vec<SelectedGuard>,
    guard_override: Option<&GuardOverride>,
) -> Result<Vec<SelectedGuard>, MlldError> {
    match guard_override {
        None => Ok(selected),
        Some(GuardOverride::Disabled) => Ok(Vec::new()),
        Some(GuardOverride::Only(names)) => {
            let names = strip_prefixes(names)?;
            Ok(selected
                .into_iter()
                .filter(|s| names.contains(&s.definition.display_name()))
                .collect())
        }
        Some(GuardOverride::Except(names)) => {
            let names = strip_prefixes(names)?;
            Ok(selected
                .into_iter()
                .filter(|s| !names.contains(&s.definition.display_name()))
                .collect())
        }
    }
}

fn strip_prefixes(names: &[String]) -> Result<Vec<String>, MlldError> {
    names
        .iter()
        .map(|name| {
            name.strip_prefix('@')
                .map(str::to_string)
                .ok_or_else(|| {
                    InterpreterError::InvalidGuardOverride {
                        reason: format!("guard name '{}' must start with '@'", name),
                    }
                    .into()
                })
        })
        .collect()
}

// ============================================================================
// SINGLE-GUARD EVALUATION
// ============================================================================

/// Outcome of evaluating one guard against one subject.
#[derive(Debug)]
pub(crate) struct GuardEvaluation {
    pub result: GuardResult,
    pub decision: GuardDecision,
    /// Raw replacement value, before the aggregator rewraps it
    pub replacement: Option<StructuredValue>,
    /// Descriptor after label modifications and `guard:<name>` tagging
    pub descriptor: Option<SecurityDescriptor>,
    /// Bindings to install for an `env` decision
    pub env_bindings: Vec<Variable>,
    pub reason: Option<String>,
    pub hint: Option<String>,
    pub snapshot: GuardContextSnapshot,
}

struct RuleWalk {
    action: Option<GuardAction>,
    let_bound: Vec<Variable>,
    captured_reason: Option<String>,
}

/// Evaluate one guard: build its environment and snapshot, walk the rule
/// block in order, and apply the first matching action.
#[allow(clippy::too_many_arguments)]
pub(crate) fn evaluate_guard(
    env: &mut Environment,
    scope: ScopeIndex,
    executables: &ExecMap,
    definition: &GuardDefinition,
    operation: &OperationContext,
    subject: &StructuredValue,
    active: &StructuredValue,
    output: Option<&StructuredValue>,
    view: &AttemptView,
    point: GuardTiming,
) -> Result<GuardEvaluation, MlldError> {
    let config = env.config().clone();
    let guard_name = definition.display_name();

    let snapshot = GuardContextSnapshot {
        name: guard_name.clone(),
        attempt: view.attempt,
        tries: view.tries.clone(),
        max: view.max,
        input: subject.clone(),
        output: output.cloned(),
        labels: subject.ctx().labels.clone(),
        sources: subject.ctx().sources.clone(),
        input_preview: preview(subject.as_text(), config.preview_width),
        output_preview: output.map(|o| preview(o.as_text(), config.preview_width)),
        hint_history: view.hint_history.clone(),
        timing: point,
    };

    // Child guard environment inheriting everything visible from the call
    // site, with the reserved bindings installed.
    let guard_scope = env.create_child(scope);
    env.set_variable(guard_scope, Variable::system("input", subject.clone()));
    if let Some(output) = output {
        env.set_variable(guard_scope, Variable::system("output", output.clone()));
    }

    let walk = env.with_guard_context(snapshot.clone(), |env| {
        env.with_guard_suppression(|env| {
            walk_rules(
                env,
                guard_scope,
                executables,
                definition,
                operation,
                subject,
                active,
                output,
                &snapshot,
                &config,
            )
        })
    })?;

    let action = walk.action.unwrap_or_else(GuardAction::allow);

    // Materialize the replacement while the guard scope is still current;
    // its executables run with guards suppressed like everything else the
    // guard does.
    let raw_replacement = match &action.value {
        Some(expr) if action.decision == GuardDecision::Allow => {
            Some(env.with_guard_suppression(|env| {
                eval_replacement(
                    env,
                    guard_scope,
                    executables,
                    expr,
                    active,
                    output,
                    operation,
                    &snapshot,
                    &config,
                )
            })?)
        }
        _ => None,
    };

    apply_action(
        env,
        definition,
        &guard_name,
        action,
        active,
        raw_replacement,
        point,
        &config,
        walk.let_bound,
        walk.captured_reason,
        snapshot,
    )
}

#[allow(clippy::too_many_arguments)]
fn walk_rules(
    env: &mut Environment,
    guard_scope: ScopeIndex,
    executables: &ExecMap,
    definition: &GuardDefinition,
    operation: &OperationContext,
    subject: &StructuredValue,
    active: &StructuredValue,
    output: Option<&StructuredValue>,
    snapshot: &GuardContextSnapshot,
    config: &MlldConfig,
) -> Result<RuleWalk, MlldError> {
    let mut let_bound = Vec::new();
    let mut captured_reason = None;

    for rule in &definition.block.rules {
        match rule {
            GuardRule::Let(binding) => {
                let value = eval_replacement(
                    env,
                    guard_scope,
                    executables,
                    &binding.value,
                    active,
                    output,
                    operation,
                    snapshot,
                    config,
                )?;
                let variable =
                    Variable::declare(&binding.name, VariableKind::Computed, value)
                        .with_flags(VariableFlags::GUARD_HELPER);
                let_bound.push(variable.clone());
                env.set_variable(guard_scope, variable);
            }
            GuardRule::Match(match_rule) => {
                let mut rule_reason = None;
                let matched = if match_rule.is_wildcard {
                    true
                } else if let Some(condition) = &match_rule.condition {
                    eval_condition(
                        executables,
                        condition,
                        operation,
                        subject,
                        output,
                        snapshot,
                        &mut rule_reason,
                    )?
                } else {
                    false
                };
                if matched {
                    return Ok(RuleWalk {
                        action: Some(match_rule.action.clone()),
                        let_bound,
                        captured_reason: rule_reason,
                    });
                }
            }
        }
    }

    // No rule matched: implicit allow.
    Ok(RuleWalk {
        action: None,
        let_bound,
        captured_reason,
    })
}

/// Evaluate a condition tree over the captured operation and label context.
#[allow(clippy::too_many_arguments)]
fn eval_condition(
    executables: &ExecMap,
    condition: &GuardCondition,
    operation: &OperationContext,
    subject: &StructuredValue,
    output: Option<&StructuredValue>,
    snapshot: &GuardContextSnapshot,
    captured: &mut Option<String>,
) -> Result<bool, MlldError> {
    let result = match condition {
        GuardCondition::OpIs(key) => {
            let key = mlld_core::normalize_op_filter(key);
            operation.operation_keys().contains(&key)
        }
        GuardCondition::OpTypeIs(expected) => operation.op_type == *expected,
        GuardCondition::OpSubtypeIs(expected) => {
            operation.subtype.as_deref() == Some(expected.as_str())
        }
        GuardCondition::OpNameIs(expected) => {
            operation.name.as_deref() == Some(expected.as_str())
        }
        GuardCondition::OpHas(label) => operation.labels.contains(label),
        GuardCondition::OpHasAny(labels) => {
            labels.iter().any(|l| operation.labels.contains(l))
        }
        GuardCondition::OpHasAll(labels) => {
            labels.iter().all(|l| operation.labels.contains(l))
        }
        GuardCondition::InputHas(label) => subject.ctx().labels.contains(label),
        GuardCondition::OutputIsValidJson => output
            .map(|o| StructuredValue::parse_json_strict(o.as_text()).is_some())
            .unwrap_or(false),
        GuardCondition::TraceIncludes(entry) => {
            operation.metadata.trace.iter().any(|t| t == entry)
        }
        GuardCondition::AttemptAtLeast(bound) => snapshot.attempt >= *bound,
        GuardCondition::Exec(name) => {
            let value = invoke_executable(
                executables,
                name,
                subject,
                output,
                operation,
                Some(snapshot),
            )?;
            truthy(&value, captured)
        }
        GuardCondition::All(conditions) => {
            let mut all = true;
            for condition in conditions {
                if !eval_condition(
                    executables, condition, operation, subject, output, snapshot, captured,
                )? {
                    all = false;
                    break;
                }
            }
            all
        }
        GuardCondition::Any(conditions) => {
            let mut any = false;
            for condition in conditions {
                if eval_condition(
                    executables, condition, operation, subject, output, snapshot, captured,
                )? {
                    any = true;
                    break;
                }
            }
            any
        }
        GuardCondition::Not(inner) => !eval_condition(
            executables, inner, operation, subject, output, snapshot, captured,
        )?,
    };
    Ok(result)
}

/// Interpret a host executable's verdict. Objects carrying `safe: false`
/// surface their `reason` into the matching rule's message.
fn truthy(value: &serde_json::Value, captured: &mut Option<String>) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Null => false,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(items) => !items.is_empty(),
        serde_json::Value::Object(map) => match map.get("safe") {
            Some(serde_json::Value::Bool(safe)) => {
                if !*safe {
                    if let Some(serde_json::Value::String(reason)) = map.get("reason") {
                        *captured = Some(reason.clone());
                    }
                }
                *safe
            }
            _ => true,
        },
    }
}

fn invoke_executable(
    executables: &ExecMap,
    name: &str,
    input: &StructuredValue,
    output: Option<&StructuredValue>,
    operation: &OperationContext,
    snapshot: Option<&GuardContextSnapshot>,
) -> Result<serde_json::Value, MlldError> {
    let executable = executables
        .get(name)
        .ok_or_else(|| InterpreterError::UnknownExecutable {
            name: name.to_string(),
        })?;
    let call = GuardCall {
        input,
        output,
        operation,
        snapshot,
    };
    Ok(executable.invoke(&call)?)
}

/// Evaluate a replacement or let-binding expression against the active
/// subject.
#[allow(clippy::too_many_arguments)]
fn eval_replacement(
    env: &mut Environment,
    guard_scope: ScopeIndex,
    executables: &ExecMap,
    expr: &ReplacementExpr,
    active: &StructuredValue,
    output: Option<&StructuredValue>,
    operation: &OperationContext,
    snapshot: &GuardContextSnapshot,
    config: &MlldConfig,
) -> Result<StructuredValue, MlldError> {
    match expr {
        ReplacementExpr::Literal(value) => Ok(StructuredValue::ensure(value.clone())),
        ReplacementExpr::Var(name) => env
            .get_variable(guard_scope, name)
            .map(|v| v.value().clone())
            .ok_or_else(|| {
                InterpreterError::UnknownVariable {
                    name: name.clone(),
                }
                .into()
            }),
        ReplacementExpr::Exec(name) => {
            let value =
                invoke_executable(executables, name, active, output, operation, Some(snapshot))?;
            Ok(StructuredValue::ensure(value))
        }
        ReplacementExpr::PrefixWith(label) => {
            let mut value =
                StructuredValue::text(format!("[{}] {}", label, active.as_text()));
            value.apply_security_descriptor(
                active.security().clone().add_labels([label], config),
            );
            Ok(value)
        }
        ReplacementExpr::Tag(timing) => {
            let mut value = active.clone();
            value.apply_security_descriptor(
                active
                    .security()
                    .clone()
                    .with_policy_entry("tagged", serde_json::json!(timing.to_string())),
            );
            Ok(value)
        }
    }
}

/// Apply a matched action: privilege checks, label modifications,
/// replacement materialization, warnings.
#[allow(clippy::too_many_arguments)]
fn apply_action(
    env: &mut Environment,
    definition: &GuardDefinition,
    guard_name: &str,
    action: GuardAction,
    active: &StructuredValue,
    raw_replacement: Option<StructuredValue>,
    point: GuardTiming,
    config: &MlldConfig,
    let_bound: Vec<Variable>,
    captured_reason: Option<String>,
    snapshot: GuardContextSnapshot,
) -> Result<GuardEvaluation, MlldError> {
    if let Some(warning) = &action.warning {
        env.emit_effect(
            mlld_events::EffectKind::Stderr,
            warning.clone(),
            Some(format!("guard:{}", guard_name)),
        );
    }

    let mut result = GuardResult::new(
        Some(guard_name.to_string()),
        action.decision,
        point,
    );

    match action.decision {
        GuardDecision::Env => {
            if point != GuardTiming::Before {
                return Err(WhenExpressionError::EnvOutsideBefore {
                    guard: guard_name.to_string(),
                }
                .into());
            }
            Ok(GuardEvaluation {
                result,
                decision: GuardDecision::Env,
                replacement: None,
                descriptor: None,
                env_bindings: let_bound,
                reason: None,
                hint: None,
                snapshot,
            })
        }
        GuardDecision::Deny => {
            let reason = compose_reason(&action.message, &captured_reason)
                .unwrap_or_else(|| format!("denied by guard '{}'", guard_name));
            result.reason = Some(reason.clone());
            Ok(GuardEvaluation {
                result,
                decision: GuardDecision::Deny,
                replacement: None,
                descriptor: None,
                env_bindings: Vec::new(),
                reason: Some(reason),
                hint: None,
                snapshot,
            })
        }
        GuardDecision::Retry => {
            let hint = compose_reason(&action.message, &captured_reason);
            result.hint = hint.clone();
            Ok(GuardEvaluation {
                result,
                decision: GuardDecision::Retry,
                replacement: None,
                descriptor: None,
                env_bindings: Vec::new(),
                reason: None,
                hint,
                snapshot,
            })
        }
        GuardDecision::Allow => {
            // removeLabels needs privilege; protected labels are beyond
            // even privileged guards.
            if !action.remove_labels.is_empty() && !definition.privileged {
                return Err(SecurityError::LabelPrivilegeRequired {
                    label: action.remove_labels[0].clone(),
                    guard: guard_name.to_string(),
                }
                .into());
            }
            for label in &action.remove_labels {
                if config.is_protected_label(label) {
                    return Err(SecurityError::ProtectedLabelRemoval {
                        label: label.clone(),
                        guard: guard_name.to_string(),
                    }
                    .into());
                }
            }

            let has_modifications = raw_replacement.is_some()
                || !action.add_labels.is_empty()
                || !action.remove_labels.is_empty();

            let mut replacement = None;
            let mut descriptor = None;
            if has_modifications {
                // The transform's descriptor merges the active subject's
                // with whatever the replacement value brought along, then
                // applies the label modifications and records this guard as
                // a source.
                let base = match &raw_replacement {
                    Some(raw) => SecurityDescriptor::merge([active.security(), raw.security()]),
                    None => active.security().clone(),
                };
                let merged = base
                    .add_labels(action.add_labels.iter(), config)
                    .remove_labels(action.remove_labels.iter())
                    .with_source(format!("guard:{}", guard_name));
                if let Some(mut raw) = raw_replacement {
                    raw.apply_security_descriptor(merged.clone());
                    result.replaced = true;
                    replacement = Some(raw);
                }
                descriptor = Some(merged);
                result.label_modifications = Some(mlld_core::LabelModifications {
                    added: action.add_labels.clone(),
                    removed: action.remove_labels.clone(),
                });
            }

            Ok(GuardEvaluation {
                result,
                decision: GuardDecision::Allow,
                replacement,
                descriptor,
                env_bindings: Vec::new(),
                reason: None,
                hint: None,
                snapshot,
            })
        }
    }
}

fn compose_reason(message: &Option<String>, captured: &Option<String>) -> Option<String> {
    match (message, captured) {
        (Some(message), Some(captured)) => Some(format!("{}: {}", message, captured)),
        (Some(message), None) => Some(message.clone()),
        (None, Some(captured)) => Some(captured.clone()),
        (None, None) => None,
    }
}

// ============================================================================
// AGGREGATION
// ============================================================================

/// The guard that settled an aggregate decision, with enough context to
/// build a structured error.
#[derive(Debug, Clone)]
pub(crate) struct DeciderInfo {
    pub name: String,
    pub filter: String,
    pub scope: GuardScope,
    pub snapshot: GuardContextSnapshot,
    pub hint: Option<String>,
    pub key: AttemptKey,
}

/// Combined outcome of every selected guard for one evaluation point.
#[derive(Debug)]
pub(crate) struct AggregateOutcome {
    /// `Allow`, `Deny`, or `Retry` (env folds into allow)
    pub decision: GuardDecision,
    pub results: Vec<GuardResult>,
    pub reasons: Vec<String>,
    pub hints: Vec<String>,
    /// Inputs after replacement composition and descriptor updates
    pub transformed_inputs: Vec<Variable>,
    /// Output after replacement composition, for the after point
    pub final_output: Option<StructuredValue>,
    /// Bindings produced by `env` decisions, for the pre-hook to install
    pub env_bindings: Vec<Variable>,
    pub denier: Option<DeciderInfo>,
    pub retrier: Option<DeciderInfo>,
}

/// Evaluate every selected guard in order and combine their decisions.
///
/// Guards attached to the same operation execute in registry order; for
/// per-input guards, inputs are processed in positional order. A retry
/// signal is only raised after all guards have been polled, so the trace is
/// complete even when an early guard asks for a rerun.
#[allow(clippy::too_many_arguments)]
pub(crate) fn evaluate_selected(
    env: &mut Environment,
    scope: ScopeIndex,
    executables: &ExecMap,
    retry: &mut RetryCoordinator,
    selected: &[SelectedGuard],
    operation: &OperationContext,
    inputs: &[Variable],
    output: Option<&StructuredValue>,
    point: GuardTiming,
) -> Result<AggregateOutcome, MlldError> {
    let mut transformed: Vec<Variable> = inputs.to_vec();
    let mut current_output = output.cloned();

    let mut results = Vec::new();
    let mut reasons = Vec::new();
    let mut hints = Vec::new();
    let mut env_bindings = Vec::new();
    let mut denier: Option<DeciderInfo> = None;
    let mut retrier: Option<DeciderInfo> = None;

    for selection in selected {
        let definition = &selection.definition;
        // Attempt identity keys off the original input so replacements
        // produced on one attempt do not reset the counter on the next.
        let (subject, key) = match selection.subject {
            GuardSubject::Input(index) => (
                transformed[index].value().clone(),
                AttemptKey::input(operation.operation_id, scope, inputs[index].variable_id),
            ),
            GuardSubject::Operation => (
                aggregate_inputs(&transformed),
                AttemptKey::operation(operation.operation_id, scope),
            ),
        };
        // The active subject is what a transform replaces: the output once
        // the body has run, otherwise the guarded input itself.
        let active = match (&current_output, selection.subject) {
            (Some(output), _) => output.clone(),
            (None, GuardSubject::Input(index)) => transformed[index].value().clone(),
            (None, GuardSubject::Operation) => subject.clone(),
        };

        let view = retry.peek(&key, definition.max);
        let evaluation = evaluate_guard(
            env,
            scope,
            executables,
            definition,
            operation,
            &subject,
            &active,
            current_output.as_ref(),
            &view,
            point,
        )?;

        results.push(evaluation.result.clone());
        env_bindings.extend(evaluation.env_bindings);

        match evaluation.decision {
            GuardDecision::Allow | GuardDecision::Env => {
                if let Some(descriptor) = evaluation.descriptor {
                    match (evaluation.replacement, selection.subject, point) {
                        (Some(replacement), GuardSubject::Input(index), GuardTiming::Before) => {
                            let name = transformed[index].name.clone();
                            transformed[index] = Variable::guard_replacement(
                                name,
                                replacement,
                                definition.display_name(),
                            );
                        }
                        (Some(replacement), _, _) if current_output.is_some() => {
                            current_output = Some(replacement);
                        }
                        (_, GuardSubject::Input(index), _) => {
                            let mut variable = transformed[index].clone();
                            variable.sync_ctx(descriptor);
                            transformed[index] = variable;
                        }
                        (_, GuardSubject::Operation, _) => {
                            if let Some(output_value) = &mut current_output {
                                output_value.apply_security_descriptor(descriptor);
                            } else {
                                // Label modifications on the aggregate apply
                                // to every input.
                                for variable in &mut transformed {
                                    let merged = SecurityDescriptor::merge([
                                        variable.security(),
                                        &descriptor,
                                    ]);
                                    variable.sync_ctx(merged);
                                }
                            }
                        }
                    }
                }
            }
            GuardDecision::Deny => {
                if let Some(reason) = evaluation.reason {
                    reasons.push(reason);
                }
                if denier.is_none() {
                    denier = Some(DeciderInfo {
                        name: definition.display_name(),
                        filter: definition.filter_value.clone(),
                        scope: definition.scope,
                        snapshot: evaluation.snapshot,
                        hint: None,
                        key,
                    });
                }
            }
            GuardDecision::Retry => {
                if view.attempt >= view.max {
                    // The budget is spent: the retry is treated as a deny.
                    let reason = format!(
                        "guard '{}' exhausted its retry budget after {} attempts",
                        definition.display_name(),
                        view.max
                    );
                    reasons.push(reason);
                    if let Some(hint) = evaluation.hint.clone() {
                        hints.push(hint);
                    }
                    if denier.is_none() {
                        denier = Some(DeciderInfo {
                            name: definition.display_name(),
                            filter: definition.filter_value.clone(),
                            scope: definition.scope,
                            snapshot: evaluation.snapshot,
                            hint: evaluation.hint,
                            key,
                        });
                    }
                } else {
                    if let Some(hint) = evaluation.hint.clone() {
                        hints.push(hint);
                    }
                    if retrier.is_none() {
                        retrier = Some(DeciderInfo {
                            name: definition.display_name(),
                            filter: definition.filter_value.clone(),
                            scope: definition.scope,
                            snapshot: evaluation.snapshot,
                            hint: evaluation.hint,
                            key,
                        });
                    }
                }
            }
        }
    }

    // Precedence: deny > retry > allow.
    let decision = if denier.is_some() {
        GuardDecision::Deny
    } else if retrier.is_some() {
        GuardDecision::Retry
    } else {
        GuardDecision::Allow
    };

    if decision == GuardDecision::Retry {
        if let Some(retrier) = &retrier {
            retry.record_retry(retrier.key, retrier.hint.clone());
        }
    }

    Ok(AggregateOutcome {
        decision,
        results,
        reasons,
        hints,
        transformed_inputs: transformed,
        final_output: current_output,
        env_bindings,
        denier,
        retrier,
    })
}

/// Aggregate view of an operation's inputs for per-operation guards: the
/// data views as an array, the texts joined by newlines.
pub(crate) fn aggregate_inputs(inputs: &[Variable]) -> StructuredValue {
    let data: Vec<serde_json::Value> =
        inputs.iter().map(|v| v.value().as_data().clone()).collect();
    let text = inputs
        .iter()
        .map(|v| v.value().as_text())
        .collect::<Vec<_>>()
        .join("\n");
    let mut aggregate = StructuredValue::wrap(
        serde_json::Value::Array(data),
        Some(mlld_core::ValueType::Array),
        Some(text),
    );
    let merged = SecurityDescriptor::merge(inputs.iter().map(|v| v.security()));
    aggregate.apply_security_descriptor(merged);
    aggregate
}
