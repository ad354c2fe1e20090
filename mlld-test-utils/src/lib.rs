//! mlld Test Utilities
//!
//! Centralized test infrastructure for the mlld workspace:
//! - Proptest generators for labels, descriptors, values, and guards
//! - Mock host executables for guard scripts
//! - Shared environment and variable fixtures

use mlld_core::{
    DescriptorParts, GuardAction, GuardDefinition, GuardRule, GuardTiming, InterpreterError,
    Label, MlldConfig, SecurityDescriptor, StructuredValue, Variable, VariableKind,
};
use mlld_env::Environment;
use mlld_events::CollectorSink;
use mlld_guard::{GuardCall, GuardExecutable, HookManager};
use proptest::prelude::*;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

// ============================================================================
// FIXTURES
// ============================================================================

/// Default configuration used across workspace tests.
pub fn make_test_config() -> MlldConfig {
    MlldConfig::default()
}

/// Root environment wired to a collector sink, plus the sink for
/// assertions.
pub fn test_env() -> (Environment, Rc<CollectorSink>) {
    test_env_with_config(make_test_config())
}

/// Like [`test_env`] with a custom configuration.
pub fn test_env_with_config(config: MlldConfig) -> (Environment, Rc<CollectorSink>) {
    let sink = Rc::new(CollectorSink::new());
    let env = Environment::new(config, sink.clone());
    (env, sink)
}

/// Environment plus a hook manager sharing its configuration.
pub fn test_harness() -> (Environment, HookManager, Rc<CollectorSink>) {
    let config = make_test_config();
    let (env, sink) = test_env_with_config(config.clone());
    (env, HookManager::new(&config), sink)
}

/// Parse a label, panicking on invalid test input.
pub fn label(s: &str) -> Label {
    Label::normalize(s).unwrap_or_else(|| panic!("invalid test label: {s}"))
}

/// A plain text variable with no labels.
pub fn text_var(name: &str, text: &str) -> Variable {
    Variable::declare(name, VariableKind::SimpleText, StructuredValue::text(text))
}

/// A text variable carrying the given labels (taint defaulting through the
/// config's known-taint set).
pub fn labeled_var(name: &str, text: &str, labels: &[&str]) -> Variable {
    labeled_var_with_config(name, text, labels, &make_test_config())
}

/// Like [`labeled_var`] with a custom configuration.
pub fn labeled_var_with_config(
    name: &str,
    text: &str,
    labels: &[&str],
    config: &MlldConfig,
) -> Variable {
    let mut variable = text_var(name, text);
    variable.sync_ctx(SecurityDescriptor::make(
        DescriptorParts::default().with_labels(labels.iter().copied()),
        config,
    ));
    variable
}

/// A guard that allows everything, for selection tests.
pub fn allow_all_guard(name: &str, on_label: &str, timing: GuardTiming) -> GuardDefinition {
    GuardDefinition::on_label(
        name,
        label(on_label),
        timing,
        vec![GuardRule::otherwise(GuardAction::allow())],
    )
}

// ============================================================================
// MOCK EXECUTABLES
// ============================================================================

/// Executable returning a fixed value on every call.
#[derive(Debug, Clone)]
pub struct FixedExecutable(pub serde_json::Value);

impl GuardExecutable for FixedExecutable {
    fn invoke(&self, _call: &GuardCall<'_>) -> Result<serde_json::Value, InterpreterError> {
        Ok(self.0.clone())
    }
}

/// Executable echoing the guarded input's data view.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoExecutable;

impl GuardExecutable for EchoExecutable {
    fn invoke(&self, call: &GuardCall<'_>) -> Result<serde_json::Value, InterpreterError> {
        Ok(call.input.as_data().clone())
    }
}

/// Executable producing scripted responses in order, repeating the last one
/// once the script runs dry. Stands in for an LLM in retry tests.
#[derive(Debug)]
pub struct ScriptedExecutable {
    responses: RefCell<VecDeque<serde_json::Value>>,
    last: RefCell<serde_json::Value>,
    pub calls: RefCell<u32>,
}

impl ScriptedExecutable {
    pub fn new(responses: impl IntoIterator<Item = serde_json::Value>) -> Self {
        Self {
            responses: RefCell::new(responses.into_iter().collect()),
            last: RefCell::new(serde_json::Value::Null),
            calls: RefCell::new(0),
        }
    }

    pub fn call_count(&self) -> u32 {
        *self.calls.borrow()
    }
}

impl GuardExecutable for ScriptedExecutable {
    fn invoke(&self, _call: &GuardCall<'_>) -> Result<serde_json::Value, InterpreterError> {
        *self.calls.borrow_mut() += 1;
        if let Some(next) = self.responses.borrow_mut().pop_front() {
            *self.last.borrow_mut() = next.clone();
            return Ok(next);
        }
        Ok(self.last.borrow().clone())
    }
}

/// Executable that always fails, for error propagation tests.
#[derive(Debug, Clone)]
pub struct FailingExecutable(pub String);

impl GuardExecutable for FailingExecutable {
    fn invoke(&self, _call: &GuardCall<'_>) -> Result<serde_json::Value, InterpreterError> {
        Err(InterpreterError::ExecutableFailed {
            name: "failing".to_string(),
            reason: self.0.clone(),
        })
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

/// Strategy over valid labels.
pub fn arb_label() -> impl Strategy<Value = Label> {
    "[a-z][a-z0-9_-]{0,8}(:[a-z0-9_-]{1,6}){0,2}"
        .prop_map(|s| Label::normalize(&s).expect("generated labels are valid"))
}

/// Strategy over security descriptors with default taint derivation.
pub fn arb_descriptor() -> impl Strategy<Value = SecurityDescriptor> {
    (
        proptest::collection::vec(arb_label(), 0..6),
        proptest::collection::vec("[a-zA-Z0-9:/._-]{1,16}", 0..4),
    )
        .prop_map(|(labels, sources)| {
            SecurityDescriptor::make(
                DescriptorParts {
                    labels,
                    taint: None,
                    sources,
                    capability: None,
                    policy_context: Default::default(),
                },
                &make_test_config(),
            )
        })
}

/// Strategy over structured values: text, numbers, arrays, objects.
pub fn arb_structured_value() -> impl Strategy<Value = StructuredValue> {
    prop_oneof![
        ".{0,40}".prop_map(StructuredValue::text),
        any::<i64>().prop_map(|n| StructuredValue::ensure(serde_json::json!(n))),
        proptest::collection::vec(any::<i32>(), 0..5)
            .prop_map(|items| StructuredValue::ensure(serde_json::json!(items))),
        ("[a-z]{1,8}", any::<bool>()).prop_map(|(key, flag)| {
            let mut object = serde_json::Map::new();
            object.insert(key, serde_json::Value::Bool(flag));
            StructuredValue::ensure(serde_json::Value::Object(object))
        }),
    ]
}

/// Strategy over simple label-filtered guard definitions.
pub fn arb_guard_definition() -> impl Strategy<Value = GuardDefinition> {
    (
        "[a-z][a-zA-Z0-9]{0,10}",
        arb_label(),
        prop_oneof![
            Just(GuardTiming::Before),
            Just(GuardTiming::After),
            Just(GuardTiming::Always),
        ],
        prop_oneof![
            Just(GuardAction::allow()),
            Just(GuardAction::deny("denied by generated guard")),
            Just(GuardAction::retry("retry per generated guard")),
        ],
    )
        .prop_map(|(name, on, timing, action)| {
            GuardDefinition::on_label(name, on, timing, vec![GuardRule::otherwise(action)])
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labeled_var_carries_taint() {
        let variable = labeled_var("apiKey", "sk-123", &["secret"]);
        assert!(variable.ctx().taint.contains(&label("secret")));
    }

    #[test]
    fn test_scripted_executable_repeats_last() {
        let exec = ScriptedExecutable::new([serde_json::json!(1), serde_json::json!(2)]);
        let input = StructuredValue::text("x");
        let operation = mlld_core::OperationContext::new("exe");
        let call = GuardCall {
            input: &input,
            output: None,
            operation: &operation,
            snapshot: None,
        };
        assert_eq!(exec.invoke(&call).unwrap(), serde_json::json!(1));
        assert_eq!(exec.invoke(&call).unwrap(), serde_json::json!(2));
        assert_eq!(exec.invoke(&call).unwrap(), serde_json::json!(2));
        assert_eq!(exec.call_count(), 3);
    }
}
