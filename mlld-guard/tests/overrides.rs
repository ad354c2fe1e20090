//! Guard override precedence (`with { guards: ... }`) and the streaming ×
//! after-guard refusal.

use mlld_core::{
    GuardAction, GuardDefinition, GuardOverride, GuardRule, GuardTiming, MlldError,
    OperationContext,
};
use mlld_guard::{parse_override_clause, PreOutcome};
use mlld_test_utils::{label, labeled_var, test_harness};

fn deny_guard(name: &str, message: &str) -> GuardDefinition {
    GuardDefinition::on_label(
        name,
        label("untrusted"),
        GuardTiming::Before,
        vec![GuardRule::otherwise(GuardAction::deny(message))],
    )
}

#[test]
fn guards_false_disables_everything() {
    let (mut env, mut hooks, _sink) = test_harness();
    hooks.register_guard(deny_guard("a", "denied by a"));
    hooks.register_guard(deny_guard("b", "denied by b"));

    let scope = env.root();
    let input = labeled_var("payload", "data", &["untrusted"]);
    let operation = OperationContext::new("run");

    let pre = hooks
        .pre(
            &mut env,
            scope,
            &[input],
            &operation,
            Some(&GuardOverride::Disabled),
        )
        .expect("override applies");
    assert!(matches!(pre, PreOutcome::Continue { .. }));
    assert!(env.guard_history().is_empty());
}

#[test]
fn only_keeps_just_the_named_guards() {
    let (mut env, mut hooks, _sink) = test_harness();
    hooks.register_guard(deny_guard("a", "denied by a"));
    hooks.register_guard(deny_guard("b", "denied by b"));

    let scope = env.root();
    let input = labeled_var("payload", "data", &["untrusted"]);
    let operation = OperationContext::new("run");

    let pre = hooks
        .pre(
            &mut env,
            scope,
            &[input],
            &operation,
            Some(&GuardOverride::Only(vec!["@b".to_string()])),
        )
        .expect("override applies");
    match pre {
        PreOutcome::Abort(error) => {
            assert_eq!(error.primary_reason(), "denied by b");
            assert_eq!(error.guard_results.len(), 1);
        }
        other => panic!("expected abort from b, got {:?}", other.action()),
    }
}

#[test]
fn except_drops_the_named_guards() {
    let (mut env, mut hooks, _sink) = test_harness();
    hooks.register_guard(deny_guard("a", "denied by a"));

    let scope = env.root();
    let input = labeled_var("payload", "data", &["untrusted"]);
    let operation = OperationContext::new("run");

    let pre = hooks
        .pre(
            &mut env,
            scope,
            &[input],
            &operation,
            Some(&GuardOverride::Except(vec!["@a".to_string()])),
        )
        .expect("override applies");
    assert!(matches!(pre, PreOutcome::Continue { .. }));
}

#[test]
fn override_names_require_the_at_prefix() {
    let (mut env, mut hooks, _sink) = test_harness();
    hooks.register_guard(deny_guard("a", "denied by a"));

    let scope = env.root();
    let input = labeled_var("payload", "data", &["untrusted"]);
    let operation = OperationContext::new("run");

    let error = hooks
        .pre(
            &mut env,
            scope,
            &[input],
            &operation,
            Some(&GuardOverride::Only(vec!["a".to_string()])),
        )
        .expect_err("bare names are a syntax error");
    assert!(matches!(error, MlldError::Interpreter(_)));
    assert!(error.to_string().contains("must start with '@'"));
}

#[test]
fn only_and_except_are_mutually_exclusive() {
    let error = parse_override_clause(
        None,
        Some(vec!["@a".to_string()]),
        Some(vec!["@b".to_string()]),
    )
    .expect_err("configuration error");
    assert!(error.to_string().contains("mutually exclusive"));

    assert_eq!(
        parse_override_clause(Some(false), None, None).expect("valid"),
        Some(GuardOverride::Disabled)
    );
    assert_eq!(parse_override_clause(None, None, None).expect("valid"), None);
}

#[test]
fn streaming_with_after_guard_denies_before_the_body() {
    let (mut env, mut hooks, _sink) = test_harness();
    hooks.register_guard(GuardDefinition::on_operation(
        "validateJson",
        "exe",
        GuardTiming::After,
        vec![GuardRule::otherwise(GuardAction::allow())],
    ));

    let scope = env.root();
    let operation = OperationContext::new("exe").streaming();

    let pre = hooks
        .pre(&mut env, scope, &[], &operation, None)
        .expect("pre-hook runs");
    match pre {
        PreOutcome::Abort(error) => {
            let reason = error.primary_reason();
            assert!(reason.contains("streams its output"));
            assert!(reason.contains("validateJson"));
            assert!(reason.contains("disable streaming"));
        }
        other => panic!("expected abort, got {:?}", other.action()),
    }
}

#[test]
fn streaming_without_after_guards_continues() {
    let (mut env, mut hooks, _sink) = test_harness();
    hooks.register_guard(GuardDefinition::on_operation(
        "preOnly",
        "exe",
        GuardTiming::Before,
        vec![GuardRule::otherwise(GuardAction::allow())],
    ));

    let scope = env.root();
    let operation = OperationContext::new("exe").streaming();
    let pre = hooks
        .pre(&mut env, scope, &[], &operation, None)
        .expect("pre-hook runs");
    assert!(matches!(pre, PreOutcome::Continue { .. }));
}

#[test]
fn disabling_guards_also_clears_the_streaming_refusal() {
    let (mut env, mut hooks, _sink) = test_harness();
    hooks.register_guard(GuardDefinition::on_operation(
        "validateJson",
        "exe",
        GuardTiming::After,
        vec![GuardRule::otherwise(GuardAction::allow())],
    ));

    let scope = env.root();
    let operation = OperationContext::new("exe").streaming();
    let pre = hooks
        .pre(
            &mut env,
            scope,
            &[],
            &operation,
            Some(&GuardOverride::Disabled),
        )
        .expect("pre-hook runs");
    assert!(matches!(pre, PreOutcome::Continue { .. }));
}
