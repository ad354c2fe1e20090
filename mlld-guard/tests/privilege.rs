//! Privilege rules for label modification: removing labels takes a
//! privileged guard, and protected labels are beyond even those.

use mlld_core::{
    Capability, DescriptorParts, GuardAction, GuardDefinition, GuardRule, GuardTiming, MlldConfig,
    MlldError, OperationContext, SecurityDescriptor, SecurityError, Variable, VariableKind,
};
use mlld_env::Environment;
use mlld_events::NullSink;
use mlld_guard::{HookManager, PreOutcome};
use mlld_test_utils::label;
use std::rc::Rc;

fn untrusted_input(config: &MlldConfig) -> Variable {
    let mut variable = Variable::declare(
        "payload",
        VariableKind::SimpleText,
        mlld_core::StructuredValue::text("rm -rf /tmp/scratch"),
    );
    variable.sync_ctx(SecurityDescriptor::make(
        DescriptorParts::default()
            .with_labels(["untrusted", "influenced"])
            .with_sources(["mcp://tools/shell".to_string()])
            .with_capability(Capability::new("destructive", "exec")),
        config,
    ));
    variable
}

fn blessing_guard(name: &str, remove: &[&str]) -> GuardDefinition {
    GuardDefinition::on_label(
        name,
        label("untrusted"),
        GuardTiming::Before,
        vec![GuardRule::otherwise(
            GuardAction::allow().with_remove_labels(remove.iter().map(|l| label(l))),
        )],
    )
}

#[test]
fn unprivileged_guard_cannot_remove_labels() {
    let config = MlldConfig::default();
    let mut env = Environment::new(config.clone(), Rc::new(NullSink));
    let mut hooks = HookManager::new(&config);
    hooks.register_guard(blessing_guard("wannabe", &["untrusted"]));

    let scope = env.root();
    let input = untrusted_input(&config);
    let operation = OperationContext::new("exec");

    let error = hooks
        .pre(&mut env, scope, &[input], &operation, None)
        .expect_err("privilege violation is a hard error");
    match error {
        MlldError::Security(SecurityError::LabelPrivilegeRequired { label: l, guard }) => {
            assert_eq!(l, label("untrusted"));
            assert_eq!(guard, "wannabe");
        }
        other => panic!("expected LabelPrivilegeRequired, got {other}"),
    }
}

#[test]
fn privileged_guard_cannot_remove_protected_labels() {
    // Default configuration protects 'untrusted'.
    let config = MlldConfig::default();
    let mut env = Environment::new(config.clone(), Rc::new(NullSink));
    let mut hooks = HookManager::new(&config);
    hooks.register_guard(blessing_guard("bless", &["untrusted"]).privileged());

    let scope = env.root();
    let input = untrusted_input(&config);
    let operation = OperationContext::new("exec");

    let error = hooks
        .pre(&mut env, scope, &[input], &operation, None)
        .expect_err("protected label removal is a hard error");
    match error {
        MlldError::Security(SecurityError::ProtectedLabelRemoval { label: l, guard }) => {
            assert_eq!(l, label("untrusted"));
            assert_eq!(guard, "bless");
        }
        other => panic!("expected ProtectedLabelRemoval, got {other}"),
    }
}

#[test]
fn privileged_guard_blesses_when_label_is_not_protected() {
    // Narrow the protected set so 'untrusted' can be removed for this run.
    let config = MlldConfig::default().with_protected_labels([label("secret")]);
    let mut env = Environment::new(config.clone(), Rc::new(NullSink));
    let mut hooks = HookManager::new(&config);
    hooks.register_guard(blessing_guard("bless", &["untrusted"]).privileged());

    let scope = env.root();
    let input = untrusted_input(&config);
    let operation = OperationContext::new("exec");

    let pre = hooks
        .pre(&mut env, scope, &[input], &operation, None)
        .expect("blessing succeeds");
    let inputs = match pre {
        PreOutcome::Continue { inputs } => inputs,
        other => panic!("expected continue, got {:?}", other.action()),
    };

    let blessed = inputs[0].security();
    assert!(!blessed.labels().contains(&label("untrusted")));
    assert!(!blessed.taint().contains(&label("untrusted")));
    assert!(blessed.taint().contains(&label("influenced")));
    assert!(blessed.sources().contains(&"guard:bless".to_string()));
    // Original provenance is preserved alongside the guard's mark.
    assert!(blessed
        .sources()
        .contains(&"mcp://tools/shell".to_string()));
}

#[test]
fn src_namespace_stays_protected_even_when_set_is_emptied() {
    let config = MlldConfig::default().with_protected_labels([]);
    let mut env = Environment::new(config.clone(), Rc::new(NullSink));
    let mut hooks = HookManager::new(&config);

    let mut variable = Variable::declare(
        "data",
        VariableKind::SimpleText,
        mlld_core::StructuredValue::text("payload"),
    );
    variable.sync_ctx(SecurityDescriptor::make(
        DescriptorParts::default().with_taint(["src:mcp"]),
        &config,
    ));

    hooks.register_guard(
        GuardDefinition::on_label(
            "scrub",
            label("src:mcp"),
            GuardTiming::Before,
            vec![GuardRule::otherwise(
                GuardAction::allow().with_remove_labels([label("src:mcp")]),
            )],
        )
        .privileged(),
    );

    let scope = env.root();
    let operation = OperationContext::new("exec");
    let error = hooks
        .pre(&mut env, scope, &[variable], &operation, None)
        .expect_err("src:* labels cannot be removed");
    assert!(matches!(
        error,
        MlldError::Security(SecurityError::ProtectedLabelRemoval { .. })
    ));
}
