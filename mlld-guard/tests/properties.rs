//! Engine-level property tests: taint monotonicity, source accumulation,
//! the protected-label floor, and the retry bound.

use mlld_core::{
    DescriptorParts, GuardAction, GuardDefinition, GuardRule, GuardTiming, MlldError,
    OperationContext, ReplacementExpr, SecurityDescriptor, SecurityError, StructuredValue,
    Variable, VariableKind,
};
use mlld_env::Environment;
use mlld_events::NullSink;
use mlld_guard::{HookManager, PreOutcome};
use mlld_test_utils::{arb_descriptor, label, make_test_config};
use proptest::prelude::*;
use std::rc::Rc;

fn variable_with(descriptor: SecurityDescriptor) -> Variable {
    let mut variable = Variable::declare(
        "payload",
        VariableKind::SimpleText,
        StructuredValue::text("some payload text"),
    );
    variable.sync_ctx(descriptor);
    variable
}

proptest! {
    /// A guard transform never sheds taint: the transformed input's taint
    /// is a superset of the original taint, and its sources keep every
    /// original source plus the guard's own mark.
    #[test]
    fn prop_transform_preserves_taint_and_sources(descriptor in arb_descriptor()) {
        let config = make_test_config();
        // Force the watched label on so the guard always applies.
        let descriptor = SecurityDescriptor::merge([
            &descriptor,
            &SecurityDescriptor::make(
                DescriptorParts::default().with_labels(["untrusted"]),
                &config,
            ),
        ]);
        let mut env = Environment::new(config.clone(), Rc::new(NullSink));
        let mut hooks = HookManager::new(&config);
        hooks.register_guard(GuardDefinition::on_label(
            "marker",
            label("untrusted"),
            GuardTiming::Before,
            vec![GuardRule::otherwise(
                GuardAction::allow()
                    .with_value(ReplacementExpr::PrefixWith(label("reviewed"))),
            )],
        ));

        let scope = env.root();
        let input = variable_with(descriptor.clone());
        let operation = OperationContext::new("run");
        let pre = hooks
            .pre(&mut env, scope, &[input], &operation, None)
            .expect("transform succeeds");
        let inputs = match pre {
            PreOutcome::Continue { inputs } => inputs,
            other => panic!("expected continue, got {:?}", other.action()),
        };
        let transformed = inputs[0].security();

        prop_assert!(descriptor.taint().is_subset(transformed.taint()));
        for source in descriptor.sources() {
            prop_assert!(transformed.sources().contains(source));
        }
        prop_assert!(transformed.sources().contains(&"guard:marker".to_string()));
        prop_assert!(transformed.labels().contains(&label("reviewed")));
        prop_assert!(inputs[0].value().as_text().starts_with("[reviewed] "));
    }

    /// Removing a `src:`-namespaced label fails even for privileged
    /// guards, regardless of the rest of the descriptor.
    #[test]
    fn prop_src_labels_are_a_floor(
        descriptor in arb_descriptor(),
        family in "[a-z]{1,6}",
    ) {
        let config = make_test_config();
        let src = label(&format!("src:{family}"));
        let descriptor = descriptor.add_labels([&src], &config);

        let mut env = Environment::new(config.clone(), Rc::new(NullSink));
        let mut hooks = HookManager::new(&config);
        hooks.register_guard(
            GuardDefinition::on_label(
                "scrub",
                src.clone(),
                GuardTiming::Before,
                vec![GuardRule::otherwise(
                    GuardAction::allow().with_remove_labels([src.clone()]),
                )],
            )
            .privileged(),
        );

        let scope = env.root();
        let input = variable_with(descriptor);
        let operation = OperationContext::new("run");
        let error = hooks
            .pre(&mut env, scope, &[input], &operation, None)
            .expect_err("src removal always fails");
        let is_protected_label_removal = matches!(
            error,
            MlldError::Security(SecurityError::ProtectedLabelRemoval { .. })
        );
        prop_assert!(is_protected_label_removal);
    }

    /// For any per-guard max within the ceiling, a guard that always asks
    /// for a retry is evaluated exactly `max` times and then denied; an
    /// allow past the budget is impossible.
    #[test]
    fn prop_retry_bound_holds(max in 1u32..=3) {
        let config = make_test_config();
        let mut env = Environment::new(config.clone(), Rc::new(NullSink));
        let mut hooks = HookManager::new(&config);
        hooks.register_guard(
            GuardDefinition::on_label(
                "stubborn",
                label("untrusted"),
                GuardTiming::Before,
                vec![GuardRule::otherwise(GuardAction::retry("again"))],
            )
            .with_max(max),
        );

        let scope = env.root();
        let input = variable_with(SecurityDescriptor::make(
            DescriptorParts::default().with_labels(["untrusted"]),
            &config,
        ));
        let mut operation = OperationContext::new("run");
        operation.metadata.source_retryable = Some(true);

        let mut evaluations = 0u32;
        loop {
            evaluations += 1;
            prop_assert!(evaluations <= max, "evaluated past the bound");
            match hooks
                .pre(&mut env, scope, &[input.clone()], &operation, None)
                .expect("pre-hook runs")
            {
                PreOutcome::Retry(_) => continue,
                PreOutcome::Abort(error) => {
                    prop_assert_eq!(error.decision, mlld_core::GuardDecision::Deny);
                    break;
                }
                PreOutcome::Continue { .. } => {
                    prop_assert!(false, "allow after retries must not happen");
                }
            }
        }
        prop_assert_eq!(evaluations, max);
    }
}
