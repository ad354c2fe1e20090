//! Content-addressed signing and verification
//!
//! Templates and policies that guards depend on are signed by hash so that
//! LLM-facing guards can authenticate their own instructions. The
//! orchestrator controls the `verify_vars` whitelist; guarded code can
//! never widen it.

use chrono::Utc;
use mlld_core::{
    compute_content_hash, OperationContext, SignAlgorithm, Signature, Variable,
};
use std::collections::BTreeSet;
use thiserror::Error;

/// Verification failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SignError {
    #[error("variable '{name}' is not in the verify whitelist for this execution")]
    NotWhitelisted { name: String },

    #[error("variable '{name}' carries no signature")]
    Unsigned { name: String },

    #[error("content of '{name}' no longer matches its signature (expected {expected}, got {actual})")]
    HashMismatch {
        name: String,
        expected: String,
        actual: String,
    },
}

/// Signer and verifier over variable content.
#[derive(Debug, Clone, Default)]
pub struct SignVerify {
    verify_vars: BTreeSet<String>,
}

impl SignVerify {
    /// Create a signer with an empty whitelist; `verify` resolves nothing
    /// until the orchestrator sets one.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whitelist constructor for the orchestrator.
    pub fn with_verify_vars(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            verify_vars: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Replace the whitelist. Called by the orchestrator before execution,
    /// never from guarded code.
    pub fn set_verify_vars(&mut self, names: impl IntoIterator<Item = impl Into<String>>) {
        self.verify_vars = names.into_iter().map(Into::into).collect();
    }

    /// Sign a variable's current content and record the signature on it.
    pub fn sign(&self, variable: &mut Variable, signer: &str, algo: SignAlgorithm) -> Signature {
        let signature = Signature {
            hash: content_hash_hex(variable),
            signer: signer.to_string(),
            algo,
            signed_at: Utc::now(),
        };
        variable.record_signature(signature.clone());
        signature
    }

    /// Sign every unsigned variable in the batch. Convenience for startup.
    pub fn auto_sign<'a>(
        &self,
        variables: impl IntoIterator<Item = &'a mut Variable>,
        signer: &str,
    ) -> usize {
        let mut signed = 0;
        for variable in variables {
            if !variable.is_signed() {
                self.sign(variable, signer, SignAlgorithm::Sha256);
                signed += 1;
            }
        }
        signed
    }

    /// Return the current, signed content of the variable: it must be
    /// whitelisted, signed, and unchanged since signing.
    pub fn verify<'a>(&self, variable: &'a Variable) -> Result<&'a str, SignError> {
        if !self.verify_vars.contains(&variable.name) {
            return Err(SignError::NotWhitelisted {
                name: variable.name.clone(),
            });
        }
        let signature = variable.signature.as_ref().ok_or_else(|| SignError::Unsigned {
            name: variable.name.clone(),
        })?;
        let actual = content_hash_hex(variable);
        if actual != signature.hash {
            return Err(SignError::HashMismatch {
                name: variable.name.clone(),
                expected: signature.hash.clone(),
                actual,
            });
        }
        Ok(variable.value().as_text())
    }
}

fn content_hash_hex(variable: &Variable) -> String {
    hex::encode(compute_content_hash(variable.value().as_text().as_bytes()))
}

/// Whether the operation's recorded tool-call trace includes a `verify`
/// call. Enforcement guards retry until this holds.
pub fn trace_includes_verify(operation: &OperationContext) -> bool {
    operation.metadata.trace.iter().any(|entry| entry == "verify")
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlld_core::{StructuredValue, VariableKind};

    fn template(name: &str, text: &str) -> Variable {
        Variable::declare(name, VariableKind::Template, StructuredValue::text(text))
    }

    #[test]
    fn test_sign_then_verify() {
        let signer = SignVerify::with_verify_vars(["policyPrompt"]);
        let mut variable = template("policyPrompt", "Compare against the signed policy.");
        signer.sign(&mut variable, "orchestrator", SignAlgorithm::Sha256);
        assert!(variable.is_signed());
        assert_eq!(
            signer.verify(&variable).expect("verified"),
            "Compare against the signed policy."
        );
    }

    #[test]
    fn test_verify_rejects_tampered_content() {
        let signer = SignVerify::with_verify_vars(["policyPrompt"]);
        let mut variable = template("policyPrompt", "original");
        signer.sign(&mut variable, "orchestrator", SignAlgorithm::Sha256);
        let tampered = variable.reassign(StructuredValue::text("altered"));
        // Reassignment drops the signature entirely
        assert_eq!(
            signer.verify(&tampered),
            Err(SignError::Unsigned {
                name: "policyPrompt".to_string()
            })
        );
    }

    #[test]
    fn test_verify_detects_hash_mismatch() {
        let signer = SignVerify::with_verify_vars(["policyPrompt"]);
        let mut variable = template("policyPrompt", "original");
        let mut signature = signer.sign(&mut variable, "orchestrator", SignAlgorithm::Sha256);
        signature.hash = "0".repeat(64);
        variable.record_signature(signature);
        assert!(matches!(
            signer.verify(&variable),
            Err(SignError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_whitelist_is_enforced() {
        let signer = SignVerify::new();
        let mut variable = template("policyPrompt", "content");
        signer.sign(&mut variable, "orchestrator", SignAlgorithm::Sha256);
        assert_eq!(
            signer.verify(&variable),
            Err(SignError::NotWhitelisted {
                name: "policyPrompt".to_string()
            })
        );
    }

    #[test]
    fn test_auto_sign_skips_signed() {
        let signer = SignVerify::new();
        let mut a = template("a", "x");
        let mut b = template("b", "y");
        signer.sign(&mut a, "orchestrator", SignAlgorithm::Sha256);
        let count = signer.auto_sign([&mut a, &mut b], "orchestrator");
        assert_eq!(count, 1);
        assert!(b.is_signed());
    }

    #[test]
    fn test_trace_inclusion() {
        let mut operation = OperationContext::new("llm");
        assert!(!trace_includes_verify(&operation));
        operation.metadata.trace.push("verify".to_string());
        assert!(trace_includes_verify(&operation));
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use mlld_core::{StructuredValue, VariableKind};
    use proptest::prelude::*;

    proptest! {
        /// Sign-then-verify returns the signed content verbatim for any
        /// content, and verification fails for any differing content
        /// smuggled in under the recorded signature.
        #[test]
        fn prop_verify_accepts_exactly_the_signed_content(
            content in ".{0,200}",
            tampered in ".{0,200}",
        ) {
            let signer = SignVerify::with_verify_vars(["tpl"]);
            let mut variable = Variable::declare(
                "tpl",
                VariableKind::Template,
                StructuredValue::text(content.clone()),
            );
            let signature = signer.sign(&mut variable, "orchestrator", SignAlgorithm::Sha256);
            prop_assert_eq!(signer.verify(&variable).expect("signed content verifies"), content.clone());

            let mut swapped = variable.reassign(StructuredValue::text(tampered.clone()));
            swapped.record_signature(signature);
            if tampered == content {
                prop_assert!(signer.verify(&swapped).is_ok());
            } else {
                let is_hash_mismatch = matches!(
                    signer.verify(&swapped),
                    Err(SignError::HashMismatch { .. })
                );
                prop_assert!(is_hash_mismatch);
            }
        }
    }
}
