//! Error types for guard engine operations

use crate::descriptor::{Label, LabelParseError};
use crate::guard::{GuardContextSnapshot, GuardDecision, GuardResult, GuardScope, GuardTiming};
use thiserror::Error;

/// Privilege violations raised while applying guard label modifications.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SecurityError {
    #[error("guard '{guard}' is not privileged to remove label '{label}'")]
    LabelPrivilegeRequired { label: Label, guard: String },

    #[error("guard '{guard}' cannot remove protected label '{label}'")]
    ProtectedLabelRemoval { label: Label, guard: String },
}

/// Guard script misuse detected during rule evaluation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WhenExpressionError {
    #[error("guard '{guard}' used the 'env' decision outside a before-guard")]
    EnvOutsideBefore { guard: String },
}

/// Extracting a field absent from a value's data view.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FieldAccessError {
    #[error("field '{access_path}' not found on {base_value}; available keys: {available_keys:?}")]
    MissingField {
        base_value: String,
        access_path: String,
        available_keys: Vec<String>,
    },
}

/// Interpreter-level failures around guard dispatch.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InterpreterError {
    #[error("operation '{operation}' exhausted its retry budget after {attempts} attempts")]
    RetriesExhausted { operation: String, attempts: u32 },

    #[error(
        "operation streams its output but after-guards {guards:?} need the complete result; \
         remove the after-guards or disable streaming"
    )]
    StreamingAfterGuards { guards: Vec<String> },

    #[error("reserved variable '{name}' is missing from the guard environment")]
    MissingReservedVariable { name: String },

    #[error("variable '{name}' is not visible from the guard environment")]
    UnknownVariable { name: String },

    #[error("invalid guard override: {reason}")]
    InvalidGuardOverride { reason: String },

    #[error("no executable named '{name}' is registered with the hook manager")]
    UnknownExecutable { name: String },

    #[error("executable '{name}' failed: {reason}")]
    ExecutableFailed { name: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

// ============================================================================
// GUARD ERRORS
// ============================================================================

fn primary(reasons: &[String]) -> &str {
    reasons
        .first()
        .map(String::as_str)
        .unwrap_or("operation denied by guard")
}

/// The canonical failure of an operation under guards.
///
/// Renderers show the first reason verbatim, then the hint history when
/// non-empty; the full trace rides along for auditing.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{}", primary(.reasons))]
pub struct GuardError {
    /// `Deny` or `Retry`; never `Allow`
    pub decision: GuardDecision,
    pub guard_name: Option<String>,
    pub guard_filter: Option<String>,
    pub scope: GuardScope,
    /// Key of the guarded operation
    pub operation: String,
    pub input_preview: Option<String>,
    pub output_preview: Option<String>,
    pub reasons: Vec<String>,
    pub guard_results: Vec<GuardResult>,
    pub hints: Vec<String>,
    pub timing: GuardTiming,
    pub retry_hint: Option<String>,
    pub guard_context: Option<GuardContextSnapshot>,
}

impl GuardError {
    /// Minimal denial for the named operation.
    pub fn deny(operation: impl Into<String>, timing: GuardTiming, reason: impl Into<String>) -> Self {
        Self {
            decision: GuardDecision::Deny,
            guard_name: None,
            guard_filter: None,
            scope: GuardScope::PerOperation,
            operation: operation.into(),
            input_preview: None,
            output_preview: None,
            reasons: vec![reason.into()],
            guard_results: Vec::new(),
            hints: Vec::new(),
            timing,
            retry_hint: None,
            guard_context: None,
        }
    }

    /// The reason renderers display first.
    pub fn primary_reason(&self) -> &str {
        primary(&self.reasons)
    }
}

/// Out-of-band request to rerun the guarded operation, raised by the
/// post-hook and caught by the nearest retry-capable construct. Uncaught
/// signals degrade to a deny.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("retry requested: {}", .0.primary_reason())]
pub struct GuardRetrySignal(pub GuardError);

impl GuardRetrySignal {
    /// Hint to feed into the next attempt.
    pub fn retry_hint(&self) -> Option<&str> {
        self.0.retry_hint.as_deref()
    }

    /// Degrade the signal to its deny form.
    pub fn into_deny(mut self) -> GuardError {
        self.0.decision = GuardDecision::Deny;
        self.0
    }
}

// ============================================================================
// MASTER ERROR TYPE
// ============================================================================

/// Master error type for all guard engine errors.
#[derive(Debug, Clone, Error)]
pub enum MlldError {
    #[error("security error: {0}")]
    Security(#[from] SecurityError),

    #[error("when expression error: {0}")]
    WhenExpression(#[from] WhenExpressionError),

    #[error("field access error: {0}")]
    FieldAccess(#[from] FieldAccessError),

    #[error("interpreter error: {0}")]
    Interpreter(#[from] InterpreterError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("guard denial: {0}")]
    Guard(#[from] GuardError),

    #[error("label error: {0}")]
    Label(#[from] LabelParseError),
}

/// Result type alias for guard engine operations.
pub type MlldResult<T> = Result<T, MlldError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_error_displays_first_reason() {
        let mut err = GuardError::deny("show", GuardTiming::Before, "Secrets cannot be shown");
        err.reasons.push("secondary".to_string());
        assert_eq!(err.to_string(), "Secrets cannot be shown");
    }

    #[test]
    fn test_retry_signal_degrades_to_deny() {
        let mut err = GuardError::deny("exe", GuardTiming::After, "invalid output");
        err.decision = GuardDecision::Retry;
        err.retry_hint = Some("produce valid JSON".to_string());
        let signal = GuardRetrySignal(err);
        assert_eq!(signal.retry_hint(), Some("produce valid JSON"));
        let denied = signal.into_deny();
        assert_eq!(denied.decision, GuardDecision::Deny);
    }
}
