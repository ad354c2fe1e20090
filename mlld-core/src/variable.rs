//! Variable bindings and their security context

use crate::descriptor::SecurityDescriptor;
use crate::identity::{EntityIdType, Timestamp, VariableId};
use crate::structured::{StructuredValue, ValueContext, ValueType};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

// ============================================================================
// VARIABLE KINDS AND SOURCES
// ============================================================================

/// Kind tag for a variable binding. The string form is a wire format only;
/// all dispatch is by exhaustive match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VariableKind {
    SimpleText,
    InterpolatedText,
    Template,
    FileContent,
    SectionContent,
    Object,
    Array,
    Primitive,
    Path,
    Computed,
    CommandResult,
    PipelineInput,
    Imported,
    Executable,
}

impl VariableKind {
    /// Kind inferred from a value's type tag, for parameter binding and
    /// reassignment.
    pub fn from_value_type(value_type: &ValueType) -> Self {
        match value_type {
            ValueType::Object | ValueType::Json => VariableKind::Object,
            ValueType::Array => VariableKind::Array,
            ValueType::Number | ValueType::Boolean => VariableKind::Primitive,
            _ => VariableKind::SimpleText,
        }
    }
}

/// How a variable came to exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VariableSource {
    /// Declared by a `var` directive
    Declaration,
    /// Bound as a function or executable parameter
    ParameterBinding,
    /// Reassigned over an existing binding
    Reassignment,
    /// Installed by the runtime
    System,
    /// Materialized by a guard transform
    GuardReplacement { guard: String },
    /// Imported from another module
    Import { module: String },
}

bitflags! {
    /// System flags on a variable binding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VariableFlags: u8 {
        /// Reserved name installed by the engine (`input`, `output`)
        const RESERVED = 0b0000_0001;
        /// Created by the runtime rather than user code
        const SYSTEM = 0b0000_0010;
        /// Bound as a parameter
        const PARAMETER = 0b0000_0100;
        /// Helper visible only inside guard evaluation
        const GUARD_HELPER = 0b0000_1000;
        /// Brought in through an import
        const IMPORTED = 0b0001_0000;
        /// Carries a content signature
        const SIGNED = 0b0010_0000;
    }
}

impl Default for VariableFlags {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// SIGNATURES
// ============================================================================

/// Hash algorithm used for content-addressed signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignAlgorithm {
    Sha256,
}

/// Content signature recorded on a signed variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    /// Hex-encoded content hash
    pub hash: String,
    /// Who signed the content
    pub signer: String,
    /// Algorithm used to compute the hash
    pub algo: SignAlgorithm,
    /// When the signature was recorded
    pub signed_at: Timestamp,
}

// ============================================================================
// VARIABLE
// ============================================================================

/// A named binding with a kind tag, a structured value, and a security
/// context mirroring the value's descriptor.
///
/// Variables are never mutated in place except to synchronize their context
/// with a new descriptor ([`Variable::sync_ctx`]) or to record a signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub variable_id: VariableId,
    pub name: String,
    pub kind: VariableKind,
    value: StructuredValue,
    pub source: VariableSource,
    #[serde(default, skip_serializing_if = "VariableFlags::is_empty", with = "flag_bits")]
    pub flags: VariableFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

impl Variable {
    /// Create a binding from a `var` declaration.
    pub fn declare(name: impl Into<String>, kind: VariableKind, value: StructuredValue) -> Self {
        Self {
            variable_id: VariableId::now_v7(),
            name: name.into(),
            kind,
            value,
            source: VariableSource::Declaration,
            flags: VariableFlags::empty(),
            signature: None,
        }
    }

    /// Bind a parameter for a function or executable invocation.
    pub fn bind_parameter(name: impl Into<String>, value: StructuredValue) -> Self {
        let kind = VariableKind::from_value_type(value.value_type());
        Self {
            variable_id: VariableId::now_v7(),
            name: name.into(),
            kind,
            value,
            source: VariableSource::ParameterBinding,
            flags: VariableFlags::PARAMETER,
            signature: None,
        }
    }

    /// Install a runtime-owned reserved binding (`input`, `output`).
    pub fn system(name: impl Into<String>, value: StructuredValue) -> Self {
        let kind = VariableKind::from_value_type(value.value_type());
        Self {
            variable_id: VariableId::now_v7(),
            name: name.into(),
            kind,
            value,
            source: VariableSource::System,
            flags: VariableFlags::RESERVED | VariableFlags::SYSTEM,
            signature: None,
        }
    }

    /// Materialize a guard transform as a fresh binding.
    pub fn guard_replacement(
        name: impl Into<String>,
        value: StructuredValue,
        guard: impl Into<String>,
    ) -> Self {
        let kind = VariableKind::from_value_type(value.value_type());
        Self {
            variable_id: VariableId::now_v7(),
            name: name.into(),
            kind,
            value,
            source: VariableSource::GuardReplacement {
                guard: guard.into(),
            },
            flags: VariableFlags::SYSTEM,
            signature: None,
        }
    }

    /// Reassign over this binding, producing the replacement variable.
    pub fn reassign(&self, value: StructuredValue) -> Self {
        Self {
            variable_id: VariableId::now_v7(),
            name: self.name.clone(),
            kind: VariableKind::from_value_type(value.value_type()),
            value,
            source: VariableSource::Reassignment,
            flags: self.flags,
            signature: None,
        }
    }

    /// Set additional flags.
    pub fn with_flags(mut self, flags: VariableFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// The bound structured value.
    pub fn value(&self) -> &StructuredValue {
        &self.value
    }

    /// The variable's security context, a mirror of its descriptor. This is
    /// the single canonical label field on a binding.
    pub fn ctx(&self) -> &ValueContext {
        self.value.ctx()
    }

    /// Shortcut to the value's security descriptor.
    pub fn security(&self) -> &SecurityDescriptor {
        self.value.security()
    }

    /// Synchronize the context with a new descriptor.
    pub fn sync_ctx(&mut self, descriptor: SecurityDescriptor) {
        self.value.apply_security_descriptor(descriptor);
    }

    /// Record a content signature and mark the binding signed.
    pub fn record_signature(&mut self, signature: Signature) {
        self.signature = Some(signature);
        self.flags |= VariableFlags::SIGNED;
    }

    pub fn is_reserved(&self) -> bool {
        self.flags.contains(VariableFlags::RESERVED)
    }

    pub fn is_parameter(&self) -> bool {
        self.flags.contains(VariableFlags::PARAMETER)
    }

    pub fn is_guard_helper(&self) -> bool {
        self.flags.contains(VariableFlags::GUARD_HELPER)
    }

    pub fn is_signed(&self) -> bool {
        self.flags.contains(VariableFlags::SIGNED)
    }
}

/// Serialize variable flags as their raw bits.
mod flag_bits {
    use super::VariableFlags;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(flags: &VariableFlags, serializer: S) -> Result<S::Ok, S::Error> {
        flags.bits().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<VariableFlags, D::Error> {
        let bits = u8::deserialize(deserializer)?;
        Ok(VariableFlags::from_bits_truncate(bits))
    }
}
