//! Structured values - the universal runtime container
//!
//! Every value crossing a component boundary is structured: a text view used
//! by interpolation and display, a typed data view, metadata with an embedded
//! security descriptor, and a derived `ctx` projection kept in sync with the
//! descriptor. Primitives auto-wrap through [`StructuredValue::ensure`].

use crate::descriptor::{Label, SecurityDescriptor};
use crate::error::FieldAccessError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ============================================================================
// VALUE TYPE
// ============================================================================

/// Open set of value type tags. `Text` is the default; unknown tags are
/// preserved through `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ValueType {
    Text,
    Json,
    Array,
    Object,
    Number,
    Boolean,
    Csv,
    Xml,
    Html,
    Other(String),
}

impl ValueType {
    /// Infer a type tag from a JSON data view.
    pub fn infer(data: &serde_json::Value) -> Self {
        match data {
            serde_json::Value::Array(_) => ValueType::Array,
            serde_json::Value::Object(_) => ValueType::Object,
            serde_json::Value::Number(_) => ValueType::Number,
            serde_json::Value::Bool(_) => ValueType::Boolean,
            _ => ValueType::Text,
        }
    }
}

impl Default for ValueType {
    fn default() -> Self {
        ValueType::Text
    }
}

impl From<String> for ValueType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "text" => ValueType::Text,
            "json" => ValueType::Json,
            "array" => ValueType::Array,
            "object" => ValueType::Object,
            "number" => ValueType::Number,
            "boolean" => ValueType::Boolean,
            "csv" => ValueType::Csv,
            "xml" => ValueType::Xml,
            "html" => ValueType::Html,
            _ => ValueType::Other(tag),
        }
    }
}

impl From<ValueType> for String {
    fn from(vt: ValueType) -> Self {
        vt.to_string()
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ValueType::Text => "text",
            ValueType::Json => "json",
            ValueType::Array => "array",
            ValueType::Object => "object",
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
            ValueType::Csv => "csv",
            ValueType::Xml => "xml",
            ValueType::Html => "html",
            ValueType::Other(tag) => tag,
        };
        write!(f, "{}", tag)
    }
}

// ============================================================================
// METADATA AND CONTEXT PROJECTION
// ============================================================================

/// Immutable metadata attached to a structured value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ValueMetadata {
    /// Origin of the value (e.g., "load-content", "command-result")
    pub source: Option<String>,
    /// File the value was loaded from, if any
    pub filename: Option<String>,
    /// URL the value was fetched from, if any
    pub url: Option<String>,
    /// Estimated token count of the text view
    pub tokens: Option<i32>,
    /// Embedded security descriptor
    #[serde(default)]
    pub security: SecurityDescriptor,
}

impl ValueMetadata {
    /// Create metadata carrying only a security descriptor.
    pub fn with_security(security: SecurityDescriptor) -> Self {
        Self {
            security,
            ..Self::default()
        }
    }

    /// Set the origin source.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the filename.
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Set the URL.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// Derived projection of a value's metadata and security descriptor,
/// exposed to guard scripts and interpolation as `@ctx`.
///
/// Always rebuilt from `metadata.security`; never edited directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueContext {
    /// Mirrors the value's type tag
    #[serde(rename = "type")]
    pub value_type: ValueType,
    pub labels: BTreeSet<Label>,
    pub taint: BTreeSet<Label>,
    pub sources: Vec<String>,
    pub policy: BTreeMap<String, serde_json::Value>,
    pub filename: Option<String>,
    pub url: Option<String>,
    pub tokens: Option<i32>,
}

impl ValueContext {
    fn derive(value_type: &ValueType, metadata: &ValueMetadata) -> Self {
        Self {
            value_type: value_type.clone(),
            labels: metadata.security.labels().clone(),
            taint: metadata.security.taint().clone(),
            sources: metadata.security.sources().to_vec(),
            policy: metadata.security.policy_context().clone(),
            filename: metadata.filename.clone(),
            url: metadata.url.clone(),
            tokens: metadata.tokens,
        }
    }
}

// ============================================================================
// STRUCTURED VALUE
// ============================================================================

/// Universal runtime container pairing a text view with a typed data view,
/// metadata, and a security context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredValue {
    #[serde(rename = "type")]
    value_type: ValueType,
    text: String,
    data: serde_json::Value,
    metadata: ValueMetadata,
    ctx: ValueContext,
}

impl StructuredValue {
    /// Wrap plain text. `as_text(text(x)) == x` for any string `x`.
    pub fn text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::assemble(
            ValueType::Text,
            text.clone(),
            serde_json::Value::String(text),
            ValueMetadata::default(),
        )
    }

    /// Wrap a data view, optionally refining the type tag and text view.
    /// Absent hints are inferred from the data.
    pub fn wrap(
        data: serde_json::Value,
        value_type: Option<ValueType>,
        text: Option<String>,
    ) -> Self {
        let value_type = value_type.unwrap_or_else(|| ValueType::infer(&data));
        let text = text.unwrap_or_else(|| render_text(&data));
        Self::assemble(value_type, text, data, ValueMetadata::default())
    }

    /// Total wrapper for any data view, including null.
    pub fn ensure(data: serde_json::Value) -> Self {
        Self::wrap(data, None, None)
    }

    /// Refine an already-wrapped value. Only explicitly provided hints
    /// change anything; `refine(None, None, None)` is the identity.
    pub fn refine(
        mut self,
        value_type: Option<ValueType>,
        text: Option<String>,
        metadata: Option<ValueMetadata>,
    ) -> Self {
        if let Some(vt) = value_type {
            self.value_type = vt;
        }
        if let Some(text) = text {
            self.text = text;
        }
        if let Some(metadata) = metadata {
            self.metadata = metadata;
        }
        self.ctx = ValueContext::derive(&self.value_type, &self.metadata);
        self
    }

    fn assemble(
        value_type: ValueType,
        text: String,
        data: serde_json::Value,
        metadata: ValueMetadata,
    ) -> Self {
        let ctx = ValueContext::derive(&value_type, &metadata);
        Self {
            value_type,
            text,
            data,
            metadata,
            ctx,
        }
    }

    /// The text view used by interpolation and display. Never absent.
    pub fn as_text(&self) -> &str {
        &self.text
    }

    /// Consume the value, returning the text view.
    pub fn into_text(self) -> String {
        self.text
    }

    /// The typed data view.
    pub fn as_data(&self) -> &serde_json::Value {
        &self.data
    }

    /// The value's type tag.
    pub fn value_type(&self) -> &ValueType {
        &self.value_type
    }

    /// Attached metadata.
    pub fn metadata(&self) -> &ValueMetadata {
        &self.metadata
    }

    /// The derived context projection; `ctx.type` mirrors the value type.
    pub fn ctx(&self) -> &ValueContext {
        &self.ctx
    }

    /// Shortcut to the embedded security descriptor.
    pub fn security(&self) -> &SecurityDescriptor {
        &self.metadata.security
    }

    /// Replace the embedded security descriptor and re-derive `ctx`.
    ///
    /// This is the only mutation path for a value's security metadata.
    pub fn apply_security_descriptor(&mut self, descriptor: SecurityDescriptor) {
        self.metadata.security = descriptor;
        self.ctx = ValueContext::derive(&self.value_type, &self.metadata);
    }

    /// Replace the metadata wholesale and re-derive `ctx`.
    pub fn with_metadata(self, metadata: ValueMetadata) -> Self {
        self.refine(None, None, Some(metadata))
    }

    /// Access a nested field by dotted path (object keys and array
    /// indices). The extracted value inherits this value's security
    /// descriptor: taint flows through data access.
    pub fn field(&self, path: &str) -> Result<StructuredValue, FieldAccessError> {
        let mut current = &self.data;
        for segment in path.split('.') {
            current = match current {
                serde_json::Value::Object(map) => map.get(segment).ok_or_else(|| {
                    FieldAccessError::MissingField {
                        base_value: preview(&self.text, 80),
                        access_path: path.to_string(),
                        available_keys: map.keys().cloned().collect(),
                    }
                })?,
                serde_json::Value::Array(items) => {
                    let index: usize =
                        segment
                            .parse()
                            .map_err(|_| FieldAccessError::MissingField {
                                base_value: preview(&self.text, 80),
                                access_path: path.to_string(),
                                available_keys: (0..items.len()).map(|i| i.to_string()).collect(),
                            })?;
                    items.get(index).ok_or_else(|| FieldAccessError::MissingField {
                        base_value: preview(&self.text, 80),
                        access_path: path.to_string(),
                        available_keys: (0..items.len()).map(|i| i.to_string()).collect(),
                    })?
                }
                _ => {
                    return Err(FieldAccessError::MissingField {
                        base_value: preview(&self.text, 80),
                        access_path: path.to_string(),
                        available_keys: Vec::new(),
                    })
                }
            };
        }
        let mut extracted = Self::ensure(current.clone());
        extracted.apply_security_descriptor(self.metadata.security.clone());
        Ok(extracted)
    }

    /// Assemble a descriptor from this value and anything nested inside its
    /// data view. Nested objects carrying a `ctx` member contribute the
    /// labels, taint, and sources recorded there.
    pub fn extract_security_descriptor(&self, options: ExtractOptions) -> SecurityDescriptor {
        let mut found = vec![self.metadata.security.clone()];
        if options.recursive {
            collect_embedded_descriptors(&self.data, options.merge_array_elements, &mut found);
        }
        let merged = SecurityDescriptor::merge(found.iter());
        if options.normalize {
            merged.normalize()
        } else {
            merged
        }
    }

    /// Parse the text as JSON when it syntactically looks like JSON;
    /// otherwise wrap it as plain text.
    pub fn parse_and_wrap_json(text: &str) -> Self {
        match Self::parse_json_strict(text) {
            Some(parsed) => parsed,
            None => Self::text(text),
        }
    }

    /// Strict variant: `None` unless the text both looks like and parses as
    /// JSON.
    pub fn parse_json_strict(text: &str) -> Option<Self> {
        if !looks_like_json(text) {
            return None;
        }
        let data: serde_json::Value = serde_json::from_str(text).ok()?;
        Some(Self::wrap(data, Some(ValueType::Json), Some(text.to_string())))
    }
}

impl fmt::Display for StructuredValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

/// Options for [`StructuredValue::extract_security_descriptor`].
#[derive(Debug, Clone, Copy)]
pub struct ExtractOptions {
    /// Walk nested objects and arrays for embedded contexts
    pub recursive: bool,
    /// Include descriptors found on array elements
    pub merge_array_elements: bool,
    /// Normalize the merged result
    pub normalize: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            merge_array_elements: true,
            normalize: true,
        }
    }
}

fn collect_embedded_descriptors(
    data: &serde_json::Value,
    merge_array_elements: bool,
    found: &mut Vec<SecurityDescriptor>,
) {
    match data {
        serde_json::Value::Object(map) => {
            if let Some(ctx) = map.get("ctx") {
                if let Ok(descriptor) = serde_json::from_value::<SecurityDescriptor>(ctx.clone()) {
                    found.push(descriptor);
                }
            }
            for value in map.values() {
                collect_embedded_descriptors(value, merge_array_elements, found);
            }
        }
        serde_json::Value::Array(items) if merge_array_elements => {
            for item in items {
                collect_embedded_descriptors(item, merge_array_elements, found);
            }
        }
        _ => {}
    }
}

// ============================================================================
// TEXT UTILITIES
// ============================================================================

/// Render a canonical text view for a data view.
fn render_text(data: &serde_json::Value) -> String {
    match data {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Whether a string syntactically looks like a JSON document.
fn looks_like_json(text: &str) -> bool {
    let trimmed = text.trim_start();
    trimmed.starts_with('{')
        || trimmed.starts_with('[')
        || trimmed.starts_with('"')
        || trimmed.starts_with(|c: char| c.is_ascii_digit() || c == '-')
        || trimmed.starts_with("true")
        || trimmed.starts_with("false")
        || trimmed.starts_with("null")
}

/// Rough token estimate for a text view (4 characters per token).
pub fn estimate_tokens(text: &str) -> i32 {
    (text.chars().count() as i32 + 3) / 4
}

/// Truncate text to a character budget for snapshots and error previews,
/// appending an ellipsis marker when anything was cut.
pub fn preview(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(width).collect();
    truncated.push('…');
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DescriptorParts;
    use crate::MlldConfig;
    use serde_json::json;

    #[test]
    fn test_text_fixed_point() {
        let value = StructuredValue::text("Hello, world!");
        assert_eq!(value.as_text(), "Hello, world!");
        assert_eq!(value.to_string(), "Hello, world!");
        assert_eq!(value.as_data(), &json!("Hello, world!"));
    }

    #[test]
    fn test_ensure_preserves_deep_data() {
        let data = json!({"a": [1, 2, {"b": true}]});
        let value = StructuredValue::ensure(data.clone());
        assert_eq!(value.as_data(), &data);
        assert_eq!(value.value_type(), &ValueType::Object);
    }

    #[test]
    fn test_refine_identity() {
        let value = StructuredValue::ensure(json!([1, 2, 3]));
        let refined = value.clone().refine(None, None, None);
        assert_eq!(value, refined);
    }

    #[test]
    fn test_ctx_mirrors_security() {
        let config = MlldConfig::default();
        let mut value = StructuredValue::text("s3cr3t");
        let descriptor =
            SecurityDescriptor::make(DescriptorParts::default().with_labels(["secret"]), &config);
        value.apply_security_descriptor(descriptor.clone());
        assert_eq!(value.ctx().labels, *descriptor.labels());
        assert_eq!(value.ctx().taint, *descriptor.taint());
        assert_eq!(value.ctx().value_type, ValueType::Text);
    }

    #[test]
    fn test_parse_and_wrap_json() {
        let parsed = StructuredValue::parse_and_wrap_json(r#"{"key": 1}"#);
        assert_eq!(parsed.value_type(), &ValueType::Json);
        assert_eq!(parsed.as_data(), &json!({"key": 1}));

        let not_json = StructuredValue::parse_and_wrap_json("just words");
        assert_eq!(not_json.value_type(), &ValueType::Text);
        assert_eq!(not_json.as_text(), "just words");

        assert!(StructuredValue::parse_json_strict("not json").is_none());
        assert!(StructuredValue::parse_json_strict("{broken").is_none());
    }

    #[test]
    fn test_field_access_inherits_security() {
        let config = MlldConfig::default();
        let mut value = StructuredValue::ensure(json!({"api": {"key": "sk-nested-555"}}));
        value.apply_security_descriptor(SecurityDescriptor::make(
            DescriptorParts::default().with_labels(["secret"]),
            &config,
        ));
        let key = value.field("api.key").expect("field exists");
        assert_eq!(key.as_text(), "sk-nested-555");
        assert!(key.security().has_label(&Label::normalize("secret").unwrap()));
    }

    #[test]
    fn test_field_access_error_lists_keys() {
        let value = StructuredValue::ensure(json!({"api": {"key": "x"}}));
        let err = value.field("api.token").expect_err("missing field");
        match err {
            FieldAccessError::MissingField { available_keys, access_path, .. } => {
                assert_eq!(available_keys, vec!["key".to_string()]);
                assert_eq!(access_path, "api.token");
            }
        }
    }

    #[test]
    fn test_extract_descriptor_walks_embedded_contexts() {
        let config = MlldConfig::default();
        let embedded = SecurityDescriptor::make(
            DescriptorParts::default()
                .with_labels(["untrusted"])
                .with_sources(["https://example.com".to_string()]),
            &config,
        );
        let data = json!({
            "items": [{"ctx": serde_json::to_value(&embedded).unwrap(), "body": "x"}]
        });
        let value = StructuredValue::ensure(data);
        let extracted = value.extract_security_descriptor(ExtractOptions::default());
        assert!(extracted.has_label(&Label::normalize("untrusted").unwrap()));
        assert!(extracted
            .sources()
            .contains(&"https://example.com".to_string()));
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        assert_eq!(preview("short", 10), "short");
        let long = "αβγδε".repeat(30);
        let p = preview(&long, 12);
        assert_eq!(p.chars().count(), 13);
        assert!(p.ends_with('…'));
    }
}
