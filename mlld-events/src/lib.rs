//! mlld Events - Observability
//!
//! Structured events the guard engine publishes for host SDKs: guard
//! evaluations, directive lifecycle, variable lifecycle, exports, dynamic
//! imports, and user-visible effects. Hosts receive events through the
//! [`EventSink`] trait; the engine never blocks on a sink.

use chrono::Utc;
use mlld_core::{
    GuardDecision, GuardResult, Label, SecurityDescriptor, Timestamp, VariableKind,
};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeSet;
use uuid::Uuid;

// ============================================================================
// EVENT MODEL
// ============================================================================

/// Channel for a user-visible effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectKind {
    Stdout,
    Stderr,
    Both,
    Document,
}

/// Payload of a guard evaluation event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardEvalEvent {
    /// Display name of the guard
    pub guard: String,
    /// Labels on the guarded subject
    pub labels: BTreeSet<Label>,
    pub decision: GuardDecision,
    pub trace: Vec<GuardResult>,
    pub hints: Vec<String>,
    pub reasons: Vec<String>,
    /// Provenance trail of the guarded subject
    pub provenance: Vec<String>,
}

/// Event payloads, tagged with their wire names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum EventPayload {
    #[serde(rename = "debug:guard:before")]
    GuardBefore(GuardEvalEvent),

    #[serde(rename = "debug:guard:after")]
    GuardAfter(GuardEvalEvent),

    #[serde(rename = "debug:directive:start")]
    DirectiveStart {
        operation: String,
        descriptor: SecurityDescriptor,
    },

    #[serde(rename = "debug:directive:complete")]
    DirectiveComplete {
        operation: String,
        descriptor: SecurityDescriptor,
    },

    #[serde(rename = "debug:variable:create")]
    VariableCreate { name: String, kind: VariableKind },

    #[serde(rename = "debug:variable:access")]
    VariableAccess { name: String },

    #[serde(rename = "debug:export:registered")]
    ExportRegistered { names: Vec<String> },

    /// A module was imported at runtime; its content is tainted
    #[serde(rename = "debug:import:dynamic")]
    DynamicImport {
        source: String,
        descriptor: SecurityDescriptor,
    },

    #[serde(rename = "effect")]
    Effect {
        kind: EffectKind,
        text: String,
        source: Option<String>,
    },
}

impl EventPayload {
    /// The payload's wire name.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::GuardBefore(_) => "debug:guard:before",
            EventPayload::GuardAfter(_) => "debug:guard:after",
            EventPayload::DirectiveStart { .. } => "debug:directive:start",
            EventPayload::DirectiveComplete { .. } => "debug:directive:complete",
            EventPayload::VariableCreate { .. } => "debug:variable:create",
            EventPayload::VariableAccess { .. } => "debug:variable:access",
            EventPayload::ExportRegistered { .. } => "debug:export:registered",
            EventPayload::DynamicImport { .. } => "debug:import:dynamic",
            EventPayload::Effect { .. } => "effect",
        }
    }
}

/// An event published by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MlldEvent {
    pub event_id: Uuid,
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl MlldEvent {
    /// Stamp a payload with an ID and the current time.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

// ============================================================================
// SINKS
// ============================================================================

/// Receiver for engine events. Implementations must not panic; the engine
/// treats publication as fire-and-forget.
pub trait EventSink {
    fn publish(&self, event: MlldEvent);
}

/// Extension trait with convenience emitters.
///
/// Implementors get these methods for free by implementing [`EventSink`].
pub trait EventSinkExt: EventSink {
    /// Stamp and publish a payload.
    fn emit(&self, payload: EventPayload) {
        self.publish(MlldEvent::new(payload));
    }

    /// Publish a user-visible effect.
    fn emit_effect(&self, kind: EffectKind, text: impl Into<String>, source: Option<String>) {
        self.emit(EventPayload::Effect {
            kind,
            text: text.into(),
            source,
        });
    }
}

// Blanket implementation: any type implementing EventSink gets EventSinkExt
impl<T: EventSink + ?Sized> EventSinkExt for T {}

/// Sink that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: MlldEvent) {}
}

/// Sink that buffers events in memory, for tests and host SDKs.
#[derive(Debug, Default)]
pub struct CollectorSink {
    events: RefCell<Vec<MlldEvent>>,
}

impl CollectorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the buffered events.
    pub fn events(&self) -> Vec<MlldEvent> {
        self.events.borrow().clone()
    }

    /// Buffered events matching the wire name.
    pub fn events_of_kind(&self, kind: &str) -> Vec<MlldEvent> {
        self.events
            .borrow()
            .iter()
            .filter(|e| e.payload.kind() == kind)
            .cloned()
            .collect()
    }

    /// Concatenated text of buffered effects on the given channel.
    pub fn effect_text(&self, wanted: EffectKind) -> String {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::Effect { kind, text, .. } if *kind == wanted => {
                    Some(text.as_str())
                }
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }
}

impl EventSink for CollectorSink {
    fn publish(&self, event: MlldEvent) {
        self.events.borrow_mut().push(event);
    }
}
