//! Test utilities.
//!
//! Delivery failures surface only as structured events, so tests assert on
//! what was logged. [`capture_events`] installs a thread-scoped subscriber
//! that records every event for inspection.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

use crate::events::{BridgeEvent, EVENT_TARGET};

/// One captured event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub target: String,
    pub level: Level,
    pub fields: BTreeMap<String, String>,
}

impl RecordedEvent {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Vocabulary name, if this is a delivery event.
    pub fn name(&self) -> Option<&str> {
        self.field("event")
    }

    pub fn is(&self, event: BridgeEvent) -> bool {
        self.name() == Some(event.as_str())
    }
}

/// Layer that stores every event it sees.
#[derive(Clone, Default)]
pub struct RecordingLayer {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl RecordingLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Only events from the delivery vocabulary.
    pub fn bridge_events(&self) -> Vec<RecordedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.target == EVENT_TARGET)
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.bridge_events()
            .iter()
            .filter_map(|e| e.name().map(str::to_string))
            .collect()
    }

    pub fn of(&self, event: BridgeEvent) -> Vec<RecordedEvent> {
        self.bridge_events()
            .into_iter()
            .filter(|e| e.is(event))
            .collect()
    }

    pub fn count(&self, event: BridgeEvent) -> usize {
        self.of(event).len()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl<S: Subscriber> Layer<S> for RecordingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let recorded = RecordedEvent {
            target: event.metadata().target().to_string(),
            level: *event.metadata().level(),
            fields: visitor.0,
        };
        if let Ok(mut events) = self.events.lock() {
            events.push(recorded);
        }
    }
}

#[derive(Default)]
struct FieldVisitor(BTreeMap<String, String>);

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{:?}", value));
    }
}

/// Record events emitted on this thread until the guard is dropped.
///
/// Works with `#[tokio::test]`'s single-threaded runtime, where spawned
/// tasks run on the test thread.
pub fn capture_events() -> (RecordingLayer, DefaultGuard) {
    let layer = RecordingLayer::new();
    let subscriber = tracing_subscriber::registry().with(layer.clone());
    let guard = tracing::subscriber::set_default(subscriber);
    (layer, guard)
}
